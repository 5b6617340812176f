use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::{
    errors::{Result, SegmentError},
    model::{ModelGeometry, Sam2Model},
    protocol::{Envelope, Reply, Request, RequestId},
};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;
pub const WORKER_THREAD_NAME: &str = "sam2-worker";

/// Control-side ends of a running worker.
pub struct WorkerHandle {
    pub requests: Sender<Envelope<Request>>,
    pub replies: Receiver<Envelope<Reply>>,
    pub thread: JoinHandle<()>,
    pub geometry: ModelGeometry,
}

/// Move `model` onto a dedicated thread and connect it with two bounded channels.
///
/// The worker stops once every request sender is dropped, or when the reply
/// receiver is gone.
pub fn spawn(model: Sam2Model, capacity: usize) -> Result<WorkerHandle> {
    let capacity = capacity.max(1);
    let geometry = model.geometry();
    let (request_tx, request_rx) = mpsc::channel(capacity);
    let (reply_tx, reply_rx) = mpsc::channel(capacity);

    let thread = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || SegmentWorker::new(model, reply_tx).run(request_rx))
        .map_err(|e| SegmentError::Configuration {
            message: format!("failed to spawn worker thread: {e}"),
        })?;

    Ok(WorkerHandle {
        requests: request_tx,
        replies: reply_rx,
        thread,
        geometry,
    })
}

/// Single-consumer request loop. Strictly FIFO: a request is fully handled,
/// and its terminal reply sent, before the next one is received.
pub struct SegmentWorker {
    model: Sam2Model,
    replies: Sender<Envelope<Reply>>,
}

impl SegmentWorker {
    pub const fn new(model: Sam2Model, replies: Sender<Envelope<Reply>>) -> Self {
        Self { model, replies }
    }

    pub fn run(mut self, mut requests: Receiver<Envelope<Request>>) {
        info!("Worker started");
        while let Some(Envelope { id, body }) = requests.blocking_recv() {
            let reply = self.handle(id, body);
            if self.replies.blocking_send(Envelope { id, body: reply }).is_err() {
                debug!("Reply receiver dropped");
                break;
            }
        }
        info!("Worker stopped");
    }

    /// Handle one request and produce its terminal reply. Failures become
    /// `error` replies; nothing escapes the loop.
    pub fn handle(&mut self, id: RequestId, request: Request) -> Reply {
        let result = match request {
            Request::Initialize => {
                let replies = &self.replies;
                self.model
                    .initialize(|stage| {
                        debug!(%id, ?stage, "Loading");
                        let progress = Envelope {
                            id,
                            body: Reply::LoadingInProgress { stage },
                        };
                        // Progress is advisory; a closed channel surfaces on the terminal reply.
                        let _ = replies.blocking_send(progress);
                    })
                    .map(|device| Reply::Ready { device })
            }
            Request::EncodeImage { image } => image
                .into_array()
                .and_then(|array| self.model.encode(array.view()))
                .map(|()| Reply::EncodeDone),
            Request::DecodeMask { points, mask } => self
                .model
                .decode(&points, mask.as_ref())
                .map(|output| Reply::DecodeResult {
                    masks: output.masks,
                    iou_predictions: output.iou_predictions,
                }),
        };

        result.unwrap_or_else(|err| {
            warn!(%id, "Request failed: {err}");
            Reply::from_error(&err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use crate::mocks::{mock_model, MockBackend};
    use crate::protocol::{LoadingStage, Point};
    use crate::session::BackendKind;
    use crate::tensor::TensorData;

    fn geometry() -> ModelGeometry {
        ModelGeometry {
            image_side: 16,
            mask_side: 4,
        }
    }

    fn model() -> Sam2Model {
        mock_model(vec![
            Box::new(MockBackend::unavailable(BackendKind::Cuda)),
            Box::new(MockBackend::available(BackendKind::Cpu)),
        ])
        .with_geometry(geometry())
    }

    fn send(handle: &WorkerHandle, body: Request) -> RequestId {
        let envelope = Envelope::new(body);
        let id = envelope.id;
        handle.requests.blocking_send(envelope).unwrap();
        id
    }

    #[test]
    fn test_handle_converts_failures_to_replies() {
        let (tx, _rx) = mpsc::channel(4);
        let mut worker = SegmentWorker::new(model(), tx);

        let reply = worker.handle(
            RequestId::new(),
            Request::DecodeMask {
                points: vec![Point::foreground(1.0, 1.0)],
                mask: None,
            },
        );
        match reply {
            Reply::Error { kind, message } => {
                assert_eq!(kind, FailureKind::Precondition);
                assert!(message.contains("models are not loaded"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_worker_round_trip() {
        let mut handle = spawn(model(), 8).unwrap();
        assert_eq!(handle.thread.thread().name(), Some(WORKER_THREAD_NAME));

        let init = send(&handle, Request::Initialize);
        let mut stages = Vec::new();
        loop {
            let reply = handle.replies.blocking_recv().unwrap();
            assert_eq!(reply.id, init);
            match reply.body {
                Reply::LoadingInProgress { stage } => stages.push(stage),
                Reply::Ready { device } => {
                    assert_eq!(device, BackendKind::Cpu);
                    break;
                }
                other => panic!("unexpected reply: {other:?}"),
            }
        }
        assert_eq!(
            stages,
            vec![LoadingStage::DownloadingModels, LoadingStage::CreatingSessions]
        );

        let encode = send(
            &handle,
            Request::EncodeImage {
                image: TensorData::zeros(vec![1, 3, 16, 16]),
            },
        );
        let decode = send(
            &handle,
            Request::DecodeMask {
                points: vec![Point::foreground(8.0, 8.0)],
                mask: None,
            },
        );

        let reply = handle.replies.blocking_recv().unwrap();
        assert_eq!((reply.id, reply.body), (encode, Reply::EncodeDone));
        let reply = handle.replies.blocking_recv().unwrap();
        assert_eq!(reply.id, decode);
        assert!(matches!(reply.body, Reply::DecodeResult { .. }));

        drop(handle.requests);
        handle.thread.join().unwrap();
    }

    #[test]
    fn test_worker_survives_errors() {
        let mut handle = spawn(model(), 8).unwrap();

        let bad = send(
            &handle,
            Request::EncodeImage {
                image: TensorData::zeros(vec![1, 3, 16, 16]),
            },
        );
        let reply = handle.replies.blocking_recv().unwrap();
        assert_eq!(reply.id, bad);
        assert!(matches!(
            reply.body,
            Reply::Error {
                kind: FailureKind::Precondition,
                ..
            }
        ));

        let init = send(&handle, Request::Initialize);
        let ready = loop {
            let reply = handle.replies.blocking_recv().unwrap();
            if reply.body.is_terminal() {
                break reply;
            }
        };
        assert_eq!(ready.id, init);
        assert!(matches!(ready.body, Reply::Ready { .. }));
    }
}
