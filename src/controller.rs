use std::thread::JoinHandle;

use image::{DynamicImage, RgbaImage};
use tokio::sync::mpsc::{
    error::{TryRecvError, TrySendError},
    Receiver, Sender,
};
use tracing::{debug, info, warn};

use crate::{
    errors::{FailureKind, Result, SegmentError},
    imageops::{
        composite_mask_over_image, display_to_model, mask_to_raster, normalize_grayscale,
        pad_to_square, PaddedImage, Size,
    },
    model::{ModelGeometry, Sam2Model},
    protocol::{select_best_candidate, Envelope, LoadingStage, Point, Reply, Request, RequestId},
    session::BackendKind,
    tensor::{mask_dims, slice_mask_channel, to_model_tensor, TensorData},
    worker::{self, WorkerHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Idle,
    LoadingModels,
    Ready,
    Encoding,
    ImageEncoded,
    Decoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    /// Adds a foreground point.
    Primary,
    /// Adds a background point.
    Secondary,
}

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Loading(LoadingStage),
    ModelsReady(BackendKind),
    ImageEncoded,
    MaskUpdated { best_index: usize, score: f32 },
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Initialize,
    Encode,
    Decode,
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    id: RequestId,
    kind: RequestKind,
}

/// Best mask of the latest decode, rasterized at mask resolution.
#[derive(Debug, Clone)]
pub struct MaskOverlay {
    pub raster: RgbaImage,
    pub scores: Vec<f32>,
    pub best_index: usize,
}

impl MaskOverlay {
    pub fn best_score(&self) -> f32 {
        self.scores[self.best_index]
    }
}

/// Control side of an interactive segmentation session.
///
/// Owns the prompt state (image, points, previous mask) and talks to the
/// worker thread through bounded channels. At most one request is tracked at
/// a time; replies carrying any other id are stale and dropped.
pub struct InteractiveSession {
    requests: Sender<Envelope<Request>>,
    replies: Receiver<Envelope<Reply>>,
    worker: JoinHandle<()>,
    geometry: ModelGeometry,
    state: ControlState,
    pending: Option<PendingRequest>,
    backend: Option<BackendKind>,
    image: Option<PaddedImage>,
    points: Vec<Point>,
    previous_mask: Option<TensorData>,
    mask: Option<MaskOverlay>,
    status: String,
}

impl InteractiveSession {
    pub fn spawn(model: Sam2Model, capacity: usize) -> Result<Self> {
        Ok(Self::from_worker(worker::spawn(model, capacity)?))
    }

    pub fn from_worker(handle: WorkerHandle) -> Self {
        Self {
            requests: handle.requests,
            replies: handle.replies,
            worker: handle.thread,
            geometry: handle.geometry,
            state: ControlState::Idle,
            pending: None,
            backend: None,
            image: None,
            points: Vec::new(),
            previous_mask: None,
            mask: None,
            status: "Loading…".to_string(),
        }
    }

    pub const fn state(&self) -> ControlState {
        self.state
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub const fn backend(&self) -> Option<BackendKind> {
        self.backend
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub const fn mask(&self) -> Option<&MaskOverlay> {
        self.mask.as_ref()
    }

    pub const fn image(&self) -> Option<&PaddedImage> {
        self.image.as_ref()
    }

    pub const fn geometry(&self) -> ModelGeometry {
        self.geometry
    }

    pub const fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn initialize(&mut self) -> Result<RequestId> {
        if self.backend.is_some() {
            return Err(SegmentError::precondition(
                "initialize",
                "models are already loaded",
            ));
        }
        let id = self.send(RequestKind::Initialize, Request::Initialize)?;
        self.state = ControlState::LoadingModels;
        self.set_status("Loading model…");
        Ok(id)
    }

    /// Make `image` the current image. Prompts and masks of the previous image
    /// are discarded and an in-flight encode or decode becomes stale.
    pub fn set_image(&mut self, mut image: RgbaImage) -> Result<()> {
        if image.width() == 0 || image.height() == 0 {
            return Err(SegmentError::validation("image", "has zero size"));
        }
        if normalize_grayscale(&mut image) {
            debug!("Grayscale image equalized");
        }

        self.image = Some(pad_to_square(&image));
        self.clear_prompts();
        if let Some(pending) = self.pending {
            if pending.kind != RequestKind::Initialize {
                debug!(id = %pending.id, "Request superseded by new image");
                self.pending = None;
            }
        }

        if self.backend.is_some() {
            self.state = ControlState::Ready;
            self.set_status("Encode image");
        } else if self.pending.is_none() {
            self.state = ControlState::Idle;
        }
        Ok(())
    }

    pub fn encode_image(&mut self) -> Result<RequestId> {
        if self.pending.is_some() {
            return Err(SegmentError::Busy);
        }
        if self.backend.is_none() {
            return Err(SegmentError::precondition(
                "encode image",
                "models are not loaded",
            ));
        }

        let side = self.geometry.image_side;
        let tensor = {
            let image = self
                .image
                .as_ref()
                .ok_or_else(|| SegmentError::precondition("encode image", "no image selected"))?;
            let resized = DynamicImage::ImageRgba8(image.resize_to_model(side));
            TensorData::from_array(to_model_tensor(&resized).view())
        };

        let id = self.send(RequestKind::Encode, Request::EncodeImage { image: tensor })?;
        self.state = ControlState::Encoding;
        self.set_status("Encoding…");
        Ok(id)
    }

    /// Pointer click at `(x, y)` on a view of `display` size.
    pub fn click(
        &mut self,
        x: f32,
        y: f32,
        display: Size,
        button: PointerButton,
    ) -> Result<RequestId> {
        if display.width == 0 || display.height == 0 {
            return Err(SegmentError::validation("display size", "has zero size"));
        }
        let (x, y) = display_to_model(x, y, display, self.geometry.image_side);
        let point = match button {
            PointerButton::Primary => Point::foreground(x, y),
            PointerButton::Secondary => Point::background(x, y),
        };
        self.add_point(point)
    }

    /// Append a model-space point and decode with every point so far.
    pub fn add_point(&mut self, point: Point) -> Result<RequestId> {
        if self.pending.is_some() {
            return Err(SegmentError::Busy);
        }
        if self.state != ControlState::ImageEncoded {
            return Err(SegmentError::precondition(
                "decode mask",
                "no image has been encoded",
            ));
        }
        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(SegmentError::validation(
                "point",
                format!("({}, {}) is not finite", point.x, point.y),
            ));
        }

        self.points.push(point);
        let request = Request::DecodeMask {
            points: self.points.clone(),
            mask: self.previous_mask.clone(),
        };
        match self.send(RequestKind::Decode, request) {
            Ok(id) => {
                self.state = ControlState::Decoding;
                self.set_status("Decoding…");
                Ok(id)
            }
            Err(err) => {
                self.points.pop();
                Err(err)
            }
        }
    }

    /// Clear points and masks. Models and the encoded image are kept.
    pub fn reset(&mut self) {
        self.clear_prompts();
        if let Some(pending) = self.pending {
            if pending.kind == RequestKind::Decode {
                debug!(id = %pending.id, "Decode superseded by reset");
                self.pending = None;
                self.state = ControlState::ImageEncoded;
            }
        }
        if self.state == ControlState::ImageEncoded {
            self.set_status("Ready. Click on image");
        }
    }

    /// Current image cut out by the current mask, at source resolution.
    pub fn crop(&self) -> Result<RgbaImage> {
        let (image, mask) = self.image_and_mask("crop")?;
        let composite = composite_mask_over_image(image.canvas(), &mask.raster);
        Ok(image.restore_source_extent(&composite))
    }

    /// Mask raster at source resolution.
    pub fn mask_for_source(&self) -> Result<RgbaImage> {
        let (image, mask) = self.image_and_mask("export mask")?;
        Ok(image.restore_source_extent(&mask.raster))
    }

    fn image_and_mask(&self, operation: &str) -> Result<(&PaddedImage, &MaskOverlay)> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| SegmentError::precondition(operation, "no image selected"))?;
        let mask = self
            .mask
            .as_ref()
            .ok_or_else(|| SegmentError::precondition(operation, "no mask has been decoded"))?;
        Ok((image, mask))
    }

    /// Drain every reply that has already arrived, without blocking.
    pub fn poll(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            match self.replies.try_recv() {
                Ok(envelope) => events.extend(self.handle_reply(envelope)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    events.extend(self.worker_lost());
                    break;
                }
            }
        }
        events
    }

    /// Wait for the next event. `None` once the worker is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let Some(envelope) = self.replies.recv().await else {
                return self.worker_lost();
            };
            if let Some(event) = self.handle_reply(envelope) {
                return Some(event);
            }
        }
    }

    /// Stop the worker after its current request and wait for the thread.
    pub fn shutdown(self) -> Result<()> {
        let Self {
            requests,
            replies,
            worker,
            ..
        } = self;
        drop(requests);
        drop(replies);
        worker.join().map_err(|_| SegmentError::WorkerDisconnected)?;
        info!("Worker joined");
        Ok(())
    }

    fn send(&mut self, kind: RequestKind, request: Request) -> Result<RequestId> {
        if self.pending.is_some() {
            return Err(SegmentError::Busy);
        }
        let envelope = Envelope::new(request);
        let id = envelope.id;
        self.requests.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => SegmentError::Busy,
            TrySendError::Closed(_) => SegmentError::WorkerDisconnected,
        })?;
        debug!(%id, ?kind, "Request sent");
        self.pending = Some(PendingRequest { id, kind });
        Ok(id)
    }

    fn handle_reply(&mut self, envelope: Envelope<Reply>) -> Option<SessionEvent> {
        let Envelope { id, body } = envelope;
        let Some(pending) = self.pending.filter(|pending| pending.id == id) else {
            debug!(%id, "Ignoring stale reply");
            return None;
        };
        if body.is_terminal() {
            self.pending = None;
        }

        match body {
            Reply::LoadingInProgress { stage } => {
                self.set_status(stage.to_string());
                Some(SessionEvent::Loading(stage))
            }
            Reply::Ready { device } => {
                self.backend = Some(device);
                self.state = ControlState::Ready;
                self.set_status(if self.image.is_some() {
                    "Encode image"
                } else {
                    "Select an image"
                });
                info!("Models ready on {device}");
                Some(SessionEvent::ModelsReady(device))
            }
            Reply::EncodeDone => {
                self.state = ControlState::ImageEncoded;
                self.set_status("Ready. Click on image");
                Some(SessionEvent::ImageEncoded)
            }
            Reply::DecodeResult {
                masks,
                iou_predictions,
            } => {
                self.state = ControlState::ImageEncoded;
                match self.apply_masks(masks, iou_predictions) {
                    Ok(event) => {
                        self.set_status("Ready. Click on image");
                        Some(event)
                    }
                    Err(err) => Some(self.fail(err.kind(), err.to_string())),
                }
            }
            Reply::Error { kind, message } => {
                self.state = match pending.kind {
                    RequestKind::Initialize => ControlState::Idle,
                    RequestKind::Encode => ControlState::Ready,
                    RequestKind::Decode => ControlState::ImageEncoded,
                };
                Some(self.fail(kind, message))
            }
        }
    }

    fn apply_masks(&mut self, masks: TensorData, scores: Vec<f32>) -> Result<SessionEvent> {
        let [_, count, width, height] = mask_dims(&masks)?;
        if scores.len() != count {
            return Err(SegmentError::validation(
                "iou predictions",
                format!("{} scores for {count} masks", scores.len()),
            ));
        }
        let best_index = select_best_candidate(&scores)
            .ok_or_else(|| SegmentError::validation("iou predictions", "no valid score"))?;
        let best = slice_mask_channel(&masks, best_index)?;
        let raster = mask_to_raster(best, width as u32, height as u32)?;
        let score = scores[best_index];
        debug!(best_index, score, "Mask selected");

        self.previous_mask = Some(TensorData::new(vec![1, 1, width, height], best.to_vec())?);
        self.mask = Some(MaskOverlay {
            raster,
            scores,
            best_index,
        });
        Ok(SessionEvent::MaskUpdated { best_index, score })
    }

    fn worker_lost(&mut self) -> Option<SessionEvent> {
        let pending = self.pending.take()?;
        warn!(id = %pending.id, "Worker stopped with a request in flight");
        self.state = match pending.kind {
            RequestKind::Initialize => ControlState::Idle,
            RequestKind::Encode => ControlState::Ready,
            RequestKind::Decode => ControlState::ImageEncoded,
        };
        let err = SegmentError::WorkerDisconnected;
        Some(self.fail(err.kind(), err.to_string()))
    }

    fn fail(&mut self, kind: FailureKind, message: String) -> SessionEvent {
        warn!("{message}");
        self.set_status(format!("Error: {message}"));
        SessionEvent::Failed { kind, message }
    }

    fn clear_prompts(&mut self) {
        self.points.clear();
        self.previous_mask = None;
        self.mask = None;
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }
}
