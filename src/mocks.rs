use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::{
    artifact::{ArtifactStore, ModelArtifact, ModelArtifacts},
    errors::{Result, SegmentError},
    model::{Sam2Model, ENCODER_INPUT, HAS_MASK_INPUT, MASK_INPUT, POINT_LABELS},
    session::BackendKind,
    traits::{ArtifactCache, ArtifactFetcher, ExecutionBackend, InferenceSession},
};

/// Model bytes the mock backend recognizes as encoder or decoder.
pub const MOCK_ENCODER_BYTES: &[u8] = b"mock-encoder";
pub const MOCK_DECODER_BYTES: &[u8] = b"mock-decoder";

pub const MOCK_ENCODER_URL: &str = "https://models.test/sam2/encoder.ort";
pub const MOCK_DECODER_URL: &str = "https://models.test/sam2/decoder.onnx";

/// Default IoU scores; channel 1 wins.
pub const MOCK_SCORES: [f32; 3] = [0.25, 0.9, 0.5];

/// One recorded session run.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    pub inputs: Vec<(String, Vec<usize>)>,
    pub labels: Vec<f32>,
    pub has_mask_input: Option<f32>,
    pub mask_input_sum: Option<f32>,
}

impl RecordedRun {
    pub fn input_dims(&self, name: &str) -> Option<Vec<usize>> {
        self.inputs
            .iter()
            .find(|(input, _)| input == name)
            .map(|(_, dims)| dims.clone())
    }

    pub fn is_decode(&self) -> bool {
        self.input_dims(MASK_INPUT).is_some()
    }
}

/// Run log shared by every session a backend creates.
#[derive(Debug, Clone, Default)]
pub struct RunLog(Arc<Mutex<Vec<RecordedRun>>>);

impl RunLog {
    pub fn runs(&self) -> Vec<RecordedRun> {
        self.0.lock().clone()
    }

    pub fn decodes(&self) -> Vec<RecordedRun> {
        self.0.lock().iter().filter(|r| r.is_decode()).cloned().collect()
    }

    fn record(&self, inputs: &[(&str, ArrayViewD<'_, f32>)]) {
        let find = |name: &str| inputs.iter().find(|(input, _)| *input == name);
        let run = RecordedRun {
            inputs: inputs
                .iter()
                .map(|(name, view)| ((*name).to_string(), view.shape().to_vec()))
                .collect(),
            labels: find(POINT_LABELS)
                .map(|(_, view)| view.iter().copied().collect())
                .unwrap_or_default(),
            has_mask_input: find(HAS_MASK_INPUT).and_then(|(_, view)| view.iter().next().copied()),
            mask_input_sum: find(MASK_INPUT).map(|(_, view)| view.sum()),
        };
        self.0.lock().push(run);
    }
}

/// Encoder double.
///
/// Output `i` is a zero tensor shaped `[1, i + 1, 4, 4]`.
pub struct MockEncoderSession {
    outputs: Vec<String>,
    log: RunLog,
}

impl InferenceSession for MockEncoderSession {
    fn input_names(&self) -> Vec<String> {
        vec![ENCODER_INPUT.to_string()]
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn run(&mut self, inputs: &[(&str, ArrayViewD<'_, f32>)]) -> Result<Vec<ArrayD<f32>>> {
        self.log.record(inputs);
        if !inputs.iter().any(|(name, _)| *name == ENCODER_INPUT) {
            return Err(SegmentError::model("mock encoder", "missing `image` input"));
        }
        Ok((0..self.outputs.len())
            .map(|i| ArrayD::zeros(IxDyn(&[1, i + 1, 4, 4])))
            .collect())
    }
}

/// Decoder double.
///
/// The mask side follows `mask_input`. Every value of channel `k` is `k - 1`,
/// so channels 0 and 1 are background and channel 2 is foreground.
pub struct MockDecoderSession {
    scores: Vec<f32>,
    log: RunLog,
}

impl InferenceSession for MockDecoderSession {
    fn input_names(&self) -> Vec<String> {
        crate::model::DECODER_INPUTS
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    fn output_names(&self) -> Vec<String> {
        vec!["masks".to_string(), "iou_predictions".to_string()]
    }

    fn run(&mut self, inputs: &[(&str, ArrayViewD<'_, f32>)]) -> Result<Vec<ArrayD<f32>>> {
        self.log.record(inputs);
        let side = inputs
            .iter()
            .find(|(name, _)| *name == MASK_INPUT)
            .map(|(_, view)| view.shape()[view.ndim() - 1])
            .ok_or_else(|| SegmentError::model("mock decoder", "missing `mask_input` input"))?;

        let count = self.scores.len();
        let masks = Array4::from_shape_fn((1, count, side, side), |(_, k, _, _)| k as f32 - 1.0);
        let scores = Array2::from_shape_vec((1, count), self.scores.clone())?;
        Ok(vec![masks.into_dyn(), scores.into_dyn()])
    }
}

/// Backend double. Recognizes the mock model bytes and records every run.
#[derive(Clone)]
pub struct MockBackend {
    kind: BackendKind,
    available: bool,
    encoder_outputs: Vec<String>,
    scores: Vec<f32>,
    attempts: Arc<Mutex<usize>>,
    log: RunLog,
}

impl MockBackend {
    pub fn available(kind: BackendKind) -> Self {
        Self {
            kind,
            available: true,
            encoder_outputs: ["high_res_feats_0", "high_res_feats_1", "image_embed"]
                .iter()
                .map(|name| name.to_string())
                .collect(),
            scores: MOCK_SCORES.to_vec(),
            attempts: Arc::default(),
            log: RunLog::default(),
        }
    }

    pub fn unavailable(kind: BackendKind) -> Self {
        Self {
            available: false,
            ..Self::available(kind)
        }
    }

    pub fn with_encoder_outputs(mut self, names: &[&str]) -> Self {
        self.encoder_outputs = names.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn with_scores(mut self, scores: &[f32]) -> Self {
        self.scores = scores.to_vec();
        self
    }

    /// Number of `create_session` calls.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }

    pub fn run_log(&self) -> RunLog {
        self.log.clone()
    }
}

impl ExecutionBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create_session(&self, model: &[u8]) -> Result<Box<dyn InferenceSession>> {
        *self.attempts.lock() += 1;
        if !self.available {
            return Err(SegmentError::model(
                format!("{} execution provider registration", self.kind),
                "provider is not available on this machine",
            ));
        }

        if model == MOCK_ENCODER_BYTES {
            Ok(Box::new(MockEncoderSession {
                outputs: self.encoder_outputs.clone(),
                log: self.log.clone(),
            }))
        } else if model == MOCK_DECODER_BYTES {
            Ok(Box::new(MockDecoderSession {
                scores: self.scores.clone(),
                log: self.log.clone(),
            }))
        } else {
            Err(SegmentError::model("model load", "unrecognized model bytes"))
        }
    }
}

/// In-memory artifact cache.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    write_error: Option<io::ErrorKind>,
}

impl MemoryCache {
    pub fn with_entry(self, key: &str, bytes: Vec<u8>) -> Self {
        self.entries.lock().insert(key.to_string(), bytes);
        self
    }

    /// Make every write fail with `kind`.
    pub fn failing_writes(mut self, kind: io::ErrorKind) -> Self {
        self.write_error = Some(kind);
        self
    }

    pub fn stored(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }
}

impl ArtifactCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.stored(key))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if let Some(kind) = self.write_error {
            return Err(SegmentError::FileSystem {
                path: PathBuf::from(key),
                operation: "write cached model".to_string(),
                source: io::Error::from(kind),
            });
        }
        self.entries.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Fetcher with canned responses per URL.
#[derive(Debug, Clone, Default)]
pub struct MockFetcher {
    responses: HashMap<String, Vec<u8>>,
    fail: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    /// Serves both mock model URLs.
    pub fn serving_models() -> Self {
        Self::default()
            .with_response(MOCK_ENCODER_URL, MOCK_ENCODER_BYTES.to_vec())
            .with_response(MOCK_DECODER_URL, MOCK_DECODER_BYTES.to_vec())
    }

    pub fn with_response(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.responses.insert(url.to_string(), bytes);
        self
    }

    /// Every fetch fails as if offline.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl ArtifactFetcher for MockFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.lock().push(url.to_string());
        if self.fail {
            return Err(SegmentError::ModelUnavailable {
                artifact: url.to_string(),
                reason: "network unreachable".to_string(),
            });
        }
        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| SegmentError::ModelUnavailable {
                artifact: url.to_string(),
                reason: "status code 404".to_string(),
            })
    }
}

pub fn mock_artifacts() -> ModelArtifacts {
    ModelArtifacts {
        encoder: ModelArtifact::remote("encoder", MOCK_ENCODER_URL),
        decoder: ModelArtifact::remote("decoder", MOCK_DECODER_URL),
    }
}

/// Model wired to an in-memory cache, a serving fetcher and `backends`.
pub fn mock_model(backends: Vec<Box<dyn ExecutionBackend>>) -> Sam2Model {
    let store = ArtifactStore::new(MemoryCache::default(), MockFetcher::serving_models());
    Sam2Model::new(store, mock_artifacts(), backends)
}
