use ndarray::prelude::*;
use tracing::{debug, debug_span, info, warn};

use crate::{
    artifact::{ArtifactStore, ModelArtifacts},
    errors::{Result, SegmentError},
    protocol::{LoadingStage, Point},
    session::{create_session, BackendKind},
    tensor::TensorData,
    traits::{ExecutionBackend, InferenceSession},
    MODEL_IMAGE_SIZE, MODEL_MASK_SIZE,
};

pub const ENCODER_INPUT: &str = "image";

pub const IMAGE_EMBED: &str = "image_embed";
pub const HIGH_RES_FEATS_0: &str = "high_res_feats_0";
pub const HIGH_RES_FEATS_1: &str = "high_res_feats_1";
pub const POINT_COORDS: &str = "point_coords";
pub const POINT_LABELS: &str = "point_labels";
pub const MASK_INPUT: &str = "mask_input";
pub const HAS_MASK_INPUT: &str = "has_mask_input";

/// Decoder input names in the order they are fed.
pub const DECODER_INPUTS: [&str; 7] = [
    IMAGE_EMBED,
    HIGH_RES_FEATS_0,
    HIGH_RES_FEATS_1,
    POINT_COORDS,
    POINT_LABELS,
    MASK_INPUT,
    HAS_MASK_INPUT,
];

/// Side lengths of the model's square image input and mask output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelGeometry {
    pub image_side: u32,
    pub mask_side: u32,
}

impl Default for ModelGeometry {
    fn default() -> Self {
        Self {
            image_side: MODEL_IMAGE_SIZE,
            mask_side: MODEL_MASK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Acquiring,
    Ready(BackendKind),
    Failed(String),
}

struct SessionSlot {
    state: SessionState,
    session: Option<Box<dyn InferenceSession>>,
}

impl SessionSlot {
    const fn unloaded() -> Self {
        Self {
            state: SessionState::Unloaded,
            session: None,
        }
    }

    fn ready(&mut self, session: Box<dyn InferenceSession>, backend: BackendKind) {
        self.session = Some(session);
        self.state = SessionState::Ready(backend);
    }

    fn fail(&mut self, reason: &str) {
        self.session = None;
        self.state = SessionState::Failed(reason.to_string());
    }

    fn session_mut(&mut self, operation: &str) -> Result<&mut Box<dyn InferenceSession>> {
        self.session
            .as_mut()
            .ok_or_else(|| SegmentError::precondition(operation, "models are not loaded"))
    }
}

/// Encoder outputs for the current image, reused by every decode.
pub struct EncodedImage {
    pub high_res_feats_0: ArrayD<f32>,
    pub high_res_feats_1: ArrayD<f32>,
    pub image_embed: ArrayD<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutput {
    /// `[1, K, M, M]` mask logits.
    pub masks: TensorData,
    /// One predicted IoU per mask channel.
    pub iou_predictions: Vec<f32>,
}

/// Two-stage SAM2 model: encoder and decoder sessions plus the encoded state of
/// the current image.
///
/// Owned by the worker thread; nothing here is shared.
pub struct Sam2Model {
    store: ArtifactStore,
    artifacts: ModelArtifacts,
    backends: Vec<Box<dyn ExecutionBackend>>,
    geometry: ModelGeometry,
    encoder: SessionSlot,
    decoder: SessionSlot,
    encoded: Option<EncodedImage>,
}

impl Sam2Model {
    pub fn new(
        store: ArtifactStore,
        artifacts: ModelArtifacts,
        backends: Vec<Box<dyn ExecutionBackend>>,
    ) -> Self {
        Self {
            store,
            artifacts,
            backends,
            geometry: ModelGeometry::default(),
            encoder: SessionSlot::unloaded(),
            decoder: SessionSlot::unloaded(),
            encoded: None,
        }
    }

    pub fn with_geometry(mut self, geometry: ModelGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub const fn geometry(&self) -> ModelGeometry {
        self.geometry
    }

    pub const fn encoder_state(&self) -> &SessionState {
        &self.encoder.state
    }

    pub const fn decoder_state(&self) -> &SessionState {
        &self.decoder.state
    }

    /// Backend the encoder runs on, once ready.
    pub fn active_backend(&self) -> Option<BackendKind> {
        match (&self.encoder.state, &self.decoder.state) {
            (SessionState::Ready(backend), SessionState::Ready(_)) => Some(*backend),
            _ => None,
        }
    }

    pub const fn has_encoded_image(&self) -> bool {
        self.encoded.is_some()
    }

    /// Acquire both artifacts and create both sessions.
    ///
    /// `progress` is called before the download and again before session
    /// creation. A no-op when both sessions are already ready.
    pub fn initialize(&mut self, mut progress: impl FnMut(LoadingStage)) -> Result<BackendKind> {
        if let Some(backend) = self.active_backend() {
            debug!("Models already loaded on {backend}");
            return Ok(backend);
        }

        self.encoded = None;
        self.encoder.state = SessionState::Acquiring;
        self.decoder.state = SessionState::Acquiring;

        match self.load_sessions(&mut progress) {
            Ok(backend) => {
                info!("Models ready on {backend}");
                Ok(backend)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!("Model initialization failed: {reason}");
                self.encoder.fail(&reason);
                self.decoder.fail(&reason);
                Err(err)
            }
        }
    }

    fn load_sessions(&mut self, progress: &mut impl FnMut(LoadingStage)) -> Result<BackendKind> {
        progress(LoadingStage::DownloadingModels);
        let encoder_bytes = self.store.acquire(&self.artifacts.encoder)?;
        let decoder_bytes = self.store.acquire(&self.artifacts.decoder)?;

        progress(LoadingStage::CreatingSessions);
        let (encoder, encoder_backend) = create_session(&encoder_bytes, &self.backends)?;
        self.encoder.ready(encoder, encoder_backend);
        let (decoder, decoder_backend) = create_session(&decoder_bytes, &self.backends)?;
        self.decoder.ready(decoder, decoder_backend);

        if encoder_backend != decoder_backend {
            info!("Encoder runs on {encoder_backend}, decoder on {decoder_backend}");
        }
        Ok(encoder_backend)
    }

    /// Run the encoder on a `[1, 3, S, S]` image tensor and keep its outputs.
    pub fn encode(&mut self, image: ArrayViewD<'_, f32>) -> Result<()> {
        let side = self.geometry.image_side as usize;
        let session = self.encoder.session_mut("encode image")?;
        if image.shape() != [1, 3, side, side] {
            return Err(SegmentError::validation(
                "image tensor",
                format!("expected [1, 3, {side}, {side}], got {:?}", image.shape()),
            ));
        }

        // A failed encode must not leave the previous image's features behind.
        self.encoded = None;

        let _span = debug_span!("encode").entered();
        let outputs = session.run(&[(ENCODER_INPUT, image)])?;
        let output_count = outputs.len();
        let mut outputs = outputs.into_iter();
        let (Some(high_res_feats_0), Some(high_res_feats_1), Some(image_embed)) =
            (outputs.next(), outputs.next(), outputs.next())
        else {
            return Err(SegmentError::model(
                "encode image",
                format!("encoder produced {output_count} outputs, expected 3"),
            ));
        };

        debug!(
            high_res_feats_0 = ?high_res_feats_0.shape(),
            high_res_feats_1 = ?high_res_feats_1.shape(),
            image_embed = ?image_embed.shape(),
            "Image encoded"
        );
        self.encoded = Some(EncodedImage {
            high_res_feats_0,
            high_res_feats_1,
            image_embed,
        });
        Ok(())
    }

    /// Run the decoder for `points` against the current encoded image.
    ///
    /// `previous_mask` is the best mask of the previous decode (`[1, 1, M, M]`);
    /// without it the decoder gets zeros and `has_mask_input = 0`.
    pub fn decode(
        &mut self,
        points: &[Point],
        previous_mask: Option<&TensorData>,
    ) -> Result<DecodeOutput> {
        let side = self.geometry.mask_side as usize;
        let session = self.decoder.session_mut("decode mask")?;
        let encoded = self
            .encoded
            .as_ref()
            .ok_or_else(|| SegmentError::precondition("decode mask", "no image has been encoded"))?;

        if points.is_empty() {
            return Err(SegmentError::validation("points", "must not be empty"));
        }
        let count = points.len();
        let coords = Array3::from_shape_vec(
            (1, count, 2),
            points.iter().flat_map(|p| [p.x, p.y]).collect(),
        )?;
        let labels =
            Array2::from_shape_vec((1, count), points.iter().map(|p| p.label.value()).collect())?;

        let (mask_input, has_mask) = match previous_mask {
            Some(mask) if mask.dims == [1, 1, side, side] => (mask.to_array()?, 1.0),
            Some(mask) => {
                return Err(SegmentError::validation(
                    "mask input",
                    format!("expected [1, 1, {side}, {side}], got {:?}", mask.dims),
                ))
            }
            None => (ArrayD::zeros(IxDyn(&[1, 1, side, side])), 0.0),
        };
        let has_mask_input = arr1(&[has_mask]);

        let _span = debug_span!("decode", points = count, has_mask).entered();
        let inputs = [
            (IMAGE_EMBED, encoded.image_embed.view()),
            (HIGH_RES_FEATS_0, encoded.high_res_feats_0.view()),
            (HIGH_RES_FEATS_1, encoded.high_res_feats_1.view()),
            (POINT_COORDS, coords.view().into_dyn()),
            (POINT_LABELS, labels.view().into_dyn()),
            (MASK_INPUT, mask_input.view()),
            (HAS_MASK_INPUT, has_mask_input.view().into_dyn()),
        ];
        let mut outputs = session.run(&inputs)?.into_iter();
        let (Some(masks), Some(iou_predictions)) = (outputs.next(), outputs.next()) else {
            return Err(SegmentError::model(
                "decode mask",
                "decoder produced fewer than 2 outputs",
            ));
        };

        if masks.ndim() != 4 {
            return Err(SegmentError::model(
                "decode mask",
                format!("mask output has shape {:?}, expected 4 dimensions", masks.shape()),
            ));
        }
        debug!(masks = ?masks.shape(), scores = ?iou_predictions.as_slice(), "Mask decoded");

        Ok(DecodeOutput {
            masks: TensorData::from_array(masks.view()),
            iou_predictions: iou_predictions.iter().copied().collect(),
        })
    }
}
