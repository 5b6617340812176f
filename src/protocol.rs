//! Messages exchanged between the control thread and the inference worker.
//!
//! Every request is wrapped in an [`Envelope`] carrying a fresh [`RequestId`];
//! the worker echoes that id on every reply it produces for the request.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    errors::{FailureKind, SegmentError},
    session::BackendKind,
    tensor::TensorData,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: RequestId,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(body: T) -> Self {
        Self {
            id: RequestId::new(),
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointLabel {
    Background,
    Foreground,
}

impl PointLabel {
    /// Numeric label fed to the decoder.
    pub const fn value(self) -> f32 {
        match self {
            Self::Background => 0.0,
            Self::Foreground => 1.0,
        }
    }
}

/// Prompt point in model space (`0..image_side` on both axes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

impl Point {
    pub const fn foreground(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Foreground,
        }
    }

    pub const fn background(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            label: PointLabel::Background,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// Acquire both models and create their sessions. No-op once ready.
    #[serde(rename = "ping")]
    Initialize,
    /// `[1, 3, S, S]` planar RGB in `0.0..=1.0`.
    EncodeImage { image: TensorData },
    /// All points so far plus the previous best mask (`[1, 1, M, M]`), if any.
    DecodeMask {
        points: Vec<Point>,
        mask: Option<TensorData>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadingStage {
    DownloadingModels,
    CreatingSessions,
}

impl fmt::Display for LoadingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DownloadingModels => f.write_str("Loading model…"),
            Self::CreatingSessions => f.write_str("Creating sessions…"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Reply {
    LoadingInProgress {
        stage: LoadingStage,
    },
    /// Both sessions exist; `device` is the backend the encoder runs on.
    #[serde(rename = "pong")]
    Ready {
        device: BackendKind,
    },
    #[serde(rename = "encodeImageDone")]
    EncodeDone,
    /// `masks` is `[1, K, M, M]`, `iou_predictions` has `K` entries.
    #[serde(rename = "decodeMaskResult")]
    DecodeResult {
        masks: TensorData,
        iou_predictions: Vec<f32>,
    },
    Error {
        kind: FailureKind,
        message: String,
    },
}

impl Reply {
    pub fn from_error(err: &SegmentError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Whether this reply completes its request.
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::LoadingInProgress { .. })
    }
}

/// Index of the highest score. Ties go to the lowest index and NaN never wins.
pub fn select_best_candidate(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_best_candidate() {
        assert_eq!(select_best_candidate(&[0.2, 0.91, 0.91, 0.3]), Some(1));
        assert_eq!(select_best_candidate(&[0.5]), Some(0));
        assert_eq!(select_best_candidate(&[f32::NAN, 0.1, f32::NAN]), Some(1));
        assert_eq!(select_best_candidate(&[-3.0, -1.0, -2.0]), Some(1));
        assert_eq!(select_best_candidate(&[]), None);
        assert_eq!(select_best_candidate(&[f32::NAN]), None);
    }

    #[test]
    fn test_request_wire_tags() {
        let id = RequestId::new();
        let ping = serde_json::to_value(Envelope {
            id,
            body: Request::Initialize,
        })
        .unwrap();
        assert_eq!(ping, json!({ "id": id.to_string(), "type": "ping" }));

        let decode = serde_json::to_value(Request::DecodeMask {
            points: vec![Point::foreground(512.0, 256.0)],
            mask: None,
        })
        .unwrap();
        assert_eq!(
            decode,
            json!({
                "type": "decodeMask",
                "points": [{ "x": 512.0, "y": 256.0, "label": "foreground" }],
                "mask": null
            })
        );
    }

    #[test]
    fn test_reply_wire_tags() {
        let pong = serde_json::to_value(Reply::Ready {
            device: BackendKind::Cpu,
        })
        .unwrap();
        assert_eq!(pong, json!({ "type": "pong", "device": "cpu" }));

        let done = serde_json::to_value(Reply::EncodeDone).unwrap();
        assert_eq!(done, json!({ "type": "encodeImageDone" }));

        let error = serde_json::to_value(Reply::from_error(&SegmentError::precondition(
            "decode mask",
            "no image has been encoded",
        )))
        .unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["kind"], "precondition");
    }

    #[test]
    fn test_only_progress_is_non_terminal() {
        assert!(!Reply::LoadingInProgress {
            stage: LoadingStage::CreatingSessions
        }
        .is_terminal());
        assert!(Reply::EncodeDone.is_terminal());
    }

    #[test]
    fn test_labels() {
        assert_eq!(Point::foreground(0.0, 0.0).label.value(), 1.0);
        assert_eq!(Point::background(0.0, 0.0).label.value(), 0.0);
        assert_ne!(RequestId::new(), RequestId::new());
    }
}
