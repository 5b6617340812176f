use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::BackendKind;

/// Structured error types for the interactive segmentation pipeline.
///
/// # Why structured errors
///
/// Each variant captures context specific to its error domain (model acquisition,
/// execution backends, tensor wiring, orchestration preconditions), so the control
/// side can tell a fatal session failure from a missing prerequisite without parsing
/// strings. The worker still flattens every failure into a single `error` reply; the
/// [`FailureKind`] travels with it.
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed: {message}")]
    Model { operation: String, message: String },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Model unavailable: {artifact} ({reason})")]
    ModelUnavailable { artifact: String, reason: String },

    #[error("No execution backend could be initialized (tried: {})", format_attempts(.attempts))]
    NoBackendAvailable { attempts: Vec<(BackendKind, String)> },

    #[error("{operation} is not possible yet: {reason}")]
    Precondition { operation: String, reason: String },

    #[error("A request is already in flight")]
    Busy,

    #[error("The background worker has stopped")]
    WorkerDisconnected,
}

pub type Result<T> = std::result::Result<T, SegmentError>;

/// Coarse classification carried by `error` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Session-level failure; `initialize` has to be issued again.
    Fatal,
    /// A prerequisite step is missing; perform it and retry.
    Precondition,
    /// Bad input data. Session and model state are untouched.
    Input,
}

impl SegmentError {
    pub fn model(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Model {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn precondition(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Precondition {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration { .. }
            | Self::FileSystem { .. }
            | Self::Model { .. }
            | Self::ModelUnavailable { .. }
            | Self::NoBackendAvailable { .. }
            | Self::WorkerDisconnected => FailureKind::Fatal,
            Self::Precondition { .. } | Self::Busy => FailureKind::Precondition,
            Self::ImageProcessing { .. } | Self::Validation { .. } => FailureKind::Input,
        }
    }
}

fn format_attempts(attempts: &[(BackendKind, String)]) -> String {
    if attempts.is_empty() {
        return "none".to_string();
    }
    attempts
        .iter()
        .map(|(kind, reason)| format!("{kind}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convert anyhow errors to configuration errors.
///
/// # Why this conversion exists
///
/// Some dependencies return anyhow::Error which lacks structured error information.
/// Rather than propagating the generic error type throughout the codebase, we convert
/// to our domain-specific error type at boundaries.
impl From<anyhow::Error> for SegmentError {
    fn from(err: anyhow::Error) -> Self {
        SegmentError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that has context should construct SegmentError::FileSystem directly with
/// the specific path and operation.
impl From<std::io::Error> for SegmentError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image processing errors.
impl From<image::ImageError> for SegmentError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ndarray shape errors to model errors.
///
/// Shape errors occur while wiring tensors into and out of the sessions, so they
/// are categorized as model errors rather than a separate tensor error type.
impl From<ndarray::ShapeError> for SegmentError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::model("tensor shape conversion", err)
    }
}
