use std::borrow::Cow;
use std::fmt;

use ndarray::{ArrayD, ArrayViewD};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider,
    },
    session::{Session, SessionInputValue},
    value::TensorRef,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    errors::{Result, SegmentError},
    traits::{ExecutionBackend, InferenceSession},
};

/// Execution target a session is bound to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[value(name = "tensorrt")]
    TensorRt,
    Cuda,
    Cpu,
}

/// Accelerated first, generic CPU last.
pub const DEFAULT_BACKENDS: [BackendKind; 2] = [BackendKind::Cuda, BackendKind::Cpu];

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TensorRt => "tensorrt",
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
        }
    }

    pub const fn is_accelerated(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Try `backends` in order and return the first session that initializes.
///
/// Candidates are evaluated lazily: once one succeeds, the rest are never touched.
pub fn create_session(
    model: &[u8],
    backends: &[Box<dyn ExecutionBackend>],
) -> Result<(Box<dyn InferenceSession>, BackendKind)> {
    let mut attempts: Vec<(BackendKind, String)> = Vec::with_capacity(backends.len());

    for backend in backends {
        let kind = backend.kind();
        match backend.create_session(model) {
            Ok(session) => {
                if !kind.is_accelerated() && attempts.iter().any(|(k, _)| k.is_accelerated()) {
                    warn!("No accelerator could be used, running on {kind}");
                }
                info!("Session created on {kind}");
                debug!(
                    inputs = ?session.input_names(),
                    outputs = ?session.output_names(),
                    "Session signature"
                );
                return Ok((session, kind));
            }
            Err(err) => {
                warn!("Session creation failed on {kind}: {err}");
                attempts.push((kind, err.to_string()));
            }
        }
    }

    Err(SegmentError::NoBackendAvailable { attempts })
}

/// ONNX Runtime session factory for one execution provider.
#[derive(Debug, Clone)]
pub struct OrtBackend {
    kind: BackendKind,
    device_id: i32,
}

impl OrtBackend {
    pub const fn new(kind: BackendKind, device_id: i32) -> Self {
        Self { kind, device_id }
    }

    /// One backend per kind, preserving the given order.
    pub fn candidates(kinds: &[BackendKind], device_id: i32) -> Vec<Box<dyn ExecutionBackend>> {
        kinds
            .iter()
            .map(|&kind| Box::new(Self::new(kind, device_id)) as Box<dyn ExecutionBackend>)
            .collect()
    }
}

impl ExecutionBackend for OrtBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create_session(&self, model: &[u8]) -> Result<Box<dyn InferenceSession>> {
        // error_on_failure: an unavailable provider must fail here instead of
        // silently running on ort's built-in CPU fallback.
        let provider = match self.kind {
            BackendKind::TensorRt => TensorRTExecutionProvider::default()
                .with_device_id(self.device_id)
                .build(),
            BackendKind::Cuda => CUDAExecutionProvider::default()
                .with_device_id(self.device_id)
                .build(),
            BackendKind::Cpu => CPUExecutionProvider::default().build(),
        }
        .error_on_failure();

        let session = Session::builder()
            .map_err(|e| SegmentError::model("session builder initialization", e))?
            .with_execution_providers([provider])
            .map_err(|e| {
                SegmentError::model(format!("{} execution provider registration", self.kind), e)
            })?
            .with_memory_pattern(true)
            .map_err(|e| SegmentError::model("memory pattern configuration", e))?
            .commit_from_memory(model)
            .map_err(|e| SegmentError::model("model load", e))?;

        Ok(Box::new(OrtSession { session }))
    }
}

pub struct OrtSession {
    session: Session,
}

impl InferenceSession for OrtSession {
    fn input_names(&self) -> Vec<String> {
        self.session.inputs.iter().map(|i| i.name.clone()).collect()
    }

    fn output_names(&self) -> Vec<String> {
        self.session.outputs.iter().map(|o| o.name.clone()).collect()
    }

    fn run(&mut self, inputs: &[(&str, ArrayViewD<'_, f32>)]) -> Result<Vec<ArrayD<f32>>> {
        let output_names = self.output_names();

        let layouts: Vec<_> = inputs
            .iter()
            .map(|(name, view)| (*name, view.as_standard_layout()))
            .collect();
        let mut session_inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> =
            Vec::with_capacity(layouts.len());
        for (name, layout) in &layouts {
            let tensor = TensorRef::from_array_view(layout)
                .map_err(|e| SegmentError::model(format!("input tensor `{name}`"), e))?;
            session_inputs.push((Cow::Borrowed(*name), tensor.into()));
        }

        let outputs = self
            .session
            .run(session_inputs)
            .map_err(|e| SegmentError::model("session run", e))?;

        output_names
            .iter()
            .map(|name| {
                let array = outputs[name.as_str()]
                    .try_extract_array::<f32>()
                    .map_err(|e| SegmentError::model(format!("output tensor `{name}`"), e))?;
                Ok(array.to_owned())
            })
            .collect()
    }
}
