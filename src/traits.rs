use ndarray::{ArrayD, ArrayViewD};

use crate::errors::Result;
use crate::session::BackendKind;

/// A loaded model that can run forward passes.
///
/// Callers depend on this instead of concrete `ort` types.
/// Only the worker thread owns a session, so `Send` is enough.
pub trait InferenceSession: Send {
    /// Input names in declaration order.
    fn input_names(&self) -> Vec<String>;

    /// Output names in declaration order.
    fn output_names(&self) -> Vec<String>;

    /// Run one forward pass; outputs come back in declaration order.
    fn run(&mut self, inputs: &[(&str, ArrayViewD<'_, f32>)]) -> Result<Vec<ArrayD<f32>>>;
}

/// An execution backend (accelerator or CPU) that can build sessions.
///
/// Fallback tries the candidates one at a time, in order.
pub trait ExecutionBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Build a session from serialized model bytes.
    fn create_session(&self, model: &[u8]) -> Result<Box<dyn InferenceSession>>;
}

/// Key-value store for downloaded model artifacts.
pub trait ArtifactCache: Send {
    /// Cached bytes for `key`, or `None` on a miss.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `bytes` under `key`. Callers treat failures as non-fatal.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Network download of an artifact.
pub trait ArtifactFetcher: Send {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}
