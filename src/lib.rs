pub mod artifact;
pub mod config;
pub mod controller;
pub mod errors;
pub mod imageops;
pub mod model;
pub mod protocol;
pub mod session;
pub mod tensor;
pub mod traits;
pub mod worker;

pub mod mocks;

/// Side of the square image the encoder consumes.
pub const MODEL_IMAGE_SIZE: u32 = 1024;
/// Side of the square masks the decoder produces.
pub const MODEL_MASK_SIZE: u32 = 256;

pub use artifact::{ArtifactStore, DirectoryCache, HttpFetcher, ModelArtifact, ModelArtifacts};
pub use config::Config;
pub use controller::{ControlState, InteractiveSession, MaskOverlay, PointerButton, SessionEvent};
pub use errors::{FailureKind, Result, SegmentError};
pub use model::{ModelGeometry, Sam2Model};
pub use protocol::{Point, PointLabel};
pub use session::{BackendKind, OrtBackend};
pub use traits::*;
