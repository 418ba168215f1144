//! Detector boundary.
//!
//! The detection model is opaque to the kernel: a backend receives a decoded
//! frame and returns violation boxes. Confidence filtering belongs to the
//! adapter layer (`BackendRegistry::detect`), not to retention.

mod backend;
mod backends;
mod registry;

pub use backend::{DetectorBackend, SharedDetector};
pub use backends::{ScriptStep, ScriptedBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::BackendRegistry;
pub(crate) use registry::detect_filtered;
