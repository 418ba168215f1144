use anyhow::Result;
use std::sync::{Arc, Mutex};

use crate::frame::{DetectionBox, Frame};

/// Detector handle shared between the controller and the producer thread.
pub type SharedDetector = Arc<Mutex<dyn DetectorBackend>>;

/// Detector backend trait.
///
/// `detect` may be slow and may fail. Callers treat an `Err` as "no detections
/// for this frame" and call again on the next frame, so a backend must stay
/// usable after returning an error.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame and return violation boxes in frame pixels.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
