use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};

use crate::frame::{DetectionBox, Frame};

use super::backend::{DetectorBackend, SharedDetector};

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, SharedDetector>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedDetector> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<SharedDetector> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the default backend and keep boxes at or above `confidence_threshold`.
    pub fn detect(&self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<DetectionBox>> {
        let backend = self
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        detect_filtered(&backend, frame, confidence_threshold)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one backend and apply the adapter-side confidence filter.
///
/// A panicking backend is reported as an error for this frame. The lock is
/// recovered afterwards so later frames still reach the backend.
pub(crate) fn detect_filtered(
    backend: &SharedDetector,
    frame: &Frame,
    confidence_threshold: f32,
) -> Result<Vec<DetectionBox>> {
    let mut guard = backend.lock().unwrap_or_else(PoisonError::into_inner);
    let boxes = panic::catch_unwind(AssertUnwindSafe(|| guard.detect(frame)))
        .map_err(|payload| anyhow!("detector panicked: {}", panic_message(&*payload)))??;
    Ok(boxes
        .into_iter()
        .filter(|b| b.confidence >= confidence_threshold)
        .collect())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
