//! Evidence persistence.
//!
//! `EvidenceStore` is the side-effect boundary of the retention ledger: it
//! writes one annotated artifact per (event, entity), deletes artifacts of
//! evicted records and appends audit rows. `FilesystemEvidenceWriter` is the
//! production store; `InMemoryEvidenceStore` records calls for tests and dry runs.

mod annotate;
mod audit;
mod writer;

pub use audit::{AuditLog, AuditRow, AUDIT_HEADER};
pub use writer::FilesystemEvidenceWriter;

use anyhow::{anyhow, Result};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::frame::{DetectionBox, Frame};
use crate::{sanitize_name, unix_seconds, validate_entity_id};

/// Who an artifact belongs to and when it was produced.
#[derive(Clone, Copy, Debug)]
pub struct ArtifactKey<'a> {
    pub entity_id: &'a str,
    pub display_name: &'a str,
    pub uid: u64,
    pub at: SystemTime,
}

impl ArtifactKey<'_> {
    /// `<sanitizedName>_<id>/top_<uid>_<sanitizedName>_<unixTs>.jpg`
    ///
    /// The id goes into the folder name as-is, so distinct ids never share a
    /// folder even when their display names match.
    pub fn relative_path(&self) -> Result<PathBuf> {
        validate_entity_id(self.entity_id)?;
        let name = sanitize_name(self.display_name);
        let folder = format!("{}_{}", name, self.entity_id);
        let file = format!(
            "top_{}_{}_{}.jpg",
            self.uid,
            name,
            unix_seconds(self.at)?
        );
        Ok(PathBuf::from(folder).join(file))
    }
}

/// `flagged_sample_<unixTs>.jpg`, then `flagged_sample_<unixTs>_<n>.jpg` (n >= 2)
/// for further samples taken within the same second.
fn sample_file_name(at: SystemTime, attempt: u32) -> Result<String> {
    let ts = unix_seconds(at)?;
    Ok(match attempt {
        0 | 1 => format!("flagged_sample_{}.jpg", ts),
        n => format!("flagged_sample_{}_{}.jpg", ts, n),
    })
}

/// First sample name for which `taken` is false.
pub(crate) fn free_sample_name(
    at: SystemTime,
    mut taken: impl FnMut(&str) -> bool,
) -> Result<String> {
    let mut attempt = 1;
    loop {
        let name = sample_file_name(at, attempt)?;
        if !taken(&name) {
            return Ok(name);
        }
        attempt += 1;
    }
}

pub trait EvidenceStore: Send {
    /// Write one annotated artifact and return its path.
    fn save(&mut self, key: &ArtifactKey<'_>, frame: &Frame, bbox: &DetectionBox)
        -> Result<PathBuf>;

    /// Best-effort removal; a missing file is not an error.
    fn delete(&mut self, path: &Path);

    fn append_log(&mut self, row: &AuditRow) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Write a standalone sample artifact with every box drawn. Not part of top-N.
    fn save_sample(
        &mut self,
        frame: &Frame,
        boxes: &[DetectionBox],
        at: SystemTime,
    ) -> Result<PathBuf>;
}

// ----------------------------------------------------------------------------
// In-memory store
// ----------------------------------------------------------------------------

#[derive(Default)]
struct InMemoryState {
    live: BTreeSet<PathBuf>,
    deleted: Vec<PathBuf>,
    samples: Vec<PathBuf>,
    rows: Vec<AuditRow>,
    flushes: u64,
    failing_entities: HashSet<String>,
}

/// Records every call instead of touching the filesystem.
///
/// Cloning yields another handle to the same state, so a test can hand one
/// clone to the ledger and inspect the other.
#[derive(Clone, Default)]
pub struct InMemoryEvidenceStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `save` for `entity_id` fail, simulating an I/O error.
    pub fn fail_saves_for(&self, entity_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_entities.insert(entity_id.to_string());
        }
    }

    /// Artifacts saved and not yet deleted.
    pub fn live_artifacts(&self) -> Vec<PathBuf> {
        self.read(|s| s.live.iter().cloned().collect())
    }

    pub fn deleted(&self) -> Vec<PathBuf> {
        self.read(|s| s.deleted.clone())
    }

    pub fn samples(&self) -> Vec<PathBuf> {
        self.read(|s| s.samples.clone())
    }

    pub fn rows(&self) -> Vec<AuditRow> {
        self.read(|s| s.rows.clone())
    }

    pub fn flush_count(&self) -> u64 {
        self.read(|s| s.flushes)
    }

    fn read<T: Default>(&self, f: impl FnOnce(&InMemoryState) -> T) -> T {
        self.state.lock().map(|s| f(&s)).unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut InMemoryState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("evidence store lock poisoned"))?;
        f(&mut state)
    }
}

impl EvidenceStore for InMemoryEvidenceStore {
    fn save(
        &mut self,
        key: &ArtifactKey<'_>,
        _frame: &Frame,
        _bbox: &DetectionBox,
    ) -> Result<PathBuf> {
        let path = key.relative_path()?;
        self.with_state(|s| {
            if s.failing_entities.contains(key.entity_id) {
                return Err(anyhow!("simulated write failure for {}", key.entity_id));
            }
            s.live.insert(path.clone());
            Ok(path)
        })
    }

    fn delete(&mut self, path: &Path) {
        let _ = self.with_state(|s| {
            s.live.remove(path);
            s.deleted.push(path.to_path_buf());
            Ok(())
        });
    }

    fn append_log(&mut self, row: &AuditRow) -> Result<()> {
        self.with_state(|s| {
            s.rows.push(row.clone());
            Ok(())
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.with_state(|s| {
            s.flushes += 1;
            Ok(())
        })
    }

    fn save_sample(
        &mut self,
        _frame: &Frame,
        _boxes: &[DetectionBox],
        at: SystemTime,
    ) -> Result<PathBuf> {
        self.with_state(|s| {
            let name = free_sample_name(at, |name| s.samples.iter().any(|p| p == Path::new(name)))?;
            let path = PathBuf::from(name);
            s.samples.push(path.clone());
            Ok(path)
        })
    }
}
