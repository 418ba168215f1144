//! EyeSpy evidence kernel
//!
//! This crate implements the retention-and-streaming core of a violation monitor:
//! a detector runs over frames from one source, each detection is associated
//! with the nearest tracked entities on a 2-D map, and a bounded, confidence-ranked
//! set of evidence frames is kept per entity alongside an append-only audit log.
//!
//! # Module Structure
//!
//! - `frame`: decoded frames and detection geometry
//! - `detect`: detector backend boundary and registry
//! - `spatial`: entity map with nearest-K lookup
//! - `retention`: bounded top-N evidence ledger with per-entity rate limits
//! - `evidence`: artifact persistence and the audit log
//! - `ingest`: source descriptors and frame sources (image folders, video, camera)
//! - `processor`: association + retention step for one frame
//! - `pipeline`: producer/consumer streaming with pause/stop/terminate
//! - `sampler`: one-shot frame acquisition
//! - `config`: daemon configuration

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod evidence;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod processor;
pub mod retention;
pub mod sampler;
pub mod spatial;
pub mod ui;

pub use config::MonitorConfig;
pub use detect::{BackendRegistry, DetectorBackend, ScriptStep, ScriptedBackend, StubBackend};
pub use evidence::{
    ArtifactKey, AuditLog, AuditRow, EvidenceStore, FilesystemEvidenceWriter,
    InMemoryEvidenceStore,
};
pub use frame::{DetectionBox, Frame, PixelRect};
pub use ingest::{SourceDescriptor, SourceUnavailable};
pub use pipeline::{
    FrameEvent, OverflowPolicy, PipelineConfig, PipelineState, PipelineStats, StreamPipeline,
};
pub use processor::{AssociationConfig, DetectionProcessor, Flag, SampleOutcome};
pub use retention::{
    Admission, Candidate, CandidateEntity, EvidenceRecord, FlaggedSummary, RetentionLedger,
    RetentionPolicy,
};
pub use sampler::{FrameSampler, SampledFrame};
pub use spatial::{Neighbor, SpatialIndex};

// -------------------- Entities --------------------

/// A tracked point of interest placed by an operator on the source image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique, immutable key (e.g. a roll number).
    pub id: String,
    pub display_name: String,
    pub x: f32,
    pub y: f32,
}

impl Entity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            x,
            y,
        }
    }

    /// Directory name: `<sanitizedName>_<id>`. The id is already restricted
    /// by `validate_entity_id` and is kept verbatim so distinct ids stay distinct.
    pub fn folder_name(&self) -> String {
        format!("{}_{}", sanitize_name(&self.display_name), self.id)
    }
}

/// Entity ids are used in file names and audit rows, so they are restricted to
/// a conservative character set.
///
/// Allowed: "21CS001", "seat-14", "row_3_left"
/// Disallowed: empty ids, whitespace, path separators, anything over 64 chars.
pub fn validate_entity_id(id: &str) -> Result<()> {
    static ENTITY_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ENTITY_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("entity id pattern is valid")
    });
    if !re.is_match(id) {
        return Err(anyhow!(
            "entity id '{}' must match ^[A-Za-z0-9_.-]{{1,64}}$",
            id
        ));
    }
    Ok(())
}

/// Replace spaces with `_` and any other character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    static UNSAFE_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = UNSAFE_RE
        .get_or_init(|| regex::Regex::new(r"[^A-Za-z0-9_-]").expect("sanitize pattern is valid"));
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }
    re.replace_all(trimmed, "_").into_owned()
}

// -------------------- Clock --------------------

/// Whole seconds since the Unix epoch.
pub fn unix_seconds(at: SystemTime) -> Result<u64> {
    Ok(at.duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn now_s() -> Result<u64> {
    unix_seconds(SystemTime::now())
}

// -------------------- Conformance Tests --------------------
