//! Bounded top-N evidence ledger with per-entity rate limits.
//!
//! `RetentionLedger::consider` is the only write path. It runs entirely under
//! one mutex: admission filter, eviction decision, heap/arena/history updates
//! and the evidence writes for the admitted record. State is mutated only
//! after the decision is final, and I/O failures are logged rather than
//! propagated, so a call either admits a full record or changes nothing.

mod heap;

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::evidence::{ArtifactKey, AuditRow, EvidenceStore};
use crate::frame::{DetectionBox, Frame};

use heap::UidMinHeap;

// ----------------------------------------------------------------------------
// Policy
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct RetentionPolicy {
    /// Maximum number of records held (N).
    pub capacity: usize,
    pub max_entries_per_entity: usize,
    /// Minimum spacing between two history entries of one entity.
    pub min_gap: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            capacity: 20,
            max_entries_per_entity: 50,
            min_gap: Duration::from_secs(2),
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(anyhow!("retention capacity must be at least 1"));
        }
        if self.max_entries_per_entity == 0 {
            return Err(anyhow!("max_entries_per_entity must be at least 1"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Inputs and outputs
// ----------------------------------------------------------------------------

/// An entity near a detection, as resolved by the spatial index.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateEntity {
    pub id: String,
    pub display_name: String,
    pub distance: f32,
}

/// One detection offered to the ledger.
#[derive(Clone, Debug)]
pub struct Candidate<'a> {
    pub bbox: DetectionBox,
    pub entities: Vec<CandidateEntity>,
    pub frame: &'a Frame,
    /// Written to the audit log as `sourceInfo`.
    pub source_label: &'a str,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Admission {
    pub accepted: bool,
    pub uid: Option<u64>,
    pub evicted_uid: Option<u64>,
    pub admitted_entity_ids: Vec<String>,
}

impl Admission {
    fn rejected() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvidenceRecord {
    pub uid: u64,
    pub confidence: f32,
    pub entity_ids: Vec<String>,
    /// `None` where the artifact write failed.
    pub artifact_paths: BTreeMap<String, Option<PathBuf>>,
    pub created_at: SystemTime,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub uid: u64,
    pub timestamp: SystemTime,
    pub artifact_path: Option<PathBuf>,
    pub confidence: f32,
}

/// Per-entity roll-up for operator views.
#[derive(Clone, Debug, PartialEq)]
pub struct FlaggedSummary {
    pub display_name: String,
    pub count: usize,
    pub best_confidence: f32,
}

// ----------------------------------------------------------------------------
// Ledger
// ----------------------------------------------------------------------------

struct LedgerState {
    heap: UidMinHeap,
    records: HashMap<u64, EvidenceRecord>,
    history: HashMap<String, Vec<HistoryEntry>>,
    display_names: HashMap<String, String>,
    next_uid: u64,
    store: Box<dyn EvidenceStore>,
}

impl LedgerState {
    fn is_eligible(&self, entity_id: &str, now: SystemTime, policy: &RetentionPolicy) -> bool {
        let Some(entries) = self.history.get(entity_id) else {
            return true;
        };
        if entries.len() >= policy.max_entries_per_entity {
            return false;
        }
        match entries.last() {
            None => true,
            // A clock that went backwards yields Err: not eligible.
            Some(last) => now
                .duration_since(last.timestamp)
                .map(|gap| gap >= policy.min_gap)
                .unwrap_or(false),
        }
    }

    fn evict(&mut self, uid: u64) {
        self.heap.remove(uid);
        let Some(record) = self.records.remove(&uid) else {
            return;
        };
        for path in record.artifact_paths.values().flatten() {
            self.store.delete(path);
        }
        for entity_id in &record.entity_ids {
            if let Some(entries) = self.history.get_mut(entity_id) {
                entries.retain(|e| e.uid != uid);
                if entries.is_empty() {
                    self.history.remove(entity_id);
                }
            }
        }
        log::debug!(
            "evicted uid {} (confidence {:.3}, entities {:?})",
            uid,
            record.confidence,
            record.entity_ids
        );
    }
}

pub struct RetentionLedger {
    policy: RetentionPolicy,
    state: Mutex<LedgerState>,
}

impl RetentionLedger {
    pub fn new(policy: RetentionPolicy, store: Box<dyn EvidenceStore>) -> Result<Self> {
        policy.validate()?;
        let capacity = policy.capacity;
        Ok(Self {
            policy,
            state: Mutex::new(LedgerState {
                heap: UidMinHeap::with_capacity(capacity),
                records: HashMap::with_capacity(capacity),
                history: HashMap::new(),
                display_names: HashMap::new(),
                next_uid: 1,
                store,
            }),
        })
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Offer one detection. See the module docs for atomicity.
    pub fn consider(&self, candidate: &Candidate<'_>, now: SystemTime) -> Result<Admission> {
        let confidence = candidate.bbox.confidence;
        if !confidence.is_finite() {
            log::warn!(
                "rejecting detection with non-finite confidence from {}",
                candidate.source_label
            );
            return Ok(Admission::rejected());
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("retention ledger lock poisoned"))?;

        // 1. Per-entity admission filter.
        let mut eligible: Vec<&CandidateEntity> = Vec::new();
        for entity in &candidate.entities {
            if eligible.iter().any(|e| e.id == entity.id) {
                continue;
            }
            if state.is_eligible(&entity.id, now, &self.policy) {
                eligible.push(entity);
            }
        }
        // 2. Nothing attributable.
        if eligible.is_empty() {
            return Ok(Admission::rejected());
        }

        // 3/4. Capacity check; evict only when strictly greater than the minimum.
        let mut evicted_uid = None;
        if state.heap.len() >= self.policy.capacity {
            match state.heap.peek() {
                Some(min) if confidence > min.confidence => evicted_uid = Some(min.uid),
                _ => return Ok(Admission::rejected()),
            }
        }

        if let Some(uid) = evicted_uid {
            state.evict(uid);
        }

        let uid = state.next_uid;
        state.next_uid += 1;
        let (center_x, center_y) = candidate.bbox.center();
        let mut artifact_paths = BTreeMap::new();
        let mut entity_ids = Vec::with_capacity(eligible.len());

        for entity in &eligible {
            let key = ArtifactKey {
                entity_id: &entity.id,
                display_name: &entity.display_name,
                uid,
                at: now,
            };
            let path = match state.store.save(&key, candidate.frame, &candidate.bbox) {
                Ok(path) => Some(path),
                Err(e) => {
                    log::warn!(
                        "artifact write failed for uid {} entity {} ({}): {:#}",
                        uid,
                        entity.id,
                        candidate.source_label,
                        e
                    );
                    None
                }
            };
            let row = AuditRow {
                timestamp: now,
                artifact_path: path.clone(),
                source_info: candidate.source_label.to_string(),
                entity_name: entity.display_name.clone(),
                entity_id: entity.id.clone(),
                confidence,
                center_x,
                center_y,
            };
            if let Err(e) = state.store.append_log(&row) {
                log::warn!(
                    "audit append failed for uid {} entity {}: {:#}",
                    uid,
                    entity.id,
                    e
                );
            }

            state
                .history
                .entry(entity.id.clone())
                .or_default()
                .push(HistoryEntry {
                    uid,
                    timestamp: now,
                    artifact_path: path.clone(),
                    confidence,
                });
            state
                .display_names
                .insert(entity.id.clone(), entity.display_name.clone());
            artifact_paths.insert(entity.id.clone(), path);
            entity_ids.push(entity.id.clone());
        }

        state.records.insert(
            uid,
            EvidenceRecord {
                uid,
                confidence,
                entity_ids: entity_ids.clone(),
                artifact_paths,
                created_at: now,
            },
        );
        state.heap.push(uid, confidence);

        if let Err(e) = state.store.flush() {
            log::warn!("audit flush failed after uid {}: {:#}", uid, e);
        }

        Ok(Admission {
            accepted: true,
            uid: Some(uid),
            evicted_uid,
            admitted_entity_ids: entity_ids,
        })
    }

    // -------------------- Read path --------------------

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.policy.capacity
    }

    /// Confidence of the weakest retained record.
    pub fn min_confidence(&self) -> Option<f32> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.heap.peek().map(|slot| slot.confidence))
    }

    /// Snapshot of retained records, strongest first.
    pub fn records(&self) -> Result<Vec<EvidenceRecord>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("retention ledger lock poisoned"))?;
        let mut out: Vec<EvidenceRecord> = state.records.values().cloned().collect();
        out.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.uid.cmp(&b.uid))
        });
        Ok(out)
    }

    pub fn history(&self, entity_id: &str) -> Result<Vec<HistoryEntry>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("retention ledger lock poisoned"))?;
        Ok(state.history.get(entity_id).cloned().unwrap_or_default())
    }

    pub fn flagged_summary(&self) -> Result<BTreeMap<String, FlaggedSummary>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("retention ledger lock poisoned"))?;
        let mut out = BTreeMap::new();
        for (entity_id, entries) in &state.history {
            let best_confidence = entries
                .iter()
                .map(|e| e.confidence)
                .fold(f32::MIN, f32::max);
            let display_name = state
                .display_names
                .get(entity_id)
                .cloned()
                .unwrap_or_else(|| entity_id.clone());
            out.insert(
                entity_id.clone(),
                FlaggedSummary {
                    display_name,
                    count: entries.len(),
                    best_confidence,
                },
            );
        }
        Ok(out)
    }

    /// Flush buffered audit rows.
    pub fn flush(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("retention ledger lock poisoned"))?;
        state.store.flush()
    }

    /// Write a sample artifact and its audit rows through the same store.
    /// Sample output never enters the top-N set.
    pub(crate) fn record_sample(
        &self,
        frame: &Frame,
        boxes: &[DetectionBox],
        rows: impl FnOnce(Option<PathBuf>) -> Vec<AuditRow>,
        at: SystemTime,
    ) -> Result<Option<PathBuf>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("retention ledger lock poisoned"))?;
        let path = match state.store.save_sample(frame, boxes, at) {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("sample artifact write failed: {:#}", e);
                None
            }
        };
        for row in rows(path.clone()) {
            state.store.append_log(&row)?;
        }
        state.store.flush()?;
        Ok(path)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
