//! Association + retention for one frame.
//!
//! Shared by the streaming producer and the one-shot sampler. Each box is
//! matched to the nearest tracked entities within `diagonal * radius_factor`
//! of its center, then offered to the ledger.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::evidence::AuditRow;
use crate::frame::{DetectionBox, Frame};
use crate::retention::{Candidate, CandidateEntity, RetentionLedger};
use crate::spatial::SpatialIndex;

/// Audit `sourceInfo` for sample artifacts.
pub const SAMPLE_SOURCE_LABEL: &str = "sample";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Maximum entities attributed to one box.
    pub k: usize,
    /// Search radius as a multiple of the box diagonal.
    pub radius_factor: f32,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            k: 2,
            radius_factor: 1.2,
        }
    }
}

/// One entity newly flagged by an admitted detection.
#[derive(Clone, Debug, PartialEq)]
pub struct Flag {
    pub entity_id: String,
    pub display_name: String,
    pub uid: u64,
    pub confidence: f32,
}

/// Entity matched to a box on the sample path.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleFlag {
    pub entity_id: String,
    pub display_name: String,
    pub bbox: DetectionBox,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SampleOutcome {
    pub artifact: Option<PathBuf>,
    pub flagged: Vec<SampleFlag>,
}

pub struct DetectionProcessor {
    index: Arc<SpatialIndex>,
    ledger: Arc<RetentionLedger>,
    association: AssociationConfig,
}

impl DetectionProcessor {
    pub fn new(
        index: Arc<SpatialIndex>,
        ledger: Arc<RetentionLedger>,
        association: AssociationConfig,
    ) -> Self {
        Self {
            index,
            ledger,
            association,
        }
    }

    pub fn index(&self) -> &Arc<SpatialIndex> {
        &self.index
    }

    pub fn ledger(&self) -> &Arc<RetentionLedger> {
        &self.ledger
    }

    /// Tracked entities near the box center, nearest first.
    pub fn associate(&self, bbox: &DetectionBox) -> Result<Vec<CandidateEntity>> {
        let (cx, cy) = bbox.center();
        let radius = bbox.diagonal() * self.association.radius_factor;
        let neighbors = self
            .index
            .nearest_k(cx, cy, self.association.k, Some(radius))?;

        let mut out = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            // Removed between the lookup and now.
            let Some(entity) = self.index.get(&neighbor.id)? else {
                continue;
            };
            out.push(CandidateEntity {
                id: entity.id,
                display_name: entity.display_name,
                distance: neighbor.distance,
            });
        }
        Ok(out)
    }

    /// Associate and offer every box; returns the entities flagged by admitted boxes.
    pub fn process_frame(
        &self,
        frame: &Frame,
        boxes: &[DetectionBox],
        source_label: &str,
        now: SystemTime,
    ) -> Result<Vec<Flag>> {
        let mut flags = Vec::new();
        for bbox in boxes {
            let entities = self.associate(bbox)?;
            if entities.is_empty() {
                continue;
            }
            let candidate = Candidate {
                bbox: *bbox,
                entities,
                frame,
                source_label,
            };
            let admission = self.ledger.consider(&candidate, now)?;
            let Some(uid) = admission.uid else {
                continue;
            };
            if let Some(evicted) = admission.evicted_uid {
                log::debug!("uid {} evicted uid {} ({})", uid, evicted, source_label);
            }
            for entity_id in admission.admitted_entity_ids {
                let display_name = candidate
                    .entities
                    .iter()
                    .find(|e| e.id == entity_id)
                    .map(|e| e.display_name.clone())
                    .unwrap_or_else(|| entity_id.clone());
                log::info!(
                    "flagged {} ({}) uid {} confidence {:.3} at {}",
                    display_name,
                    entity_id,
                    uid,
                    bbox.confidence,
                    source_label
                );
                flags.push(Flag {
                    entity_id,
                    display_name,
                    uid,
                    confidence: bbox.confidence,
                });
            }
        }
        Ok(flags)
    }

    /// Save one annotated sample with every box and log one row per
    /// associated entity. The sample never enters the top-N set.
    pub fn process_sample(
        &self,
        frame: &Frame,
        boxes: &[DetectionBox],
        now: SystemTime,
    ) -> Result<SampleOutcome> {
        let mut flagged = Vec::new();
        for bbox in boxes {
            for entity in self.associate(bbox)? {
                flagged.push(SampleFlag {
                    entity_id: entity.id,
                    display_name: entity.display_name,
                    bbox: *bbox,
                });
            }
        }

        let artifact = self.ledger.record_sample(
            frame,
            boxes,
            |path| {
                flagged
                    .iter()
                    .map(|flag| {
                        let (center_x, center_y) = flag.bbox.center();
                        AuditRow {
                            timestamp: now,
                            artifact_path: path.clone(),
                            source_info: SAMPLE_SOURCE_LABEL.to_string(),
                            entity_name: flag.display_name.clone(),
                            entity_id: flag.entity_id.clone(),
                            confidence: flag.bbox.confidence,
                            center_x,
                            center_y,
                        }
                    })
                    .collect()
            },
            now,
        )?;

        Ok(SampleOutcome { artifact, flagged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::InMemoryEvidenceStore;
    use crate::retention::RetentionPolicy;
    use crate::Entity;
    use std::time::{Duration, UNIX_EPOCH};

    fn processor(store: &InMemoryEvidenceStore) -> DetectionProcessor {
        let index = SpatialIndex::from_entities([
            Entity::new("1", "Ada", 20.0, 20.0),
            Entity::new("2", "Grace", 30.0, 20.0),
            Entity::new("3", "Linus", 40.0, 20.0),
            Entity::new("far", "Far", 500.0, 500.0),
        ])
        .unwrap();
        let ledger = RetentionLedger::new(RetentionPolicy::default(), Box::new(store.clone()))
            .unwrap();
        DetectionProcessor::new(
            Arc::new(index),
            Arc::new(ledger),
            AssociationConfig::default(),
        )
    }

    #[test]
    fn association_takes_two_nearest_within_radius() -> Result<()> {
        let store = InMemoryEvidenceStore::new();
        let processor = processor(&store);
        // Center (20, 20), diagonal ~14.1, radius ~17.
        let bbox = DetectionBox::new(15.0, 15.0, 25.0, 25.0, 0.8);
        let ids: Vec<String> = processor
            .associate(&bbox)?
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
        Ok(())
    }

    #[test]
    fn process_frame_flags_each_admitted_entity() -> Result<()> {
        let store = InMemoryEvidenceStore::new();
        let processor = processor(&store);
        let frame = Frame::synthetic(64, 64, 0)?;
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let boxes = [
            DetectionBox::new(15.0, 15.0, 25.0, 25.0, 0.8),
            DetectionBox::new(0.0, 0.0, 2.0, 2.0, 0.9),
        ];
        let flags = processor.process_frame(&frame, &boxes, "clip@1", now)?;
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].uid, flags[1].uid);
        assert_eq!(processor.ledger().len(), 1);
        assert_eq!(store.rows()[0].source_info, "clip@1");
        Ok(())
    }

    #[test]
    fn sample_bypasses_top_n() -> Result<()> {
        let store = InMemoryEvidenceStore::new();
        let processor = processor(&store);
        let frame = Frame::synthetic(64, 64, 0)?;
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let outcome = processor.process_sample(
            &frame,
            &[DetectionBox::new(35.0, 15.0, 45.0, 25.0, 0.6)],
            now,
        )?;
        assert_eq!(
            outcome.artifact,
            Some(PathBuf::from("flagged_sample_1700000000.jpg"))
        );
        assert_eq!(outcome.flagged.len(), 2);
        assert!(processor.ledger().is_empty());
        let rows = store.rows();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.source_info == SAMPLE_SOURCE_LABEL));
        Ok(())
    }
}
