//! Entity map with nearest-K lookup.
//!
//! Written by the operator/controller thread (placement, repositioning,
//! removal), read by the producer for every detection. A `RwLock` keeps reads
//! concurrent; writes are rare and short.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::{validate_entity_id, Entity};

/// One lookup result, ordered by ascending distance.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub distance: f32,
}

#[derive(Default)]
pub struct SpatialIndex {
    entities: RwLock<HashMap<String, Entity>>,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Result<Self> {
        let index = Self::new();
        for entity in entities {
            index.upsert(entity)?;
        }
        Ok(index)
    }

    /// Add an entity or replace the one with the same id.
    pub fn upsert(&self, entity: Entity) -> Result<()> {
        validate_entity_id(&entity.id)?;
        if !entity.x.is_finite() || !entity.y.is_finite() {
            return Err(anyhow!("entity {} has a non-finite position", entity.id));
        }
        let mut guard = self
            .entities
            .write()
            .map_err(|_| anyhow!("spatial index lock poisoned"))?;
        guard.insert(entity.id.clone(), entity);
        Ok(())
    }

    /// Move an existing entity. Returns false when the id is not tracked.
    pub fn reposition(&self, id: &str, x: f32, y: f32) -> Result<bool> {
        if !x.is_finite() || !y.is_finite() {
            return Err(anyhow!("entity {} moved to a non-finite position", id));
        }
        let mut guard = self
            .entities
            .write()
            .map_err(|_| anyhow!("spatial index lock poisoned"))?;
        match guard.get_mut(id) {
            Some(entity) => {
                entity.x = x;
                entity.y = y;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self, id: &str) -> Result<Option<Entity>> {
        let mut guard = self
            .entities
            .write()
            .map_err(|_| anyhow!("spatial index lock poisoned"))?;
        Ok(guard.remove(id))
    }

    pub fn clear(&self) -> Result<()> {
        self.entities
            .write()
            .map_err(|_| anyhow!("spatial index lock poisoned"))?
            .clear();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Entity>> {
        let guard = self
            .entities
            .read()
            .map_err(|_| anyhow!("spatial index lock poisoned"))?;
        Ok(guard.get(id).cloned())
    }

    /// Snapshot of all tracked entities, sorted by id.
    pub fn entities(&self) -> Result<Vec<Entity>> {
        let guard = self
            .entities
            .read()
            .map_err(|_| anyhow!("spatial index lock poisoned"))?;
        let mut out: Vec<Entity> = guard.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.entities.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `k` entities nearest to `(x, y)`, ascending by Euclidean distance.
    ///
    /// When `max_distance` is given, entities farther than it are dropped.
    /// Equal distances are ordered by id so results are deterministic.
    pub fn nearest_k(
        &self,
        x: f32,
        y: f32,
        k: usize,
        max_distance: Option<f32>,
    ) -> Result<Vec<Neighbor>> {
        let guard = self
            .entities
            .read()
            .map_err(|_| anyhow!("spatial index lock poisoned"))?;
        if k == 0 || guard.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<Neighbor> = guard
            .values()
            .map(|entity| Neighbor {
                id: entity.id.clone(),
                distance: (entity.x - x).hypot(entity.y - y),
            })
            .filter(|n| max_distance.map_or(true, |max| n.distance <= max))
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> SpatialIndex {
        SpatialIndex::from_entities([
            Entity::new("near", "Near Seat", 10.0, 10.0),
            Entity::new("far", "Far Seat", 100.0, 100.0),
        ])
        .unwrap()
    }

    #[test]
    fn nearest_k_filters_by_max_distance() -> Result<()> {
        let index = sample_index();
        let hits = index.nearest_k(10.0, 10.0, 2, Some(5.0))?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "near");
        assert_eq!(hits[0].distance, 0.0);
        Ok(())
    }

    #[test]
    fn nearest_k_orders_and_truncates() -> Result<()> {
        let index = sample_index();
        index.upsert(Entity::new("mid", "Mid Seat", 40.0, 10.0))?;
        let hits = index.nearest_k(0.0, 10.0, 2, None)?;
        let ids: Vec<&str> = hits.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
        Ok(())
    }

    #[test]
    fn equal_distances_break_ties_by_id() -> Result<()> {
        let index = SpatialIndex::from_entities([
            Entity::new("b", "B", 5.0, 0.0),
            Entity::new("a", "A", -5.0, 0.0),
        ])?;
        let hits = index.nearest_k(0.0, 0.0, 1, None)?;
        assert_eq!(hits[0].id, "a");
        Ok(())
    }

    #[test]
    fn nearest_k_is_idempotent() -> Result<()> {
        let index = sample_index();
        let first = index.nearest_k(50.0, 40.0, 2, Some(200.0))?;
        let second = index.nearest_k(50.0, 40.0, 2, Some(200.0))?;
        assert_eq!(first, second);
        assert_eq!(index.len(), 2);
        Ok(())
    }

    #[test]
    fn empty_index_returns_empty_list() -> Result<()> {
        let index = SpatialIndex::new();
        assert!(index.nearest_k(0.0, 0.0, 3, None)?.is_empty());
        Ok(())
    }

    #[test]
    fn reposition_and_remove() -> Result<()> {
        let index = sample_index();
        assert!(index.reposition("far", 11.0, 11.0)?);
        assert!(!index.reposition("ghost", 0.0, 0.0)?);
        let hits = index.nearest_k(10.0, 10.0, 2, Some(5.0))?;
        assert_eq!(hits.len(), 2);

        let removed = index.remove("near")?;
        assert_eq!(removed.map(|e| e.display_name), Some("Near Seat".to_string()));
        assert!(index.get("near")?.is_none());
        Ok(())
    }

    #[test]
    fn upsert_rejects_invalid_ids() {
        let index = SpatialIndex::new();
        assert!(index.upsert(Entity::new("bad id", "x", 0.0, 0.0)).is_err());
        assert!(index
            .upsert(Entity::new("ok", "x", f32::NAN, 0.0))
            .is_err());
    }
}
