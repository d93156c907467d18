//! Entity handles and their allocation.
//!
//! An [`Entity`] is an `index` into the manager's generation table plus the
//! `generation` that was current when the handle was issued. Destroying an
//! entity bumps the stored generation, so every outstanding copy of the old
//! handle stops being alive immediately.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::config::EcsConfig;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    index: u32,
    generation: u16,
}

impl Entity {
    /// Construct an `Entity` from an index and generation.
    #[inline]
    pub fn new(index: u32, generation: u16) -> Self {
        Self { index, generation }
    }

    /// Slot in the generation table.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation this handle was issued with.
    #[inline]
    pub fn generation(self) -> u16 {
        self.generation
    }

    /// Packed representation: `[0: u16 | generation: u16 | index: u32]`.
    ///
    /// This is the value stored in a data block's entity column.
    #[inline]
    pub fn to_bits(self) -> u64 {
        (self.generation as u64) << 32 | self.index as u64
    }

    /// Inverse of [`to_bits`](Self::to_bits).
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u16,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// EntityManager
// ---------------------------------------------------------------------------

/// Issues and recycles [`Entity`] handles.
///
/// Freed indices wait in a FIFO queue. An index is only handed out again once
/// the queue holds more than `min_free_indices_before_reuse` entries, which
/// spreads generation bumps over many slots and makes it unlikely that a stale
/// handle collides with a wrapped generation.
#[derive(Debug)]
pub struct EntityManager {
    /// Current generation for each index slot.
    generations: Vec<u16>,
    /// Recyclable indices, oldest first.
    free_indices: VecDeque<u32>,
    min_free_indices_before_reuse: usize,
    max_entity_count: u32,
}

impl EntityManager {
    /// Create an empty manager with the reuse policy from `config`.
    pub fn new(config: &EcsConfig) -> Self {
        Self {
            generations: Vec::new(),
            free_indices: VecDeque::new(),
            min_free_indices_before_reuse: config.min_free_indices_before_reuse,
            max_entity_count: config.max_entity_count,
        }
    }

    /// Issue a new handle, recycling the oldest freed index if enough have
    /// accumulated.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::EntityLimitReached`] when a fresh index would exceed
    /// the configured maximum.
    pub fn create(&mut self) -> Result<Entity, EcsError> {
        let entity = self.peek_next()?;
        if self.reuses_next() {
            self.free_indices.pop_front();
        } else {
            self.generations.push(0);
        }
        Ok(entity)
    }

    /// The handle the next [`create`](Self::create) will return, without
    /// issuing it.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub fn peek_next(&self) -> Result<Entity, EcsError> {
        if self.reuses_next() {
            if let Some(&index) = self.free_indices.front() {
                // Generation was already bumped in `destroy`.
                return Ok(Entity::new(index, self.generations[index as usize]));
            }
        }
        let index = self.next_fresh_index(1)?;
        Ok(Entity::new(index, 0))
    }

    /// Issue `count` handles on fresh indices, skipping the free list.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::EntityLimitReached`] if the batch does not fit;
    /// nothing is allocated in that case.
    pub fn create_many(&mut self, count: usize) -> Result<Vec<Entity>, EcsError> {
        let batch = self.peek_many(count)?;
        self.generations.resize(self.generations.len() + count, 0);
        Ok(batch)
    }

    /// The handles the next [`create_many`](Self::create_many) will return.
    ///
    /// # Errors
    ///
    /// Same as [`create_many`](Self::create_many).
    pub fn peek_many(&self, count: usize) -> Result<Vec<Entity>, EcsError> {
        let first = self.next_fresh_index(count)?;
        Ok((0..count as u32).map(|i| Entity::new(first + i, 0)).collect())
    }

    /// Retire a handle: bump its generation and queue the index for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::InvalidEntity`] for a stale or unknown handle. The
    /// manager is left unchanged, so a double destroy cannot poison the free
    /// list.
    pub fn destroy(&mut self, entity: Entity) -> Result<(), EcsError> {
        self.validate(entity)?;
        let slot = &mut self.generations[entity.index() as usize];
        *slot = slot.wrapping_add(1);
        self.free_indices.push_back(entity.index());
        Ok(())
    }

    /// Destroy every handle in `entities`, stopping at the first invalid one.
    ///
    /// # Errors
    ///
    /// Propagates the first [`EcsError::InvalidEntity`].
    pub fn destroy_many(&mut self, entities: &[Entity]) -> Result<(), EcsError> {
        entities.iter().try_for_each(|&e| self.destroy(e))
    }

    /// `true` iff `entity`'s generation matches the stored one.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.generations
            .get(entity.index() as usize)
            .is_some_and(|&g| g == entity.generation())
    }

    /// [`is_alive`](Self::is_alive) as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::InvalidEntity`] when the handle is not alive.
    #[inline]
    pub fn validate(&self, entity: Entity) -> Result<(), EcsError> {
        if self.is_alive(entity) {
            Ok(())
        } else {
            Err(EcsError::InvalidEntity { entity })
        }
    }

    /// Number of currently alive entities.
    pub fn count(&self) -> usize {
        self.generations.len() - self.free_indices.len()
    }

    /// Number of index slots ever handed out.
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }

    fn reuses_next(&self) -> bool {
        self.free_indices.len() > self.min_free_indices_before_reuse
    }

    fn next_fresh_index(&self, count: usize) -> Result<u32, EcsError> {
        let first = self.generations.len();
        if first + count > self.max_entity_count as usize {
            return Err(EcsError::EntityLimitReached {
                max: self.max_entity_count,
            });
        }
        Ok(first as u32)
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new(&EcsConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(reuse_after: usize) -> EntityManager {
        EntityManager::new(&EcsConfig {
            min_free_indices_before_reuse: reuse_after,
            ..Default::default()
        })
    }

    #[test]
    fn create_unique_indices() {
        let mut entities = manager(0);
        let ids: Vec<Entity> = (0..100).map(|_| entities.create().unwrap()).collect();
        let mut indices: Vec<u32> = ids.iter().map(|id| id.index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 100);
        assert!(ids.iter().all(|&e| entities.is_alive(e)));
    }

    #[test]
    fn destroy_makes_handle_stale() {
        let mut entities = manager(0);
        let e = entities.create().unwrap();
        assert!(entities.is_alive(e));
        entities.destroy(e).unwrap();
        assert!(!entities.is_alive(e));
    }

    #[test]
    fn recycled_index_gets_new_generation() {
        let mut entities = manager(0);
        let e0 = entities.create().unwrap();
        entities.destroy(e0).unwrap();
        let e1 = entities.create().unwrap();
        assert_eq!(e1.index(), e0.index());
        assert_ne!(e1.generation(), e0.generation());
        assert!(!entities.is_alive(e0), "stale handle must stay dead after reuse");
        assert!(entities.is_alive(e1));
    }

    #[test]
    fn reuse_waits_for_threshold() {
        let mut entities = manager(2);
        let _a = entities.create().unwrap();
        let b = entities.create().unwrap();
        let _c = entities.create().unwrap();
        entities.destroy(b).unwrap();

        // One freed index is not more than the threshold of two.
        let d = entities.create().unwrap();
        assert_eq!(d.index(), 3);

        let e = entities.create().unwrap();
        let f = entities.create().unwrap();
        entities.destroy(e).unwrap();
        entities.destroy(f).unwrap();

        // Three queued indices now exceed the threshold; oldest comes first.
        let g = entities.create().unwrap();
        assert_eq!(g.index(), b.index());
        assert_eq!(g.generation(), 1);
    }

    #[test]
    fn double_destroy_is_rejected() {
        let mut entities = manager(0);
        let e = entities.create().unwrap();
        entities.destroy(e).unwrap();
        assert!(matches!(
            entities.destroy(e),
            Err(EcsError::InvalidEntity { .. })
        ));
        assert_eq!(entities.count(), 0);
    }

    #[test]
    fn unknown_index_is_not_alive() {
        let entities = manager(0);
        assert!(!entities.is_alive(Entity::new(7, 0)));
        assert!(entities.validate(Entity::new(7, 0)).is_err());
    }

    #[test]
    fn create_many_skips_free_list() {
        let mut entities = manager(0);
        let e = entities.create().unwrap();
        entities.destroy(e).unwrap();
        let batch = entities.create_many(3).unwrap();
        let indices: Vec<u32> = batch.iter().map(|e| e.index()).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(entities.count(), 3);
    }

    #[test]
    fn entity_limit_is_enforced() {
        let mut entities = EntityManager::new(&EcsConfig {
            max_entity_count: 2,
            ..Default::default()
        });
        entities.create().unwrap();
        entities.create().unwrap();
        assert!(matches!(
            entities.create(),
            Err(EcsError::EntityLimitReached { max: 2 })
        ));
        assert!(entities.create_many(1).is_err());
        assert_eq!(entities.capacity(), 2);
    }

    #[test]
    fn generation_wraps_without_panicking() {
        let mut entities = manager(0);
        let mut e = entities.create().unwrap();
        for _ in 0..=u16::MAX as u32 {
            entities.destroy(e).unwrap();
            e = entities.create().unwrap();
        }
        assert_eq!(e.index(), 0);
        assert_eq!(e.generation(), 0);
    }

    #[test]
    fn peek_matches_create() {
        let mut entities = manager(1);
        for _ in 0..4 {
            let e = entities.create().unwrap();
            entities.destroy(e).unwrap();
            let peeked = entities.peek_next().unwrap();
            assert_eq!(entities.create().unwrap(), peeked);
        }
        let batch = entities.peek_many(3).unwrap();
        assert_eq!(entities.create_many(3).unwrap(), batch);
    }

    #[test]
    fn bits_roundtrip() {
        let e = Entity::new(42, 7);
        assert_eq!(Entity::from_bits(e.to_bits()), e);
        assert_eq!(e.to_string(), "42v7");
    }
}
