//! Archetype identity, column layout and the archetype registry.
//!
//! An archetype is the exact set of components an entity owns. Its
//! [`Archetype`] identifier is folded from the component ids in canonical
//! order (entity column first, then ascending id), so the order in which a
//! caller lists components never matters.
//!
//! Each registered archetype gets an [`ArchetypeInstanceInfo`] describing
//! where every column lives inside a data block of the configured size:
//!
//! ```text
//! | entity x N | pad | column 1 x N | pad | column 2 x N | ... |
//! ```
//!
//! where `N` is [`entity_count_max`](ArchetypeInstanceInfo::entity_count_max).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::block::AllocError;
use crate::component::{ComponentId, ComponentInfo, ComponentRegistry};
use crate::query::QueryPart;
use crate::EcsError;

/// Starting value of the archetype identifier fold.
pub const ARCHETYPE_HASH_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Argument-map entry for a component the archetype does not have.
pub const MISSING_COLUMN: u32 = u32::MAX;

/// Offset recorded for tag columns, which own no storage.
pub const TAG_OFFSET: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Opaque identifier of a component set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Archetype(u64);

impl Archetype {
    /// The empty archetype: an entity that has no storage row.
    pub const INVALID: Archetype = Archetype(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Archetype({:#018x})", self.0)
    }
}

/// Fold already-sorted component ids into an archetype identifier.
pub fn identifier_for(sorted_ids: &[ComponentId]) -> Archetype {
    let hash = sorted_ids
        .iter()
        .fold(ARCHETYPE_HASH_SEED, |hash, id| (hash << 5) ^ id.to_bits());
    Archetype(hash)
}

// ---------------------------------------------------------------------------
// ArchetypeInstance
// ---------------------------------------------------------------------------

/// Dense index of a registered archetype. Also indexes the block pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeInstance(pub(crate) u32);

impl ArchetypeInstance {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// ArchetypeDefinition
// ---------------------------------------------------------------------------

/// A canonical, deduplicated component list plus its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchetypeDefinition {
    components: Vec<ComponentInfo>,
    identifier: Archetype,
}

impl ArchetypeDefinition {
    /// Canonicalise `infos`: drop duplicates and any explicit entity
    /// component, sort ascending by id, then put the entity column first.
    pub fn new(infos: impl IntoIterator<Item = ComponentInfo>) -> Self {
        let entity = ComponentInfo::entity();
        let mut components: Vec<ComponentInfo> =
            infos.into_iter().filter(|info| info.id != entity.id).collect();
        components.sort_unstable_by_key(|info| info.id);
        components.dedup_by_key(|info| info.id);
        components.insert(0, entity);

        let ids: Vec<ComponentId> = components.iter().map(|info| info.id).collect();
        Self {
            identifier: identifier_for(&ids),
            components,
        }
    }

    /// Build a definition from registered ids.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::UnknownComponent`] for an id the registry lacks.
    pub fn from_ids(registry: &ComponentRegistry, ids: &[ComponentId]) -> Result<Self, EcsError> {
        let infos = ids
            .iter()
            .map(|&id| registry.require(id).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(infos))
    }

    /// Entity component followed by the rest in ascending id order.
    pub fn components(&self) -> &[ComponentInfo] {
        &self.components
    }

    pub fn identifier(&self) -> Archetype {
        self.identifier
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.components.iter().any(|info| info.id == id)
    }

    /// This definition plus `info`.
    pub fn with(&self, info: ComponentInfo) -> Self {
        Self::new(self.user_components().chain(std::iter::once(info)))
    }

    /// This definition minus `id`.
    pub fn without(&self, id: ComponentId) -> Self {
        Self::new(self.user_components().filter(|info| info.id != id))
    }

    fn user_components(&self) -> impl Iterator<Item = ComponentInfo> + '_ {
        self.components[1..].iter().cloned()
    }
}

// ---------------------------------------------------------------------------
// ArchetypeInstanceInfo
// ---------------------------------------------------------------------------

/// Immutable runtime layout of one registered archetype.
#[derive(Debug, Clone)]
pub struct ArchetypeInstanceInfo {
    instance: ArchetypeInstance,
    definition: ArchetypeDefinition,
    component_ids: Vec<ComponentId>,
    sizes: Vec<u32>,
    alignments: Vec<u32>,
    offsets: Vec<u32>,
    entity_count_max: u32,
}

impl ArchetypeInstanceInfo {
    fn build(
        instance: ArchetypeInstance,
        definition: &ArchetypeDefinition,
        block_size: usize,
    ) -> Result<Self, EcsError> {
        let components = definition.components();
        let sizes: Vec<u32> = components.iter().map(|c| c.size as u32).collect();
        let alignments: Vec<u32> = components.iter().map(|c| c.align as u32).collect();

        let stored = components.iter().filter(|c| !c.is_tag());
        let (size_sum, align_sum) =
            stored.fold((0usize, 0usize), |(s, a), c| (s + c.size, a + c.align));
        let entity_count_max = block_size.saturating_sub(align_sum) / size_sum;
        if entity_count_max == 0 {
            return Err(EcsError::ArchetypeAllocationFailed {
                archetype: definition.identifier(),
                source: AllocError {
                    size: block_size,
                    reason: format!("a block cannot hold one row of {size_sum} bytes"),
                },
            });
        }

        let mut offsets = Vec::with_capacity(components.len());
        let mut cursor = 0usize;
        for c in components {
            if c.is_tag() {
                offsets.push(TAG_OFFSET);
                continue;
            }
            cursor = align_forward(cursor, c.align);
            offsets.push(cursor as u32);
            cursor += c.size * entity_count_max;
        }
        debug_assert!(cursor <= block_size);

        Ok(Self {
            instance,
            definition: definition.clone(),
            component_ids: components.iter().map(|c| c.id).collect(),
            sizes,
            alignments,
            offsets,
            entity_count_max: entity_count_max as u32,
        })
    }

    pub fn instance(&self) -> ArchetypeInstance {
        self.instance
    }

    pub fn identifier(&self) -> Archetype {
        self.definition.identifier()
    }

    pub fn definition(&self) -> &ArchetypeDefinition {
        &self.definition
    }

    /// Component ids in column order.
    pub fn component_ids(&self) -> &[ComponentId] {
        &self.component_ids
    }

    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }

    pub fn alignments(&self) -> &[u32] {
        &self.alignments
    }

    /// Byte offset of each column inside a block; [`TAG_OFFSET`] for tags.
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// Rows per block.
    pub fn entity_count_max(&self) -> u32 {
        self.entity_count_max
    }

    pub fn column_count(&self) -> usize {
        self.component_ids.len()
    }

    /// Column index of `id`. Column 0 is always the entity column.
    pub fn column_of(&self, id: ComponentId) -> Option<usize> {
        if self.component_ids[0] == id {
            return Some(0);
        }
        self.component_ids[1..]
            .binary_search(&id)
            .ok()
            .map(|i| i + 1)
    }

    pub fn has(&self, id: ComponentId) -> bool {
        self.column_of(id).is_some()
    }

    #[inline]
    pub fn is_tag(&self, column: usize) -> bool {
        self.sizes[column] == 0
    }
}

#[inline]
fn align_forward(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// ArchetypeRegistry
// ---------------------------------------------------------------------------

/// Append-only store of every archetype seen by a world.
#[derive(Debug, Default)]
pub struct ArchetypeRegistry {
    infos: Vec<ArchetypeInstanceInfo>,
    lookup: HashMap<Archetype, ArchetypeInstance>,
}

impl ArchetypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `definition`, registering it on first sight.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::ArchetypeAllocationFailed`] when a block of
    /// `block_size` bytes cannot hold a single row. Nothing is registered.
    ///
    /// # Panics
    ///
    /// Panics if the identifier is already taken by a different component
    /// list (an identifier collision), or if it folds to
    /// [`Archetype::INVALID`].
    pub fn register_or_get(
        &mut self,
        definition: &ArchetypeDefinition,
        block_size: usize,
    ) -> Result<&ArchetypeInstanceInfo, EcsError> {
        let identifier = definition.identifier();
        assert!(
            identifier.is_valid(),
            "component list folds to the reserved invalid archetype"
        );
        if let Some(&instance) = self.lookup.get(&identifier) {
            let existing = &self.infos[instance.index()];
            assert!(
                existing.definition.components() == definition.components(),
                "archetype identifier collision on {identifier:?}"
            );
            return Ok(existing);
        }

        let instance = ArchetypeInstance(self.infos.len() as u32);
        let info = ArchetypeInstanceInfo::build(instance, definition, block_size)?;
        tracing::debug!(
            archetype = ?identifier,
            instance = instance.0,
            columns = info.column_count(),
            rows_per_block = info.entity_count_max,
            "registered archetype"
        );
        self.infos.push(info);
        self.lookup.insert(identifier, instance);
        Ok(&self.infos[instance.index()])
    }

    pub fn get(&self, instance: ArchetypeInstance) -> Option<&ArchetypeInstanceInfo> {
        self.infos.get(instance.index())
    }

    pub fn find(&self, archetype: Archetype) -> Option<&ArchetypeInstanceInfo> {
        self.lookup
            .get(&archetype)
            .map(|instance| &self.infos[instance.index()])
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ArchetypeInstanceInfo> {
        self.infos.iter()
    }

    /// Column index in `info` of each requested id, or [`MISSING_COLUMN`].
    pub fn argument_index_map(info: &ArchetypeInstanceInfo, requested: &[ComponentId]) -> Vec<u32> {
        requested
            .iter()
            .map(|&id| info.column_of(id).map_or(MISSING_COLUMN, |c| c as u32))
            .collect()
    }

    /// Archetypes matched by `part`, in registration order.
    pub fn find_archetypes(&self, part: &QueryPart) -> Vec<ArchetypeInstance> {
        self.infos
            .iter()
            .filter(|info| part_matches(part, info))
            .map(|info| info.instance)
            .collect()
    }
}

fn part_matches(part: &QueryPart, info: &ArchetypeInstanceInfo) -> bool {
    let required = part
        .args
        .iter()
        .filter(|arg| !arg.optional)
        .all(|arg| info.has(arg.component));
    if !required {
        return false;
    }
    if !part.tags.iter().all(|&tag| info.has(tag)) {
        return false;
    }
    if part.excluded.iter().any(|&id| info.has(id)) {
        return false;
    }
    // An all-optional part must still touch something.
    let all_optional = !part.args.is_empty() && part.args.iter().all(|arg| arg.optional);
    !all_optional || part.args.iter().any(|arg| info.has(arg.component))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
