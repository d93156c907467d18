//! Component identity, layout metadata and registration.
//!
//! A component is identified by a [`ComponentId`] derived from its declared
//! name, so the same name yields the same id in every world and every run,
//! regardless of registration order. The [`ComponentRegistry`] records the
//! size and alignment that go with each id and rejects layouts that block
//! storage cannot hold.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::EcsError;

/// Largest supported component alignment. Block memory is aligned to this.
pub const MAX_COMPONENT_ALIGN: usize = 8;

/// Reserved name of the implicit entity column present in every archetype.
pub const ENTITY_COMPONENT_NAME: &str = "shard.entity";

// ---------------------------------------------------------------------------
// ComponentId
// ---------------------------------------------------------------------------

/// Stable 64-bit identifier of a component, hashed from its name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(u64);

impl ComponentId {
    /// First eight bytes (little-endian) of the BLAKE3 digest of `name`.
    pub fn from_name(name: &str) -> Self {
        let digest = blake3::hash(name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(bytes))
    }

    /// Id of the implicit entity column.
    pub fn entity() -> Self {
        Self::from_name(ENTITY_COMPONENT_NAME)
    }

    /// Id of a typed component.
    pub fn of<C: Component>() -> Self {
        Self::from_name(C::NAME)
    }

    /// Raw hash value.
    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({:#018x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// A plain-old-data type that can live in a block column.
///
/// `NAME` is the component's identity: two types with the same name are the
/// same component as far as storage is concerned.
pub trait Component: bytemuck::Pod + 'static {
    const NAME: &'static str;
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Identity and layout of one component.
///
/// Components with `size == 0` are tags: they count towards archetype
/// identity but occupy no column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub name: String,
    pub size: usize,
    pub align: usize,
}

impl ComponentInfo {
    /// Describe a component with an explicit layout.
    pub fn new(name: &str, size: usize, align: usize) -> Self {
        Self {
            id: ComponentId::from_name(name),
            name: name.to_owned(),
            size,
            align,
        }
    }

    /// Describe a typed component.
    pub fn of<C: Component>() -> Self {
        Self::new(C::NAME, std::mem::size_of::<C>(), std::mem::align_of::<C>())
    }

    /// Describe a zero-sized tag.
    pub fn tag(name: &str) -> Self {
        Self::new(name, 0, 1)
    }

    /// The implicit entity column: one packed `u64` per row.
    pub fn entity() -> Self {
        Self::new(ENTITY_COMPONENT_NAME, 8, 8)
    }

    #[inline]
    pub fn is_tag(&self) -> bool {
        self.size == 0
    }

    fn same_layout(&self, other: &ComponentInfo) -> bool {
        self.size == other.size && self.align == other.align
    }

    fn check_layout(&self) -> Result<(), EcsError> {
        let align_ok = self.align.is_power_of_two() && self.align <= MAX_COMPONENT_ALIGN;
        if !align_ok || self.size % self.align != 0 {
            return Err(EcsError::UnsupportedComponentLayout {
                name: self.name.clone(),
                size: self.size,
                align: self.align,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry of every component known to a world, keyed by [`ComponentId`].
///
/// The entity component is registered up front.
#[derive(Debug)]
pub struct ComponentRegistry {
    /// Id -> index into `infos`.
    by_id: HashMap<ComponentId, usize>,
    /// Registration order.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create a registry holding only the entity component.
    pub fn new() -> Self {
        let entity = ComponentInfo::entity();
        let mut by_id = HashMap::new();
        by_id.insert(entity.id, 0);
        Self {
            by_id,
            infos: vec![entity],
        }
    }

    /// Register a component. Re-registering an identical description returns
    /// the existing id.
    ///
    /// # Errors
    ///
    /// - [`EcsError::UnsupportedComponentLayout`] if the alignment is zero,
    ///   not a power of two, above [`MAX_COMPONENT_ALIGN`], or does not divide
    ///   the size.
    /// - [`EcsError::ComponentLayoutMismatch`] if the name is already
    ///   registered with a different layout.
    ///
    /// # Panics
    ///
    /// Panics if a *different* name hashes to an id that is already taken.
    /// Continuing would silently alias two components' columns.
    pub fn register(&mut self, info: ComponentInfo) -> Result<ComponentId, EcsError> {
        info.check_layout()?;
        if let Some(&index) = self.by_id.get(&info.id) {
            let existing = &self.infos[index];
            assert!(
                existing.name == info.name,
                "component id collision: '{}' and '{}' both hash to {:?}",
                existing.name,
                info.name,
                info.id
            );
            if !existing.same_layout(&info) {
                return Err(EcsError::ComponentLayoutMismatch { name: info.name });
            }
            return Ok(info.id);
        }

        let id = info.id;
        tracing::debug!(component = %info.name, ?id, size = info.size, "registered component");
        self.by_id.insert(id, self.infos.len());
        self.infos.push(info);
        Ok(id)
    }

    /// Register a typed component.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn register_component<C: Component>(&mut self) -> Result<ComponentId, EcsError> {
        self.register(ComponentInfo::of::<C>())
    }

    /// Register a zero-sized tag under `name`.
    ///
    /// # Errors
    ///
    /// [`EcsError::ComponentLayoutMismatch`] if `name` is already a sized
    /// component.
    pub fn register_tag(&mut self, name: &str) -> Result<ComponentId, EcsError> {
        self.register(ComponentInfo::tag(name))
    }

    /// Metadata for a registered id.
    pub fn info(&self, id: ComponentId) -> Option<&ComponentInfo> {
        self.by_id.get(&id).map(|&index| &self.infos[index])
    }

    /// [`info`](Self::info), failing with [`EcsError::UnknownComponent`].
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::UnknownComponent`] for an unregistered id.
    pub fn require(&self, id: ComponentId) -> Result<&ComponentInfo, EcsError> {
        self.info(id)
            .ok_or(EcsError::UnknownComponent { component: id })
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Number of registered components, the entity component included.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Always `false`: the entity component is registered on construction.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// All registered components in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.infos.iter()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
