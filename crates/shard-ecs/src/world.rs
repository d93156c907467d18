//! The [`World`] is the top-level container. It owns the entity manager, the
//! component and archetype registries, all block storage, and the map from
//! each entity to its storage slot.

use crate::archetype::{Archetype, ArchetypeDefinition, ArchetypeRegistry};
use crate::block::{BlockAllocator, DataBlock, DataBlockStore, EntitySlot, HeapBlockAllocator};
use crate::component::{Component, ComponentId, ComponentInfo, ComponentRegistry};
use crate::config::EcsConfig;
use crate::entity::{Entity, EntityManager};
use crate::query::{Fetch, QueryBuilder, QueryDefinition, QueryObject, QueryProvider};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// A tuple of components spawned together.
pub trait Bundle {
    /// Layout of every component in the bundle, in tuple order.
    fn component_infos() -> Vec<ComponentInfo>;

    /// Feed each component's bytes to `sink`, in tuple order.
    fn write_components(&self, sink: &mut dyn FnMut(ComponentId, &[u8]));
}

macro_rules! impl_bundle_tuple {
    ($($name:ident),+) => {
        impl<$($name: Component),+> Bundle for ($($name,)+) {
            fn component_infos() -> Vec<ComponentInfo> {
                vec![$(ComponentInfo::of::<$name>()),+]
            }

            #[allow(non_snake_case)]
            fn write_components(&self, sink: &mut dyn FnMut(ComponentId, &[u8])) {
                let ($($name,)+) = self;
                $(sink(ComponentId::of::<$name>(), bytemuck::bytes_of($name));)+
            }
        }
    };
}

impl_bundle_tuple!(A);
impl_bundle_tuple!(A, B);
impl_bundle_tuple!(A, B, C);
impl_bundle_tuple!(A, B, C, D);
impl_bundle_tuple!(A, B, C, D, E);
impl_bundle_tuple!(A, B, C, D, E, F);
impl_bundle_tuple!(A, B, C, D, E, F, G);
impl_bundle_tuple!(A, B, C, D, E, F, G, H);

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Owner of all entities, components and archetype storage.
#[derive(Debug)]
pub struct World {
    config: EcsConfig,
    entities: EntityManager,
    components: ComponentRegistry,
    archetypes: ArchetypeRegistry,
    store: DataBlockStore,
    /// Indexed by entity index. `None` for entities without storage.
    slots: Vec<Option<EntitySlot>>,
}

impl World {
    /// Create a world with default configuration and the heap allocator.
    pub fn new() -> Self {
        let config = EcsConfig::default();
        let allocator = HeapBlockAllocator::new(config.max_blocks);
        Self::build(config, Box::new(allocator))
    }

    /// Create a world with `config` and the heap allocator.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::Config`] if `config` fails validation.
    pub fn with_config(config: EcsConfig) -> Result<Self, EcsError> {
        let allocator = HeapBlockAllocator::new(config.max_blocks);
        Self::with_allocator(config, Box::new(allocator))
    }

    /// Create a world that takes block memory from `allocator`.
    /// `config.max_blocks` only applies to the heap allocator and is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::Config`] if `config` fails validation.
    pub fn with_allocator(config: EcsConfig, allocator: Box<dyn BlockAllocator>) -> Result<Self, EcsError> {
        config.validate()?;
        Ok(Self::build(config, allocator))
    }

    fn build(config: EcsConfig, allocator: Box<dyn BlockAllocator>) -> Self {
        Self {
            entities: EntityManager::new(&config),
            components: ComponentRegistry::new(),
            archetypes: ArchetypeRegistry::new(),
            store: DataBlockStore::new(allocator, config.block_size),
            slots: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &EcsConfig {
        &self.config
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    pub fn archetypes(&self) -> &ArchetypeRegistry {
        &self.archetypes
    }

    pub fn store(&self) -> &DataBlockStore {
        &self.store
    }

    pub(crate) fn storage_mut(&mut self) -> (&ArchetypeRegistry, &mut [Vec<DataBlock>]) {
        (&self.archetypes, self.store.pools_mut())
    }

    // -- registration -------------------------------------------------------

    /// Register a typed component.
    ///
    /// # Errors
    ///
    /// See [`ComponentRegistry::register`].
    pub fn register_component<C: Component>(&mut self) -> Result<ComponentId, EcsError> {
        self.components.register_component::<C>()
    }

    /// Register a zero-sized tag.
    ///
    /// # Errors
    ///
    /// See [`ComponentRegistry::register_tag`].
    pub fn register_tag(&mut self, name: &str) -> Result<ComponentId, EcsError> {
        self.components.register_tag(name)
    }

    /// Register `definition`'s components and archetype without spawning.
    ///
    /// # Errors
    ///
    /// Component registration errors, or
    /// [`EcsError::ArchetypeAllocationFailed`] if one row does not fit a block.
    pub fn register_archetype(&mut self, definition: &ArchetypeDefinition) -> Result<Archetype, EcsError> {
        self.register_definition(definition)?;
        Ok(definition.identifier())
    }

    fn register_definition(&mut self, definition: &ArchetypeDefinition) -> Result<(), EcsError> {
        for info in definition.components() {
            self.components.register(info.clone())?;
        }
        self.archetypes
            .register_or_get(definition, self.config.block_size)?;
        Ok(())
    }

    // -- spawn / despawn ----------------------------------------------------

    /// Spawn an entity holding every component of `bundle`.
    ///
    /// # Errors
    ///
    /// Registration errors, [`EcsError::EntityLimitReached`], or
    /// [`EcsError::ArchetypeAllocationFailed`]. On error no entity is created.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> Result<Entity, EcsError> {
        let definition = ArchetypeDefinition::new(B::component_infos());
        let (entity, slot) = self.spawn_row(&definition)?;
        let mut written = Ok(());
        bundle.write_components(&mut |id: ComponentId, bytes: &[u8]| {
            if written.is_ok() {
                written = self.write_bytes(slot, id, bytes);
            }
        });
        written.map(|()| entity)
    }

    /// Spawn an entity from type-erased component values.
    ///
    /// # Errors
    ///
    /// As [`spawn`](Self::spawn), plus [`EcsError::ComponentLayoutMismatch`]
    /// if a value's length differs from its declared size.
    pub fn spawn_components(&mut self, components: &[(ComponentInfo, Vec<u8>)]) -> Result<Entity, EcsError> {
        for (info, bytes) in components {
            check_value_len(info, bytes)?;
        }
        let definition = ArchetypeDefinition::new(components.iter().map(|(info, _)| info.clone()));
        let (entity, slot) = self.spawn_row(&definition)?;
        for (info, bytes) in components {
            self.write_bytes(slot, info.id, bytes)?;
        }
        Ok(entity)
    }

    /// Spawn a live entity with no components and no storage row.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::EntityLimitReached`].
    pub fn spawn_empty(&mut self) -> Result<Entity, EcsError> {
        let entity = self.entities.create()?;
        self.set_slot(entity, None);
        Ok(entity)
    }

    /// Spawn `count` zero-initialised entities of `definition` on fresh
    /// indices.
    ///
    /// # Errors
    ///
    /// As [`spawn`](Self::spawn). Rows already written for the batch are
    /// removed again before the error is returned.
    pub fn spawn_many(&mut self, definition: &ArchetypeDefinition, count: usize) -> Result<Vec<Entity>, EcsError> {
        self.register_definition(definition)?;
        let batch = self.entities.peek_many(count)?;
        let info = self
            .archetypes
            .find(definition.identifier())
            .ok_or(EcsError::UnknownArchetype {
                archetype: definition.identifier(),
            })?;

        let mut slots = Vec::with_capacity(count);
        for &entity in &batch {
            match self.store.insert(info, entity) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    // Each slot is the tail of its block once later ones are gone.
                    for &slot in slots.iter().rev() {
                        self.store.remove(info, slot)?;
                    }
                    return Err(err);
                }
            }
        }

        let created = self.entities.create_many(count)?;
        debug_assert_eq!(created, batch);
        for (&entity, slot) in batch.iter().zip(slots) {
            self.set_slot(entity, Some(slot));
        }
        Ok(batch)
    }

    /// Destroy `entity` and free its row.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::InvalidEntity`] for a stale handle.
    pub fn despawn(&mut self, entity: Entity) -> Result<(), EcsError> {
        self.entities.validate(entity)?;
        self.relocate(entity, Archetype::INVALID)?;
        self.entities.destroy(entity)
    }

    /// Reserve a row first, then issue the entity, so a failure leaves both
    /// the store and the entity manager untouched.
    fn spawn_row(&mut self, definition: &ArchetypeDefinition) -> Result<(Entity, EntitySlot), EcsError> {
        for info in definition.components() {
            self.components.register(info.clone())?;
        }
        let info = self
            .archetypes
            .register_or_get(definition, self.config.block_size)?;
        let entity = self.entities.peek_next()?;
        let slot = self.store.insert(info, entity)?;
        let created = self.entities.create()?;
        debug_assert_eq!(created, entity);
        self.set_slot(entity, Some(slot));
        Ok((entity, slot))
    }

    // -- structural changes -------------------------------------------------

    /// Move `entity` into `archetype`, keeping shared components and zeroing
    /// new ones. [`Archetype::INVALID`] drops its row but keeps it alive.
    ///
    /// # Errors
    ///
    /// - [`EcsError::InvalidEntity`] for a stale handle.
    /// - [`EcsError::UnknownArchetype`] if `archetype` was never registered.
    /// - [`EcsError::ArchetypeAllocationFailed`]; the entity stays put.
    pub fn set_archetype(&mut self, entity: Entity, archetype: Archetype) -> Result<(), EcsError> {
        self.entities.validate(entity)?;
        self.relocate(entity, archetype)
    }

    /// Set a component, migrating the entity if it does not have it yet.
    ///
    /// # Errors
    ///
    /// Registration errors, [`EcsError::InvalidEntity`], or
    /// [`EcsError::ArchetypeAllocationFailed`].
    pub fn insert_component<C: Component>(&mut self, entity: Entity, value: C) -> Result<(), EcsError> {
        self.set_component_bytes(entity, &ComponentInfo::of::<C>(), bytemuck::bytes_of(&value))
    }

    /// Type-erased [`insert_component`](Self::insert_component).
    ///
    /// # Errors
    ///
    /// As [`insert_component`](Self::insert_component), plus
    /// [`EcsError::ComponentLayoutMismatch`] if `bytes` is not `info.size`
    /// long.
    pub fn set_component_bytes(&mut self, entity: Entity, info: &ComponentInfo, bytes: &[u8]) -> Result<(), EcsError> {
        self.entities.validate(entity)?;
        check_value_len(info, bytes)?;
        self.components.register(info.clone())?;

        let current = self.slot_of(entity);
        let present = current
            .and_then(|slot| self.archetypes.get(slot.archetype))
            .is_some_and(|archetype| archetype.has(info.id));
        if !present {
            let target = self.definition_of(entity).with(info.clone());
            let identifier = self
                .archetypes
                .register_or_get(&target, self.config.block_size)?
                .identifier();
            self.relocate(entity, identifier)?;
        }

        match self.slot_of(entity) {
            Some(slot) => self.write_bytes(slot, info.id, bytes),
            None => Err(self.not_in_archetype(entity, info.id)),
        }
    }

    /// Remove component `C`, migrating the entity.
    ///
    /// # Errors
    ///
    /// [`EcsError::InvalidEntity`], [`EcsError::ComponentNotInArchetype`] if
    /// the entity lacks `C`, or [`EcsError::ArchetypeAllocationFailed`].
    pub fn remove_component<C: Component>(&mut self, entity: Entity) -> Result<(), EcsError> {
        self.remove_component_by_id(entity, ComponentId::of::<C>())
    }

    /// Type-erased [`remove_component`](Self::remove_component).
    ///
    /// # Errors
    ///
    /// See [`remove_component`](Self::remove_component).
    pub fn remove_component_by_id(&mut self, entity: Entity, id: ComponentId) -> Result<(), EcsError> {
        self.entities.validate(entity)?;
        if !self.has_component(entity, id) {
            return Err(self.not_in_archetype(entity, id));
        }
        let target = self.definition_of(entity).without(id);
        let identifier = self
            .archetypes
            .register_or_get(&target, self.config.block_size)?
            .identifier();
        self.relocate(entity, identifier)
    }

    /// Attach a registered tag.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownComponent`] if `tag` is not registered, otherwise as
    /// [`set_component_bytes`](Self::set_component_bytes).
    pub fn add_tag(&mut self, entity: Entity, tag: ComponentId) -> Result<(), EcsError> {
        let info = self.components.require(tag)?.clone();
        self.set_component_bytes(entity, &info, &[])
    }

    /// Detach a tag.
    ///
    /// # Errors
    ///
    /// See [`remove_component_by_id`](Self::remove_component_by_id).
    pub fn remove_tag(&mut self, entity: Entity, tag: ComponentId) -> Result<(), EcsError> {
        self.remove_component_by_id(entity, tag)
    }

    // -- access -------------------------------------------------------------

    /// Borrow component `C` of `entity`.
    ///
    /// # Errors
    ///
    /// [`EcsError::InvalidEntity`], [`EcsError::ComponentNotInArchetype`], or
    /// [`EcsError::ComponentLayoutMismatch`] if `C` does not match the
    /// registered layout of its name.
    pub fn get<C: Component>(&self, entity: Entity) -> Result<&C, EcsError> {
        self.entities.validate(entity)?;
        let id = ComponentId::of::<C>();
        self.check_typed::<C>()?;
        let bytes = self
            .locate(entity, id)
            .and_then(|(slot, column)| {
                let info = self.archetypes.get(slot.archetype)?;
                self.store.component_bytes(info, slot, column)
            })
            .ok_or_else(|| self.not_in_archetype(entity, id))?;
        bytemuck::try_from_bytes(bytes).map_err(|_| EcsError::ComponentLayoutMismatch {
            name: C::NAME.to_owned(),
        })
    }

    /// Mutably borrow component `C` of `entity`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub fn get_mut<C: Component>(&mut self, entity: Entity) -> Result<&mut C, EcsError> {
        self.entities.validate(entity)?;
        let id = ComponentId::of::<C>();
        self.check_typed::<C>()?;
        let Some((slot, column)) = self.locate(entity, id) else {
            return Err(self.not_in_archetype(entity, id));
        };
        let mismatch = || EcsError::ComponentLayoutMismatch {
            name: C::NAME.to_owned(),
        };
        let info = self
            .archetypes
            .get(slot.archetype)
            .ok_or(EcsError::InvalidSlot { slot })?;
        let bytes = self
            .store
            .component_bytes_mut(info, slot, column)
            .ok_or_else(mismatch)?;
        bytemuck::try_from_bytes_mut(bytes).map_err(|_| mismatch())
    }

    /// `true` if `entity` is alive and holds `C`.
    pub fn has<C: Component>(&self, entity: Entity) -> bool {
        self.has_component(entity, ComponentId::of::<C>())
    }

    /// `true` if `entity` is alive and its archetype contains `id`.
    pub fn has_component(&self, entity: Entity, id: ComponentId) -> bool {
        self.entities.is_alive(entity)
            && self
                .slot_of(entity)
                .and_then(|slot| self.archetypes.get(slot.archetype))
                .is_some_and(|info| info.has(id))
    }

    /// Current archetype, or [`Archetype::INVALID`] for an entity without
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::InvalidEntity`] for a stale handle.
    pub fn archetype_of(&self, entity: Entity) -> Result<Archetype, EcsError> {
        self.entities.validate(entity)?;
        Ok(self.current_archetype(entity))
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Alive entities, with or without storage.
    pub fn entity_count(&self) -> usize {
        self.entities.count()
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn block_count(&self) -> usize {
        self.store.block_count()
    }

    /// Start building a typed query.
    pub fn query<Q: Fetch>(&self) -> QueryBuilder<'_, Q> {
        QueryBuilder::new(self)
    }

    // -- internals ----------------------------------------------------------

    /// Slot and column of `id` for `entity`, if it has that component.
    fn locate(&self, entity: Entity, id: ComponentId) -> Option<(EntitySlot, usize)> {
        let slot = self.slot_of(entity)?;
        let column = self.archetypes.get(slot.archetype)?.column_of(id)?;
        Some((slot, column))
    }

    /// `C` must match the layout registered under its name.
    fn check_typed<C: Component>(&self) -> Result<(), EcsError> {
        let expected = ComponentInfo::of::<C>();
        match self.components.info(expected.id) {
            Some(info) if info.size != expected.size || info.align != expected.align => {
                Err(EcsError::ComponentLayoutMismatch { name: expected.name })
            }
            _ => Ok(()),
        }
    }

    fn slot_of(&self, entity: Entity) -> Option<EntitySlot> {
        self.slots.get(entity.index() as usize).copied().flatten()
    }

    fn set_slot(&mut self, entity: Entity, slot: Option<EntitySlot>) {
        let index = entity.index() as usize;
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = slot;
    }

    fn current_archetype(&self, entity: Entity) -> Archetype {
        self.slot_of(entity)
            .and_then(|slot| self.archetypes.get(slot.archetype))
            .map_or(Archetype::INVALID, |info| info.identifier())
    }

    fn definition_of(&self, entity: Entity) -> ArchetypeDefinition {
        self.slot_of(entity)
            .and_then(|slot| self.archetypes.get(slot.archetype))
            .map_or_else(
                || ArchetypeDefinition::new(Vec::new()),
                |info| info.definition().clone(),
            )
    }

    fn not_in_archetype(&self, entity: Entity, component: ComponentId) -> EcsError {
        EcsError::ComponentNotInArchetype {
            component,
            archetype: self.current_archetype(entity),
        }
    }

    /// Move `entity`'s row into `target`, or drop it for `INVALID`, and fix
    /// the slot of whichever entity filled the hole.
    fn relocate(&mut self, entity: Entity, target: Archetype) -> Result<(), EcsError> {
        let to = if target.is_valid() {
            let info = self
                .archetypes
                .find(target)
                .ok_or(EcsError::UnknownArchetype { archetype: target })?;
            Some(info)
        } else {
            None
        };

        let current = self.slot_of(entity);
        let (slot, moved) = match (current, to) {
            (None, None) => return Ok(()),
            (None, Some(to)) => (Some(self.store.insert(to, entity)?), None),
            (Some(slot), to) => {
                let from = self
                    .archetypes
                    .get(slot.archetype)
                    .ok_or(EcsError::InvalidSlot { slot })?;
                match to {
                    Some(to) => {
                        let (new_slot, moved) = self.store.move_entity(from, slot, to)?;
                        (Some(new_slot), moved.map(|m| (m, slot)))
                    }
                    None => (None, self.store.remove(from, slot)?.map(|m| (m, slot))),
                }
            }
        };

        if let Some((moved, hole)) = moved {
            self.set_slot(moved, Some(hole));
        }
        self.set_slot(entity, slot);
        Ok(())
    }

    fn write_bytes(&mut self, slot: EntitySlot, id: ComponentId, bytes: &[u8]) -> Result<(), EcsError> {
        let info = self
            .archetypes
            .get(slot.archetype)
            .ok_or(EcsError::InvalidSlot { slot })?;
        let column = info
            .column_of(id)
            .ok_or(EcsError::ComponentNotInArchetype {
                component: id,
                archetype: info.identifier(),
            })?;
        if info.is_tag(column) {
            return Ok(());
        }
        let dst = self
            .store
            .component_bytes_mut(info, slot, column)
            .ok_or(EcsError::InvalidSlot { slot })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryProvider for World {
    /// Resolve against this world's archetypes, rejecting arguments that are
    /// unregistered or zero-sized.
    fn initialize_query(&self, definition: &QueryDefinition) -> Result<QueryObject, EcsError> {
        for id in definition.argument_ids() {
            let info = self
                .components
                .info(id)
                .ok_or_else(|| EcsError::InvalidQuery(format!("component {id:?} is not registered")))?;
            if info.is_tag() {
                return Err(EcsError::InvalidQuery(format!(
                    "tag '{}' cannot be fetched; filter on it instead",
                    info.name
                )));
            }
        }
        Ok(QueryObject::resolve(&self.archetypes, definition.clone()))
    }
}

fn check_value_len(info: &ComponentInfo, bytes: &[u8]) -> Result<(), EcsError> {
    if bytes.len() != info.size {
        return Err(EcsError::ComponentLayoutMismatch {
            name: info.name.clone(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
