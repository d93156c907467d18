//! Shard ECS -- archetype-based component storage in fixed-size data blocks.
//!
//! Entities that own the exact same set of components share an *archetype*.
//! Each archetype stores its rows in fixed-size blocks laid out column by
//! column, so iterating a component is a walk over a contiguous slice.
//! Queries resolve, once, which archetypes they touch and where each of their
//! arguments lives inside those archetypes' blocks.
//!
//! # Quick Start
//!
//! ```
//! use shard_ecs::prelude::*;
//!
//! #[repr(C)]
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
//! struct Position { x: f32, y: f32 }
//! impl Component for Position { const NAME: &'static str = "position"; }
//!
//! #[repr(C)]
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
//! struct Velocity { dx: f32, dy: f32 }
//! impl Component for Velocity { const NAME: &'static str = "velocity"; }
//!
//! let mut world = World::new();
//! let entity = world
//!     .spawn((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0, dy: 0.0 }))
//!     .unwrap();
//!
//! let mut movement = world.query::<(&mut Position, &Velocity)>().build().unwrap();
//! movement.for_each_entity(&mut world, |_, (pos, vel)| {
//!     pos.x += vel.dx;
//!     pos.y += vel.dy;
//! });
//!
//! assert_eq!(world.get::<Position>(entity).unwrap(), &Position { x: 1.0, y: 0.0 });
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod block;
pub mod component;
pub mod config;
pub mod entity;
pub mod operations;
pub mod query;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The handle's generation is stale, or its index was never issued.
    #[error("entity {entity} does not exist (stale or never allocated)")]
    InvalidEntity { entity: entity::Entity },

    /// No more entity indices can be handed out.
    #[error("entity limit of {max} reached")]
    EntityLimitReached { max: u32 },

    /// Storage for an archetype could not be obtained.
    #[error("could not allocate storage for archetype {archetype:?}")]
    ArchetypeAllocationFailed {
        archetype: archetype::Archetype,
        #[source]
        source: block::AllocError,
    },

    /// An archetype identifier that was never registered.
    #[error("archetype {archetype:?} is not registered")]
    UnknownArchetype { archetype: archetype::Archetype },

    /// A storage slot that does not point at a live row.
    #[error("slot {slot:?} does not point at a live row")]
    InvalidSlot { slot: block::EntitySlot },

    /// The entity's archetype has no column for the requested component.
    #[error("component {component:?} is not part of archetype {archetype:?}")]
    ComponentNotInArchetype {
        component: component::ComponentId,
        archetype: archetype::Archetype,
    },

    /// A component id that has not been registered.
    #[error("component {component:?} is not registered")]
    UnknownComponent { component: component::ComponentId },

    /// Size/alignment that block storage cannot hold.
    #[error("component '{name}' has unsupported layout (size {size}, align {align})")]
    UnsupportedComponentLayout {
        name: String,
        size: usize,
        align: usize,
    },

    /// The same component name was registered twice with different layouts.
    #[error("component '{name}' was already registered with a different layout")]
    ComponentLayoutMismatch { name: String },

    /// A malformed query definition.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Invalid configuration values.
    #[error("invalid configuration: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{
        Archetype, ArchetypeDefinition, ArchetypeInstance, ArchetypeInstanceInfo,
        ArchetypeRegistry,
    };
    pub use crate::block::{
        AllocError, BlockAllocator, BlockMemory, DataBlockStore, EntitySlot, HeapBlockAllocator,
    };
    pub use crate::component::{Component, ComponentId, ComponentInfo, ComponentRegistry};
    pub use crate::config::EcsConfig;
    pub use crate::entity::{Entity, EntityManager};
    pub use crate::operations::{ApplyReport, EntityOperations, Operation};
    pub use crate::query::{
        Access, Fetch, Query, QueryArg, QueryBuilder, QueryDefinition, QueryObject, QueryPart,
        QueryProvider,
    };
    pub use crate::world::{Bundle, World};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    // -- test component types -----------------------------------------------

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Component for Position {
        const NAME: &'static str = "position";
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    impl Component for Velocity {
        const NAME: &'static str = "velocity";
    }

    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    struct Health(u32);

    impl Component for Health {
        const NAME: &'static str = "health";
    }

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Position>().unwrap();
        world.register_component::<Velocity>().unwrap();
        world.register_component::<Health>().unwrap();
        world
    }

    // -- spawn / despawn integration ----------------------------------------

    #[test]
    fn spawn_entities_with_components_and_read_back() {
        let mut world = setup_world();
        let e = world
            .spawn((Position { x: 1.0, y: 2.0 }, Velocity { dx: 3.0, dy: 4.0 }))
            .unwrap();

        assert_eq!(world.get::<Position>(e).unwrap(), &Position { x: 1.0, y: 2.0 });
        assert_eq!(world.get::<Velocity>(e).unwrap(), &Velocity { dx: 3.0, dy: 4.0 });
        assert!(!world.has::<Health>(e));
    }

    #[test]
    fn despawn_entity_verify_gone() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 0.0, y: 0.0 },)).unwrap();
        world.despawn(e).unwrap();
        assert!(!world.is_alive(e));
        assert!(matches!(
            world.get::<Position>(e),
            Err(EcsError::InvalidEntity { .. })
        ));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn insert_component_triggers_migration() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 1.0, y: 2.0 },)).unwrap();
        let arch_count_before = world.archetype_count();

        world.insert_component(e, Velocity { dx: 5.0, dy: 6.0 }).unwrap();

        assert!(world.has::<Velocity>(e));
        assert_eq!(world.get::<Position>(e).unwrap(), &Position { x: 1.0, y: 2.0 });
        assert_eq!(world.archetype_count(), arch_count_before + 1);
    }

    #[test]
    fn remove_component_triggers_migration() {
        let mut world = setup_world();
        let e = world
            .spawn((Position { x: 1.0, y: 2.0 }, Velocity { dx: 3.0, dy: 4.0 }))
            .unwrap();

        world.remove_component::<Velocity>(e).unwrap();

        assert!(!world.has::<Velocity>(e));
        assert_eq!(world.get::<Position>(e).unwrap(), &Position { x: 1.0, y: 2.0 });
    }

    #[test]
    fn get_mut_writes_through() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 0.0, y: 0.0 },)).unwrap();
        {
            let pos = world.get_mut::<Position>(e).unwrap();
            pos.x = 42.0;
            pos.y = 99.0;
        }
        assert_eq!(world.get::<Position>(e).unwrap(), &Position { x: 42.0, y: 99.0 });
    }

    // -- query integration --------------------------------------------------

    #[test]
    fn query_matching_entities_only() {
        let mut world = setup_world();
        let e1 = world
            .spawn((Position { x: 1.0, y: 2.0 }, Velocity { dx: 3.0, dy: 4.0 }))
            .unwrap();
        let _e2 = world.spawn((Position { x: 10.0, y: 20.0 },)).unwrap();

        let query = world.query::<(&Position, &Velocity)>().build().unwrap();
        let mut seen = Vec::new();
        query.for_each_entity(&mut world, |e, _| seen.push(e));
        assert_eq!(seen, vec![e1]);
    }

    #[test]
    fn mutable_query_modifies_components() {
        let mut world = setup_world();
        let e = world
            .spawn((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0, dy: 2.0 }))
            .unwrap();

        let query = world.query::<(&mut Position, &Velocity)>().build().unwrap();
        query.for_each_entity(&mut world, |_, (pos, vel)| {
            pos.x += vel.dx;
            pos.y += vel.dy;
        });

        assert_eq!(world.get::<Position>(e).unwrap(), &Position { x: 1.0, y: 2.0 });
    }

    // -- scale test ---------------------------------------------------------

    #[test]
    fn scale_10k_entities() {
        let mut world = setup_world();

        let mut entities = Vec::with_capacity(10_000);
        for i in 0..10_000u32 {
            let e = world
                .spawn((
                    Position {
                        x: i as f32,
                        y: i as f32 * 2.0,
                    },
                    Velocity { dx: 1.0, dy: -1.0 },
                ))
                .unwrap();
            entities.push(e);
        }

        let both = world.query::<(&Position, &Velocity)>().build().unwrap();
        assert_eq!(both.entity_count(&world), 10_000);
        assert!(world.block_count() > 1, "10k rows must span several blocks");

        let velocities = world.query::<(&mut Velocity,)>().build().unwrap();
        velocities.for_each_block(&mut world, |_, (vel,)| {
            for v in vel.iter_mut() {
                v.dx *= 2.0;
                v.dy *= 2.0;
            }
        });

        let vel = world.get::<Velocity>(entities[0]).unwrap();
        assert_eq!(vel.dx, 2.0);
        assert_eq!(vel.dy, -2.0);

        for e in entities.iter().take(5_000) {
            world.despawn(*e).unwrap();
        }

        assert_eq!(both.entity_count(&world), 5_000);
        assert_eq!(world.entity_count(), 5_000);

        // Survivors kept their own data through every swap-remove.
        for (i, e) in entities.iter().enumerate().skip(5_000) {
            assert_eq!(world.get::<Position>(*e).unwrap().x, i as f32);
        }
        let mut visited = 0;
        both.for_each_entity(&mut world, |_, _| visited += 1);
        assert_eq!(visited, 5_000);
    }

    // -- stale entity tests -------------------------------------------------

    #[test]
    fn stale_entity_despawn_returns_error() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 0.0, y: 0.0 },)).unwrap();
        world.despawn(e).unwrap();
        assert!(matches!(
            world.despawn(e),
            Err(EcsError::InvalidEntity { .. })
        ));
    }

    #[test]
    fn insert_on_stale_entity_returns_error() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 0.0, y: 0.0 },)).unwrap();
        world.despawn(e).unwrap();
        let result = world.insert_component(e, Velocity { dx: 1.0, dy: 1.0 });
        assert!(result.is_err());
    }

    // -- multiple entities in same archetype --------------------------------

    #[test]
    fn multiple_entities_same_archetype() {
        let mut world = setup_world();
        let e1 = world.spawn((Position { x: 1.0, y: 1.0 },)).unwrap();
        let e2 = world.spawn((Position { x: 2.0, y: 2.0 },)).unwrap();
        let e3 = world.spawn((Position { x: 3.0, y: 3.0 },)).unwrap();

        assert_eq!(world.archetype_of(e1).unwrap(), world.archetype_of(e3).unwrap());

        // Despawn middle entity; the last row is swapped into its place.
        world.despawn(e2).unwrap();
        assert_eq!(world.entity_count(), 2);
        assert_eq!(world.get::<Position>(e1).unwrap(), &Position { x: 1.0, y: 1.0 });
        assert_eq!(world.get::<Position>(e3).unwrap(), &Position { x: 3.0, y: 3.0 });
    }

    #[test]
    fn insert_component_overwrite() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 1.0, y: 2.0 },)).unwrap();
        let archetypes = world.archetype_count();
        world.insert_component(e, Position { x: 99.0, y: 100.0 }).unwrap();
        assert_eq!(
            world.get::<Position>(e).unwrap(),
            &Position { x: 99.0, y: 100.0 }
        );
        assert_eq!(world.archetype_count(), archetypes);
    }

    // -- tags and deferred operations ---------------------------------------

    #[test]
    fn tags_partition_queries() {
        let mut world = setup_world();
        let frozen = world.register_tag("frozen").unwrap();

        let moving = world
            .spawn((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0, dy: 0.0 }))
            .unwrap();
        let stuck = world
            .spawn((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0, dy: 0.0 }))
            .unwrap();
        world.add_tag(stuck, frozen).unwrap();

        let query = world
            .query::<(&mut Position, &Velocity)>()
            .exclude(frozen)
            .build()
            .unwrap();
        query.for_each_entity(&mut world, |_, (pos, vel)| pos.x += vel.dx);

        assert_eq!(world.get::<Position>(moving).unwrap().x, 1.0);
        assert_eq!(world.get::<Position>(stuck).unwrap().x, 0.0);
        assert!(world.has_component(stuck, frozen));
    }

    #[test]
    fn deferred_spawn_then_despawn() {
        let mut world = setup_world();
        let victim = world.spawn((Health(3),)).unwrap();

        let mut ops = EntityOperations::new();
        ops.spawn((Position { x: 5.0, y: 5.0 },));
        ops.despawn(victim);
        let report = ops.apply(&mut world);

        assert_eq!(report.success_count, 2);
        assert_eq!(report.failed_count, 0);
        assert_eq!(report.spawned.len(), 1);
        assert!(!world.is_alive(victim));
        assert_eq!(
            world.get::<Position>(report.spawned[0]).unwrap(),
            &Position { x: 5.0, y: 5.0 }
        );
    }
}
