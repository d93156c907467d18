//! Deferred structural changes.
//!
//! [`EntityOperations`] queues spawns, migrations, component writes and
//! despawns while a query holds the world, then applies them in insertion
//! order once the world is free again. Component values are captured as
//! their Pod bytes, so the queue has no generic parameters.
//!
//! ```
//! use shard_ecs::prelude::*;
//!
//! #[repr(C)]
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
//! struct Health(u32);
//!
//! impl Component for Health {
//!     const NAME: &'static str = "health";
//! }
//!
//! let mut world = World::new();
//! let entity = world.spawn((Health(100),)).unwrap();
//!
//! let mut ops = EntityOperations::new();
//! ops.set_component(entity, Health(50));
//! ops.spawn((Health(10),));
//!
//! let report = ops.apply(&mut world);
//! assert_eq!(report.success_count, 2);
//! assert_eq!(world.get::<Health>(entity).unwrap(), &Health(50));
//! assert_eq!(report.spawned.len(), 1);
//! ```

use std::collections::HashMap;

use tracing::warn;

use crate::archetype::Archetype;
use crate::component::{Component, ComponentId, ComponentInfo};
use crate::entity::Entity;
use crate::world::{Bundle, World};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One queued change.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Spawn an entity holding these components.
    Spawn {
        components: Vec<(ComponentInfo, Vec<u8>)>,
    },
    /// Move an entity to a registered archetype, or drop its row with
    /// [`Archetype::INVALID`].
    SetArchetype { entity: Entity, archetype: Archetype },
    /// Write a component, adding it first if the entity lacks it.
    SetComponent {
        entity: Entity,
        info: ComponentInfo,
        bytes: Vec<u8>,
    },
    /// Attach a registered tag.
    AddTag { entity: Entity, tag: ComponentId },
    /// Remove a component or tag.
    RemoveComponent { entity: Entity, component: ComponentId },
    Despawn { entity: Entity },
}

impl Operation {
    /// `(entity, component)` touched by a component write or removal.
    fn component_target(&self) -> Option<(Entity, ComponentId)> {
        match self {
            Operation::SetComponent { entity, info, .. } => Some((*entity, info.id)),
            Operation::AddTag { entity, tag } => Some((*entity, *tag)),
            Operation::RemoveComponent { entity, component } => Some((*entity, *component)),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Operation::Spawn { .. } => "spawn",
            Operation::SetArchetype { .. } => "set_archetype",
            Operation::SetComponent { .. } => "set_component",
            Operation::AddTag { .. } => "add_tag",
            Operation::RemoveComponent { .. } => "remove_component",
            Operation::Despawn { .. } => "despawn",
        }
    }
}

// ---------------------------------------------------------------------------
// ApplyReport
// ---------------------------------------------------------------------------

/// Outcome of one [`EntityOperations::apply`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub success_count: usize,
    pub failed_count: usize,
    /// `(entity, component)` pairs written or removed by more than one
    /// operation. The last one wins.
    pub conflict_count: usize,
    /// Entities created by successful spawns, in queue order.
    pub spawned: Vec<Entity>,
}

// ---------------------------------------------------------------------------
// EntityOperations
// ---------------------------------------------------------------------------

/// FIFO queue of deferred changes.
#[derive(Debug, Default)]
pub struct EntityOperations {
    queue: Vec<Operation>,
    last_report: ApplyReport,
}

impl EntityOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a spawn of `bundle`.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) {
        let mut values: HashMap<ComponentId, Vec<u8>> = HashMap::new();
        bundle.write_components(&mut |id: ComponentId, bytes: &[u8]| {
            values.insert(id, bytes.to_vec());
        });
        let components = B::component_infos()
            .into_iter()
            .map(|info| {
                let bytes = values.remove(&info.id).unwrap_or_default();
                (info, bytes)
            })
            .collect();
        self.queue.push(Operation::Spawn { components });
    }

    /// Queue a spawn from type-erased values.
    pub fn spawn_components(&mut self, components: Vec<(ComponentInfo, Vec<u8>)>) {
        self.queue.push(Operation::Spawn { components });
    }

    pub fn set_archetype(&mut self, entity: Entity, archetype: Archetype) {
        self.queue.push(Operation::SetArchetype { entity, archetype });
    }

    pub fn set_component<C: Component>(&mut self, entity: Entity, value: C) {
        self.set_component_bytes(entity, ComponentInfo::of::<C>(), bytemuck::bytes_of(&value).to_vec());
    }

    pub fn set_component_bytes(&mut self, entity: Entity, info: ComponentInfo, bytes: Vec<u8>) {
        self.queue.push(Operation::SetComponent { entity, info, bytes });
    }

    /// Queue attaching a tag. Applying fails with
    /// [`EcsError::UnknownComponent`] unless the tag is registered by then.
    pub fn add_tag(&mut self, entity: Entity, tag: &str) {
        self.queue.push(Operation::AddTag {
            entity,
            tag: ComponentId::from_name(tag),
        });
    }

    pub fn remove_component<C: Component>(&mut self, entity: Entity) {
        self.remove_component_by_id(entity, ComponentId::of::<C>());
    }

    pub fn remove_component_by_id(&mut self, entity: Entity, component: ComponentId) {
        self.queue.push(Operation::RemoveComponent { entity, component });
    }

    pub fn despawn(&mut self, entity: Entity) {
        self.queue.push(Operation::Despawn { entity });
    }

    /// Queued operations in insertion order.
    pub fn operations(&self) -> &[Operation] {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Report of the last [`apply`](Self::apply), all zero before the first.
    pub fn last_report(&self) -> &ApplyReport {
        &self.last_report
    }

    /// Apply every queued operation in insertion order and clear the queue.
    ///
    /// A failing operation is logged and skipped; later operations still
    /// run against whatever state the earlier ones left.
    pub fn apply(&mut self, world: &mut World) -> ApplyReport {
        let queue = std::mem::take(&mut self.queue);
        let mut report = ApplyReport {
            conflict_count: count_conflicts(&queue),
            ..ApplyReport::default()
        };

        for (index, op) in queue.iter().enumerate() {
            match apply_one(world, op) {
                Ok(spawned) => {
                    report.success_count += 1;
                    report.spawned.extend(spawned);
                }
                Err(error) => {
                    report.failed_count += 1;
                    warn!(index, op = op.name(), %error, "entity operation failed");
                }
            }
        }

        self.last_report = report.clone();
        report
    }
}

fn apply_one(world: &mut World, op: &Operation) -> Result<Option<Entity>, EcsError> {
    match op {
        Operation::Spawn { components } => world.spawn_components(components).map(Some),
        Operation::SetArchetype { entity, archetype } => world.set_archetype(*entity, *archetype).map(|()| None),
        Operation::SetComponent { entity, info, bytes } => {
            world.set_component_bytes(*entity, info, bytes).map(|()| None)
        }
        Operation::AddTag { entity, tag } => world.add_tag(*entity, *tag).map(|()| None),
        Operation::RemoveComponent { entity, component } => {
            world.remove_component_by_id(*entity, *component).map(|()| None)
        }
        Operation::Despawn { entity } => world.despawn(*entity).map(|()| None),
    }
}

fn count_conflicts(queue: &[Operation]) -> usize {
    let mut seen: HashMap<(Entity, ComponentId), usize> = HashMap::new();
    for target in queue.iter().filter_map(Operation::component_target) {
        *seen.entry(target).or_default() += 1;
    }
    seen.values().filter(|&&hits| hits > 1).count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
