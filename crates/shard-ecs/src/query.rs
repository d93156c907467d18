//! Query definitions, resolution and iteration.
//!
//! A [`QueryDefinition`] is one or more [`QueryPart`]s. Every part lists the
//! same component at each argument position, and may differ in which
//! arguments are optional, which components it excludes and which tags it
//! requires. Resolving a definition against an [`ArchetypeRegistry`]
//! produces a [`QueryObject`]: the matching archetype instances plus, for
//! each, the column index of every argument. Iteration never re-examines
//! archetype layouts.
//!
//! An archetype is claimed by the first part that matches it, so each row is
//! visited once. Rows come in archetype registration order, then block
//! creation order, then row order.
//!
//! Typed access goes through [`Fetch`], implemented for `&C`, `&mut C`,
//! `Option<&C>`, `Option<&mut C>` and tuples of those.

use std::collections::HashSet;
use std::marker::PhantomData;

use crate::archetype::{ArchetypeInstance, ArchetypeRegistry};
use crate::block::DataBlock;
use crate::component::{Component, ComponentId, ComponentInfo};
use crate::entity::Entity;
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// How an argument's column is borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

/// One argument of a query part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryArg {
    pub component: ComponentId,
    pub access: Access,
    pub optional: bool,
}

impl QueryArg {
    pub fn read(component: ComponentId) -> Self {
        Self {
            component,
            access: Access::Read,
            optional: false,
        }
    }

    pub fn write(component: ComponentId) -> Self {
        Self {
            component,
            access: Access::Write,
            optional: false,
        }
    }

    /// Allow matching archetypes that lack this component.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// One alternative of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPart {
    pub args: Vec<QueryArg>,
    pub excluded: Vec<ComponentId>,
    pub tags: Vec<ComponentId>,
}

impl QueryPart {
    pub fn new(args: Vec<QueryArg>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    /// Skip archetypes holding `component`.
    pub fn exclude(mut self, component: ComponentId) -> Self {
        self.excluded.push(component);
        self
    }

    /// Require `tag` without fetching it.
    pub fn with_tag(mut self, tag: ComponentId) -> Self {
        self.tags.push(tag);
        self
    }

    fn argument_ids(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.args.iter().map(|arg| arg.component)
    }
}

/// A validated, possibly disjunctive query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDefinition {
    parts: Vec<QueryPart>,
}

impl QueryDefinition {
    /// # Errors
    ///
    /// Returns [`EcsError::InvalidQuery`] if there are no parts, if an
    /// argument repeats or names the entity column, or if parts disagree on
    /// the component at some argument position.
    pub fn new(parts: Vec<QueryPart>) -> Result<Self, EcsError> {
        let Some(first) = parts.first() else {
            return Err(EcsError::InvalidQuery("query has no parts".to_owned()));
        };

        let mut seen = HashSet::new();
        for id in first.argument_ids() {
            if id == ComponentId::entity() {
                return Err(EcsError::InvalidQuery(
                    "the entity column is always provided and cannot be an argument".to_owned(),
                ));
            }
            if !seen.insert(id) {
                return Err(EcsError::InvalidQuery(format!(
                    "component {id:?} is requested twice"
                )));
            }
        }
        for (index, part) in parts.iter().enumerate().skip(1) {
            if !part.argument_ids().eq(first.argument_ids()) {
                return Err(EcsError::InvalidQuery(format!(
                    "part {index} does not request the same components as part 0"
                )));
            }
        }
        Ok(Self { parts })
    }

    /// A single-part definition.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn single(part: QueryPart) -> Result<Self, EcsError> {
        Self::new(vec![part])
    }

    pub fn parts(&self) -> &[QueryPart] {
        &self.parts
    }

    /// Component at each argument position.
    pub fn argument_ids(&self) -> Vec<ComponentId> {
        self.parts[0].argument_ids().collect()
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Anything a [`QueryDefinition`] can be resolved against.
pub trait QueryProvider {
    /// Resolve `definition` against the archetypes registered right now.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::InvalidQuery`] when the provider can tell that an
    /// argument cannot be fetched.
    fn initialize_query(&self, definition: &QueryDefinition) -> Result<QueryObject, EcsError>;
}

impl QueryProvider for ArchetypeRegistry {
    fn initialize_query(&self, definition: &QueryDefinition) -> Result<QueryObject, EcsError> {
        Ok(QueryObject::resolve(self, definition.clone()))
    }
}

#[derive(Debug, Clone)]
struct MatchedArchetype {
    instance: ArchetypeInstance,
    part: usize,
    argument_map: Vec<u32>,
}

/// A resolved query: matching archetypes and their argument maps.
///
/// The match set is fixed when the object is built; call
/// [`reinitialize`](Self::reinitialize) to pick up archetypes registered
/// since.
#[derive(Debug, Clone)]
pub struct QueryObject {
    definition: QueryDefinition,
    /// Sorted by instance.
    matches: Vec<MatchedArchetype>,
    /// Registry length at resolution time.
    resolved_archetypes: usize,
}

impl QueryObject {
    pub(crate) fn resolve(registry: &ArchetypeRegistry, definition: QueryDefinition) -> Self {
        let ids = definition.argument_ids();
        let mut claimed = HashSet::new();
        let mut matches = Vec::new();
        for (part_index, part) in definition.parts().iter().enumerate() {
            for instance in registry.find_archetypes(part) {
                if !claimed.insert(instance) {
                    continue;
                }
                if let Some(info) = registry.get(instance) {
                    matches.push(MatchedArchetype {
                        instance,
                        part: part_index,
                        argument_map: ArchetypeRegistry::argument_index_map(info, &ids),
                    });
                }
            }
        }
        matches.sort_by_key(|m| m.instance);

        Self {
            definition,
            matches,
            resolved_archetypes: registry.len(),
        }
    }

    pub fn definition(&self) -> &QueryDefinition {
        &self.definition
    }

    /// Matched archetypes in registration order.
    pub fn archetypes(&self) -> impl Iterator<Item = ArchetypeInstance> + '_ {
        self.matches.iter().map(|m| m.instance)
    }

    /// Column index of each argument in the `index`-th matched archetype.
    pub fn argument_map(&self, index: usize) -> Option<&[u32]> {
        self.matches.get(index).map(|m| m.argument_map.as_slice())
    }

    /// Which part claimed the `index`-th matched archetype.
    pub fn matched_part(&self, index: usize) -> Option<usize> {
        self.matches.get(index).map(|m| m.part)
    }

    /// `true` if `world` has registered archetypes since resolution.
    pub fn is_stale(&self, world: &World) -> bool {
        world.archetype_count() != self.resolved_archetypes
    }

    /// Resolve the same definition again.
    ///
    /// # Errors
    ///
    /// Propagates [`QueryProvider::initialize_query`] errors.
    pub fn reinitialize(&mut self, provider: &impl QueryProvider) -> Result<(), EcsError> {
        *self = provider.initialize_query(&self.definition)?;
        Ok(())
    }

    /// Rows currently matched.
    pub fn entity_count(&self, world: &World) -> usize {
        self.matches
            .iter()
            .map(|m| world.store().entity_count(m.instance))
            .sum()
    }

    /// Visit every non-empty matched block with its packed entity column and
    /// one byte slice per argument (`None` where the archetype lacks it).
    pub fn for_each_block_raw<F>(&self, world: &mut World, mut f: F)
    where
        F: FnMut(&[u64], &mut [Option<&mut [u8]>]),
    {
        let (registry, pools) = world.storage_mut();
        self.visit_blocks(registry, pools, |entities, mut columns| {
            f(entities, columns.as_mut_slice())
        });
    }

    fn visit_blocks<'w, F>(&self, registry: &ArchetypeRegistry, pools: &'w mut [Vec<DataBlock>], mut f: F)
    where
        F: FnMut(&'w [u64], Vec<Option<&'w mut [u8]>>),
    {
        let mut matches = self.matches.iter().peekable();
        for (index, pool) in pools.iter_mut().enumerate() {
            let Some(matched) = matches.next_if(|m| m.instance.index() == index) else {
                continue;
            };
            let Some(info) = registry.get(matched.instance) else {
                continue;
            };
            for block in pool {
                if block.count() == 0 {
                    continue;
                }
                let (entities, columns) = block.split_columns(info, &matched.argument_map);
                f(entities, columns);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch -- typed views of block columns
// ---------------------------------------------------------------------------

/// Column views handed to [`Fetch::fetch`], one per argument.
pub type ColumnIter<'c, 'w> = std::slice::IterMut<'c, Option<&'w mut [u8]>>;

/// A typed query shape: a component reference or a tuple of them.
pub trait Fetch {
    /// Whole-block view, e.g. `&'w mut [C]`.
    type Block<'w>;
    /// Per-row view, e.g. `&'w mut C`.
    type Item<'w>;
    /// Rows of a block view.
    type Iter<'w>: Iterator<Item = Self::Item<'w>>;

    /// Arguments in positional order.
    fn args() -> Vec<QueryArg>;

    /// Layout each argument's type expects, in the same order as
    /// [`args`](Self::args).
    fn infos() -> Vec<ComponentInfo>;

    /// Take this shape's columns off the front of `columns`.
    fn fetch<'w>(columns: &mut ColumnIter<'_, 'w>) -> Self::Block<'w>;

    /// Split a block view into `len` row views.
    fn iter<'w>(block: Self::Block<'w>, len: usize) -> Self::Iter<'w>;
}

fn take_column<'w>(columns: &mut ColumnIter<'_, 'w>) -> Option<&'w mut [u8]> {
    columns.next().and_then(Option::take)
}

impl<'q, C: Component> Fetch for &'q C {
    type Block<'w> = &'w [C];
    type Item<'w> = &'w C;
    type Iter<'w> = std::slice::Iter<'w, C>;

    fn args() -> Vec<QueryArg> {
        vec![QueryArg::read(ComponentId::of::<C>())]
    }

    fn infos() -> Vec<ComponentInfo> {
        vec![ComponentInfo::of::<C>()]
    }

    fn fetch<'w>(columns: &mut ColumnIter<'_, 'w>) -> Self::Block<'w> {
        take_column(columns)
            .map(|bytes| {
                let bytes: &'w [u8] = bytes;
                bytemuck::cast_slice(bytes)
            })
            .unwrap_or_default()
    }

    fn iter<'w>(block: Self::Block<'w>, _len: usize) -> Self::Iter<'w> {
        block.iter()
    }
}

impl<'q, C: Component> Fetch for &'q mut C {
    type Block<'w> = &'w mut [C];
    type Item<'w> = &'w mut C;
    type Iter<'w> = std::slice::IterMut<'w, C>;

    fn args() -> Vec<QueryArg> {
        vec![QueryArg::write(ComponentId::of::<C>())]
    }

    fn infos() -> Vec<ComponentInfo> {
        vec![ComponentInfo::of::<C>()]
    }

    fn fetch<'w>(columns: &mut ColumnIter<'_, 'w>) -> Self::Block<'w> {
        take_column(columns)
            .map(bytemuck::cast_slice_mut::<u8, C>)
            .unwrap_or_default()
    }

    fn iter<'w>(block: Self::Block<'w>, _len: usize) -> Self::Iter<'w> {
        block.iter_mut()
    }
}

impl<'q, C: Component> Fetch for Option<&'q C> {
    type Block<'w> = Option<&'w [C]>;
    type Item<'w> = Option<&'w C>;
    type Iter<'w> = OptionalIter<std::slice::Iter<'w, C>>;

    fn args() -> Vec<QueryArg> {
        vec![QueryArg::read(ComponentId::of::<C>()).optional()]
    }

    fn infos() -> Vec<ComponentInfo> {
        vec![ComponentInfo::of::<C>()]
    }

    fn fetch<'w>(columns: &mut ColumnIter<'_, 'w>) -> Self::Block<'w> {
        take_column(columns).map(|bytes| {
            let bytes: &'w [u8] = bytes;
            bytemuck::cast_slice(bytes)
        })
    }

    fn iter<'w>(block: Self::Block<'w>, len: usize) -> Self::Iter<'w> {
        OptionalIter::new(block.map(|column| column.iter()), len)
    }
}

impl<'q, C: Component> Fetch for Option<&'q mut C> {
    type Block<'w> = Option<&'w mut [C]>;
    type Item<'w> = Option<&'w mut C>;
    type Iter<'w> = OptionalIter<std::slice::IterMut<'w, C>>;

    fn args() -> Vec<QueryArg> {
        vec![QueryArg::write(ComponentId::of::<C>()).optional()]
    }

    fn infos() -> Vec<ComponentInfo> {
        vec![ComponentInfo::of::<C>()]
    }

    fn fetch<'w>(columns: &mut ColumnIter<'_, 'w>) -> Self::Block<'w> {
        take_column(columns).map(bytemuck::cast_slice_mut::<u8, C>)
    }

    fn iter<'w>(block: Self::Block<'w>, len: usize) -> Self::Iter<'w> {
        OptionalIter::new(block.map(|column| column.iter_mut()), len)
    }
}

/// Rows of an optional column: `Some` per row when present, else `len`
/// `None`s.
#[derive(Debug)]
pub struct OptionalIter<I> {
    inner: Option<I>,
    remaining: usize,
}

impl<I> OptionalIter<I> {
    fn new(inner: Option<I>, len: usize) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }
}

impl<I: Iterator> Iterator for OptionalIter<I> {
    type Item = Option<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(inner) = &mut self.inner {
            return inner.next().map(Some);
        }
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(None)
    }
}

/// Lock-step iteration over a tuple of iterators.
#[derive(Debug)]
pub struct TupleIter<T>(T);

macro_rules! impl_fetch_tuple {
    ($($name:ident),+) => {
        impl<$($name: Fetch),+> Fetch for ($($name,)+) {
            type Block<'w> = ($($name::Block<'w>,)+);
            type Item<'w> = ($($name::Item<'w>,)+);
            type Iter<'w> = TupleIter<($($name::Iter<'w>,)+)>;

            fn args() -> Vec<QueryArg> {
                let mut args = Vec::new();
                $(args.extend($name::args());)+
                args
            }

            fn infos() -> Vec<ComponentInfo> {
                let mut infos = Vec::new();
                $(infos.extend($name::infos());)+
                infos
            }

            fn fetch<'w>(columns: &mut ColumnIter<'_, 'w>) -> Self::Block<'w> {
                ($($name::fetch(columns),)+)
            }

            #[allow(non_snake_case)]
            fn iter<'w>(block: Self::Block<'w>, len: usize) -> Self::Iter<'w> {
                let ($($name,)+) = block;
                TupleIter(($($name::iter($name, len),)+))
            }
        }

        impl<$($name: Iterator),+> Iterator for TupleIter<($($name,)+)> {
            type Item = ($($name::Item,)+);

            #[allow(non_snake_case)]
            fn next(&mut self) -> Option<Self::Item> {
                let ($($name,)+) = &mut self.0;
                Some(($($name.next()?,)+))
            }
        }
    };
}

impl_fetch_tuple!(A);
impl_fetch_tuple!(A, B);
impl_fetch_tuple!(A, B, C);
impl_fetch_tuple!(A, B, C, D);
impl_fetch_tuple!(A, B, C, D, E);
impl_fetch_tuple!(A, B, C, D, E, F);
impl_fetch_tuple!(A, B, C, D, E, F, G);
impl_fetch_tuple!(A, B, C, D, E, F, G, H);

// ---------------------------------------------------------------------------
// Query / QueryBuilder
// ---------------------------------------------------------------------------

/// A resolved, typed query.
#[derive(Debug)]
pub struct Query<Q> {
    object: QueryObject,
    marker: PhantomData<fn() -> Q>,
}

impl<Q: Fetch> Query<Q> {
    /// The type-erased resolution behind this query.
    pub fn object(&self) -> &QueryObject {
        &self.object
    }

    pub fn entity_count(&self, world: &World) -> usize {
        self.object.entity_count(world)
    }

    /// Resolve again, picking up archetypes registered since.
    ///
    /// # Errors
    ///
    /// Propagates [`QueryProvider::initialize_query`] errors.
    pub fn reinitialize(&mut self, world: &World) -> Result<(), EcsError> {
        self.object.reinitialize(world)
    }

    /// Visit every non-empty matched block with its packed entity column and
    /// typed column slices.
    pub fn for_each_block<'w, F>(&self, world: &'w mut World, mut f: F)
    where
        F: FnMut(&'w [u64], Q::Block<'w>),
    {
        let (registry, pools) = world.storage_mut();
        self.object.visit_blocks(registry, pools, |entities, mut columns| {
            f(entities, Q::fetch(&mut columns.iter_mut()))
        });
    }

    /// Visit every matched row.
    pub fn for_each_entity<'w, F>(&self, world: &'w mut World, mut f: F)
    where
        F: FnMut(Entity, Q::Item<'w>),
    {
        self.for_each_block(world, |entities, block| {
            let rows = Q::iter(block, entities.len());
            for (&bits, item) in entities.iter().zip(rows) {
                f(Entity::from_bits(bits), item);
            }
        });
    }
}

/// Builder returned by [`World::query`].
#[derive(Debug)]
pub struct QueryBuilder<'w, Q> {
    world: &'w World,
    parts: Vec<QueryPart>,
    marker: PhantomData<fn() -> Q>,
}

impl<'w, Q: Fetch> QueryBuilder<'w, Q> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self {
            world,
            parts: vec![QueryPart::new(Q::args())],
            marker: PhantomData,
        }
    }

    /// Skip archetypes that contain `C`.
    pub fn without<C: Component>(self) -> Self {
        self.exclude(ComponentId::of::<C>())
    }

    /// Skip archetypes that contain `component`.
    pub fn exclude(mut self, component: ComponentId) -> Self {
        self.current().excluded.push(component);
        self
    }

    /// Only match archetypes carrying `tag`.
    pub fn with_tag(mut self, tag: ComponentId) -> Self {
        self.current().tags.push(tag);
        self
    }

    /// Start another alternative with the same arguments.
    pub fn or(mut self) -> Self {
        self.parts.push(QueryPart::new(Q::args()));
        self
    }

    /// Validate and resolve.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::InvalidQuery`] for duplicate arguments, tag
    /// arguments, or components the world has never registered, and
    /// [`EcsError::ComponentLayoutMismatch`] when an argument type's layout
    /// differs from the one registered under its name.
    pub fn build(self) -> Result<Query<Q>, EcsError> {
        let definition = QueryDefinition::new(self.parts)?;
        for expected in Q::infos() {
            let Some(registered) = self.world.components().info(expected.id) else {
                continue;
            };
            if registered.size != expected.size || registered.align != expected.align {
                return Err(EcsError::ComponentLayoutMismatch { name: expected.name });
            }
        }
        Ok(Query {
            object: self.world.initialize_query(&definition)?,
            marker: PhantomData,
        })
    }

    fn current(&mut self) -> &mut QueryPart {
        let last = self.parts.len() - 1;
        &mut self.parts[last]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
