//! Fixed-size data blocks and the per-archetype block pools.
//!
//! Every archetype instance owns a pool of [`DataBlock`]s, all of the
//! configured block size. A block stores up to
//! [`entity_count_max`](crate::archetype::ArchetypeInstanceInfo::entity_count_max)
//! rows column by column, at the offsets computed by the archetype layout.
//! Live rows always occupy `[0, count)`: removal swaps the last row into the
//! hole.
//!
//! Block memory is a `Vec<u64>`, which keeps every block 8-byte aligned, and
//! columns are viewed through checked `bytemuck` casts.

use std::ops::Range;

use crate::archetype::{ArchetypeInstance, ArchetypeInstanceInfo, MISSING_COLUMN};
use crate::entity::Entity;
use crate::EcsError;

/// Bytes per row of the entity column.
const ENTITY_SIZE: usize = std::mem::size_of::<u64>();

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// A block's backing memory.
#[derive(Debug)]
pub struct BlockMemory {
    words: Vec<u64>,
}

impl BlockMemory {
    /// Zeroed memory of at least `size` bytes, rounded up to whole words.
    pub fn zeroed(size: usize) -> Self {
        Self {
            words: vec![0; size.div_ceil(ENTITY_SIZE)],
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.words.len() * ENTITY_SIZE
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }
}

/// Failure reported by a [`BlockAllocator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("block allocation of {size} bytes failed: {reason}")]
pub struct AllocError {
    pub size: usize,
    pub reason: String,
}

/// Source of block memory.
pub trait BlockAllocator: Send {
    /// Hand out a zeroed block of `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<BlockMemory, AllocError>;

    /// Take back a block previously returned by [`allocate`](Self::allocate).
    fn deallocate(&mut self, memory: BlockMemory);
}

/// Heap-backed allocator with an optional cap on live blocks.
#[derive(Debug, Default)]
pub struct HeapBlockAllocator {
    max_blocks: Option<usize>,
    live: usize,
}

impl HeapBlockAllocator {
    pub fn new(max_blocks: Option<usize>) -> Self {
        Self {
            max_blocks,
            live: 0,
        }
    }

    /// Blocks handed out and not yet returned.
    pub fn live_blocks(&self) -> usize {
        self.live
    }
}

impl BlockAllocator for HeapBlockAllocator {
    fn allocate(&mut self, size: usize) -> Result<BlockMemory, AllocError> {
        if let Some(max) = self.max_blocks {
            if self.live >= max {
                return Err(AllocError {
                    size,
                    reason: format!("block limit of {max} reached"),
                });
            }
        }
        self.live += 1;
        Ok(BlockMemory::zeroed(size))
    }

    fn deallocate(&mut self, _memory: BlockMemory) {
        self.live = self.live.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// EntitySlot
// ---------------------------------------------------------------------------

/// Where an entity's row lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntitySlot {
    pub archetype: ArchetypeInstance,
    pub block: u32,
    pub row: u32,
}

// ---------------------------------------------------------------------------
// DataBlock
// ---------------------------------------------------------------------------

/// One block of rows for a single archetype.
#[derive(Debug)]
pub struct DataBlock {
    memory: BlockMemory,
    count: u32,
}

impl DataBlock {
    /// Live rows.
    pub fn count(&self) -> usize {
        self.count as usize
    }

    /// Packed entity handles of the live rows (see [`Entity::to_bits`]).
    pub fn entities(&self) -> &[u64] {
        &self.memory.words[..self.count()]
    }

    /// Bytes of `column` for the live rows. `None` for tags.
    pub fn column(&self, info: &ArchetypeInstanceInfo, column: usize) -> Option<&[u8]> {
        let range = column_range(info, column, 0..self.count())?;
        Some(&self.memory.bytes()[range])
    }

    /// Mutable [`column`](Self::column).
    pub fn column_mut(&mut self, info: &ArchetypeInstanceInfo, column: usize) -> Option<&mut [u8]> {
        let range = column_range(info, column, 0..self.count())?;
        Some(&mut self.memory.bytes_mut()[range])
    }

    /// Borrow the entity column and the columns named by `argument_map` at
    /// once. Entries equal to [`MISSING_COLUMN`] come back as `None`.
    ///
    /// # Panics
    ///
    /// Panics if `argument_map` names the same column twice.
    pub fn split_columns<'b>(
        &'b mut self,
        info: &ArchetypeInstanceInfo,
        argument_map: &[u32],
    ) -> (&'b [u64], Vec<Option<&'b mut [u8]>>) {
        let count = self.count();
        let entity_end = info.entity_count_max() as usize * ENTITY_SIZE;
        let (head, mut rest) = self.memory.bytes_mut().split_at_mut(entity_end);
        let head: &'b [u8] = head;
        let entities: &'b [u64] = bytemuck::cast_slice(&head[..count * ENTITY_SIZE]);

        let mut order: Vec<(usize, usize)> = argument_map
            .iter()
            .enumerate()
            .filter(|&(_, &column)| column != MISSING_COLUMN && !info.is_tag(column as usize))
            .map(|(arg, &column)| (info.offsets()[column as usize] as usize, arg))
            .collect();
        order.sort_unstable();

        let mut columns: Vec<Option<&'b mut [u8]>> =
            std::iter::repeat_with(|| None).take(argument_map.len()).collect();
        let mut cursor = entity_end;
        for (offset, arg) in order {
            assert!(offset >= cursor, "column requested twice in one view");
            let size = info.sizes()[argument_map[arg] as usize] as usize;
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(offset - cursor);
            let (live, tail) = tail.split_at_mut(size * count);
            columns[arg] = Some(live);
            rest = tail;
            cursor = offset + size * count;
        }
        (entities, columns)
    }
}

/// Byte range of `rows` in `column`, or `None` for a tag column.
fn column_range(info: &ArchetypeInstanceInfo, column: usize, rows: Range<usize>) -> Option<Range<usize>> {
    if info.is_tag(column) {
        return None;
    }
    let offset = info.offsets()[column] as usize;
    let size = info.sizes()[column] as usize;
    Some(offset + rows.start * size..offset + rows.end * size)
}

// ---------------------------------------------------------------------------
// DataBlockStore
// ---------------------------------------------------------------------------

/// Owns every block of every archetype.
///
/// Blocks are never returned to the allocator while the store lives: an
/// emptied block stays in its pool and is refilled by later inserts.
pub struct DataBlockStore {
    allocator: Box<dyn BlockAllocator>,
    block_size: usize,
    /// Indexed by [`ArchetypeInstance`].
    pools: Vec<Vec<DataBlock>>,
}

impl std::fmt::Debug for DataBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlockStore")
            .field("block_size", &self.block_size)
            .field("pools", &self.pools.len())
            .field("blocks", &self.block_count())
            .finish()
    }
}

impl DataBlockStore {
    pub fn new(allocator: Box<dyn BlockAllocator>, block_size: usize) -> Self {
        Self {
            allocator,
            block_size,
            pools: Vec::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Append a row for `entity`, writing its handle and zeroing every
    /// component column.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::ArchetypeAllocationFailed`] if every block is full
    /// and the allocator refuses a new one. The store is left unchanged.
    pub fn insert(&mut self, info: &ArchetypeInstanceInfo, entity: Entity) -> Result<EntitySlot, EcsError> {
        let instance = info.instance();
        if self.pools.len() <= instance.index() {
            self.pools.resize_with(instance.index() + 1, Vec::new);
        }

        let capacity = info.entity_count_max();
        let free = self.pools[instance.index()]
            .iter()
            .position(|block| block.count < capacity);
        let block_index = match free {
            Some(index) => index,
            None => {
                let memory = self.allocator.allocate(self.block_size).map_err(|source| {
                    tracing::warn!(archetype = ?info.identifier(), error = %source, "block allocation failed");
                    EcsError::ArchetypeAllocationFailed {
                        archetype: info.identifier(),
                        source,
                    }
                })?;
                let pool = &mut self.pools[instance.index()];
                pool.push(DataBlock { memory, count: 0 });
                tracing::debug!(
                    archetype = ?info.identifier(),
                    blocks = pool.len(),
                    "allocated data block"
                );
                pool.len() - 1
            }
        };

        let block = &mut self.pools[instance.index()][block_index];
        let row = block.count as usize;
        block.count += 1;
        block.memory.words[row] = entity.to_bits();
        let bytes = block.memory.bytes_mut();
        for column in 1..info.column_count() {
            if let Some(range) = column_range(info, column, row..row + 1) {
                bytes[range].fill(0);
            }
        }

        Ok(EntitySlot {
            archetype: instance,
            block: block_index as u32,
            row: row as u32,
        })
    }

    /// Swap-remove the row at `slot`.
    ///
    /// Returns the entity that was moved into `slot` from the end of the
    /// block, or `None` if `slot` was the last row.
    ///
    /// # Errors
    ///
    /// Returns [`EcsError::InvalidSlot`] if `slot` is not a live row.
    pub fn remove(&mut self, info: &ArchetypeInstanceInfo, slot: EntitySlot) -> Result<Option<Entity>, EcsError> {
        let block = self.block_mut(slot)?;
        let row = slot.row as usize;
        let last = block.count() - 1;
        block.count -= 1;
        if row == last {
            return Ok(None);
        }

        let bytes = block.memory.bytes_mut();
        for column in 0..info.column_count() {
            let Some(src) = column_range(info, column, last..last + 1) else {
                continue;
            };
            let dst = info.offsets()[column] as usize + row * info.sizes()[column] as usize;
            bytes.copy_within(src, dst);
        }
        Ok(Some(Entity::from_bits(block.memory.words[row])))
    }

    /// Move the row at `slot` into archetype `to`.
    ///
    /// Shared columns are copied byte for byte, columns only `to` has are
    /// zeroed, and columns only `from` has are dropped. Returns the new slot
    /// and the entity that filled the hole left in `from`, if any.
    ///
    /// # Errors
    ///
    /// - [`EcsError::InvalidSlot`] if `slot` is not a live row.
    /// - [`EcsError::ArchetypeAllocationFailed`] if no destination row can be
    ///   obtained. Nothing has moved in that case.
    pub fn move_entity(
        &mut self,
        from: &ArchetypeInstanceInfo,
        slot: EntitySlot,
        to: &ArchetypeInstanceInfo,
    ) -> Result<(EntitySlot, Option<Entity>), EcsError> {
        let entity = self.entity_at(slot).ok_or(EcsError::InvalidSlot { slot })?;
        if from.instance() == to.instance() {
            return Ok((slot, None));
        }

        let target = self.insert(to, entity)?;

        let (src_pool, dst_pool) =
            pair_mut(&mut self.pools, from.instance().index(), to.instance().index());
        let src = src_pool[slot.block as usize].memory.bytes();
        let dst = dst_pool[target.block as usize].memory.bytes_mut();
        for (column, &id) in from.component_ids().iter().enumerate().skip(1) {
            let Some(to_column) = to.column_of(id) else {
                continue;
            };
            let row = slot.row as usize;
            let target_row = target.row as usize;
            if let (Some(s), Some(d)) = (
                column_range(from, column, row..row + 1),
                column_range(to, to_column, target_row..target_row + 1),
            ) {
                dst[d].copy_from_slice(&src[s]);
            }
        }

        let moved = self.remove(from, slot)?;
        tracing::trace!(
            %entity,
            from = ?from.identifier(),
            to = ?to.identifier(),
            "moved entity between archetypes"
        );
        Ok((target, moved))
    }

    /// Entity stored at `slot`, if the slot is live.
    pub fn entity_at(&self, slot: EntitySlot) -> Option<Entity> {
        let block = self.block(slot).ok()?;
        Some(Entity::from_bits(block.memory.words[slot.row as usize]))
    }

    /// Bytes of one component of one row. `None` for tags and dead slots.
    pub fn component_bytes(&self, info: &ArchetypeInstanceInfo, slot: EntitySlot, column: usize) -> Option<&[u8]> {
        let block = self.block(slot).ok()?;
        let row = slot.row as usize;
        let range = column_range(info, column, row..row + 1)?;
        Some(&block.memory.bytes()[range])
    }

    /// Mutable [`component_bytes`](Self::component_bytes).
    pub fn component_bytes_mut(
        &mut self,
        info: &ArchetypeInstanceInfo,
        slot: EntitySlot,
        column: usize,
    ) -> Option<&mut [u8]> {
        let block = self.block_mut(slot).ok()?;
        let row = slot.row as usize;
        let range = column_range(info, column, row..row + 1)?;
        Some(&mut block.memory.bytes_mut()[range])
    }

    /// Blocks of one archetype, in creation order.
    pub fn blocks(&self, instance: ArchetypeInstance) -> &[DataBlock] {
        self.pools.get(instance.index()).map_or(&[], Vec::as_slice)
    }

    /// All pools, indexed by archetype instance.
    pub(crate) fn pools_mut(&mut self) -> &mut [Vec<DataBlock>] {
        &mut self.pools
    }

    /// Live rows across all blocks of one archetype.
    pub fn entity_count(&self, instance: ArchetypeInstance) -> usize {
        self.blocks(instance).iter().map(DataBlock::count).sum()
    }

    /// Blocks held across all archetypes.
    pub fn block_count(&self) -> usize {
        self.pools.iter().map(Vec::len).sum()
    }

    fn block(&self, slot: EntitySlot) -> Result<&DataBlock, EcsError> {
        self.pools
            .get(slot.archetype.index())
            .and_then(|pool| pool.get(slot.block as usize))
            .filter(|block| slot.row < block.count)
            .ok_or(EcsError::InvalidSlot { slot })
    }

    fn block_mut(&mut self, slot: EntitySlot) -> Result<&mut DataBlock, EcsError> {
        self.pools
            .get_mut(slot.archetype.index())
            .and_then(|pool| pool.get_mut(slot.block as usize))
            .filter(|block| slot.row < block.count)
            .ok_or(EcsError::InvalidSlot { slot })
    }
}

impl Drop for DataBlockStore {
    fn drop(&mut self) {
        for pool in self.pools.drain(..) {
            for block in pool {
                self.allocator.deallocate(block.memory);
            }
        }
    }
}

/// Two distinct elements of a slice, both mutable.
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b);
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{ArchetypeDefinition, ArchetypeRegistry};
    use crate::component::ComponentInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const BLOCK: usize = 256;

    fn position() -> ComponentInfo {
        ComponentInfo::new("position", 8, 4)
    }

    fn velocity() -> ComponentInfo {
        ComponentInfo::new("velocity", 8, 4)
    }

    fn heap_store(max_blocks: Option<usize>) -> DataBlockStore {
        DataBlockStore::new(Box::new(HeapBlockAllocator::new(max_blocks)), BLOCK)
    }

    fn register(registry: &mut ArchetypeRegistry, infos: Vec<ComponentInfo>) -> ArchetypeInstance {
        registry
            .register_or_get(&ArchetypeDefinition::new(infos), BLOCK)
            .unwrap()
            .instance()
    }

    fn write_position(store: &mut DataBlockStore, info: &ArchetypeInstanceInfo, slot: EntitySlot, v: [f32; 2]) {
        let column = info.column_of(position().id).unwrap();
        store
            .component_bytes_mut(info, slot, column)
            .unwrap()
            .copy_from_slice(bytemuck::bytes_of(&v));
    }

    fn read_position(store: &DataBlockStore, info: &ArchetypeInstanceInfo, slot: EntitySlot) -> [f32; 2] {
        let column = info.column_of(position().id).unwrap();
        bytemuck::pod_read_unaligned(store.component_bytes(info, slot, column).unwrap())
    }

    #[test]
    fn insert_fills_blocks_in_order() {
        let mut registry = ArchetypeRegistry::new();
        let instance = register(&mut registry, vec![position()]);
        let info = registry.get(instance).unwrap();
        let mut store = heap_store(None);

        let per_block = info.entity_count_max() as usize;
        let slots: Vec<EntitySlot> = (0..per_block + 1)
            .map(|i| store.insert(info, Entity::new(i as u32, 0)).unwrap())
            .collect();

        assert_eq!(slots[0].block, 0);
        assert_eq!(slots[per_block - 1].row as usize, per_block - 1);
        assert_eq!(slots[per_block].block, 1);
        assert_eq!(slots[per_block].row, 0);
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.entity_count(instance), per_block + 1);
        assert_eq!(store.entity_at(slots[3]), Some(Entity::new(3, 0)));
    }

    #[test]
    fn inserted_components_start_zeroed() {
        let mut registry = ArchetypeRegistry::new();
        let instance = register(&mut registry, vec![position()]);
        let info = registry.get(instance).unwrap();
        let mut store = heap_store(None);

        let a = store.insert(info, Entity::new(0, 0)).unwrap();
        write_position(&mut store, info, a, [1.0, 2.0]);
        store.remove(info, a).unwrap();

        let b = store.insert(info, Entity::new(1, 0)).unwrap();
        assert_eq!(b, a);
        assert_eq!(read_position(&store, info, b), [0.0, 0.0]);
    }

    #[test]
    fn remove_swaps_last_row_in() {
        let mut registry = ArchetypeRegistry::new();
        let instance = register(&mut registry, vec![position()]);
        let info = registry.get(instance).unwrap();
        let mut store = heap_store(None);

        let slots: Vec<EntitySlot> = (0..3)
            .map(|i| {
                let slot = store.insert(info, Entity::new(i, 0)).unwrap();
                write_position(&mut store, info, slot, [i as f32, 0.0]);
                slot
            })
            .collect();

        let moved = store.remove(info, slots[0]).unwrap();
        assert_eq!(moved, Some(Entity::new(2, 0)));
        assert_eq!(store.entity_at(slots[0]), Some(Entity::new(2, 0)));
        assert_eq!(read_position(&store, info, slots[0]), [2.0, 0.0]);
        assert_eq!(store.entity_count(instance), 2);

        // Removing the tail moves nothing.
        assert_eq!(store.remove(info, slots[1]).unwrap(), None);
        assert!(matches!(
            store.remove(info, slots[2]),
            Err(EcsError::InvalidSlot { .. })
        ));
    }

    #[test]
    fn move_keeps_shared_and_zeroes_new() {
        let mut registry = ArchetypeRegistry::new();
        let p = register(&mut registry, vec![position()]);
        let pv = register(&mut registry, vec![position(), velocity()]);
        let from = registry.get(p).unwrap();
        let to = registry.get(pv).unwrap();
        let mut store = heap_store(None);

        let a = store.insert(from, Entity::new(0, 0)).unwrap();
        let b = store.insert(from, Entity::new(1, 0)).unwrap();
        write_position(&mut store, from, a, [3.0, 4.0]);
        write_position(&mut store, from, b, [5.0, 6.0]);

        let (target, moved) = store.move_entity(from, a, to).unwrap();
        assert_eq!(target.archetype, pv);
        assert_eq!(moved, Some(Entity::new(1, 0)));
        assert_eq!(read_position(&store, to, target), [3.0, 4.0]);
        assert_eq!(read_position(&store, from, a), [5.0, 6.0]);

        let vel = to.column_of(velocity().id).unwrap();
        assert_eq!(store.component_bytes(to, target, vel).unwrap(), &[0u8; 8]);
        assert_eq!(store.entity_count(p), 1);
        assert_eq!(store.entity_count(pv), 1);
    }

    #[test]
    fn failed_move_changes_nothing() {
        let mut registry = ArchetypeRegistry::new();
        let p = register(&mut registry, vec![position()]);
        let pv = register(&mut registry, vec![position(), velocity()]);
        let from = registry.get(p).unwrap();
        let to = registry.get(pv).unwrap();
        let mut store = heap_store(Some(1));

        let a = store.insert(from, Entity::new(0, 0)).unwrap();
        write_position(&mut store, from, a, [7.0, 8.0]);

        let err = store.move_entity(from, a, to).unwrap_err();
        assert!(matches!(err, EcsError::ArchetypeAllocationFailed { .. }));
        assert_eq!(store.entity_count(p), 1);
        assert_eq!(store.entity_count(pv), 0);
        assert_eq!(read_position(&store, from, a), [7.0, 8.0]);
    }

    #[test]
    fn split_columns_returns_disjoint_views() {
        let mut registry = ArchetypeRegistry::new();
        let pv = register(&mut registry, vec![position(), velocity()]);
        let info = registry.get(pv).unwrap();
        let mut store = heap_store(None);
        for i in 0..4 {
            let slot = store.insert(info, Entity::new(i, 0)).unwrap();
            write_position(&mut store, info, slot, [i as f32, 1.0]);
        }

        let map = ArchetypeRegistry::argument_index_map(
            info,
            &[velocity().id, position().id, ComponentInfo::new("mass", 8, 8).id],
        );
        let block = &mut store.pools_mut()[pv.index()][0];
        let (entities, mut columns) = block.split_columns(info, &map);
        assert_eq!(entities.len(), 4);
        assert_eq!(Entity::from_bits(entities[3]), Entity::new(3, 0));
        assert!(columns[2].is_none());

        let velocities: &mut [[f32; 2]] = bytemuck::cast_slice_mut(columns[0].take().unwrap());
        velocities[1] = [9.0, 9.0];
        let positions: &[[f32; 2]] = bytemuck::cast_slice(columns[1].take().unwrap());
        assert_eq!(positions[2], [2.0, 1.0]);
    }

    #[derive(Clone, Default)]
    struct CountingAllocator {
        live: Arc<AtomicUsize>,
    }

    impl BlockAllocator for CountingAllocator {
        fn allocate(&mut self, size: usize) -> Result<BlockMemory, AllocError> {
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(BlockMemory::zeroed(size))
        }

        fn deallocate(&mut self, _memory: BlockMemory) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn drop_returns_blocks_to_allocator() {
        let allocator = CountingAllocator::default();
        let live = Arc::clone(&allocator.live);
        let mut registry = ArchetypeRegistry::new();
        let p = register(&mut registry, vec![position()]);
        let info = registry.get(p).unwrap();

        let mut store = DataBlockStore::new(Box::new(allocator), BLOCK);
        for i in 0..(info.entity_count_max() * 3) {
            store.insert(info, Entity::new(i, 0)).unwrap();
        }
        assert_eq!(live.load(Ordering::SeqCst), 3);
        drop(store);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn heap_allocator_enforces_limit() {
        let mut allocator = HeapBlockAllocator::new(Some(1));
        let block = allocator.allocate(64).unwrap();
        assert_eq!(block.len_bytes(), 64);
        assert!(allocator.allocate(64).is_err());
        allocator.deallocate(block);
        assert_eq!(allocator.live_blocks(), 0);
        assert!(allocator.allocate(64).is_ok());
    }
}
