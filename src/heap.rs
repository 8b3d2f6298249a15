use std::cmp::Reverse;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::block::{Block, BlockFlags, BlockState};
use crate::block_allocator::BlockAllocator;
use crate::card_table::{merge_into_mod_union, scan_block, BlockCards, CardScanMode, CardTable};
use crate::concurrent::ConcurrentMark;
use crate::generation::{LargeObjects, NoLargeObjects, NoNursery, Nursery};
use crate::globals::{CARDS_PER_BLOCK, MAX_SMALL_OBJECT_SIZE};
use crate::gray_queue::GrayQueue;
use crate::internal::block_list::AtomicBlockList;
use crate::internal::registry::BlockRegistry;
use crate::marking::{select_ops, MarkMode, MarkOps};
use crate::memgov::{MemoryGovernor, UnboundedGovernor};
use crate::mmap::{OsMemory, SystemMemory};
use crate::object::{ObjRef, VTable};
use crate::segregated_space::size_class::SizeClasses;
use crate::statistics::{MajorStatistics, SizeClassStatistics};
use crate::sweeper::Sweeper;
use crate::{Config, HeapError};

/// Components the major heap talks to.
pub struct Collaborators {
    pub nursery: Box<dyn Nursery>,
    pub large_objects: Box<dyn LargeObjects>,
    pub governor: Box<dyn MemoryGovernor>,
    pub os: Box<dyn OsMemory>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            nursery: Box::new(NoNursery),
            large_objects: Box::new(NoLargeObjects),
            governor: Box::new(UnboundedGovernor::default()),
            os: Box::new(SystemMemory),
        }
    }
}

/// Selects what [`MajorHeap::iterate_objects`] visits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IterateObjects(u8);

impl IterateObjects {
    /// Finish sweeping first, so that only live objects are reported.
    pub const SWEEP: Self = Self(1);
    pub const NON_PINNED: Self = Self(2);
    pub const PINNED: Self = Self(4);
    pub const ALL: Self = Self(2 | 4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for IterateObjects {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Mark-sweep major heap made of size-segregated blocks.
pub struct MajorHeap {
    config: Config,
    size_classes: SizeClasses,
    registry: BlockRegistry,
    /// Four lists per size class, keyed by pinned and has-references.
    free_lists: Box<[AtomicBlockList]>,
    block_allocator: BlockAllocator,
    card_table: CardTable,
    nursery: Box<dyn Nursery>,
    large_objects: Box<dyn LargeObjects>,
    evacuate_classes: Box<[AtomicBool]>,
    marking: AtomicBool,
    sweeper: Sweeper,
    collections: AtomicUsize,
    degraded_allocations: AtomicUsize,
}

impl MajorHeap {
    pub fn new(config: Config) -> Result<Arc<Self>, HeapError> {
        Self::with(config, Collaborators::default())
    }

    pub fn with(config: Config, collaborators: Collaborators) -> Result<Arc<Self>, HeapError> {
        let size_classes = SizeClasses::new();
        let classes = size_classes.len();
        let card_table = CardTable::new(config.card_table_bits)?;
        logln_if!(
            config.verbose,
            "[GC] major heap: {} size classes, card table of {} bytes",
            classes,
            card_table.mem_map_size()
        );
        Ok(Arc::new(Self {
            block_allocator: BlockAllocator::new(
                collaborators.os,
                collaborators.governor,
                config.empty_block_reserve,
            ),
            free_lists: (0..classes * 4).map(|_| AtomicBlockList::new()).collect(),
            evacuate_classes: (0..classes).map(|_| AtomicBool::new(false)).collect(),
            sweeper: Sweeper::new(classes),
            registry: BlockRegistry::new(),
            nursery: collaborators.nursery,
            large_objects: collaborators.large_objects,
            marking: AtomicBool::new(false),
            collections: AtomicUsize::new(0),
            degraded_allocations: AtomicUsize::new(0),
            card_table,
            size_classes,
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    pub(crate) fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    pub(crate) fn block_allocator(&self) -> &BlockAllocator {
        &self.block_allocator
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn nursery(&self) -> &dyn Nursery {
        &*self.nursery
    }

    pub fn large_objects(&self) -> &dyn LargeObjects {
        &*self.large_objects
    }

    pub fn size_classes(&self) -> &SizeClasses {
        &self.size_classes
    }

    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    #[inline]
    fn free_list(&self, class: usize, pinned: bool, has_references: bool) -> &AtomicBlockList {
        &self.free_lists[class * 4 + (pinned as usize) * 2 + has_references as usize]
    }

    /* Allocation */

    /// Grabs an empty block for `class` and puts it on the free list.
    /// Returns false if the governor or the OS refused.
    pub fn allocate_block(&self, class: usize, pinned: bool, has_references: bool) -> bool {
        let mem = match self.block_allocator.get_block() {
            Some(mem) => mem,
            None => return false,
        };
        let state = if self.is_marking() {
            BlockState::Marking
        } else {
            BlockState::Swept
        };
        let flags = BlockFlags::new()
            .with_pinned(pinned)
            .with_has_references(has_references)
            .with_is_to_space(self.is_evacuating(class));
        let block = unsafe {
            Block::init(mem, class, self.size_classes.slot_size(class), flags, state)
        };
        self.registry.push(block);
        tracing::trace!(
            target: "comet::marksweep",
            block = block.address(),
            slot_size = block.slot_size(),
            pinned,
            "new block"
        );
        self.add_free_block(block);
        true
    }

    /// Pops a free slot of `class`, allocating a block if needed.
    fn alloc_slot(&self, class: usize, pinned: bool, has_references: bool) -> Option<usize> {
        let list = self.free_list(class, pinned, has_references);
        loop {
            let block = match list.peek() {
                Some(block) => block,
                None => {
                    if !self.allocate_block(class, pinned, has_references) {
                        return None;
                    }
                    continue;
                }
            };
            Sweeper::ensure_block_swept(block);
            if let Some(slot) = block.take_slot() {
                return Some(slot);
            }
            if list.pop_if_head(block) {
                block.on_free_list.store(false, Ordering::SeqCst);
                // a slot may have been freed after our take failed
                if block.has_free_slots() {
                    self.add_free_block(block);
                }
            }
        }
    }

    fn allocate(&self, vtable: &'static VTable, size: usize, length: usize, pinned: bool) -> Option<ObjRef> {
        debug_assert!(size >= vtable.object_size(length));
        if size > MAX_SMALL_OBJECT_SIZE {
            tracing::debug!(target: "comet::marksweep", size, "object too large for the major heap");
            return None;
        }
        let class = self.size_classes.index_for(size);
        let slot = self.alloc_slot(class, pinned, vtable.has_references())?;
        let obj = unsafe { ObjRef::initialize(slot as *mut u8, vtable, length) };
        if self.is_marking() {
            // allocated black
            let block = unsafe { Block::from_object(slot) };
            block.set_mark_atomic(block.slot_index(slot));
        }
        Some(obj)
    }

    /// Allocates a non-vector object of `size` bytes. Returns `None` when the memory
    /// governor or the OS refuse to provide another block.
    pub fn allocate_object(&self, vtable: &'static VTable, size: usize, pinned: bool) -> Option<ObjRef> {
        self.allocate(vtable, size, 0, pinned)
    }

    pub fn allocate_vector(&self, vtable: &'static VTable, length: usize, pinned: bool) -> Option<ObjRef> {
        let size = vtable.checked_object_size(length)?;
        self.allocate(vtable, size, length, pinned)
    }

    /// Allocation straight into the major heap, used when the nursery cannot serve
    /// a request.
    pub fn allocate_degraded(&self, vtable: &'static VTable, size: usize) -> Option<ObjRef> {
        self.degraded_allocations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "comet::marksweep", size, "degraded allocation");
        self.allocate(vtable, size, 0, false)
    }

    /// Slot of `class` for an evacuated object.
    pub(crate) fn alloc_to_space(&self, class: usize, has_references: bool) -> Option<usize> {
        debug_assert!(self.is_evacuating(class));
        self.alloc_slot(class, false, has_references)
    }

    /// Returns the copy of an object that lost the forwarding race.
    pub(crate) fn free_to_space_copy(&self, copy: ObjRef) {
        let block = unsafe { Block::from_object(copy.address()) };
        self.release_slot(block, copy.address());
    }

    fn release_slot(&self, block: &'static Block, slot: usize) {
        block.clear_mark(block.slot_index(slot));
        unsafe { std::ptr::write_bytes(slot as *mut u8, 0, block.slot_size()) };
        block.return_slot(slot);
        self.add_free_block(block);
    }

    fn free_object(&self, obj: ObjRef, size: usize, pinned: bool) {
        debug_assert!(
            !self.config.concurrent_sweep || self.sweeper.have_swept(),
            "objects cannot be freed during a concurrent sweep"
        );
        let block = unsafe { Block::from_object(obj.address()) };
        debug_assert_eq!(block.is_pinned(), pinned);
        debug_assert!(size <= block.slot_size());
        Sweeper::ensure_block_swept(block);
        self.release_slot(block, obj.address());
    }

    pub fn free_non_pinned_object(&self, obj: ObjRef, size: usize) {
        self.free_object(obj, size, false);
    }

    pub fn free_pinned_object(&self, obj: ObjRef, size: usize) {
        self.free_object(obj, size, true);
    }

    pub(crate) fn add_free_block(&self, block: &'static Block) {
        // from-space blocks stay off the free lists until they are swept
        if self.is_marking()
            && !block.is_pinned()
            && !block.is_to_space()
            && self.is_evacuating(block.size_class())
        {
            return;
        }
        if !block.on_free_list.swap(true, Ordering::AcqRel) {
            self.free_list(block.size_class(), block.is_pinned(), block.has_references())
                .push(block);
        }
    }

    pub(crate) fn clear_free_lists(&self) {
        for list in self.free_lists.iter() {
            list.take_all(|block| block.on_free_list.store(false, Ordering::Release));
        }
    }

    /// Hands an empty block back to the block allocator.
    ///
    /// # Safety
    /// `block` must be unreachable: removed from the registry and from free lists.
    pub(crate) unsafe fn release_block(&self, block: &'static Block) {
        debug_assert!(!block.on_free_list.load(Ordering::Relaxed));
        block.free_mod_union();
        self.block_allocator
            .release_block(block.address() as *mut u8);
    }

    /* Evacuation */

    pub fn is_evacuating(&self, class: usize) -> bool {
        self.evacuate_classes[class].load(Ordering::Relaxed)
    }

    pub(crate) fn set_evacuating(&self, class: usize, evacuate: bool) {
        self.evacuate_classes[class].store(evacuate, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_evacuation_candidate(&self, obj: ObjRef) -> bool {
        let addr = obj.address();
        if self.nursery.contains(addr) || self.large_objects.contains(addr) {
            return false;
        }
        let block = unsafe { Block::from_object(addr) };
        self.is_evacuating(block.size_class())
            && !block.is_pinned()
            && !block.is_to_space()
            && !block.has_pinned()
            && !obj.is_pinned()
    }

    /// Picks the blocks an evacuating class keeps: the fullest ones, enough to hold
    /// every object of the class. They become to-space, the others are emptied by
    /// marking.
    fn select_evacuation_blocks(&self, class: usize) {
        let mut blocks = vec![];
        self.registry.for_each(|_, block| {
            if block.size_class() == class && !block.is_pinned() {
                blocks.push((block.count_allocated(), block));
            }
        });
        let slots_per_block = self.size_classes.slots_per_block(class);
        let used: usize = blocks.iter().map(|(count, _)| count).sum();
        let keep = (used + slots_per_block - 1) / slots_per_block;
        blocks.sort_by_key(|(count, _)| Reverse(*count));

        for has_references in [false, true] {
            self.free_list(class, false, has_references)
                .take_all(|block| block.on_free_list.store(false, Ordering::Release));
        }
        for (i, &(count, block)) in blocks.iter().enumerate() {
            let to_space = i < keep;
            block.set_to_space(to_space);
            if to_space && count < block.slot_count() {
                self.add_free_block(block);
            }
        }
        tracing::debug!(
            target: "comet::marksweep",
            class,
            blocks = blocks.len(),
            keep,
            "selected evacuation blocks"
        );
    }

    /* Collection */

    /// Prepares every block for marking. The world must be stopped.
    pub fn start_major_collection(&self) {
        Sweeper::finish_sweeping(self);
        self.collections.fetch_add(1, Ordering::Relaxed);

        self.registry.for_each(|_, block| {
            Sweeper::ensure_block_swept(block);
            debug_assert_eq!(block.state(), BlockState::Swept);
            debug_assert!(block.marks_clear(), "mark bits set on a swept block");
            block.set_has_pinned(false);
        });
        self.registry.compact();

        for class in 0..self.size_classes.len() {
            if self.is_evacuating(class) {
                self.select_evacuation_blocks(class);
            }
        }
        self.registry
            .for_each(|_, block| block.set_state(BlockState::Marking));
        self.marking.store(true, Ordering::Release);
        tracing::debug!(
            target: "comet::marksweep",
            blocks = self.registry.len(),
            "major collection started"
        );
    }

    /// Ends marking and starts the sweep.
    pub fn finish_major_collection(self: &Arc<Self>) {
        self.marking.store(false, Ordering::Release);
        tracing::debug!(target: "comet::marksweep", "major collection marked");
        Sweeper::sweep(self);
    }

    pub fn marker(&self, mode: MarkMode, evacuate: bool) -> Marker<'_> {
        Marker {
            heap: self,
            ops: select_ops(mode, evacuate),
            queue: GrayQueue::new(),
        }
    }

    /// Marks from `roots` with the configured number of workers. Evacuated roots are
    /// updated in place. Returns the number of objects pushed on gray queues.
    pub fn parallel_mark(&self, roots: &[AtomicUsize], evacuate: bool) -> usize {
        crate::parallel::parallel_mark(self, roots, evacuate, self.config.parallel_workers)
    }

    /// Starts marking from `roots` on a background thread, see [`ConcurrentMark`].
    pub fn start_concurrent_mark(
        self: &Arc<Self>,
        roots: &[AtomicUsize],
        evacuate: bool,
    ) -> std::io::Result<ConcurrentMark> {
        ConcurrentMark::start(self, roots, evacuate)
    }

    /// Marks `obj` without moving it and flags its block so that it is not evacuated.
    pub fn pin_object(&self, obj: ObjRef, queue: &mut GrayQueue) {
        let addr = obj.address();
        if self.nursery.contains(addr) || self.large_objects.contains(addr) {
            return;
        }
        let block = unsafe { Block::from_object(addr) };
        block.set_has_pinned(true);
        if block.set_mark_atomic(block.slot_index(addr)) {
            let vtable = obj.vtable();
            if vtable.has_references() {
                queue.push(obj, vtable);
            }
        }
    }

    /* Sweeping */

    pub fn sweep(self: &Arc<Self>) {
        Sweeper::sweep(self);
    }

    pub fn have_swept(&self) -> bool {
        self.sweeper.have_swept()
    }

    pub fn finish_sweeping(&self) {
        Sweeper::finish_sweeping(self);
    }

    /// Makes sure every block has been checked, without waiting for lazy sweeping.
    pub fn finish_sweep_checking(&self) {
        Sweeper::finish_sweep_checking(self);
    }

    pub(crate) fn ensure_block_swept(&self, block: &Block) {
        Sweeper::ensure_block_swept(block);
    }

    /* Cards */

    /// Dirties the card of `slot` after a reference store.
    #[inline]
    pub fn write_barrier(&self, slot: &AtomicUsize) {
        self.card_table
            .mark_address(slot as *const AtomicUsize as usize);
    }

    /// Stores `value` into field `index` of `obj` with the write barrier.
    pub fn store_field(&self, obj: ObjRef, index: usize, value: Option<ObjRef>) {
        obj.set_field(index, value);
        self.write_barrier(obj.slot(index));
    }

    /// Records that `slot` of `obj` must be rescanned by the finishing pause.
    pub fn mark_card(&self, obj: ObjRef, slot: usize, value: u8) {
        if self.large_objects.contains(obj.address()) {
            self.large_objects.mark_mod_union_card(obj, slot);
            return;
        }
        let block = unsafe { Block::from_object(obj.address()) };
        block.mod_union_or_alloc()[block.card_of(slot)].store(value, Ordering::Relaxed);
    }

    /// Folds the global cards into the mod-union of every block.
    pub fn update_mod_union(&self) {
        let mut cards: BlockCards = [0; CARDS_PER_BLOCK];
        self.registry.for_each(|_, block| {
            if self.card_table.copy_block_cards(block.address(), &mut cards) {
                merge_into_mod_union(block, &cards);
            }
        });
    }

    /// Rescans the objects under dirty cards of every block. Returns the number of
    /// objects scanned.
    pub fn scan_card_table(&self, mode: CardScanMode, ops: &dyn MarkOps, queue: &mut GrayQueue) -> usize {
        let mut global = vec![];
        if mode == CardScanMode::Global {
            self.finish_sweep_checking();
            global = self.card_table.take_all();
            if self.is_marking() {
                // the concurrent marker still needs the cards we just cleared
                let mut cards: BlockCards = [0; CARDS_PER_BLOCK];
                self.registry.for_each(|_, block| {
                    if self
                        .card_table
                        .shadow_block_cards(&global, block.address(), &mut cards)
                    {
                        merge_into_mod_union(block, &cards);
                    }
                });
            }
        }
        let mut scanned = 0;
        self.registry.for_each(|_, block| {
            scanned += scan_block(self, block, mode, &global, ops, queue);
        });
        scanned
    }

    /* Heap walking and statistics */

    pub fn iterate_objects(&self, flags: IterateObjects, mut callback: impl FnMut(ObjRef, usize)) {
        let sweep = flags.contains(IterateObjects::SWEEP);
        if sweep {
            self.finish_sweep_checking();
        }
        self.registry.for_each(|_, block| {
            let wanted = if block.is_pinned() {
                IterateObjects::PINNED
            } else {
                IterateObjects::NON_PINNED
            };
            if !flags.contains(wanted) {
                return;
            }
            if sweep || block.state() == BlockState::Sweeping {
                Sweeper::ensure_block_swept(block);
            }
            let only_marked = block.state() == BlockState::NeedSweeping;
            block.for_each_allocated(|index, slot| {
                if only_marked && !block.is_marked(index) {
                    return;
                }
                if let Some(obj) = unsafe { ObjRef::from_address(slot) } {
                    if obj.forwarded().is_none() {
                        callback(obj, obj.size());
                    }
                }
            });
        });
    }

    /// Bytes occupied by objects, counted in slots.
    pub fn get_used_size(&self) -> usize {
        let mut used = 0;
        self.registry.for_each(|_, block| {
            let slots = match block.state() {
                BlockState::NeedSweeping | BlockState::Sweeping => block.live_count(),
                _ => block.count_allocated(),
            };
            used += slots * block.slot_size();
        });
        used
    }

    /// Number of blocks owned by the heap.
    pub fn get_num_sections(&self) -> usize {
        self.registry.count()
    }

    pub fn num_empty_blocks(&self) -> usize {
        self.block_allocator.num_empty_blocks()
    }

    pub fn slots_per_block(&self, size: usize) -> usize {
        self.size_classes
            .slots_per_block(self.size_classes.index_for(size))
    }

    pub fn statistics(&self) -> MajorStatistics {
        let mut blocks_per_class = vec![0; self.size_classes.len()];
        self.registry
            .for_each(|_, block| blocks_per_class[block.size_class()] += 1);
        let classes = self
            .size_classes
            .iter()
            .enumerate()
            .map(|(class, slot_size)| {
                let stats = self.sweeper.class_stats(class);
                SizeClassStatistics {
                    slot_size,
                    blocks: blocks_per_class[class],
                    used_slots: stats.used_slots.load(Ordering::Relaxed),
                    available_slots: stats.available_slots.load(Ordering::Relaxed),
                    evacuating: self.is_evacuating(class),
                }
            })
            .collect();
        MajorStatistics {
            collections: self.collections.load(Ordering::Relaxed),
            blocks: blocks_per_class.iter().sum(),
            empty_blocks: self.num_empty_blocks(),
            used_bytes: self.get_used_size(),
            reserved_bytes: self.block_allocator.governor().reserved(),
            degraded_allocations: self.degraded_allocations.load(Ordering::Relaxed),
            classes,
        }
    }
}

impl Drop for MajorHeap {
    fn drop(&mut self) {
        self.registry.for_each(|_, block| {
            block.free_mod_union();
            unsafe {
                self.block_allocator
                    .unmap_block(block.address() as *mut u8)
            };
        });
    }
}

/// Marking context: a gray queue plus the strategy that fills and drains it.
pub struct Marker<'a> {
    heap: &'a MajorHeap,
    ops: &'static dyn MarkOps,
    queue: GrayQueue,
}

impl<'a> Marker<'a> {
    pub fn ops(&self) -> &'static dyn MarkOps {
        self.ops
    }

    pub fn queue(&self) -> &GrayQueue {
        &self.queue
    }

    /// Marks the object referenced by `slot`, updating the slot if it moved.
    /// Returns true if the slot still refers to the nursery.
    pub fn mark_root(&mut self, slot: &AtomicUsize) -> bool {
        self.ops.copy_or_mark(self.heap, slot, &mut self.queue)
    }

    /// Marks `obj` and returns its current location.
    pub fn mark(&mut self, obj: ObjRef) -> ObjRef {
        let slot = AtomicUsize::new(obj.address());
        self.mark_root(&slot);
        ObjRef::load(&slot).unwrap_or(obj)
    }

    pub fn pin(&mut self, obj: ObjRef) {
        self.heap.pin_object(obj, &mut self.queue);
    }

    /// Scans gray objects until the queue is empty.
    pub fn drain(&mut self) {
        self.ops.drain(self.heap, &mut self.queue, usize::MAX);
    }

    pub fn scan_card_table(&mut self, mode: CardScanMode) -> usize {
        self.heap.scan_card_table(mode, self.ops, &mut self.queue)
    }

    pub fn into_queue(self) -> GrayQueue {
        self.queue
    }
}
