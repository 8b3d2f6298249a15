use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use crate::block::{Block, BlockState};
use crate::card_table::CardScanMode;
use crate::concurrent::ConcurrentMark;
use crate::descriptor::Descriptor;
use crate::generation::Nursery;
use crate::globals::{BLOCK_SIZE, CARDS_PER_BLOCK, CARD_SIZE, MAX_SMALL_OBJECT_SIZE};
use crate::gray_queue::GrayQueue;
use crate::heap::{Collaborators, IterateObjects, MajorHeap};
use crate::marking::{select_ops, MarkMode};
use crate::memgov::QuotaGovernor;
use crate::object::{ObjRef, VTable};
use crate::Config;

/// Two references, in words 1 and 2.
static NODE: VTable = VTable::new("node", Descriptor::Bitmap(0b110), 24);
static LEAF: VTable = VTable::new("leaf", Descriptor::SmallPtrFree, 256);
/// Same size class as `LEAF`, with one reference in word 1.
static BIG_NODE: VTable = VTable::new("big-node", Descriptor::Bitmap(0b10), 256);

fn eager_config() -> Config {
    Config {
        lazy_sweep: false,
        concurrent_sweep: false,
        empty_block_reserve: 1024,
        ..Config::default()
    }
}

fn eager_heap() -> Arc<MajorHeap> {
    MajorHeap::new(eager_config()).unwrap()
}

fn block_of(obj: ObjRef) -> &'static Block {
    unsafe { Block::from_object(obj.address()) }
}

fn is_marked(obj: ObjRef) -> bool {
    let block = block_of(obj);
    block.is_marked(block.slot_index(obj.address()))
}

fn count_objects(heap: &MajorHeap) -> usize {
    let mut count = 0;
    heap.iterate_objects(IterateObjects::ALL | IterateObjects::SWEEP, |_, _| count += 1);
    count
}

fn alloc(heap: &MajorHeap, vtable: &'static VTable) -> ObjRef {
    heap.allocate_object(vtable, vtable.instance_size, false)
        .unwrap()
}

#[test]
fn free_restores_the_slot() {
    let heap = eager_heap();
    let a = alloc(&heap, &NODE);
    let b = alloc(&heap, &NODE);
    assert_ne!(a, b);
    assert!(std::ptr::eq(a.vtable(), &NODE));
    assert_eq!(a.field(1), None);

    heap.free_non_pinned_object(b, 24);
    assert!(!block_of(b).is_allocated(block_of(b).slot_index(b.address())));
    assert_eq!(alloc(&heap, &NODE), b);
}

#[test]
fn pinned_objects_use_their_own_blocks() {
    let heap = eager_heap();
    let a = alloc(&heap, &NODE);
    let p = heap.allocate_object(&NODE, 24, true).unwrap();
    assert!(block_of(p).is_pinned());
    assert!(!block_of(a).is_pinned());
    assert_ne!(block_of(a).address(), block_of(p).address());
    heap.free_pinned_object(p, 24);
    assert_eq!(heap.allocate_object(&NODE, 24, true), Some(p));
}

#[test]
fn too_large_objects_are_refused() {
    let heap = eager_heap();
    assert_eq!(heap.allocate_object(&LEAF, MAX_SMALL_OBJECT_SIZE + 8, false), None);
    assert!(heap.allocate_object(&LEAF, MAX_SMALL_OBJECT_SIZE, false).is_some());
}

#[test]
fn quota_denial_fails_allocation() {
    let collaborators = Collaborators {
        governor: Box::new(QuotaGovernor::new(2 * BLOCK_SIZE)),
        ..Collaborators::default()
    };
    let heap = MajorHeap::with(eager_config(), collaborators).unwrap();
    let mut count = 0;
    while heap.allocate_object(&LEAF, 256, false).is_some() {
        count += 1;
    }
    assert_eq!(count, 2 * heap.slots_per_block(256));
    assert_eq!(heap.get_num_sections(), 2);
}

#[test]
fn sweep_frees_unmarked_objects_and_empty_blocks() {
    let heap = eager_heap();
    let objects: Vec<ObjRef> = (0..1000).map(|_| alloc(&heap, &LEAF)).collect();
    let per_block = heap.slots_per_block(256);
    let blocks = (1000 + per_block - 1) / per_block;
    assert_eq!(heap.get_num_sections(), blocks);
    assert_eq!(heap.num_empty_blocks(), 32 - blocks);

    heap.start_major_collection();
    let mut marker = heap.marker(MarkMode::Serial, false);
    for obj in &objects[..100] {
        assert_eq!(marker.mark(*obj), *obj);
    }
    marker.drain();
    drop(marker);
    heap.finish_major_collection();

    assert!(heap.have_swept());
    let survivors = (100 + per_block - 1) / per_block;
    assert_eq!(heap.get_num_sections(), survivors);
    assert_eq!(heap.num_empty_blocks(), 32 - survivors);
    assert_eq!(heap.get_used_size(), 100 * 256);
    assert_eq!(count_objects(&heap), 100);
    heap.registry().for_each(|_, block| {
        assert_eq!(block.state(), BlockState::Swept);
        assert!(block.marks_clear());
    });
    for obj in &objects[100..2 * per_block] {
        let block = block_of(*obj);
        assert!(!block.is_allocated(block.slot_index(obj.address())));
    }
}

#[test]
fn drain_scans_every_object_once() {
    let heap = eager_heap();
    let a = alloc(&heap, &NODE);
    let b = alloc(&heap, &NODE);
    let c = alloc(&heap, &NODE);
    let garbage = alloc(&heap, &NODE);
    a.set_field(1, Some(b));
    b.set_field(1, Some(c));
    b.set_field(2, Some(b));
    c.set_field(1, Some(a));
    c.set_field(2, Some(b));

    heap.start_major_collection();
    let mut marker = heap.marker(MarkMode::Serial, false);
    let root = AtomicUsize::new(a.address());
    assert!(!marker.mark_root(&root));
    marker.drain();
    assert_eq!(marker.queue().pushes(), 3);
    assert!(marker.queue().is_empty());
    assert!(is_marked(a) && is_marked(b) && is_marked(c));
    assert!(!is_marked(garbage));
    drop(marker);
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 3);
}

#[test]
fn racing_markers_push_once() {
    let heap = eager_heap();
    let objects: Vec<ObjRef> = (0..100).map(|_| alloc(&heap, &NODE)).collect();
    heap.start_major_collection();
    let ops = select_ops(MarkMode::Parallel, false);
    for obj in &objects {
        let slot = AtomicUsize::new(obj.address());
        let barrier = Barrier::new(2);
        let pushes: usize = crossbeam_utils::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let (heap, slot, barrier) = (&heap, &slot, &barrier);
                    scope.spawn(move |_| {
                        let mut queue = GrayQueue::new();
                        barrier.wait();
                        ops.copy_or_mark(heap, slot, &mut queue);
                        queue.pushes()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        })
        .unwrap();
        assert_eq!(pushes, 1);
        assert!(is_marked(*obj));
    }
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 100);
}

#[test]
fn parallel_mark_reaches_the_whole_graph() {
    let heap = eager_heap();
    let nodes: Vec<ObjRef> = (0..2000).map(|_| alloc(&heap, &NODE)).collect();
    // binary tree, node i points to 2i+1 and 2i+2
    for (i, node) in nodes.iter().enumerate() {
        for field in 1..=2 {
            if let Some(child) = nodes.get(2 * i + field) {
                node.set_field(field, Some(*child));
            }
        }
    }
    for _ in 0..500 {
        alloc(&heap, &NODE);
    }

    heap.start_major_collection();
    let roots = [AtomicUsize::new(nodes[0].address())];
    assert_eq!(heap.parallel_mark(&roots, false), 2000);
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 2000);
}

#[test]
fn global_scan_visits_objects_overlapping_dirty_cards() {
    let heap = eager_heap();
    let old: Vec<ObjRef> = (0..20).map(|_| alloc(&heap, &BIG_NODE)).collect();
    let targets: Vec<ObjRef> = old
        .iter()
        .map(|obj| {
            let target = alloc(&heap, &NODE);
            obj.set_field(1, Some(target));
            target
        })
        .collect();
    assert!(!heap.card_table().is_dirty(old[5].slot(1) as *const _ as usize));

    heap.start_major_collection();
    heap.write_barrier(old[5].slot(1));
    let dirty = old[5].address() + 8;
    let card_start = dirty - (dirty - block_of(old[5]).address()) % CARD_SIZE;
    let card_end = card_start + CARD_SIZE;
    let expected: Vec<bool> = old
        .iter()
        .map(|obj| obj.address() < card_end && obj.address() + 256 > card_start)
        .collect();

    let mut marker = heap.marker(MarkMode::Serial, false);
    let scanned = marker.scan_card_table(CardScanMode::Global);
    assert_eq!(scanned, expected.iter().filter(|e| **e).count());
    assert!(scanned >= 1);
    for (target, expected) in targets.iter().zip(expected) {
        assert_eq!(is_marked(*target), expected);
    }
    assert!(!heap.card_table().is_dirty(dirty));
    // cards are consumed
    assert_eq!(marker.scan_card_table(CardScanMode::Global), 0);
    drop(marker);
    heap.finish_major_collection();
}

#[test]
fn global_scan_keeps_cards_shared_by_aliased_blocks() {
    // one block worth of cards, every block maps onto the same bytes
    let config = Config {
        card_table_bits: CARDS_PER_BLOCK.trailing_zeros(),
        ..eager_config()
    };
    let heap = MajorHeap::new(config).unwrap();
    let per_block = heap.slots_per_block(256);
    let old: Vec<ObjRef> = (0..3 * per_block).map(|_| alloc(&heap, &BIG_NODE)).collect();
    let holder = old[2 * per_block + 3];
    assert_ne!(block_of(holder).address(), block_of(old[0]).address());
    let target = alloc(&heap, &NODE);
    holder.set_field(1, Some(target));

    heap.start_major_collection();
    heap.write_barrier(holder.slot(1));
    let mut marker = heap.marker(MarkMode::Serial, false);
    // the same card of every BIG_NODE block is scanned
    assert!(marker.scan_card_table(CardScanMode::Global) >= 3);
    assert!(is_marked(target));
    assert_eq!(marker.scan_card_table(CardScanMode::Global), 0);
    drop(marker);
    heap.finish_major_collection();
}

/// Nursery made of a single static buffer. Objects are never promoted.
struct FixedNursery {
    start: usize,
    end: usize,
}

impl FixedNursery {
    fn new() -> (Self, ObjRef) {
        let memory: &'static mut [usize; 8] = Box::leak(Box::new([0; 8]));
        let obj = unsafe { ObjRef::initialize(memory.as_mut_ptr().cast(), &NODE, 0) };
        let start = obj.address();
        (
            Self {
                start,
                end: start + 8 * 8,
            },
            obj,
        )
    }
}

impl Nursery for FixedNursery {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    fn copy_object(&self, obj: ObjRef, _queue: &mut GrayQueue) -> ObjRef {
        obj
    }
}

fn heap_with_nursery() -> (Arc<MajorHeap>, ObjRef) {
    let (nursery, young) = FixedNursery::new();
    let collaborators = Collaborators {
        nursery: Box::new(nursery),
        ..Collaborators::default()
    };
    (MajorHeap::with(eager_config(), collaborators).unwrap(), young)
}

#[test]
fn references_left_in_the_nursery_keep_their_card() {
    let (heap, young) = heap_with_nursery();
    let old = alloc(&heap, &NODE);
    old.set_field(2, Some(young));
    let slot = old.slot(2) as *const AtomicUsize as usize;
    assert!(!heap.card_table().is_dirty(slot));

    heap.start_major_collection();
    let mut marker = heap.marker(MarkMode::Serial, false);
    marker.mark(old);
    marker.drain();
    assert!(heap.card_table().is_dirty(slot));
    assert_eq!(old.field(2), Some(young));
    drop(marker);
    heap.finish_major_collection();
}

#[test]
fn concurrent_marker_defers_nursery_references() {
    let (heap, young) = heap_with_nursery();
    let old = alloc(&heap, &NODE);
    old.set_field(1, Some(young));
    let slot = old.slot(1) as *const AtomicUsize as usize;

    heap.start_major_collection();
    let roots = [AtomicUsize::new(old.address())];
    let mark = ConcurrentMark::start(&heap, &roots, false).unwrap();
    while !mark.is_done() {
        std::thread::yield_now();
    }
    let block = block_of(old);
    let card = &block.mod_union().unwrap()[block.card_of(slot)];
    assert_ne!(card.load(Ordering::Relaxed), 0);
    assert!(!heap.card_table().is_dirty(slot));

    mark.finish(&roots);
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 1);
}

#[test]
fn concurrent_mark_sees_stores_made_while_marking() {
    let heap = eager_heap();
    let a = alloc(&heap, &NODE);
    let c = alloc(&heap, &NODE);
    let garbage = alloc(&heap, &NODE);
    garbage.set_field(1, Some(c));

    heap.start_major_collection();
    let roots = [AtomicUsize::new(a.address())];
    let mut mark = ConcurrentMark::start(&heap, &roots, false).unwrap();
    while !mark.is_done() {
        std::thread::yield_now();
    }
    assert!(is_marked(a));
    assert!(!is_marked(c));

    // the mutator publishes c after a was scanned and drops its own reference
    heap.store_field(a, 2, Some(c));
    garbage.set_field(1, None);
    mark.preclean();
    assert!(is_marked(c));

    mark.finish(&roots);
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 2);
    assert_eq!(a.field(2), Some(c));
}

#[test]
fn concurrent_mark_rescans_at_finish() {
    let heap = eager_heap();
    let a = alloc(&heap, &NODE);
    let c = alloc(&heap, &NODE);

    heap.start_major_collection();
    let roots = [AtomicUsize::new(a.address())];
    let mark = ConcurrentMark::start(&heap, &roots, false).unwrap();
    while !mark.is_done() {
        std::thread::yield_now();
    }
    heap.store_field(a, 1, Some(c));
    mark.finish(&[]);
    assert!(is_marked(c));
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 2);
}

#[test]
fn concurrent_mark_of_a_long_chain() {
    let heap = eager_heap();
    let chain: Vec<ObjRef> = (0..5000).map(|_| alloc(&heap, &NODE)).collect();
    for pair in chain.windows(2) {
        pair[0].set_field(1, Some(pair[1]));
    }
    for _ in 0..1000 {
        alloc(&heap, &NODE);
    }

    heap.start_major_collection();
    let roots = [AtomicUsize::new(chain[0].address())];
    let mark = ConcurrentMark::start(&heap, &roots, false).unwrap();
    let pushed = mark.finish(&roots);
    assert_eq!(pushed, 5000);
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 5000);
}

#[test]
fn objects_allocated_while_marking_survive() {
    let heap = eager_heap();
    heap.start_major_collection();
    let fresh = alloc(&heap, &NODE);
    assert!(is_marked(fresh));
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 1);

    heap.start_major_collection();
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 0);
    assert_eq!(heap.get_num_sections(), 0);
}

/// Fills `blocks` blocks with `vtable` objects and frees all but the first object of
/// each block. Returns the survivors.
fn sparse_blocks(heap: &MajorHeap, vtable: &'static VTable, blocks: usize) -> Vec<ObjRef> {
    let per_block = heap.slots_per_block(vtable.instance_size);
    let objects: Vec<ObjRef> = (0..blocks * per_block).map(|_| alloc(heap, vtable)).collect();
    let mut survivors = vec![];
    for chunk in objects.chunks(per_block) {
        survivors.push(chunk[0]);
        for obj in &chunk[1..] {
            heap.free_non_pinned_object(*obj, vtable.instance_size);
        }
    }
    survivors
}

#[test]
fn sweep_selects_sparse_classes_for_evacuation() {
    let heap = eager_heap();
    let objects = sparse_blocks(&heap, &LEAF, 10);
    let class = heap.size_classes().index_for(256);

    heap.start_major_collection();
    let mut marker = heap.marker(MarkMode::Serial, false);
    for obj in &objects {
        marker.mark(*obj);
    }
    drop(marker);
    heap.finish_major_collection();
    assert!(heap.is_evacuating(class));
    assert!(!heap.is_evacuating(heap.size_classes().index_for(24)));
    let stats = heap.statistics();
    assert_eq!(stats.classes[class].used_slots, 10);
    assert!(stats.to_string().contains("evacuating"));
}

#[test]
fn serial_evacuation_moves_objects_out_of_sparse_blocks() {
    let heap = eager_heap();
    let objects = sparse_blocks(&heap, &LEAF, 10);
    let class = heap.size_classes().index_for(256);
    heap.set_evacuating(class, true);

    heap.start_major_collection();
    let kept = block_of(objects[0]);
    assert!(kept.is_to_space());
    assert!(!block_of(objects[5]).is_to_space());

    let mut marker = heap.marker(MarkMode::Serial, true);
    let roots: Vec<AtomicUsize> = objects.iter().map(|obj| AtomicUsize::new(obj.address())).collect();
    for root in &roots {
        marker.mark_root(root);
    }
    marker.drain();
    drop(marker);

    assert_eq!(roots[0].load(Ordering::Relaxed), objects[0].address());
    for (root, obj) in roots.iter().zip(&objects).skip(1) {
        let moved = ObjRef::load(root).unwrap();
        assert_ne!(moved, *obj);
        assert_eq!(obj.forwarded(), Some(moved));
        assert_eq!(block_of(moved).address(), kept.address());
        assert!(std::ptr::eq(moved.vtable(), &LEAF));
    }

    heap.finish_major_collection();
    assert_eq!(heap.get_num_sections(), 1);
    assert_eq!(count_objects(&heap), 10);
}

#[test]
fn racing_evacuation_forwards_once() {
    let heap = eager_heap();
    let objects = sparse_blocks(&heap, &BIG_NODE, 8);
    let class = heap.size_classes().index_for(256);
    heap.set_evacuating(class, true);
    heap.start_major_collection();
    let kept = block_of(objects[0]);

    let ops = select_ops(MarkMode::Parallel, true);
    for obj in &objects[1..] {
        let slots = [AtomicUsize::new(obj.address()), AtomicUsize::new(obj.address())];
        let barrier = Barrier::new(2);
        let pushes: usize = crossbeam_utils::thread::scope(|scope| {
            let handles: Vec<_> = slots
                .iter()
                .map(|slot| {
                    let barrier = &barrier;
                    let heap = &heap;
                    scope.spawn(move |_| {
                        let mut queue = GrayQueue::new();
                        barrier.wait();
                        ops.copy_or_mark(heap, slot, &mut queue);
                        queue.pushes()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        })
        .unwrap();
        assert_eq!(pushes, 1);
        let moved = obj.forwarded().unwrap();
        assert_eq!(slots[0].load(Ordering::Relaxed), moved.address());
        assert_eq!(slots[1].load(Ordering::Relaxed), moved.address());
        assert!(is_marked(moved));
    }
    // one copy per object, losing copies were handed back
    assert_eq!(kept.count_allocated(), objects.len());
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), objects.len());
}

#[test]
fn freed_from_space_slots_are_not_reused_while_evacuating() {
    let heap = eager_heap();
    let objects = sparse_blocks(&heap, &LEAF, 10);
    heap.set_evacuating(heap.size_classes().index_for(256), true);
    heap.start_major_collection();
    assert!(!block_of(objects[5]).is_to_space());

    heap.free_non_pinned_object(objects[5], 256);
    let fresh = alloc(&heap, &LEAF);
    assert!(block_of(fresh).is_to_space());
    assert_ne!(block_of(fresh).address(), block_of(objects[5]).address());
    heap.finish_major_collection();
}

#[test]
fn concurrent_evacuation_moves_objects_in_the_pause() {
    let heap = eager_heap();
    let objects = sparse_blocks(&heap, &BIG_NODE, 8);
    heap.set_evacuating(heap.size_classes().index_for(256), true);
    let holder = alloc(&heap, &NODE);
    holder.set_field(1, Some(objects[1]));

    heap.start_major_collection();
    let kept = block_of(objects[0]);
    let roots = [
        AtomicUsize::new(holder.address()),
        AtomicUsize::new(objects[2].address()),
    ];
    let mark = ConcurrentMark::start(&heap, &roots, true).unwrap();
    while !mark.is_done() {
        std::thread::yield_now();
    }
    // nothing moves before the pause
    assert!(is_marked(holder));
    assert!(!is_marked(objects[1]) && !is_marked(objects[2]));
    assert_eq!(holder.field(1), Some(objects[1]));
    let slot = holder.slot(1) as *const AtomicUsize as usize;
    let block = block_of(holder);
    assert_ne!(block.mod_union().unwrap()[block.card_of(slot)].load(Ordering::Relaxed), 0);

    mark.finish(&roots);
    let moved = objects[1].forwarded().unwrap();
    assert_eq!(holder.field(1), Some(moved));
    assert_eq!(block_of(moved).address(), kept.address());
    let moved_root = ObjRef::load(&roots[1]).unwrap();
    assert_eq!(objects[2].forwarded(), Some(moved_root));
    assert_eq!(block_of(moved_root).address(), kept.address());
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 3);
}

#[test]
fn dropping_an_unfinished_concurrent_mark_joins_the_worker() {
    let heap = eager_heap();
    let a = alloc(&heap, &NODE);
    let b = alloc(&heap, &NODE);
    a.set_field(1, Some(b));

    heap.start_major_collection();
    let roots = [AtomicUsize::new(a.address())];
    drop(ConcurrentMark::start(&heap, &roots, false).unwrap());
    assert!(is_marked(b));
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 2);
}

#[test]
fn pinned_objects_are_not_evacuated() {
    let heap = eager_heap();
    let objects = sparse_blocks(&heap, &LEAF, 10);
    heap.set_evacuating(heap.size_classes().index_for(256), true);
    heap.start_major_collection();

    let mut marker = heap.marker(MarkMode::Serial, true);
    marker.pin(objects[3]);
    assert!(block_of(objects[3]).has_pinned());
    assert_eq!(marker.mark(objects[3]), objects[3]);
    assert_ne!(marker.mark(objects[4]), objects[4]);
    drop(marker);
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 2);
}

#[test]
fn lazy_sweep_happens_on_allocation() {
    let config = Config {
        lazy_sweep: true,
        concurrent_sweep: false,
        ..Config::default()
    };
    let heap = MajorHeap::new(config).unwrap();
    let objects: Vec<ObjRef> = (0..200).map(|_| alloc(&heap, &LEAF)).collect();

    heap.start_major_collection();
    heap.marker(MarkMode::Serial, false).mark(objects[0]);
    heap.finish_major_collection();

    let block = block_of(objects[0]);
    assert_eq!(block.state(), BlockState::NeedSweeping);
    assert_eq!(heap.get_num_sections(), 1);
    assert_eq!(heap.get_used_size(), 256);

    let fresh = alloc(&heap, &LEAF);
    assert_eq!(block.state(), BlockState::Swept);
    assert_eq!(block_of(fresh).address(), block.address());
    assert_eq!(count_objects(&heap), 2);
}

#[test]
fn concurrent_sweep_finishes_on_demand() {
    let config = Config {
        concurrent_sweep: true,
        ..eager_config()
    };
    let heap = MajorHeap::new(config).unwrap();
    let objects: Vec<ObjRef> = (0..3000).map(|_| alloc(&heap, &NODE)).collect();

    heap.start_major_collection();
    let mut marker = heap.marker(MarkMode::Serial, false);
    for obj in objects.iter().step_by(3) {
        marker.mark(*obj);
    }
    drop(marker);
    heap.finish_major_collection();
    heap.finish_sweeping();
    assert!(heap.have_swept());
    assert_eq!(count_objects(&heap), 1000);

    // the next collection waits for the sweep too
    heap.start_major_collection();
    heap.finish_major_collection();
    heap.finish_sweeping();
    assert_eq!(heap.get_num_sections(), 0);
}

#[test]
fn iteration_without_sweeping_reports_marked_objects() {
    let config = Config {
        lazy_sweep: true,
        concurrent_sweep: false,
        ..Config::default()
    };
    let heap = MajorHeap::new(config).unwrap();
    let objects: Vec<ObjRef> = (0..10).map(|_| alloc(&heap, &NODE)).collect();
    let pinned = heap.allocate_object(&NODE, 24, true).unwrap();

    heap.start_major_collection();
    let mut marker = heap.marker(MarkMode::Serial, false);
    marker.mark(objects[2]);
    marker.mark(pinned);
    drop(marker);
    heap.finish_major_collection();

    let mut seen = vec![];
    heap.iterate_objects(IterateObjects::NON_PINNED, |obj, size| {
        assert_eq!(size, 24);
        seen.push(obj);
    });
    assert_eq!(seen, vec![objects[2]]);
    let mut pinned_seen = vec![];
    heap.iterate_objects(IterateObjects::PINNED, |obj, _| pinned_seen.push(obj));
    assert_eq!(pinned_seen, vec![pinned]);
}

#[test]
fn vectors_are_sized_by_length() {
    static REFS: VTable = VTable::vector("refs[]", crate::VectorElements::Refs, 8);
    let heap = eager_heap();
    let vector = heap.allocate_vector(&REFS, 10, false).unwrap();
    assert_eq!(vector.length(), 10);
    assert_eq!(vector.size(), 96);
    let node = alloc(&heap, &NODE);
    vector.set_field(2 + 9, Some(node));

    heap.start_major_collection();
    let mut marker = heap.marker(MarkMode::Serial, false);
    marker.mark(vector);
    marker.drain();
    assert!(is_marked(node));
    drop(marker);
    heap.finish_major_collection();
    assert_eq!(count_objects(&heap), 2);
}

#[test]
fn oversized_vector_lengths_are_refused() {
    static REFS: VTable = VTable::vector("refs[]", crate::VectorElements::Refs, 8);
    let heap = eager_heap();
    assert_eq!(heap.allocate_vector(&REFS, usize::MAX / 4, false), None);
    assert_eq!(heap.allocate_vector(&REFS, usize::MAX / 8, false), None);
    assert_eq!(heap.get_num_sections(), 0);
}

#[test]
fn degraded_allocations_are_counted() {
    let heap = eager_heap();
    assert!(heap.allocate_degraded(&NODE, 24).is_some());
    heap.start_major_collection();
    heap.finish_major_collection();
    let stats = heap.statistics();
    assert_eq!(stats.degraded_allocations, 1);
    assert_eq!(stats.collections, 1);
    assert!(stats.to_string().contains("Collections: 1"));
}
