//! End-of-collection sweeping.
//!
//! Sweeping happens in two steps per block. *Checking* counts the mark bits: a block
//! without survivors goes straight back to the block allocator, any other block
//! becomes `NeedSweeping` and is put on the free lists. *Sweeping* proper, which
//! rebuilds the slot free list, runs right away or lazily when an allocation
//! first touches the block. Checking runs in ascending registry order, either inline
//! or on a background thread; [`Sweeper::finish_sweep_checking`] helps from the other
//! end so that callers waiting for it do not contend with the background job.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use atomic::Atomic;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;

use crate::block::{Block, BlockState};
use crate::heap::MajorHeap;
use crate::util::formatted_size;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SweepPhase {
    /// Every block has been checked and the sweep job has finished.
    Swept,
    /// The sweep job is running or has not been finished yet.
    Sweeping,
}

/// Occupancy of one size class as seen by the last sweep.
#[derive(Default)]
pub struct ClassStats {
    pub blocks: AtomicUsize,
    pub used_slots: AtomicUsize,
    pub available_slots: AtomicUsize,
}

impl ClassStats {
    fn reset(&self) {
        self.blocks.store(0, Ordering::Relaxed);
        self.used_slots.store(0, Ordering::Relaxed);
        self.available_slots.store(0, Ordering::Relaxed);
    }
}

/// Decides whether a size class is sparse enough to be evacuated during the next
/// collection. The threshold itself does not evacuate.
pub fn should_evacuate(
    used_slots: usize,
    available_slots: usize,
    blocks: usize,
    threshold: f64,
    min_blocks: usize,
) -> bool {
    if blocks <= min_blocks || available_slots == 0 {
        return false;
    }
    (used_slots as f64 / available_slots as f64) < threshold
}

pub struct Sweeper {
    phase: Atomic<SweepPhase>,
    job: Mutex<Option<JoinHandle<()>>>,
    stats: Box<[CachePadded<ClassStats>]>,
}

impl Sweeper {
    pub fn new(size_classes: usize) -> Self {
        Self {
            phase: Atomic::new(SweepPhase::Swept),
            job: Mutex::new(None),
            stats: (0..size_classes).map(|_| CachePadded::default()).collect(),
        }
    }

    pub fn phase(&self) -> SweepPhase {
        self.phase.load(Ordering::Acquire)
    }

    pub fn have_swept(&self) -> bool {
        self.phase() == SweepPhase::Swept
    }

    pub fn class_stats(&self, class: usize) -> &ClassStats {
        &self.stats[class]
    }

    /// Starts sweeping after marking has finished.
    pub fn sweep(heap: &Arc<MajorHeap>) {
        let this = heap.sweeper();
        debug_assert!(this.have_swept(), "sweep started twice");
        heap.clear_free_lists();
        this.stats.iter().for_each(|stats| stats.reset());
        this.phase.store(SweepPhase::Sweeping, Ordering::Release);
        tracing::debug!(
            target: "comet::marksweep",
            blocks = heap.registry().len(),
            lazy = heap.config().lazy_sweep,
            concurrent = heap.config().concurrent_sweep,
            "sweep started"
        );

        if heap.config().concurrent_sweep {
            let heap = heap.clone();
            let handle = thread::Builder::new()
                .name("comet-sweep".into())
                .spawn(move || Self::sweep_job(&heap));
            match handle {
                Ok(handle) => {
                    *this.job.lock() = Some(handle);
                    return;
                }
                Err(error) => {
                    tracing::warn!(target: "comet::marksweep", %error, "could not spawn sweep thread, sweeping inline");
                }
            }
        }
        Self::sweep_job(heap);
    }

    fn sweep_job(heap: &MajorHeap) {
        let sweep_now = !heap.config().lazy_sweep;
        for index in 0..heap.registry().len() {
            Self::ensure_block_checked(heap, index, sweep_now);
        }
        Self::sweep_finish(heap);
    }

    /// Checks the block at registry `index` unless somebody already did. Returns the
    /// block if it survived.
    pub fn ensure_block_checked(heap: &MajorHeap, index: usize, sweep_now: bool) -> Option<&'static Block> {
        let block = heap.registry().try_tag(index)?;
        if block.state() == BlockState::Marking {
            block.set_state(BlockState::Checking);
            let live = block.count_marked();
            if live == 0 {
                tracing::trace!(target: "comet::marksweep", block = block.address(), "freeing empty block");
                heap.registry().clear(index);
                unsafe { heap.release_block(block) };
                return None;
            }
            block.set_live_count(live);
            if !block.is_pinned() {
                let stats = &heap.sweeper().stats[block.size_class()];
                stats.blocks.fetch_add(1, Ordering::Relaxed);
                stats.used_slots.fetch_add(live, Ordering::Relaxed);
                stats
                    .available_slots
                    .fetch_add(block.slot_count(), Ordering::Relaxed);
            }
            block.set_state(BlockState::NeedSweeping);
            if sweep_now {
                Self::ensure_block_swept(block);
            }
            if live < block.slot_count() {
                heap.add_free_block(block);
            }
        }
        heap.registry().untag(index);
        Some(block)
    }

    /// Sweeps `block` if it still needs it. Waits when another thread holds it in
    /// `Checking` or `Sweeping`.
    pub fn ensure_block_swept(block: &Block) {
        let backoff = Backoff::new();
        loop {
            match block.state() {
                BlockState::Swept | BlockState::Marking => return,
                BlockState::NeedSweeping => {
                    if block.transition(BlockState::NeedSweeping, BlockState::Sweeping) {
                        block.sweep();
                        block.set_state(BlockState::Swept);
                        return;
                    }
                }
                BlockState::Checking | BlockState::Sweeping => backoff.snooze(),
            }
        }
    }

    /// Computes the evacuation decisions for the next collection and returns surplus
    /// empty blocks to the OS.
    fn sweep_finish(heap: &MajorHeap) {
        let config = heap.config();
        let this = heap.sweeper();
        for (class, stats) in this.stats.iter().enumerate() {
            let used = stats.used_slots.load(Ordering::Relaxed);
            let available = stats.available_slots.load(Ordering::Relaxed);
            let blocks = stats.blocks.load(Ordering::Relaxed);
            let evacuate = should_evacuate(
                used,
                available,
                blocks,
                config.evacuation_threshold,
                config.min_evacuation_blocks,
            );
            if evacuate {
                tracing::debug!(
                    target: "comet::marksweep",
                    class,
                    used,
                    available,
                    blocks,
                    "size class will be evacuated"
                );
            }
            heap.set_evacuating(class, evacuate);
        }
        let freed = heap.block_allocator().free_swept_blocks();
        this.phase.store(SweepPhase::Swept, Ordering::Release);
        logln_if!(
            config.verbose,
            "[GC] sweep done: {} blocks in use, {} empty, {} returned to the OS, {} used",
            heap.get_num_sections(),
            heap.num_empty_blocks(),
            freed,
            formatted_size(heap.get_used_size())
        );
    }

    /// Checks every block that the sweep job has not reached yet, walking the
    /// registry from the end.
    pub fn finish_sweep_checking(heap: &MajorHeap) {
        if heap.sweeper().have_swept() {
            return;
        }
        let sweep_now = !heap.config().lazy_sweep;
        for index in (0..heap.registry().len()).rev() {
            Self::ensure_block_checked(heap, index, sweep_now);
        }
    }

    /// Completes an outstanding sweep. Callable from any thread.
    pub fn finish_sweeping(heap: &MajorHeap) {
        let this = heap.sweeper();
        if !this.have_swept() {
            Self::finish_sweep_checking(heap);
            while !this.have_swept() {
                thread::sleep(Duration::from_micros(100));
            }
        }
        let handle = this.job.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(target: "comet::marksweep", "sweep thread panicked");
            }
        }
    }
}
