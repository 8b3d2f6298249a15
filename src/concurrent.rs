//! Marking while the mutator runs.
//!
//! [`ConcurrentMark::start`] marks the roots on the calling thread and hands the gray
//! queue to a background worker. The worker never moves objects: references it
//! cannot follow (nursery objects, evacuation candidates) are recorded in the mod-union
//! of the referring block instead. [`ConcurrentMark::finish`] runs in a pause: it
//! folds the global cards into the mod-unions, re-marks the roots and rescans every
//! dirty mod-union card with the stop-the-world engine, evacuating if requested.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::card_table::CardScanMode;
use crate::gray_queue::GrayQueue;
use crate::heap::MajorHeap;
use crate::marking::{select_ops, MarkMode};

pub struct ConcurrentMark {
    heap: Arc<MajorHeap>,
    evacuate: bool,
    pushed: usize,
    worker: Option<JoinHandle<usize>>,
}

impl ConcurrentMark {
    /// Starts marking from `roots`. [`MajorHeap::start_major_collection`] must have
    /// been called.
    pub fn start(heap: &Arc<MajorHeap>, roots: &[AtomicUsize], evacuate: bool) -> std::io::Result<Self> {
        debug_assert!(heap.is_marking(), "concurrent mark outside of a collection");
        let ops = select_ops(MarkMode::Concurrent, evacuate);
        let mut queue = GrayQueue::new();
        for root in roots {
            ops.copy_or_mark(heap, root, &mut queue);
        }
        let pushed = queue.pushes();

        let worker = {
            let heap = heap.clone();
            thread::Builder::new()
                .name("comet-mark".into())
                .spawn(move || {
                    ops.drain(&heap, &mut queue, usize::MAX);
                    queue.pushes() - pushed
                })?
        };
        tracing::debug!(target: "comet::marksweep", roots = roots.len(), evacuate, "concurrent mark started");
        Ok(Self {
            heap: heap.clone(),
            evacuate,
            pushed,
            worker: Some(worker),
        })
    }

    /// Whether the background worker ran out of gray objects.
    pub fn is_done(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(true, |worker| worker.is_finished())
    }

    /// Scans the cards dirtied so far without stopping the mutator, so that the
    /// finishing pause has less to do. Returns the number of objects rescanned.
    pub fn preclean(&mut self) -> usize {
        let ops = select_ops(MarkMode::Concurrent, self.evacuate);
        let mut queue = GrayQueue::new();
        let scanned = self
            .heap
            .scan_card_table(CardScanMode::ModUnionPreclean, ops, &mut queue);
        ops.drain(&self.heap, &mut queue, usize::MAX);
        self.pushed += queue.pushes();
        tracing::debug!(target: "comet::marksweep", scanned, "precleaned mod-union cards");
        scanned
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(pushed) => self.pushed += pushed,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
    }

    /// Completes marking. The world must be stopped and `roots` must hold every
    /// root again, since roots to evacuation candidates were skipped at the start.
    /// Returns the number of objects pushed on gray queues overall.
    pub fn finish(mut self, roots: &[AtomicUsize]) -> usize {
        self.join();
        let heap = self.heap.clone();
        heap.update_mod_union();

        let mut marker = heap.marker(MarkMode::Serial, self.evacuate);
        for root in roots {
            marker.mark_root(root);
        }
        let rescanned = marker.scan_card_table(CardScanMode::ModUnion);
        marker.drain();
        self.pushed += marker.queue().pushes();
        tracing::debug!(
            target: "comet::marksweep",
            rescanned,
            pushed = self.pushed,
            "concurrent mark finished"
        );
        self.pushed
    }
}

impl Drop for ConcurrentMark {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(target: "comet::marksweep", "concurrent mark thread panicked");
            }
        }
    }
}
