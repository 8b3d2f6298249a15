//! Stop-the-world marking with several workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer};

use crate::globals::PARALLEL_DRAIN_BATCH;
use crate::gray_queue::{GrayEntry, GrayQueue};
use crate::heap::MajorHeap;
use crate::marking::{select_ops, MarkMode, MarkOps};

/// Termination of parallel draining. A worker whose gray queue is empty and that
/// found nothing to steal goes idle; marking is over once every worker is idle at
/// the same time. An idle worker that sees a peer still busy rejoins and looks for
/// gray objects again.
pub struct Termination {
    workers: usize,
    active: AtomicUsize,
}

impl Termination {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            active: AtomicUsize::new(workers),
        }
    }

    /// Returns true when no gray object is left anywhere.
    pub fn offer(&self) -> bool {
        if self.workers == 1 || self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            return true;
        }
        thread::sleep(Duration::from_micros(1));
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active != 0).then(|| active + 1)
            })
            .is_err()
    }
}

struct MarkWorker<'a> {
    task_id: usize,
    heap: &'a MajorHeap,
    ops: &'static dyn MarkOps,
    queue: GrayQueue,
    injector: &'a Injector<GrayEntry>,
    stealers: &'a [Stealer<GrayEntry>],
    termination: &'a Termination,
}

impl<'a> MarkWorker<'a> {
    fn pop(&mut self) -> Option<GrayEntry> {
        self.queue
            .pop()
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_global(&mut self) -> Option<GrayEntry> {
        loop {
            match self.injector.steal_batch_and_pop(self.queue.worker()) {
                Steal::Empty => return None,
                Steal::Success(entry) => return Some(entry),
                Steal::Retry => continue,
            }
        }
    }

    fn steal(&self) -> Option<GrayEntry> {
        if self.stealers.len() == 1 {
            return None;
        }
        for offset in 1..self.stealers.len() {
            let stealer = &self.stealers[(self.task_id + offset) % self.stealers.len()];
            loop {
                match stealer.steal_batch_and_pop(self.queue.worker()) {
                    Steal::Empty => break,
                    Steal::Success(entry) => return Some(entry),
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    fn run(&mut self) {
        loop {
            let entry = if let Some(entry) = self.pop() {
                entry
            } else if self.termination.offer() {
                break;
            } else {
                continue;
            };

            self.ops
                .scan(self.heap, entry.obj, entry.vtable, &mut self.queue);
            // bounded so that surplus work is published regularly
            self.ops
                .drain(self.heap, &mut self.queue, PARALLEL_DRAIN_BATCH);
            if self.queue.len() > 1 && self.injector.is_empty() {
                self.queue.share(self.injector);
            }
        }
    }
}

/// Marks everything reachable from `roots` with `workers` threads. Roots that are
/// evacuated are updated in place. Returns the number of objects pushed.
pub fn parallel_mark(heap: &MajorHeap, roots: &[AtomicUsize], evacuate: bool, workers: usize) -> usize {
    let ops = select_ops(MarkMode::Parallel, evacuate);
    let injector = Injector::new();
    let mut seed = GrayQueue::new();
    for root in roots {
        ops.copy_or_mark(heap, root, &mut seed);
    }
    let total = AtomicUsize::new(seed.pushes());
    while let Some(entry) = seed.pop() {
        injector.push(entry);
    }

    let nworkers = workers.max(1);
    let queues: Vec<GrayQueue> = (0..nworkers).map(|_| GrayQueue::new()).collect();
    let stealers: Vec<_> = queues.iter().map(GrayQueue::stealer).collect();
    let termination = Termination::new(nworkers);

    let result = crossbeam_utils::thread::scope(|scope| {
        for (task_id, queue) in queues.into_iter().enumerate() {
            let injector = &injector;
            let stealers = &stealers;
            let termination = &termination;
            let total = &total;
            scope.spawn(move |_| {
                let mut worker = MarkWorker {
                    task_id,
                    heap,
                    ops,
                    queue,
                    injector,
                    stealers,
                    termination,
                };
                worker.run();
                total.fetch_add(worker.queue.pushes(), Ordering::Relaxed);
            });
        }
    });
    if let Err(panic) = result {
        std::panic::resume_unwind(panic);
    }
    let pushed = total.load(Ordering::Relaxed);
    tracing::debug!(target: "comet::marksweep", workers = nworkers, pushed, "parallel mark done");
    pushed
}
