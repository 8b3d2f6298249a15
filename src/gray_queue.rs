use crossbeam_deque::{Injector, Stealer, Worker};

use crate::object::{ObjRef, VTable};

/// Object waiting to be scanned together with the layout it was marked with.
#[derive(Clone, Copy, Debug)]
pub struct GrayEntry {
    pub obj: ObjRef,
    pub vtable: &'static VTable,
}

/// Stack of gray objects.
///
/// Backed by a work-stealing deque so that parallel markers can hand work to each
/// other. Every push is counted, which makes "each object is enqueued once"
/// observable.
pub struct GrayQueue {
    worker: Worker<GrayEntry>,
    pushes: usize,
}

impl Default for GrayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GrayQueue {
    pub fn new() -> Self {
        Self {
            worker: Worker::new_lifo(),
            pushes: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, obj: ObjRef, vtable: &'static VTable) {
        self.pushes += 1;
        self.worker.push(GrayEntry { obj, vtable });
    }

    #[inline]
    pub fn pop(&mut self) -> Option<GrayEntry> {
        self.worker.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    pub fn len(&self) -> usize {
        self.worker.len()
    }

    /// Number of objects pushed since the queue was created.
    pub fn pushes(&self) -> usize {
        self.pushes
    }

    pub fn stealer(&self) -> Stealer<GrayEntry> {
        self.worker.stealer()
    }

    pub(crate) fn worker(&self) -> &Worker<GrayEntry> {
        &self.worker
    }

    /// Moves half of the local entries to `injector` so idle workers can pick them up.
    pub(crate) fn share(&mut self, injector: &Injector<GrayEntry>) {
        for _ in 0..self.worker.len() / 2 {
            match self.worker.pop() {
                Some(entry) => injector.push(entry),
                None => break,
            }
        }
    }
}
