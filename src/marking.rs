//! The gray-queue engine: copy-or-mark, scan and drain.
//!
//! One implementation exists per combination of [`MarkMode`] and evacuation. The
//! combinations share the code below and differ only in constants, so every
//! variant is monomorphized into its own straight-line routine and the collector
//! picks one of them through [`select_ops`].

use std::marker::PhantomData;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::block::Block;
use crate::card_table::CARD_DIRTY;
use crate::gray_queue::GrayQueue;
use crate::heap::MajorHeap;
use crate::object::{ObjRef, VTable, FORWARDED_BIT, HEADER_TAG_MASK};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MarkMode {
    /// Single thread, the world is stopped.
    Serial,
    /// Several workers, the world is stopped.
    Parallel,
    /// A background thread marks while the mutator runs. Objects are never moved
    /// and references the marker cannot follow are left to the finishing pause.
    Concurrent,
}

/// Strategy used to trace the major heap.
pub trait MarkOps: Sync {
    fn mode(&self) -> MarkMode;
    fn evacuating(&self) -> bool;
    /// Marks or moves the object `slot` refers to and updates `slot` if it moved.
    /// Returns true if `slot` still refers to a nursery object afterwards.
    fn copy_or_mark(&self, heap: &MajorHeap, slot: &AtomicUsize, queue: &mut GrayQueue) -> bool;
    /// Visits every reference of `obj`.
    fn scan(&self, heap: &MajorHeap, obj: ObjRef, vtable: &'static VTable, queue: &mut GrayQueue);
    /// Scans up to `max` objects from `queue`. Returns true if the queue ran empty.
    fn drain(&self, heap: &MajorHeap, queue: &mut GrayQueue, max: usize) -> bool;
}

pub trait Mode: Sync + 'static {
    const MODE: MarkMode;
}

pub struct Serial;
pub struct Parallel;
pub struct Concurrent;

impl Mode for Serial {
    const MODE: MarkMode = MarkMode::Serial;
}
impl Mode for Parallel {
    const MODE: MarkMode = MarkMode::Parallel;
}
impl Mode for Concurrent {
    const MODE: MarkMode = MarkMode::Concurrent;
}

pub struct Ops<M: Mode, const EVACUATE: bool>(PhantomData<M>);

static SERIAL_MARK: Ops<Serial, false> = Ops(PhantomData);
static SERIAL_EVACUATE: Ops<Serial, true> = Ops(PhantomData);
static PARALLEL_MARK: Ops<Parallel, false> = Ops(PhantomData);
static PARALLEL_EVACUATE: Ops<Parallel, true> = Ops(PhantomData);
static CONCURRENT_MARK: Ops<Concurrent, false> = Ops(PhantomData);
static CONCURRENT_EVACUATE: Ops<Concurrent, true> = Ops(PhantomData);

pub fn select_ops(mode: MarkMode, evacuate: bool) -> &'static dyn MarkOps {
    match (mode, evacuate) {
        (MarkMode::Serial, false) => &SERIAL_MARK,
        (MarkMode::Serial, true) => &SERIAL_EVACUATE,
        (MarkMode::Parallel, false) => &PARALLEL_MARK,
        (MarkMode::Parallel, true) => &PARALLEL_EVACUATE,
        (MarkMode::Concurrent, false) => &CONCURRENT_MARK,
        (MarkMode::Concurrent, true) => &CONCURRENT_EVACUATE,
    }
}

impl<M: Mode, const EVACUATE: bool> Ops<M, EVACUATE> {
    #[inline]
    fn mark(&self, obj: ObjRef, queue: &mut GrayQueue) {
        let block = unsafe { Block::from_object(obj.address()) };
        let index = block.slot_index(obj.address());
        let first = match M::MODE {
            MarkMode::Serial => block.set_mark_serial(index),
            _ => block.set_mark_atomic(index),
        };
        if first {
            let vtable = obj.vtable();
            if vtable.has_references() {
                queue.push(obj, vtable);
            }
        }
    }

    /// Moves `obj` into to-space and returns its new location. Returns `None` if no
    /// to-space slot is available, the object must then be marked in place.
    fn evacuate(&self, heap: &MajorHeap, obj: ObjRef, header: usize, queue: &mut GrayQueue) -> Option<ObjRef> {
        let vtable = unsafe { &*((header & !HEADER_TAG_MASK) as *const VTable) };
        let size = if vtable.is_vector() {
            vtable.object_size(obj.length())
        } else {
            vtable.object_size(0)
        };
        let class = unsafe { Block::from_object(obj.address()) }.size_class();
        let dest = heap.alloc_to_space(class, vtable.has_references())?;
        let word = std::mem::size_of::<usize>();
        unsafe {
            std::ptr::copy_nonoverlapping(obj.as_ptr().add(word), (dest as *mut u8).add(word), size - word);
        }
        let dest = unsafe { ObjRef::initialize_header(dest, header) };

        if M::MODE == MarkMode::Serial {
            obj.forward_unsync(dest);
        } else {
            // the copy must be visible before anyone can follow the forwarding pointer
            fence(Ordering::Release);
            if let Err(actual) = obj.try_forward(header, dest) {
                heap.free_to_space_copy(dest);
                // either another worker won, or the object got pinned meanwhile
                return match ObjRef::decode_forwarding(actual) {
                    Some(winner) => Some(winner),
                    None => {
                        self.mark(obj, queue);
                        Some(obj)
                    }
                };
            }
        }
        tracing::trace!(target: "comet::marksweep", from = obj.address(), to = dest.address(), "evacuated");
        self.mark(dest, queue);
        Some(dest)
    }
}

impl<M: Mode, const EVACUATE: bool> MarkOps for Ops<M, EVACUATE> {
    fn mode(&self) -> MarkMode {
        M::MODE
    }

    fn evacuating(&self) -> bool {
        EVACUATE
    }

    #[inline]
    fn copy_or_mark(&self, heap: &MajorHeap, slot: &AtomicUsize, queue: &mut GrayQueue) -> bool {
        let obj = match ObjRef::load(slot) {
            Some(obj) => obj,
            None => return false,
        };
        let addr = obj.address();
        if heap.nursery().contains(addr) {
            if M::MODE == MarkMode::Concurrent {
                return true;
            }
            let copy = heap.nursery().copy_object(obj, queue);
            if copy != obj {
                slot.store(copy.address(), Ordering::Relaxed);
            }
            return heap.nursery().contains(copy.address());
        }
        if heap.large_objects().contains(addr) {
            return false;
        }

        let header = obj.header_word();
        if header & FORWARDED_BIT != 0 {
            if let Some(dest) = obj.forwarded() {
                slot.store(dest.address(), Ordering::Relaxed);
            }
            return false;
        }
        if EVACUATE && heap.is_evacuation_candidate(obj) {
            if M::MODE == MarkMode::Concurrent {
                // left to the finishing pause, which sees it through the mod-union
                return false;
            }
            if let Some(dest) = self.evacuate(heap, obj, header, queue) {
                slot.store(dest.address(), Ordering::Relaxed);
                return false;
            }
        }
        self.mark(obj, queue);
        false
    }

    #[inline]
    fn scan(&self, heap: &MajorHeap, obj: ObjRef, vtable: &'static VTable, queue: &mut GrayQueue) {
        vtable
            .descriptor
            .for_each_slot(obj, vtable.element_size, |slot| {
                let slot_addr = slot as *const AtomicUsize as usize;
                if M::MODE == MarkMode::Concurrent {
                    if let Some(target) = ObjRef::load(slot) {
                        let young = heap.nursery().contains(target.address());
                        if young || (EVACUATE && heap.is_evacuation_candidate(target)) {
                            heap.mark_card(obj, slot_addr, CARD_DIRTY);
                            return;
                        }
                    }
                    self.copy_or_mark(heap, slot, queue);
                } else if self.copy_or_mark(heap, slot, queue) {
                    heap.card_table().mark_address(slot_addr);
                }
            });
    }

    fn drain(&self, heap: &MajorHeap, queue: &mut GrayQueue, max: usize) -> bool {
        for _ in 0..max {
            match queue.pop() {
                Some(entry) => self.scan(heap, entry.obj, entry.vtable, queue),
                None => return true,
            }
        }
        queue.is_empty()
    }
}
