//! Boundaries to the other generations of the collector.
//!
//! The major heap only knows about the nursery and the large object space through
//! these traits. Both default to empty implementations so the heap can be used on
//! its own.

use crate::gray_queue::GrayQueue;
use crate::object::ObjRef;

/// Young generation as seen by the major heap.
pub trait Nursery: Send + Sync {
    fn contains(&self, addr: usize) -> bool;
    /// Copies (or promotes) `obj` and returns its new location. The copy is pushed
    /// onto `queue` when it needs scanning.
    fn copy_object(&self, obj: ObjRef, queue: &mut GrayQueue) -> ObjRef;
}

/// Large object space as seen by the major heap.
pub trait LargeObjects: Send + Sync {
    fn contains(&self, addr: usize) -> bool;
    /// Records that `slot` of the large object `obj` needs rescanning.
    fn mark_mod_union_card(&self, obj: ObjRef, slot: usize);
}

pub struct NoNursery;

impl Nursery for NoNursery {
    fn contains(&self, _addr: usize) -> bool {
        false
    }

    fn copy_object(&self, obj: ObjRef, _queue: &mut GrayQueue) -> ObjRef {
        obj
    }
}

pub struct NoLargeObjects;

impl LargeObjects for NoLargeObjects {
    fn contains(&self, _addr: usize) -> bool {
        false
    }

    fn mark_mod_union_card(&self, _obj: ObjRef, _slot: usize) {}
}
