//! Index-based arena of every block owned by the heap.
//!
//! Entries are block addresses. Bit 0 of an entry is the CHECKING tag: the thread
//! that sets it owns the block until it clears it again, which is how the sweeper
//! and [`finish_sweep_checking`](crate::heap::MajorHeap::finish_sweep_checking)
//! agree on who checks a block. A zero entry is a freed block.
//!
//! Storage is a list of segments doubling in size so that growing never moves
//! existing entries and readers need no lock.

use std::ptr::{null_mut, slice_from_raw_parts_mut};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

use crate::block::Block;

pub const CHECKING_TAG: usize = 1;

const FIRST_SEGMENT_BITS: u32 = 6;
const FIRST_SEGMENT: usize = 1 << FIRST_SEGMENT_BITS;
const SEGMENTS: usize = 26;

pub struct BlockRegistry {
    segments: [AtomicPtr<AtomicUsize>; SEGMENTS],
    len: AtomicUsize,
}

#[inline]
fn locate(index: usize) -> (usize, usize) {
    let pos = index + FIRST_SEGMENT;
    let bit = usize::BITS - 1 - pos.leading_zeros();
    let segment = (bit - FIRST_SEGMENT_BITS) as usize;
    (segment, pos - (1 << bit))
}

#[inline]
fn segment_len(segment: usize) -> usize {
    FIRST_SEGMENT << segment
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockRegistry {
    pub fn new() -> Self {
        const NULL: AtomicPtr<AtomicUsize> = AtomicPtr::new(null_mut());
        Self {
            segments: [NULL; SEGMENTS],
            len: AtomicUsize::new(0),
        }
    }

    /// Number of indices handed out so far. Entries past a concurrent `push` may
    /// still read as zero.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn segment(&self, segment: usize) -> *mut AtomicUsize {
        let current = self.segments[segment].load(Ordering::Acquire);
        if !current.is_null() {
            return current;
        }
        let fresh: Box<[AtomicUsize]> = (0..segment_len(segment))
            .map(|_| AtomicUsize::new(0))
            .collect();
        let fresh = Box::into_raw(fresh) as *mut AtomicUsize;
        match self.segments[segment].compare_exchange(
            null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                unsafe {
                    drop(Box::from_raw(slice_from_raw_parts_mut(
                        fresh,
                        segment_len(segment),
                    )));
                }
                winner
            }
        }
    }

    #[inline]
    fn entry(&self, index: usize) -> Option<&AtomicUsize> {
        let (segment, offset) = locate(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        Some(unsafe { &*base.add(offset) })
    }

    /// Publishes `block` and returns its index.
    pub fn push(&self, block: &'static Block) -> usize {
        let index = self.len.fetch_add(1, Ordering::AcqRel);
        let (segment, offset) = locate(index);
        let base = self.segment(segment);
        unsafe { (*base.add(offset)).store(block.address(), Ordering::Release) };
        index
    }

    /// Block at `index`, ignoring the CHECKING tag.
    pub fn get(&self, index: usize) -> Option<&'static Block> {
        let raw = self.entry(index)?.load(Ordering::Acquire);
        unsafe { Block::from_address(raw & !CHECKING_TAG) }
    }

    /// Sets the CHECKING tag of `index`, waiting for a current holder to release it.
    /// Returns `None` if there is no block at `index`.
    pub fn try_tag(&self, index: usize) -> Option<&'static Block> {
        let entry = self.entry(index)?;
        let backoff = Backoff::new();
        loop {
            let raw = entry.load(Ordering::Acquire);
            if raw == 0 {
                return None;
            }
            if raw & CHECKING_TAG != 0 {
                backoff.snooze();
                continue;
            }
            if entry
                .compare_exchange_weak(raw, raw | CHECKING_TAG, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return unsafe { Block::from_address(raw) };
            }
        }
    }

    pub fn untag(&self, index: usize) {
        if let Some(entry) = self.entry(index) {
            entry.fetch_and(!CHECKING_TAG, Ordering::Release);
        }
    }

    /// Removes the block at `index`. Also drops the CHECKING tag.
    pub fn clear(&self, index: usize) {
        if let Some(entry) = self.entry(index) {
            entry.store(0, Ordering::Release);
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(usize, &'static Block)) {
        for index in 0..self.len() {
            if let Some(block) = self.get(index) {
                f(index, block);
            }
        }
    }

    pub fn count(&self) -> usize {
        let mut count = 0;
        self.for_each(|_, _| count += 1);
        count
    }

    /// Squeezes out freed entries. Must only run with the world stopped and no
    /// sweep in progress.
    pub fn compact(&self) {
        let len = self.len();
        let mut dest = 0;
        for index in 0..len {
            let raw = match self.entry(index) {
                Some(entry) => entry.load(Ordering::Relaxed),
                None => 0,
            };
            debug_assert_eq!(raw & CHECKING_TAG, 0, "compacting a block that is being checked");
            if raw == 0 {
                continue;
            }
            if dest != index {
                if let Some(entry) = self.entry(dest) {
                    entry.store(raw, Ordering::Relaxed);
                }
            }
            dest += 1;
        }
        for index in dest..len {
            self.clear(index);
        }
        self.len.store(dest, Ordering::Release);
    }
}

impl Drop for BlockRegistry {
    fn drop(&mut self) {
        for (segment, ptr) in self.segments.iter().enumerate() {
            let ptr = ptr.load(Ordering::Relaxed);
            if !ptr.is_null() {
                unsafe {
                    drop(Box::from_raw(slice_from_raw_parts_mut(
                        ptr,
                        segment_len(segment),
                    )));
                }
            }
        }
    }
}
