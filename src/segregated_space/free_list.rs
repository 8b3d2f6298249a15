use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Intrusive free list of the slots of one block.
///
/// The first word of a free slot holds the address of the next free slot of the
/// same block, or null. `head` packs the block-relative offset of the first free
/// slot (zero when empty, slots never start at offset zero) with a 32-bit counter
/// in the upper half that is bumped on every update to defeat ABA.
pub struct FreeList {
    head: AtomicU64,
}

#[inline]
fn pack(offset: usize, old: u64) -> u64 {
    ((old >> 32).wrapping_add(1) << 32) | offset as u64
}

#[inline]
unsafe fn link(slot: usize) -> &'static AtomicUsize {
    &*(slot as *const AtomicUsize)
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) as u32 == 0
    }

    /// Takes the first free slot of the block starting at `base`.
    #[inline]
    pub fn take(&self, base: usize) -> Option<usize> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let offset = head as u32 as usize;
            if offset == 0 {
                return None;
            }
            let slot = base + offset;
            // may read a header if the slot was taken meanwhile, the CAS then fails
            let next = unsafe { link(slot).load(Ordering::Relaxed) };
            let next_offset = if next == 0 { 0 } else { next.wrapping_sub(base) };
            match self.head.compare_exchange_weak(
                head,
                pack(next_offset, head),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(slot),
                Err(actual) => head = actual,
            }
        }
    }

    /// Threads `slot` back onto the list.
    #[inline]
    pub fn add(&self, base: usize, slot: usize) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let offset = head as u32 as usize;
            let next = if offset == 0 { 0 } else { base + offset };
            unsafe { link(slot).store(next, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                head,
                pack(slot - base, head),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Replaces the list with `slots`, which are linked in the given order.
    /// The caller must have exclusive access to the block.
    pub fn rebuild(&self, base: usize, slots: impl DoubleEndedIterator<Item = usize>) {
        let mut next = 0;
        for slot in slots.rev() {
            unsafe { link(slot).store(next, Ordering::Relaxed) };
            next = slot;
        }
        let old = self.head.load(Ordering::Relaxed);
        let offset = if next == 0 { 0 } else { next - base };
        self.head.store(pack(offset, old), Ordering::Release);
    }

    /// Walks the list. Only meaningful while nobody else updates it.
    pub fn for_each(&self, base: usize, mut f: impl FnMut(usize)) {
        let offset = self.head.load(Ordering::Acquire) as u32 as usize;
        let mut slot = if offset == 0 { 0 } else { base + offset };
        while slot != 0 {
            f(slot);
            slot = unsafe { link(slot).load(Ordering::Relaxed) };
        }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}
