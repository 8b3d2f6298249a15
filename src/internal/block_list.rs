use crate::block::Block;
use crate::globals::BLOCK_SIZE;
use crossbeam_utils::atomic::AtomicCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Blocks are `BLOCK_SIZE` aligned, the low bits of the head hold an ABA counter.
const TAG_MASK: usize = BLOCK_SIZE - 1;

/// Lock-free block list
///
/// Treiber stack linked through [`Block::next_free`]. Every successful update bumps
/// the tag kept in the low bits of `head`, so a block that is popped and pushed
/// again between a load and a CAS does not go unnoticed.
pub struct AtomicBlockList {
    head: AtomicCell<usize>,
    count: AtomicUsize,
}

impl Default for AtomicBlockList {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn untag(head: usize) -> usize {
    head & !TAG_MASK
}

#[inline]
fn retag(addr: usize, old: usize) -> usize {
    addr | (old.wrapping_add(1) & TAG_MASK)
}

impl AtomicBlockList {
    pub fn new() -> Self {
        Self {
            head: AtomicCell::new(0),
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn peek(&self) -> Option<&'static Block> {
        unsafe { Block::from_address(untag(self.head.load())) }
    }

    pub fn push(&self, block: &'static Block) {
        let mut head = self.head.load();
        loop {
            debug_assert_ne!(untag(head), block.address());
            block.set_next_free(untag(head));
            match self.head.compare_exchange(head, retag(block.address(), head)) {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::AcqRel);
                    return;
                }
                Err(actual) => head = actual,
            }
        }
    }

    pub fn pop(&self) -> Option<&'static Block> {
        let mut head = self.head.load();
        loop {
            let block = unsafe { Block::from_address(untag(head))? };
            match self
                .head
                .compare_exchange(head, retag(block.next_free(), head))
            {
                Ok(_) => {
                    self.count.fetch_sub(1, Ordering::AcqRel);
                    return Some(block);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Unlinks `block` only if it is still the first element.
    pub fn pop_if_head(&self, block: &Block) -> bool {
        let head = self.head.load();
        if untag(head) != block.address() {
            return false;
        }
        if self
            .head
            .compare_exchange(head, retag(block.next_free(), head))
            .is_ok()
        {
            self.count.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Detaches the whole list and calls `f` with each block. Callers must make sure
    /// nobody pushes or pops concurrently while the chain is walked.
    pub fn take_all(&self, mut f: impl FnMut(&'static Block)) {
        let mut head = self.head.load();
        loop {
            match self.head.compare_exchange(head, retag(0, head)) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.count.store(0, Ordering::Release);
        let mut cursor = untag(head);
        while let Some(block) = unsafe { Block::from_address(cursor) } {
            cursor = block.next_free();
            f(block);
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        untag(self.head.load()) == 0
    }
}
