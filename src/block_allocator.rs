use parking_lot::Mutex;

use crate::globals::{BLOCK_ALLOC_NUM, BLOCK_SIZE};
use crate::memgov::MemoryGovernor;
use crate::mmap::OsMemory;

/// Source of empty blocks for the major heap.
///
/// Blocks come from the OS in batches of [`BLOCK_ALLOC_NUM`] and are kept in an
/// empty-block pool once released. Every block handed out is backed by
/// `BLOCK_SIZE` bytes of governor quota.
pub struct BlockAllocator {
    os: Box<dyn OsMemory>,
    governor: Box<dyn MemoryGovernor>,
    /// Zeroed blocks ready for reuse.
    pool: Mutex<Vec<usize>>,
    /// Number of empty blocks kept when returning memory to the OS.
    reserve: usize,
}

impl BlockAllocator {
    pub fn new(os: Box<dyn OsMemory>, governor: Box<dyn MemoryGovernor>, reserve: usize) -> Self {
        Self {
            os,
            governor,
            pool: Mutex::new(Vec::new()),
            reserve,
        }
    }

    pub fn governor(&self) -> &dyn MemoryGovernor {
        &*self.governor
    }

    /// Get a new zeroed block aligned to `BLOCK_SIZE`.
    pub fn get_block(&self) -> Option<*mut u8> {
        if !self.governor.try_reserve(BLOCK_SIZE) {
            tracing::debug!(target: "comet::marksweep", "block quota denied");
            return None;
        }
        let mut pool = self.pool.lock();
        if pool.is_empty() && !self.refill(&mut pool) {
            drop(pool);
            self.governor.release(BLOCK_SIZE);
            return None;
        }
        pool.pop().map(|block| block as *mut u8)
    }

    fn refill(&self, pool: &mut Vec<usize>) -> bool {
        let batch = self
            .os
            .alloc_aligned(BLOCK_SIZE * BLOCK_ALLOC_NUM, BLOCK_SIZE);
        if !batch.is_null() {
            // pushed in reverse so that blocks are handed out in address order
            for i in (0..BLOCK_ALLOC_NUM).rev() {
                pool.push(batch as usize + i * BLOCK_SIZE);
            }
            tracing::trace!(target: "comet::marksweep", "mapped {} blocks at {:p}", BLOCK_ALLOC_NUM, batch);
            return true;
        }
        let single = self.os.alloc_aligned(BLOCK_SIZE, BLOCK_SIZE);
        if single.is_null() {
            tracing::debug!(target: "comet::marksweep", "out of OS memory for blocks");
            return false;
        }
        pool.push(single as usize);
        true
    }

    /// Clears `block` and returns it to the empty-block pool.
    ///
    /// # Safety
    /// `block` must come from [`get_block`](Self::get_block) and must no longer be
    /// reachable from the heap.
    pub unsafe fn release_block(&self, block: *mut u8) {
        std::ptr::write_bytes(block, 0, BLOCK_SIZE);
        self.governor.release(BLOCK_SIZE);
        self.pool.lock().push(block as usize);
    }

    pub fn num_empty_blocks(&self) -> usize {
        self.pool.lock().len()
    }

    /// Returns pooled blocks beyond the reserve to the OS. Contiguous runs are freed
    /// first, halving the run length from `BLOCK_ALLOC_NUM` down to 2, then single
    /// blocks. Blocks the OS refuses to take back stay in the pool.
    /// Returns the number of blocks freed.
    pub fn free_swept_blocks(&self) -> usize {
        let mut pool = self.pool.lock();
        if pool.len() <= self.reserve {
            return 0;
        }
        let mut to_free = pool.len() - self.reserve;
        pool.sort_unstable();
        let mut freed = vec![false; pool.len()];

        let mut run_len = BLOCK_ALLOC_NUM;
        while run_len >= 2 {
            let mut i = 0;
            while i < pool.len() && to_free >= run_len {
                let run = contiguous_run(&pool, &freed, i, run_len);
                if run == run_len && self.os.free(pool[i] as *mut u8, run_len * BLOCK_SIZE) {
                    freed[i..i + run_len].iter_mut().for_each(|f| *f = true);
                    to_free -= run_len;
                    i += run_len;
                } else {
                    i += run.max(1);
                }
            }
            run_len /= 2;
        }
        for i in 0..pool.len() {
            if to_free == 0 {
                break;
            }
            if !freed[i] && self.os.free(pool[i] as *mut u8, BLOCK_SIZE) {
                freed[i] = true;
                to_free -= 1;
            }
        }

        let mut index = 0;
        pool.retain(|_| {
            let keep = !freed[index];
            index += 1;
            keep
        });
        let count = freed.iter().filter(|f| **f).count();
        tracing::debug!(target: "comet::marksweep", "returned {} empty blocks to the OS", count);
        count
    }

    /// Frees `block` directly, bypassing the pool. Used when the heap is torn down.
    pub(crate) unsafe fn unmap_block(&self, block: *mut u8) {
        if !self.os.free(block, BLOCK_SIZE) {
            tracing::warn!(target: "comet::marksweep", "failed to unmap block {:p}", block);
        }
    }
}

/// Length of the run of adjacent, not yet freed blocks starting at `start`, capped at `max`.
fn contiguous_run(pool: &[usize], freed: &[bool], start: usize, max: usize) -> usize {
    if freed[start] {
        return 0;
    }
    let mut len = 1;
    while len < max
        && start + len < pool.len()
        && !freed[start + len]
        && pool[start + len] == pool[start + len - 1] + BLOCK_SIZE
    {
        len += 1;
    }
    len
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        let pool = std::mem::take(&mut *self.pool.lock());
        for block in pool {
            unsafe { self.unmap_block(block as *mut u8) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memgov::{QuotaGovernor, UnboundedGovernor};
    use crate::mmap::SystemMemory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records the sizes of `free` calls and refuses runs longer than `max_run` blocks.
    struct RecordingMemory {
        inner: SystemMemory,
        max_run: usize,
        frees: Arc<parking_lot::Mutex<Vec<usize>>>,
        failures: Arc<AtomicUsize>,
    }

    impl OsMemory for RecordingMemory {
        fn alloc_aligned(&self, size: usize, align: usize) -> *mut u8 {
            self.inner.alloc_aligned(size, align)
        }

        fn free(&self, ptr: *mut u8, size: usize) -> bool {
            if size > self.max_run * BLOCK_SIZE {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            if self.inner.free(ptr, size) {
                self.frees.lock().push(size / BLOCK_SIZE);
                true
            } else {
                false
            }
        }
    }

    fn recording(max_run: usize) -> (RecordingMemory, Arc<parking_lot::Mutex<Vec<usize>>>, Arc<AtomicUsize>) {
        let frees = Arc::new(parking_lot::Mutex::new(vec![]));
        let failures = Arc::new(AtomicUsize::new(0));
        (
            RecordingMemory {
                inner: SystemMemory,
                max_run,
                frees: frees.clone(),
                failures: failures.clone(),
            },
            frees,
            failures,
        )
    }

    #[test]
    fn blocks_come_in_address_order() {
        let allocator = BlockAllocator::new(
            Box::new(SystemMemory),
            Box::new(UnboundedGovernor::default()),
            BLOCK_ALLOC_NUM,
        );
        let a = allocator.get_block().unwrap() as usize;
        let b = allocator.get_block().unwrap() as usize;
        assert_eq!(a % BLOCK_SIZE, 0);
        if cfg!(unix) {
            assert_eq!(b, a + BLOCK_SIZE);
            assert_eq!(allocator.num_empty_blocks(), BLOCK_ALLOC_NUM - 2);
        }
        assert_eq!(allocator.governor().reserved(), 2 * BLOCK_SIZE);
        unsafe {
            allocator.release_block(a as *mut u8);
            allocator.release_block(b as *mut u8);
        }
        assert_eq!(allocator.governor().reserved(), 0);
    }

    #[test]
    fn quota_denial_fails_allocation() {
        let allocator = BlockAllocator::new(
            Box::new(SystemMemory),
            Box::new(QuotaGovernor::new(BLOCK_SIZE)),
            0,
        );
        let block = allocator.get_block();
        assert!(block.is_some());
        assert!(allocator.get_block().is_none());
        unsafe { allocator.release_block(block.unwrap()) };
        assert!(allocator.get_block().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn contiguous_runs_are_freed_first() {
        let (os, frees, _) = recording(BLOCK_ALLOC_NUM);
        let allocator = BlockAllocator::new(Box::new(os), Box::new(UnboundedGovernor::default()), 0);
        let blocks: Vec<_> = (0..BLOCK_ALLOC_NUM)
            .map(|_| allocator.get_block().unwrap())
            .collect();
        for block in blocks {
            unsafe { allocator.release_block(block) };
        }
        assert_eq!(allocator.free_swept_blocks(), BLOCK_ALLOC_NUM);
        assert_eq!(*frees.lock(), vec![BLOCK_ALLOC_NUM]);
        assert_eq!(allocator.num_empty_blocks(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn failed_runs_fall_back_to_smaller_ones() {
        let (os, frees, failures) = recording(4);
        let allocator = BlockAllocator::new(Box::new(os), Box::new(UnboundedGovernor::default()), 3);
        let blocks: Vec<_> = (0..BLOCK_ALLOC_NUM)
            .map(|_| allocator.get_block().unwrap())
            .collect();
        // keep a hole so the pool is not one single run
        for (i, block) in blocks.into_iter().enumerate() {
            if i != 10 {
                unsafe { allocator.release_block(block) };
            }
        }
        let freed = allocator.free_swept_blocks();
        assert_eq!(freed, BLOCK_ALLOC_NUM - 1 - 3);
        assert_eq!(allocator.num_empty_blocks(), 3);
        assert!(failures.load(Ordering::Relaxed) > 0);
        let frees = frees.lock();
        assert!(frees.iter().all(|run| *run <= 4));
        assert_eq!(frees.iter().sum::<usize>(), freed);
        assert_eq!(frees[0], 4);
    }
}
