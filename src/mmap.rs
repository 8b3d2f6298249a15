//! OS memory provider used by the block allocator.

/// Source of block-aligned memory.
///
/// Returned memory must be zero-filled. `free` may be asked to release any
/// block-aligned sub-range of a previous allocation and reports failure instead of
/// panicking, the block allocator then retries with smaller ranges.
pub trait OsMemory: Send + Sync {
    /// Allocates `size` bytes aligned to `align`. Returns null on failure.
    fn alloc_aligned(&self, size: usize, align: usize) -> *mut u8;
    /// Returns `size` bytes starting at `ptr` to the OS.
    fn free(&self, ptr: *mut u8, size: usize) -> bool;
}

#[cfg(unix)]
pub mod _unix {
    use super::OsMemory;
    use std::ptr::null_mut;

    /// `mmap`-backed provider. Alignment is obtained by over-mapping and trimming
    /// the head and tail of the mapping, so any aligned sub-range can later be
    /// unmapped on its own.
    #[derive(Default)]
    pub struct SystemMemory;

    impl SystemMemory {
        unsafe fn map(size: usize) -> *mut u8 {
            let map = libc::mmap(
                core::ptr::null_mut(),
                size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                return null_mut();
            }
            map as *mut u8
        }
    }

    impl OsMemory for SystemMemory {
        fn alloc_aligned(&self, size: usize, align: usize) -> *mut u8 {
            unsafe {
                let Some(total) = size.checked_add(align) else {
                    return null_mut();
                };
                let map = Self::map(total);
                if map.is_null() {
                    return null_mut();
                }
                let start = map as usize;
                let aligned = crate::util::align_up(start, align);
                let head = aligned - start;
                let tail = total - head - size;
                if head != 0 {
                    libc::munmap(map as *mut _, head as _);
                }
                if tail != 0 {
                    libc::munmap((aligned + size) as *mut _, tail as _);
                }
                aligned as *mut u8
            }
        }

        fn free(&self, ptr: *mut u8, size: usize) -> bool {
            unsafe { libc::munmap(ptr as *mut _, size as _) == 0 }
        }
    }
}

#[cfg(not(unix))]
pub mod _portable {
    use super::OsMemory;
    use crate::globals::BLOCK_SIZE;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::ptr::null_mut;

    /// Allocator-backed provider. Every allocation is a single block, so batch
    /// requests are refused and the block allocator falls back to one block at a time.
    #[derive(Default)]
    pub struct SystemMemory;

    impl OsMemory for SystemMemory {
        fn alloc_aligned(&self, size: usize, align: usize) -> *mut u8 {
            if size != BLOCK_SIZE {
                return null_mut();
            }
            match Layout::from_size_align(size, align) {
                Ok(layout) => unsafe { alloc_zeroed(layout) },
                Err(_) => null_mut(),
            }
        }

        fn free(&self, ptr: *mut u8, size: usize) -> bool {
            if size != BLOCK_SIZE {
                return false;
            }
            unsafe { dealloc(ptr, Layout::from_size_align_unchecked(BLOCK_SIZE, BLOCK_SIZE)) };
            true
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(not(unix))]
pub use _portable::*;
