use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use atomic::Atomic;
use modular_bitfield::prelude::*;

use crate::globals::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE, CARDS_PER_BLOCK, CARD_BITS, MARK_WORDS,
};
use crate::segregated_space::free_list::FreeList;
use crate::util::align_down;

const BITS_PER_WORD: usize = usize::BITS as usize;

/// Sweep state of a block.
///
/// ```text
/// Swept -> Marking -> Checking -> NeedSweeping -> Sweeping -> Swept
/// ```
/// Mark bits are only meaningful in `Marking` and `Checking` and are all zero
/// once a block is `Swept` again.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockState {
    Swept,
    Marking,
    Checking,
    NeedSweeping,
    Sweeping,
}

#[bitfield(bits = 8)]
#[derive(Clone, Copy, Debug)]
pub struct BlockFlags {
    /// Block belongs to the pinned free lists, its objects never move.
    pub pinned: bool,
    pub has_references: bool,
    /// An object of the block was pinned during the current collection.
    pub has_pinned: bool,
    /// Evacuation target, or a block kept in place while its class evacuates.
    pub is_to_space: bool,
    #[skip]
    __: B4,
}

/// Card shadow of a block, see [`crate::card_table`].
pub type ModUnion = [AtomicU8; CARDS_PER_BLOCK];

// A block is a `BLOCK_SIZE` aligned region. The header sits at the start of the
// block and slots of one size class follow it, starting at BLOCK_HEADER_SIZE.
//
// A slot is allocated iff its first word is neither null nor an address inside
// the block: free slots keep their free list link there.
#[repr(C)]
pub struct Block {
    /// Link used by free block lists.
    next_free: AtomicUsize,
    free_list: FreeList,
    mod_union: AtomicPtr<ModUnion>,
    slot_size: u32,
    slot_count: u32,
    live_count: AtomicU32,
    size_class: u16,
    state: Atomic<BlockState>,
    flags: AtomicU8,
    pub(crate) on_free_list: AtomicBool,
    marks: [AtomicUsize; MARK_WORDS],
}

const _: () = assert!(size_of::<Block>() <= BLOCK_HEADER_SIZE);

impl Block {
    /// Formats the zeroed memory at `at` as a block of `slot_size` slots with every
    /// slot free, threaded in ascending address order.
    ///
    /// # Safety
    /// `at` must be a zero-filled, `BLOCK_SIZE` aligned block owned by the caller.
    pub unsafe fn init(
        at: *mut u8,
        size_class: usize,
        slot_size: usize,
        flags: BlockFlags,
        state: BlockState,
    ) -> &'static Self {
        debug_assert_eq!(at as usize % BLOCK_SIZE, 0);
        debug_assert!(slot_size >= size_of::<usize>() && slot_size % 8 == 0);
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        let ptr = at as *mut Self;
        ptr.write(Self {
            next_free: AtomicUsize::new(0),
            free_list: FreeList::new(),
            mod_union: AtomicPtr::new(null_mut()),
            slot_size: slot_size as u32,
            slot_count: ((BLOCK_SIZE - BLOCK_HEADER_SIZE) / slot_size) as u32,
            live_count: AtomicU32::new(0),
            size_class: size_class as u16,
            state: Atomic::new(state),
            flags: AtomicU8::new(flags.into_bytes()[0]),
            on_free_list: AtomicBool::new(false),
            marks: [ZERO; MARK_WORDS],
        });
        let block = &*ptr;
        let base = block.address();
        block
            .free_list
            .rebuild(base, (0..block.slot_count()).map(|i| block.slot(i)));
        block
    }

    /// # Safety
    /// `addr` must be zero or the address of an initialized block.
    #[inline]
    pub unsafe fn from_address(addr: usize) -> Option<&'static Self> {
        (addr as *const Self).as_ref()
    }

    /// Block containing `addr`.
    ///
    /// # Safety
    /// `addr` must point into a block of the major heap.
    #[inline]
    pub unsafe fn from_object(addr: usize) -> &'static Self {
        &*(align_down(addr, BLOCK_SIZE) as *const Self)
    }

    #[inline]
    pub fn address(&self) -> usize {
        self as *const Self as usize
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.address();
        addr >= start && addr < start + BLOCK_SIZE
    }

    #[inline]
    pub fn next_free(&self) -> usize {
        self.next_free.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_next_free(&self, next: usize) {
        self.next_free.store(next, Ordering::Release);
    }

    #[inline]
    pub fn size_class(&self) -> usize {
        self.size_class as usize
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size as usize
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count as usize
    }

    #[inline]
    pub fn payload_start(&self) -> usize {
        self.address() + BLOCK_HEADER_SIZE
    }

    #[inline]
    pub fn slot(&self, index: usize) -> usize {
        self.payload_start() + index * self.slot_size()
    }

    #[inline]
    pub fn slot_index(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.payload_start());
        (addr - self.payload_start()) / self.slot_size()
    }

    #[inline]
    pub fn state(&self) -> BlockState {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_state(&self, state: BlockState) {
        self.state.store(state, Ordering::Release);
    }

    #[inline]
    pub fn transition(&self, from: BlockState, to: BlockState) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn flags(&self) -> BlockFlags {
        BlockFlags::from_bytes([self.flags.load(Ordering::Acquire)])
    }

    fn update_flags(&self, f: impl Fn(BlockFlags) -> BlockFlags) {
        let _ = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(f(BlockFlags::from_bytes([bits])).into_bytes()[0])
            });
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.flags().pinned()
    }

    #[inline]
    pub fn has_references(&self) -> bool {
        self.flags().has_references()
    }

    #[inline]
    pub fn has_pinned(&self) -> bool {
        self.flags().has_pinned()
    }

    pub fn set_has_pinned(&self, value: bool) {
        self.update_flags(|flags| flags.with_has_pinned(value));
    }

    #[inline]
    pub fn is_to_space(&self) -> bool {
        self.flags().is_to_space()
    }

    pub fn set_to_space(&self, value: bool) {
        self.update_flags(|flags| flags.with_is_to_space(value));
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live_count.load(Ordering::Acquire) as usize
    }

    pub fn set_live_count(&self, count: usize) {
        self.live_count.store(count as u32, Ordering::Release);
    }

    /* Free slots */

    #[inline]
    pub fn take_slot(&self) -> Option<usize> {
        self.free_list.take(self.address())
    }

    #[inline]
    pub fn return_slot(&self, slot: usize) {
        debug_assert!(self.contains(slot));
        self.free_list.add(self.address(), slot);
    }

    #[inline]
    pub fn has_free_slots(&self) -> bool {
        !self.free_list.is_empty()
    }

    pub fn for_each_free_slot(&self, f: impl FnMut(usize)) {
        self.free_list.for_each(self.address(), f);
    }

    #[inline]
    pub fn is_allocated(&self, index: usize) -> bool {
        let word = unsafe { (*(self.slot(index) as *const AtomicUsize)).load(Ordering::Acquire) };
        word != 0 && !self.contains(word)
    }

    pub fn count_allocated(&self) -> usize {
        (0..self.slot_count())
            .filter(|i| self.is_allocated(*i))
            .count()
    }

    /// Calls `f` with the address of every allocated slot.
    pub fn for_each_allocated(&self, mut f: impl FnMut(usize, usize)) {
        for index in 0..self.slot_count() {
            if self.is_allocated(index) {
                f(index, self.slot(index));
            }
        }
    }

    /* Mark bits */

    #[inline]
    fn mark_word(&self, index: usize) -> (&AtomicUsize, usize) {
        (&self.marks[index / BITS_PER_WORD], 1 << (index % BITS_PER_WORD))
    }

    #[inline]
    pub fn is_marked(&self, index: usize) -> bool {
        let (word, bit) = self.mark_word(index);
        word.load(Ordering::Acquire) & bit != 0
    }

    /// Non-atomic read-modify-write, for the serial marker. Returns true if the bit
    /// was clear.
    #[inline]
    pub fn set_mark_serial(&self, index: usize) -> bool {
        let (word, bit) = self.mark_word(index);
        let old = word.load(Ordering::Relaxed);
        if old & bit != 0 {
            return false;
        }
        word.store(old | bit, Ordering::Relaxed);
        true
    }

    /// Atomic set-if-absent. Exactly one of several racing callers gets true.
    #[inline]
    pub fn set_mark_atomic(&self, index: usize) -> bool {
        let (word, bit) = self.mark_word(index);
        if word.load(Ordering::Relaxed) & bit != 0 {
            return false;
        }
        word.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    #[inline]
    pub fn clear_mark(&self, index: usize) {
        let (word, bit) = self.mark_word(index);
        word.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn count_marked(&self) -> usize {
        self.marks
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    pub fn marks_clear(&self) -> bool {
        self.marks
            .iter()
            .all(|word| word.load(Ordering::Relaxed) == 0)
    }

    pub fn clear_marks(&self) {
        for word in self.marks.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Frees every allocated slot without a mark bit, zeroing it, rebuilds the free
    /// list in ascending order and clears the mark bits. Returns the number of live
    /// slots. The caller must own the block in the `Sweeping` state or otherwise
    /// have exclusive access.
    pub fn sweep(&self) -> usize {
        let slot_size = self.slot_size();
        let mut live = 0;
        for index in 0..self.slot_count() {
            if self.is_marked(index) {
                debug_assert!(self.is_allocated(index));
                live += 1;
            } else if self.is_allocated(index) {
                unsafe { std::ptr::write_bytes(self.slot(index) as *mut u8, 0, slot_size) };
            }
        }
        let free = (0..self.slot_count()).filter(|index| !self.is_marked(*index));
        let free: Vec<usize> = free.map(|index| self.slot(index)).collect();
        self.free_list.rebuild(self.address(), free.into_iter());
        self.clear_marks();
        self.set_live_count(live);
        live
    }

    /* Card shadow */

    pub fn mod_union(&self) -> Option<&ModUnion> {
        unsafe { self.mod_union.load(Ordering::Acquire).as_ref() }
    }

    /// Returns the mod-union table, allocating it on first use.
    pub fn mod_union_or_alloc(&self) -> &ModUnion {
        if let Some(table) = self.mod_union() {
            return table;
        }
        const CLEAN: AtomicU8 = AtomicU8::new(0);
        let fresh = Box::into_raw(Box::new([CLEAN; CARDS_PER_BLOCK]));
        match self.mod_union.compare_exchange(
            null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*fresh },
            Err(winner) => unsafe {
                drop(Box::from_raw(fresh));
                &*winner
            },
        }
    }

    /// Card index of `addr` within this block.
    #[inline]
    pub fn card_of(&self, addr: usize) -> usize {
        (addr - self.address()) >> CARD_BITS
    }

    pub(crate) fn free_mod_union(&self) {
        let table = self.mod_union.swap(null_mut(), Ordering::AcqRel);
        if !table.is_null() {
            unsafe { drop(Box::from_raw(table)) };
        }
    }
}
