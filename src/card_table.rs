//! Card table and the remembered-set scanner built on top of it.
//!
//! The heap is divided into cards of [`CARD_SIZE`] bytes. The write barrier dirties
//! the card of every updated slot in the global table. Addresses are masked into a
//! table of fixed size, so unrelated cards may share a byte; that only causes
//! extra scanning. A global scan therefore takes the whole table at once into a
//! shadow copy and every block reads its cards from there.
//!
//! Concurrent marking cannot consume the global table since nursery collections
//! need it, so every block also has a private mod-union copy that accumulates the
//! global cards (and the references deferred by the concurrent marker) until the
//! finishing pause scans it.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use memmap2::MmapMut;

use crate::block::{Block, BlockState};
use crate::globals::{BLOCK_SIZE, CARDS_PER_BLOCK, CARD_BITS, CARD_SIZE};
use crate::gray_queue::GrayQueue;
use crate::heap::MajorHeap;
use crate::marking::MarkOps;
use crate::object::{ObjRef, FORWARDED_BIT};

pub const CARD_CLEAN: u8 = 0x0;
pub const CARD_DIRTY: u8 = 0x70;

const CARD_WORDS_PER_BLOCK: usize = CARDS_PER_BLOCK / size_of::<u64>();

/// Snapshot of the cards of one block.
pub type BlockCards = [u8; CARDS_PER_BLOCK];

/// Which cards [`scan_block`] looks at.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CardScanMode {
    /// Scan every allocated object under the global cards taken by
    /// [`CardTable::take_all`].
    Global,
    /// Take and clear the block's mod-union cards, scan marked objects under them.
    ModUnion,
    /// Fold the global cards into the mod-union, then take and clear the mod-union
    /// while the mutator runs, scanning marked objects.
    ModUnionPreclean,
}

pub struct CardTable {
    /// Mmapped pages for the card table
    mem_map: MmapMut,
    mask: usize,
}

impl CardTable {
    /// Maps a table of `1 << bits` cards.
    pub fn new(bits: u32) -> std::io::Result<Self> {
        debug_assert!(1usize << bits >= CARDS_PER_BLOCK);
        let size = 1usize << bits;
        Ok(Self {
            mem_map: MmapMut::map_anon(size)?,
            mask: size - 1,
        })
    }

    pub fn mem_map_size(&self) -> usize {
        self.mem_map.len()
    }

    #[inline]
    pub fn card_index(&self, addr: usize) -> usize {
        (addr >> CARD_BITS) & self.mask
    }

    #[inline]
    fn card(&self, index: usize) -> &AtomicU8 {
        unsafe { &*(self.mem_map.as_ptr().add(index) as *const AtomicU8) }
    }

    /// Cards of a block seen as words, for the fast clean check.
    #[inline]
    fn block_words(&self, block: usize) -> &[AtomicU64; CARD_WORDS_PER_BLOCK] {
        debug_assert_eq!(block % BLOCK_SIZE, 0);
        let start = self.card_index(block);
        // blocks are aligned to CARDS_PER_BLOCK cards and the table is page aligned
        unsafe { &*(self.mem_map.as_ptr().add(start) as *const [AtomicU64; CARD_WORDS_PER_BLOCK]) }
    }

    /// Write barrier slow path: dirties the card of `addr`.
    #[inline]
    pub fn mark_address(&self, addr: usize) {
        self.card(self.card_index(addr))
            .store(CARD_DIRTY, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.card(self.card_index(addr)).load(Ordering::Relaxed) != CARD_CLEAN
    }

    /// Copies the whole table and clears it. Blocks sharing bytes of the table all
    /// see the shared cards in the copy.
    pub fn take_all(&self) -> Vec<u8> {
        let words = unsafe {
            std::slice::from_raw_parts(
                self.mem_map.as_ptr() as *const AtomicU64,
                self.mem_map.len() / size_of::<u64>(),
            )
        };
        let mut shadow = vec![CARD_CLEAN; self.mem_map.len()];
        for (word, out) in words.iter().zip(shadow.chunks_exact_mut(size_of::<u64>())) {
            if word.load(Ordering::Relaxed) != 0 {
                out.copy_from_slice(&word.swap(0, Ordering::AcqRel).to_ne_bytes());
            }
        }
        shadow
    }

    /// Cards of `block` in a copy made by [`take_all`](Self::take_all). Returns false
    /// if they are all clean.
    pub fn shadow_block_cards(&self, shadow: &[u8], block: usize, out: &mut BlockCards) -> bool {
        let start = self.card_index(block);
        out.copy_from_slice(&shadow[start..start + CARDS_PER_BLOCK]);
        out.iter().any(|c| *c != CARD_CLEAN)
    }

    /// Copies the cards of `block` into `out`. Returns false if they are all clean.
    pub fn copy_block_cards(&self, block: usize, out: &mut BlockCards) -> bool {
        let mut any = false;
        for (i, word) in self.block_words(block).iter().enumerate() {
            let bytes = word.load(Ordering::Acquire).to_ne_bytes();
            out[i * 8..i * 8 + 8].copy_from_slice(&bytes);
            any |= bytes.iter().any(|c| *c != CARD_CLEAN);
        }
        any
    }
}

/// ORs `cards` into the mod-union of `block`.
pub fn merge_into_mod_union(block: &Block, cards: &BlockCards) {
    if cards.iter().all(|c| *c == CARD_CLEAN) {
        return;
    }
    let table = block.mod_union_or_alloc();
    for (card, value) in table.iter().zip(cards.iter()) {
        if *value != CARD_CLEAN {
            card.store(*value, Ordering::Relaxed);
        }
    }
}

fn take_mod_union(block: &Block, out: &mut BlockCards) -> bool {
    let table = match block.mod_union() {
        Some(table) => table,
        None => return false,
    };
    let mut any = false;
    for (card, out) in table.iter().zip(out.iter_mut()) {
        *out = card.swap(CARD_CLEAN, Ordering::AcqRel);
        any |= *out != CARD_CLEAN;
    }
    any
}

/// Rescans the objects of `block` that overlap a dirty card. `global` is the table
/// copy taken for a [`CardScanMode::Global`] scan and is ignored by the other modes.
/// Returns the number of objects scanned.
pub fn scan_block(
    heap: &MajorHeap,
    block: &'static Block,
    mode: CardScanMode,
    global: &[u8],
    ops: &dyn MarkOps,
    queue: &mut GrayQueue,
) -> usize {
    let mut cards: BlockCards = [CARD_CLEAN; CARDS_PER_BLOCK];
    let dirty = match mode {
        CardScanMode::Global => heap
            .card_table()
            .shadow_block_cards(global, block.address(), &mut cards),
        CardScanMode::ModUnion => take_mod_union(block, &mut cards),
        CardScanMode::ModUnionPreclean => {
            let mut live: BlockCards = [CARD_CLEAN; CARDS_PER_BLOCK];
            if heap.card_table().copy_block_cards(block.address(), &mut live) {
                merge_into_mod_union(block, &live);
            }
            take_mod_union(block, &mut cards)
        }
    };
    if !dirty {
        return 0;
    }

    let only_marked = match mode {
        CardScanMode::Global => {
            // dead objects of a block awaiting sweep must not be scanned
            heap.ensure_block_swept(block);
            false
        }
        _ => true,
    };
    debug_assert!(!only_marked || block.state() == BlockState::Marking);

    let slot_size = block.slot_size();
    let payload = block.payload_start();
    let payload_end = block.slot(block.slot_count());
    let mut front = payload;
    let mut scanned = 0;
    for (card, value) in cards.iter().enumerate() {
        if *value == CARD_CLEAN {
            continue;
        }
        let card_start = block.address() + card * CARD_SIZE;
        let card_end = (card_start + CARD_SIZE).min(payload_end);
        if card_end <= payload {
            continue;
        }
        let first = payload + (card_start.max(payload) - payload) / slot_size * slot_size;
        let mut addr = first.max(front);
        while addr < card_end {
            let index = block.slot_index(addr);
            if block.is_allocated(index) && (!only_marked || block.is_marked(index)) {
                let obj = unsafe { ObjRef::from_address(addr) };
                if let Some(obj) = obj {
                    let header = obj.header_word();
                    if header & FORWARDED_BIT == 0 {
                        ops.scan(heap, obj, obj.vtable(), queue);
                        scanned += 1;
                    }
                }
            }
            addr += slot_size;
        }
        front = addr;
    }
    tracing::trace!(
        target: "comet::marksweep",
        block = block.address(),
        ?mode,
        scanned,
        "scanned dirty cards"
    );
    scanned
}
