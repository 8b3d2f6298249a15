/// Size and alignment of a major heap block.
pub const BLOCK_SIZE: usize = 16 * 1024;
/// Bytes reserved at the start of every block for [`Block`](crate::block::Block).
pub const BLOCK_HEADER_SIZE: usize = 256;
/// Bytes available for slots in a block.
pub const BLOCK_PAYLOAD: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;
/// Number of blocks requested from the OS at once.
pub const BLOCK_ALLOC_NUM: usize = 32;

/// Slot sizes are multiples of this.
pub const SLOT_GRANULE: usize = 16;
pub const MIN_SLOT_SIZE: usize = SLOT_GRANULE;
/// Objects larger than this belong to the large object space.
pub const MAX_SMALL_OBJECT_SIZE: usize = 8000;
/// Upper bound on slots per block, sizes the mark bitmap.
pub const MAX_SLOTS_PER_BLOCK: usize = BLOCK_PAYLOAD / MIN_SLOT_SIZE;
pub const MARK_WORDS: usize = (MAX_SLOTS_PER_BLOCK + usize::BITS as usize - 1) / usize::BITS as usize;

/// Object sizes are rounded up to this.
pub const ALLOCATION_GRANULARITY: usize = core::mem::size_of::<usize>();

pub const CARD_BITS: usize = 9;
pub const CARD_SIZE: usize = 1 << CARD_BITS;
pub const CARDS_PER_BLOCK: usize = BLOCK_SIZE / CARD_SIZE;

/// Number of gray objects a parallel worker scans before it looks at its peers.
pub const PARALLEL_DRAIN_BATCH: usize = 256;
