use crate::globals::{BLOCK_PAYLOAD, MAX_SMALL_OBJECT_SIZE, SLOT_GRANULE};
use crate::util::{align_down, align_up};

/// Sizes below this get one class per granule.
pub const PRECISE_CUTOFF: usize = 64;
pub const SIZE_CLASS_PROGRESSION: f64 = 1.25;

/// Slot sizes of the major heap and the lookup table from object size to class.
pub struct SizeClasses {
    sizes: Vec<usize>,
    lookup: Vec<u8>,
}

/// Largest granule-aligned slot that fits as many slots in a block as `size` does.
/// Growing the slot this way costs nothing and lets larger objects use the class.
pub const fn refine(size: usize) -> usize {
    let slots = BLOCK_PAYLOAD / size;
    align_down(BLOCK_PAYLOAD / slots, SLOT_GRANULE)
}

pub fn size_classes(dump: bool) -> Vec<usize> {
    let mut result: Vec<usize> = Vec::new();
    let mut add = |size: usize| {
        let size = refine(size);
        if result.last() != Some(&size) {
            if dump {
                tracing::debug!(target: "comet::marksweep", "adding size class: {}", size);
            }
            result.push(size);
        }
    };

    let mut size = SLOT_GRANULE;
    while size < PRECISE_CUTOFF {
        add(size);
        size += SLOT_GRANULE;
    }
    let mut approximate = PRECISE_CUTOFF as f64;
    while (approximate as usize) < MAX_SMALL_OBJECT_SIZE {
        add(align_up(approximate as usize, SLOT_GRANULE));
        approximate *= SIZE_CLASS_PROGRESSION;
    }
    // the last class must fit the largest small object
    add(align_up(MAX_SMALL_OBJECT_SIZE, SLOT_GRANULE));
    result.sort_unstable();
    result.dedup();
    result
}

impl SizeClasses {
    pub fn new() -> Self {
        let sizes = size_classes(false);
        debug_assert!(sizes.len() <= u8::MAX as usize);
        let mut lookup = Vec::with_capacity(MAX_SMALL_OBJECT_SIZE / SLOT_GRANULE + 1);
        let mut class = 0;
        for granule in 0..=MAX_SMALL_OBJECT_SIZE / SLOT_GRANULE + 1 {
            let size = granule * SLOT_GRANULE;
            while sizes[class] < size {
                class += 1;
            }
            lookup.push(class as u8);
        }
        Self { sizes, lookup }
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Class serving objects of `size` bytes. `size` must not exceed
    /// [`MAX_SMALL_OBJECT_SIZE`].
    #[inline]
    pub fn index_for(&self, size: usize) -> usize {
        debug_assert!(size <= MAX_SMALL_OBJECT_SIZE);
        self.lookup[(size + SLOT_GRANULE - 1) / SLOT_GRANULE] as usize
    }

    #[inline]
    pub fn slot_size(&self, class: usize) -> usize {
        self.sizes[class]
    }

    #[inline]
    pub fn slots_per_block(&self, class: usize) -> usize {
        BLOCK_PAYLOAD / self.sizes[class]
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.sizes.iter().copied()
    }
}

impl Default for SizeClasses {
    fn default() -> Self {
        Self::new()
    }
}
