use crate::util::formatted_size;

pub struct SizeClassStatistics {
    pub slot_size: usize,
    pub blocks: usize,
    /// Live slots found by the last sweep.
    pub used_slots: usize,
    pub available_slots: usize,
    pub evacuating: bool,
}

pub struct MajorStatistics {
    pub collections: usize,
    pub blocks: usize,
    pub empty_blocks: usize,
    pub used_bytes: usize,
    pub reserved_bytes: usize,
    pub degraded_allocations: usize,
    pub classes: Vec<SizeClassStatistics>,
}

impl std::fmt::Display for MajorStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Major heap statistics:")?;
        writeln!(f, "  Collections: {}", self.collections)?;
        writeln!(
            f,
            "  Blocks in use: {} ({})",
            self.blocks,
            formatted_size(self.blocks * crate::globals::BLOCK_SIZE)
        )?;
        writeln!(f, "  Empty blocks: {}", self.empty_blocks)?;
        writeln!(f, "  Used: {}", formatted_size(self.used_bytes))?;
        writeln!(f, "  Reserved: {}", formatted_size(self.reserved_bytes))?;
        writeln!(f, "  Degraded allocations: {}", self.degraded_allocations)?;
        for class in self.classes.iter().filter(|class| class.blocks != 0) {
            writeln!(
                f,
                "  {:>5}B: {} blocks, {}/{} slots{}",
                class.slot_size,
                class.blocks,
                class.used_slots,
                class.available_slots,
                if class.evacuating { ", evacuating" } else { "" }
            )?;
        }
        Ok(())
    }
}
