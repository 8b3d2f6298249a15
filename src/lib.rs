//! # comet-marksweep
//!
//! Block-based major heap for a generational collector. Objects smaller than
//! [`MAX_SMALL_OBJECT_SIZE`](globals::MAX_SMALL_OBJECT_SIZE) live in 16KB blocks
//! segregated by size class. The heap is collected by mark-sweep:
//!
//! - marking goes through a gray queue engine that is shared with minor
//!   collections and comes in serial, parallel and concurrent flavours, each of them
//!   optionally evacuating sparse size classes;
//! - sweeping is driven per block by a small state machine so that it can run lazily
//!   on allocation or on a background thread while the mutator keeps running;
//! - a card table plus per-block mod-union tables let concurrent marking re-scan
//!   only the parts of the heap that were mutated.
//!
//! Roots, thread suspension, the nursery and the large object space are supplied by
//! the embedder through the traits in [`generation`], [`memgov`] and [`mmap`].

use thiserror::Error;

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            tracing::info!(target: "comet::marksweep", $($t)*);
        }
    };
}

pub mod block;
pub mod block_allocator;
pub mod card_table;
pub mod concurrent;
pub mod descriptor;
pub mod generation;
pub mod globals;
pub mod gray_queue;
pub mod heap;
pub mod internal;
pub mod marking;
pub mod memgov;
pub mod mmap;
pub mod object;
pub mod parallel;
pub mod segregated_space;
pub mod statistics;
pub mod sweeper;
pub mod util;

#[cfg(test)]
mod tests;

pub use card_table::CardScanMode;
pub use concurrent::ConcurrentMark;
pub use descriptor::{Descriptor, VectorElements};
pub use gray_queue::GrayQueue;
pub use heap::{Collaborators, IterateObjects, MajorHeap, Marker};
pub use marking::{MarkMode, MarkOps};
pub use object::{ObjRef, VTable};
pub use statistics::MajorStatistics;

/// Error returned when the heap cannot be created.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("failed to map card table: {0}")]
    CardTable(#[from] std::io::Error),
}

/// Error returned when a collector parameter cannot be applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("evacuation-threshold must be an integer percentage between 0 and 100, got `{0}`")]
    InvalidEvacuationThreshold(String),
    #[error("unknown major heap parameter `{0}`")]
    Unknown(String),
}

/// Configuration for heap constructor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size classes whose block occupancy falls below this ratio are evacuated
    /// during the next collection.
    pub evacuation_threshold: f64,
    /// A size class needs more than this many blocks before it is considered for evacuation.
    pub min_evacuation_blocks: usize,
    /// Sweep blocks on first allocation instead of during the sweep pass.
    pub lazy_sweep: bool,
    /// Run the sweep pass on a background thread.
    pub concurrent_sweep: bool,
    /// Number of empty blocks kept around instead of being returned to the OS.
    pub empty_block_reserve: usize,
    /// log2 of the number of bytes in the card table.
    pub card_table_bits: u32,
    /// Worker count used by parallel marking.
    pub parallel_workers: usize,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            evacuation_threshold: 0.666,
            min_evacuation_blocks: 5,
            lazy_sweep: true,
            concurrent_sweep: true,
            empty_block_reserve: globals::BLOCK_ALLOC_NUM,
            card_table_bits: 20,
            parallel_workers: 2,
            verbose: false,
        }
    }
}

impl Config {
    /// Applies a single `name` or `name=value` parameter.
    ///
    /// Returns `Ok(false)` when the parameter does not belong to the major heap so the
    /// caller can hand it to another component.
    pub fn handle_param(&mut self, opt: &str) -> Result<bool, ParamError> {
        let opt = opt.trim();
        if let Some(value) = opt.strip_prefix("evacuation-threshold=") {
            let percent = value
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| ParamError::InvalidEvacuationThreshold(value.to_string()))?;
            self.evacuation_threshold = percent as f64 / 100.0;
            return Ok(true);
        }
        match opt {
            "lazy-sweep" => self.lazy_sweep = true,
            "no-lazy-sweep" => self.lazy_sweep = false,
            "concurrent-sweep" => self.concurrent_sweep = true,
            "no-concurrent-sweep" => self.concurrent_sweep = false,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Builds a configuration from a comma separated parameter list such as
    /// `"evacuation-threshold=50,no-lazy-sweep"`.
    pub fn from_params(params: &str) -> Result<Self, ParamError> {
        let mut config = Self::default();
        for opt in params.split(',').filter(|opt| !opt.trim().is_empty()) {
            if !config.handle_param(opt)? {
                return Err(ParamError::Unknown(opt.trim().to_string()));
            }
        }
        Ok(config)
    }

    pub fn param_usage() -> &'static str {
        concat!(
            "  evacuation-threshold=P (where P is a percentage, an integer in 0-100)\n",
            "  (no-)lazy-sweep\n",
            "  (no-)concurrent-sweep\n"
        )
    }
}
