//! Memory governor: decides whether the major heap may grow.

use std::sync::atomic::{AtomicUsize, Ordering};

pub trait MemoryGovernor: Send + Sync {
    /// Reserves `bytes` of heap quota. Returns false if the request is denied.
    fn try_reserve(&self, bytes: usize) -> bool;
    /// Returns quota previously obtained with `try_reserve`.
    fn release(&self, bytes: usize);
    /// Currently reserved bytes.
    fn reserved(&self) -> usize;
}

/// Grants every request.
#[derive(Default)]
pub struct UnboundedGovernor {
    reserved: AtomicUsize,
}

impl MemoryGovernor for UnboundedGovernor {
    fn try_reserve(&self, bytes: usize) -> bool {
        self.reserved.fetch_add(bytes, Ordering::Relaxed);
        true
    }

    fn release(&self, bytes: usize) {
        self.reserved.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }
}

/// Grants requests until `limit` bytes are reserved.
pub struct QuotaGovernor {
    limit: usize,
    reserved: AtomicUsize,
}

impl QuotaGovernor {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            reserved: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl MemoryGovernor for QuotaGovernor {
    fn try_reserve(&self, bytes: usize) -> bool {
        let mut old = self.reserved.load(Ordering::Relaxed);
        loop {
            let new = match old.checked_add(bytes) {
                Some(new) if new <= self.limit => new,
                _ => return false,
            };
            match self
                .reserved
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.reserved.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_enforced() {
        let gov = QuotaGovernor::new(100);
        assert!(gov.try_reserve(60));
        assert!(!gov.try_reserve(60));
        gov.release(60);
        assert!(gov.try_reserve(100));
        assert_eq!(gov.reserved(), 100);
    }
}
