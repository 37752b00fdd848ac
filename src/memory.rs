//! Memory budget accounting
//!
//! The cache never asks the system allocator how much it may use. Every chunk,
//! interned string, log payload and item entry is charged against a fixed budget
//! here first; a failed charge is what the cache treats as "out of memory" and what
//! drives eviction.
//!
//! Each allocation is charged [`ALLOC_OVERHEAD`] bytes on top of its payload so
//! that many tiny allocations cost what they would in a real arena.

use serde::Serialize;

/// Bookkeeping bytes charged per allocation
pub const ALLOC_OVERHEAD: usize = 16;

/// Snapshot of the memory budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Total budget in bytes
    pub total_size: usize,
    /// Bytes still available
    pub free_size: usize,
    /// Bytes charged, including per-allocation overhead
    pub used_size: usize,
    /// Live allocations
    pub allocations: usize,
    /// Highest `used_size` observed
    pub high_watermark: usize,
    /// Charges refused because the budget was exhausted
    pub failed_allocations: u64,
}

/// Byte budget tracker
///
/// Not synchronized: it lives inside the cache registry and is only touched with the
/// registry lock held.
#[derive(Debug)]
pub struct MemoryTracker {
    total_bytes: usize,
    used_bytes: usize,
    allocations: usize,
    high_watermark: usize,
    failed_allocations: u64,
}

impl MemoryTracker {
    /// Create a tracker for a budget of `total_bytes`
    pub fn new(total_bytes: usize) -> Self {
        Self {
            total_bytes,
            used_bytes: 0,
            allocations: 0,
            high_watermark: 0,
            failed_allocations: 0,
        }
    }

    /// Charge `size` bytes against the budget
    ///
    /// Returns false, leaving the budget untouched, if the charge does not fit.
    pub fn try_alloc(&mut self, size: usize) -> bool {
        let charged = size + ALLOC_OVERHEAD;
        if self.used_bytes + charged > self.total_bytes {
            self.failed_allocations += 1;
            return false;
        }

        self.used_bytes += charged;
        self.allocations += 1;
        self.high_watermark = self.high_watermark.max(self.used_bytes);
        true
    }

    /// Return an allocation of `size` bytes to the budget
    ///
    /// `size` must be the payload size passed to the matching [`try_alloc`].
    /// Uses saturating arithmetic so a mismatched free can never underflow.
    ///
    /// [`try_alloc`]: MemoryTracker::try_alloc
    pub fn free(&mut self, size: usize) {
        self.used_bytes = self.used_bytes.saturating_sub(size + ALLOC_OVERHEAD);
        self.allocations = self.allocations.saturating_sub(1);
    }

    /// Total budget
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Bytes currently charged
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Bytes still available
    pub fn free_bytes(&self) -> usize {
        self.total_bytes - self.used_bytes
    }

    /// Current usage ratio (0.0 to 1.0)
    pub fn usage_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }

    /// Snapshot of the budget
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_size: self.total_bytes,
            free_size: self.free_bytes(),
            used_size: self.used_bytes,
            allocations: self.allocations,
            high_watermark: self.high_watermark,
            failed_allocations: self.failed_allocations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free() {
        let mut tracker = MemoryTracker::new(1000);
        assert!(tracker.try_alloc(100));
        assert_eq!(tracker.used_bytes(), 100 + ALLOC_OVERHEAD);
        assert_eq!(tracker.stats().allocations, 1);

        tracker.free(100);
        assert_eq!(tracker.used_bytes(), 0);
        assert_eq!(tracker.stats().high_watermark, 100 + ALLOC_OVERHEAD);
    }

    #[test]
    fn test_alloc_refused_when_full() {
        let mut tracker = MemoryTracker::new(100);
        assert!(!tracker.try_alloc(100));
        assert_eq!(tracker.used_bytes(), 0);
        assert_eq!(tracker.stats().failed_allocations, 1);

        assert!(tracker.try_alloc(100 - ALLOC_OVERHEAD));
        assert_eq!(tracker.free_bytes(), 0);
        assert!((tracker.usage_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_free_saturates() {
        let mut tracker = MemoryTracker::new(100);
        tracker.free(50);
        assert_eq!(tracker.used_bytes(), 0);
        assert_eq!(tracker.stats().allocations, 0);
    }
}
