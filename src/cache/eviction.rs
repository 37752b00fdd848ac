//! Eviction and low-memory handling
//!
//! When a charge does not fit the budget, [`Registry::release_space`] frees at least
//! the requested amount (and never less than the registry's minimum free request):
//!
//! 1. Items not accessed within the expire period go first.
//! 2. If that is not enough the cache enters [`CacheMode::LowMemory`] and evicts
//!    unreferenced items by ascending weight (hits per cached value) until enough
//!    is free.
//!
//! In low-memory mode no new items are admitted. A warning with the largest items is
//! logged at most once per warning period; the mode switches back to normal once a
//! full reset period passes without another eviction round.

use super::item::ItemStats;
use super::registry::{CacheMode, Registry};
use crate::metrics;
use crate::types::ItemId;
use tracing::{info, warn};

/// Items listed in the low-memory report
const TOP_ITEMS_REPORTED: usize = 25;

impl Registry {
    /// Remove unreferenced items idle since before `expire_before`
    ///
    /// `source` is never removed. Returns the bytes freed.
    pub(crate) fn release_unused_items(&mut self, source: ItemId, expire_before: i64) -> usize {
        let expired: Vec<ItemId> = self
            .items
            .values()
            .filter(|item| {
                item.refcount == 0 && item.itemid != source && item.last_accessed < expire_before
            })
            .map(|item| item.itemid)
            .collect();

        let mut freed = 0;
        for itemid in expired {
            freed += self.remove_item(itemid);
            metrics::record_eviction("expired");
        }
        freed
    }

    /// Free at least `size` bytes for item `source`
    pub(crate) fn release_space(&mut self, source: ItemId, size: usize) {
        let need = size.max(self.min_free_request);
        let now = self.now();

        let mut freed = self.release_unused_items(source, now - self.config.item_expire_period);
        if freed >= need {
            return;
        }

        if self.mode != CacheMode::LowMemory {
            warn!(
                requested = size,
                free = self.memory.free_bytes(),
                "value cache memory exhausted, switching to low memory mode"
            );
        }
        self.mode = CacheMode::LowMemory;
        self.mode_time = now;
        metrics::update_mode(true);

        self.warn_low_memory();

        let mut candidates: Vec<(f64, ItemId)> = self
            .items
            .values()
            .filter(|item| item.refcount == 0 && item.itemid != source)
            .map(|item| (item.weight(), item.itemid))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        for (_, itemid) in candidates {
            if freed >= need {
                break;
            }
            freed += self.remove_item(itemid);
            metrics::record_eviction("weight");
        }
    }

    /// Report a full cache, or leave low-memory mode after a quiet period
    pub(crate) fn warn_low_memory(&mut self) {
        let now = self.now();

        if now - self.mode_time > self.config.low_memory_reset_period {
            self.mode = CacheMode::Normal;
            self.mode_time = now;
            metrics::update_mode(false);
            info!("value cache has been switched back to normal mode");
            return;
        }

        if now - self.last_warning_time > self.config.low_memory_warning_period {
            self.last_warning_time = now;
            self.dump_items_statistics();
            self.dump_memory_statistics();
            warn!("value cache is fully used: please increase the cache size");
        }
    }

    fn dump_items_statistics(&self) {
        let total: usize = self.items.values().map(|item| item.values_total).sum();
        let mut top: Vec<ItemStats> = self.item_stats();
        top.truncate(TOP_ITEMS_REPORTED);

        warn!(items = self.items.len(), values = total, "value cache item statistics");
        for item in top {
            let share = if total == 0 {
                0.0
            } else {
                item.values as f64 * 100.0 / total as f64
            };
            warn!(
                itemid = item.itemid,
                active_range = item.active_range,
                hits = item.hits,
                values = item.values,
                share = format!("{:.1}%", share),
                "value cache item"
            );
        }
    }

    fn dump_memory_statistics(&self) {
        let stats = self.memory.stats();
        warn!(
            total = stats.total_size,
            used = stats.used_size,
            free = stats.free_size,
            allocations = stats.allocations,
            high_watermark = stats.high_watermark,
            failed = stats.failed_allocations,
            strings = self.strings.len(),
            "value cache memory statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::error::CacheError;
    use crate::types::{HistoryRecord, HistoryValue, Timespec, ValueType};
    use std::sync::Arc;

    const NOW: i64 = 1_000_000;

    fn registry(size: u64) -> (Registry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let reg = Registry::new(&CacheConfig::with_size(size), clock.clone());
        (reg, clock)
    }

    fn fill(reg: &mut Registry, itemid: ItemId, values: i64) {
        reg.create_item(itemid, ValueType::Uint).unwrap();
        reg.with_item(itemid, |reg, item| {
            for sec in 0..values {
                let record = HistoryRecord::new(Timespec::new(sec, 0), HistoryValue::Uint(1));
                item.push_head(reg, &record).unwrap();
            }
        });
    }

    #[test]
    fn test_expired_items_go_first() {
        let (mut reg, _clock) = registry(1 << 20);
        fill(&mut reg, 1, 10);
        fill(&mut reg, 2, 10);
        reg.items.get_mut(&1).unwrap().last_accessed = NOW - 2 * 86_400;
        reg.min_free_request = 0;

        reg.release_space(3, 1);

        assert_eq!(reg.mode, CacheMode::Normal);

        assert!(!reg.items.contains_key(&1));
        assert!(reg.items.contains_key(&2));
    }

    #[test]
    fn test_low_memory_evicts_by_weight() {
        let (mut reg, _clock) = registry(1 << 20);
        fill(&mut reg, 1, 10);
        fill(&mut reg, 2, 10);
        fill(&mut reg, 3, 10);
        reg.items.get_mut(&1).unwrap().hits = 100;
        reg.items.get_mut(&2).unwrap().hits = 1;
        reg.items.get_mut(&3).unwrap().hits = 50;
        reg.min_free_request = 0;

        // asks for more than one item holds, so two items go
        let one_item = reg.memory.used_bytes() / 3;
        reg.release_space(4, one_item + 1);

        assert_eq!(reg.mode, CacheMode::LowMemory);
        assert_eq!(reg.mode_time, NOW);
        assert!(reg.items.contains_key(&1));
        assert!(!reg.items.contains_key(&2));
        assert!(!reg.items.contains_key(&3));
    }

    #[test]
    fn test_referenced_and_source_items_survive() {
        let (mut reg, _clock) = registry(1 << 20);
        fill(&mut reg, 1, 10);
        fill(&mut reg, 2, 10);
        reg.addref(1);

        reg.release_space(2, 1 << 20);

        assert!(reg.items.contains_key(&1));
        assert!(reg.items.contains_key(&2));
    }

    #[test]
    fn test_alloc_fails_after_eviction_round() {
        let (mut reg, _clock) = registry(1 << 17);
        let result = reg.alloc(1, 1 << 18);
        assert_eq!(result, Err(CacheError::OutOfMemory { requested: 1 << 18 }));
        assert_eq!(reg.mode, CacheMode::LowMemory);
    }

    #[test]
    fn test_low_memory_resets_after_quiet_period() {
        let (mut reg, clock) = registry(1 << 20);
        reg.mode = CacheMode::LowMemory;
        reg.mode_time = NOW;

        clock.advance(3600);
        reg.warn_low_memory();
        assert_eq!(reg.mode, CacheMode::LowMemory);
        assert_eq!(reg.last_warning_time, NOW + 3600);

        clock.advance(86_400);
        reg.warn_low_memory();
        assert_eq!(reg.mode, CacheMode::Normal);
    }

    #[test]
    fn test_warning_rate_limited() {
        let (mut reg, clock) = registry(1 << 20);
        reg.mode = CacheMode::LowMemory;
        reg.mode_time = NOW;

        reg.warn_low_memory();
        assert_eq!(reg.last_warning_time, NOW);

        clock.advance(60);
        reg.warn_low_memory();
        assert_eq!(reg.last_warning_time, NOW);

        clock.advance(300);
        reg.warn_low_memory();
        assert_eq!(reg.last_warning_time, NOW + 360);
    }
}
