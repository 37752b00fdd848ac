//! Per-item cache state

use super::chunk::ChunkStore;
use crate::types::{ItemId, ValueType};
use serde::Serialize;
use std::mem;

/// Shortest range an item is ever asked to keep, in seconds
pub(crate) const MIN_RANGE: i64 = 60;

/// Hours after which the active range is re-synced to the daily range
pub(crate) const RANGE_SYNC_PERIOD: i64 = 24;

/// Bytes charged for an item entry
pub(crate) const ITEM_ENTRY_SIZE: usize = mem::size_of::<CacheItem>();

/// Lifecycle state of a cached item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Normal operation
    #[default]
    Active,
    /// Trim the history to the active range once the item is released
    CleanPending,
    /// Drop the item once the last reference is released
    RemovePending,
}

/// One item's cached history and bookkeeping
pub(crate) struct CacheItem {
    pub(crate) itemid: ItemId,
    pub(crate) value_type: ValueType,
    pub(crate) state: ItemState,
    /// Every record of the item in the store is cached
    pub(crate) cached_all: bool,
    pub(crate) values_total: usize,
    pub(crate) hits: u64,
    pub(crate) last_accessed: i64,
    /// Readers currently working on the item
    pub(crate) refcount: u32,
    /// Seconds of history worth keeping
    pub(crate) active_range: i64,
    /// Largest range requested since the last sync
    pub(crate) daily_range: i64,
    pub(crate) range_sync_hour: i64,
    /// All store records from this second on are cached
    pub(crate) db_cached_from: Option<i64>,
    /// Writes that landed below the cached tail and were not cached
    pub(crate) tail_writes: u64,
    pub(crate) chunks: ChunkStore,
}

impl CacheItem {
    pub(crate) fn new(itemid: ItemId, value_type: ValueType, now: i64) -> Self {
        Self {
            itemid,
            value_type,
            state: ItemState::Active,
            cached_all: false,
            values_total: 0,
            hits: 0,
            last_accessed: now,
            refcount: 0,
            active_range: 0,
            daily_range: 0,
            range_sync_hour: 0,
            db_cached_from: None,
            tail_writes: 0,
            chunks: ChunkStore::default(),
        }
    }

    /// Record that a request needed `range` seconds of history
    ///
    /// The daily range tracks the largest request. Once a day (or as soon as the
    /// daily range outgrows it) it becomes the active range, which drives trimming,
    /// and tracking restarts from the current request.
    pub(crate) fn update_range(&mut self, range: i64, now: i64) {
        let range = range.max(MIN_RANGE);

        if self.daily_range < range {
            self.daily_range = range;
        }

        let hour = (now / 3600) & 0xff;
        let mut diff = hour - self.range_sync_hour;
        if diff < 0 {
            diff += 0xff;
        }

        if self.active_range < self.daily_range || diff > RANGE_SYNC_PERIOD {
            self.active_range = self.daily_range;
            self.daily_range = range;
            self.range_sync_hour = hour;
        }
    }

    pub(crate) fn mark_clean_pending(&mut self) {
        if self.state == ItemState::Active {
            self.state = ItemState::CleanPending;
        }
    }

    pub(crate) fn mark_remove_pending(&mut self) {
        self.state = ItemState::RemovePending;
    }

    /// Eviction weight: hits per cached value, lower goes first
    pub(crate) fn weight(&self) -> f64 {
        if self.values_total == 0 {
            return 0.0;
        }
        self.hits as f64 / self.values_total as f64
    }

    pub(crate) fn stats(&self) -> ItemStats {
        ItemStats {
            itemid: self.itemid,
            value_type: self.value_type,
            state: self.state,
            values: self.values_total,
            chunks: self.chunks.len(),
            hits: self.hits,
            refcount: self.refcount,
            active_range: self.active_range,
            daily_range: self.daily_range,
            db_cached_from: self.db_cached_from,
            cached_all: self.cached_all,
            last_accessed: self.last_accessed,
        }
    }
}

/// Snapshot of one cached item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemStats {
    /// Item
    pub itemid: ItemId,
    /// Value type the history is cached as
    pub value_type: ValueType,
    /// Lifecycle state
    pub state: ItemState,
    /// Cached records
    pub values: usize,
    /// Chunks holding the records
    pub chunks: usize,
    /// Values served from the cache
    pub hits: u64,
    /// Readers holding the item
    pub refcount: u32,
    /// Seconds of history kept on trimming
    pub active_range: i64,
    /// Largest range requested since the last sync
    pub daily_range: i64,
    /// Second from which all store records are cached
    pub db_cached_from: Option<i64>,
    /// Whether the entire store history is cached
    pub cached_all: bool,
    /// Last request time (unix seconds)
    pub last_accessed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3600;

    #[test]
    fn test_update_range_first_request_syncs() {
        let mut item = CacheItem::new(1, ValueType::Float, 0);
        item.update_range(300, 100 * HOUR);

        assert_eq!(item.active_range, 300);
        assert_eq!(item.daily_range, 300);
        assert_eq!(item.range_sync_hour, 100);
    }

    #[test]
    fn test_update_range_minimum() {
        let mut item = CacheItem::new(1, ValueType::Float, 0);
        item.update_range(5, 10 * HOUR);
        assert_eq!(item.active_range, MIN_RANGE);
    }

    #[test]
    fn test_update_range_daily_sync() {
        let mut item = CacheItem::new(1, ValueType::Float, 0);
        item.update_range(300, 100 * HOUR);

        // smaller request in the same hour changes nothing
        item.update_range(100, 100 * HOUR);
        assert_eq!(item.active_range, 300);
        assert_eq!(item.daily_range, 300);

        // a day later the active range follows the daily maximum and
        // tracking restarts from the current request
        item.update_range(100, 125 * HOUR);
        assert_eq!(item.active_range, 300);
        assert_eq!(item.daily_range, 100);
        assert_eq!(item.range_sync_hour, 125);

        item.update_range(60, 125 * HOUR);
        assert_eq!(item.active_range, 300);
        assert_eq!(item.daily_range, 100);
    }

    #[test]
    fn test_update_range_grows_immediately() {
        let mut item = CacheItem::new(1, ValueType::Float, 0);
        item.update_range(300, 100 * HOUR);
        item.update_range(900, 100 * HOUR);

        assert_eq!(item.active_range, 900);
        assert_eq!(item.daily_range, 900);
    }

    #[test]
    fn test_update_range_hour_wraps() {
        let mut item = CacheItem::new(1, ValueType::Float, 0);
        item.update_range(300, 250 * HOUR);
        assert_eq!(item.range_sync_hour, 250);

        // hour 256 wraps to 0: diff is 0 - 250 + 255 = 5
        item.update_range(100, 256 * HOUR);
        assert_eq!(item.range_sync_hour, 250);
        assert_eq!(item.active_range, 300);
    }

    #[test]
    fn test_state_transitions() {
        let mut item = CacheItem::new(1, ValueType::Uint, 0);
        item.mark_clean_pending();
        assert_eq!(item.state, ItemState::CleanPending);

        item.mark_remove_pending();
        item.mark_clean_pending();
        assert_eq!(item.state, ItemState::RemovePending);
    }

    #[test]
    fn test_weight() {
        let mut item = CacheItem::new(1, ValueType::Uint, 0);
        assert_eq!(item.weight(), 0.0);

        item.values_total = 4;
        item.hits = 2;
        assert!((item.weight() - 0.5).abs() < f64::EPSILON);
    }
}
