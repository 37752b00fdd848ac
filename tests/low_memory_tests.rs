//! Memory pressure: eviction order, low-memory mode and recovery
//!
//! Runs the cache with the smallest allowed budget so a few items of a thousand
//! values each exhaust it.
//!
//! Run with: cargo test --test low_memory_tests

use kuba_valuecache::clock::ManualClock;
use kuba_valuecache::config::MIN_CACHE_SIZE;
use kuba_valuecache::{
    CacheConfig, CacheMode, HistoryRecord, HistoryValue, ItemId, MemoryHistoryStore, Timespec,
    ValueCache, ValueType,
};
use std::sync::Arc;

const HOUR: i64 = 3600;
const START: i64 = 1_000_000;

struct Fixture {
    cache: ValueCache,
    store: Arc<MemoryHistoryStore>,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(MemoryHistoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let cache = ValueCache::with_clock(
            CacheConfig::with_size(MIN_CACHE_SIZE),
            store.clone(),
            clock.clone(),
        )
        .unwrap();
        cache.enable();
        Self {
            cache,
            store,
            clock,
        }
    }

    /// Give an item `values` records, one per second ending at second 10_000
    fn history(&self, itemid: ItemId, values: i64) {
        self.store.insert(
            itemid,
            (0..values)
                .map(|i| {
                    HistoryRecord::new(Timespec::new(10_000 - i, 0), HistoryValue::Uint(i as u64))
                })
                .collect(),
        );
    }

    /// Request the item's whole history
    fn read_all(&self, itemid: ItemId, values: i64) -> usize {
        self.cache
            .get_values(itemid, ValueType::Uint, values, 0, Timespec::new(10_000, 0))
            .unwrap()
            .len()
    }

    fn cached(&self, itemid: ItemId) -> bool {
        self.cache.item_stats().iter().any(|s| s.itemid == itemid)
    }

    fn mode(&self) -> CacheMode {
        self.cache.statistics().unwrap().mode
    }
}

/// An item idle for 25 hours goes before a recently used one with a worse hit ratio
#[test]
fn test_expired_item_evicted_before_low_weight_item() {
    let fx = Fixture::new();
    fx.history(1, 1000);
    fx.history(2, 1000);
    fx.history(3, 1200);

    // item 1: used twice, good hit ratio, then left idle
    assert_eq!(fx.read_all(1, 1000), 1000);
    assert_eq!(fx.read_all(1, 1000), 1000);

    // item 2: used once an hour before the pressure, no hits
    fx.clock.advance(24 * HOUR);
    assert_eq!(fx.read_all(2, 1000), 1000);
    assert!(fx.cached(1) && fx.cached(2));

    // item 3 does not fit next to both
    fx.clock.advance(HOUR);
    assert_eq!(fx.read_all(3, 1200), 1200);

    assert!(!fx.cached(1));
    assert!(fx.cached(2));
    assert!(fx.cached(3));
    assert_eq!(fx.mode(), CacheMode::Normal);
}

/// Exhausting the budget switches to low-memory mode, which stops admitting items
/// until a quiet day has passed
#[test]
fn test_low_memory_mode_and_recovery() {
    let fx = Fixture::new();
    for itemid in 1..=4 {
        fx.history(itemid, 1400);
    }

    for itemid in 1..=3 {
        assert_eq!(fx.read_all(itemid, 1400), 1400);
        fx.clock.advance(60);
    }
    assert_eq!(fx.mode(), CacheMode::LowMemory);
    let items = fx.cache.statistics().unwrap().items;
    assert!(items < 3);

    // still answered, but not admitted
    assert_eq!(fx.read_all(4, 1400), 1400);
    assert!(!fx.cached(4));
    assert_eq!(fx.cache.statistics().unwrap().items, items);

    // a day without another eviction round brings normal mode back
    fx.clock.advance(24 * HOUR + 1);
    assert_eq!(fx.read_all(3, 1400), 1400);
    assert_eq!(fx.mode(), CacheMode::Normal);
}

/// Memory is fully returned once every item is gone
#[test]
fn test_budget_returned_after_reset() {
    let fx = Fixture::new();
    for itemid in 1..=3 {
        fx.history(itemid, 1400);
        fx.read_all(itemid, 1400);
    }
    assert!(fx.cache.memory_stats().unwrap().used_size > 0);

    fx.cache.reset();
    let memory = fx.cache.memory_stats().unwrap();
    assert_eq!(memory.used_size, 0);
    assert_eq!(memory.free_size, MIN_CACHE_SIZE as usize);
    assert_eq!(fx.mode(), CacheMode::Normal);
}
