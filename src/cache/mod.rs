//! In-memory history value cache
//!
//! Sits in front of a [`HistoryStore`] and keeps the recent history of the items
//! that are actually requested, so repeated range and last-N queries are answered
//! from memory.
//!
//! # Architecture
//!
//! ```text
//! get_values ──► registry lock ──► item cached? ──yes──► chunks cover request? ──yes──► answer
//!                                      │                        │ no
//!                                      │ no (admit)             ▼
//!                                      └──────────────► unlock, read store, relock,
//!                                                       prepend to chunks, answer
//! add_values ──► store.append ──► registry lock ──► push to head of cached items
//! ```
//!
//! # Key Components
//!
//! - **ValueCache**: per-worker handle; handles created with [`ValueCache::attach`]
//!   share one cache
//! - **Registry**: item map, string pool and memory budget behind a single lock
//! - **Chunks**: per-item list of fixed-capacity record arrays
//! - **Eviction**: expired items first, then low-weight items in low-memory mode
//!
//! # Example
//!
//! ```rust
//! use kuba_valuecache::cache::ValueCache;
//! use kuba_valuecache::config::CacheConfig;
//! use kuba_valuecache::store::MemoryHistoryStore;
//! use kuba_valuecache::types::{HistoryValue, ItemValue, Timespec, ValueType};
//! use std::sync::Arc;
//!
//! # fn main() -> kuba_valuecache::Result<()> {
//! let store = Arc::new(MemoryHistoryStore::new());
//! let cache = ValueCache::new(CacheConfig::with_size(1024 * 1024), store)?;
//! cache.enable();
//!
//! let value = ItemValue::new(42, Timespec::new(100, 0), HistoryValue::Float(1.5));
//! cache.add_values(&[value])?;
//!
//! let values = cache.get_values(42, ValueType::Float, 60, 0, Timespec::new(120, 0))?;
//! assert_eq!(values.len(), 1);
//! # Ok(())
//! # }
//! ```

pub(crate) mod chunk;
mod eviction;
mod ingest;
mod item;
mod query;
mod registry;
/// Reference-counted string pool for cached string payloads
pub mod strpool;

pub use item::{ItemState, ItemStats};
pub use registry::CacheMode;
pub use strpool::{StrHandle, StringPool};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::memory::MemoryStats;
use crate::store::HistoryStore;
use crate::types::{HistoryRecord, ItemId, ItemValue, Timespec, ValueType};
use parking_lot::{Mutex, MutexGuard};
use query::Request;
use registry::Registry;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Cache-wide statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Values served from the cache
    pub hits: u64,
    /// Values read from the history store
    pub misses: u64,
    /// Operating mode
    pub mode: CacheMode,
    /// Memory budget in bytes
    pub total_size: usize,
    /// Unused budget in bytes
    pub free_size: usize,
    /// Charged budget in bytes
    pub used_size: usize,
    /// Cached items
    pub items: usize,
    /// Cached records across all items
    pub values: usize,
    /// Distinct pooled strings
    pub strings: usize,
}

impl CacheStats {
    /// Share of values served from the cache (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

struct Shared {
    /// `None` when the configured size is 0
    registry: Option<Mutex<Registry>>,
    store: Arc<dyn HistoryStore>,
    config: CacheConfig,
}

/// Handle to a shared value cache
///
/// Every handle carries its own enabled flag and starts out disabled. A disabled
/// handle passes reads and writes straight through to the history store.
pub struct ValueCache {
    shared: Arc<Shared>,
    enabled: AtomicBool,
}

impl fmt::Debug for ValueCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCache")
            .field("size", &self.shared.config.size)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl ValueCache {
    /// Create a cache in front of `store`
    ///
    /// A size of 0 creates a cache that stays off: every handle passes straight
    /// through to the store.
    pub fn new(config: CacheConfig, store: Arc<dyn HistoryStore>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a cache reading time from `clock`
    pub fn with_clock(
        config: CacheConfig,
        store: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = if config.size == 0 {
            info!("value cache disabled: size is 0");
            None
        } else {
            info!(size = config.size, "value cache initialized");
            Some(Mutex::new(Registry::new(&config, clock)))
        };

        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                store,
                config,
            }),
            enabled: AtomicBool::new(false),
        })
    }

    /// New handle on the same cache, initially disabled
    pub fn attach(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            enabled: AtomicBool::new(false),
        }
    }

    /// Turn caching on for this handle (no effect on a size 0 cache)
    pub fn enable(&self) {
        self.enabled
            .store(self.shared.registry.is_some(), Ordering::Relaxed);
    }

    /// Turn caching off for this handle
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Whether this handle uses the cache
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// The configuration the cache was created with
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    fn registry(&self) -> Option<&Mutex<Registry>> {
        if !self.is_enabled() {
            return None;
        }
        self.shared.registry.as_ref()
    }

    /// Hold the cache lock across several operations
    ///
    /// While the guard lives, store reads made on cache misses happen with the lock
    /// held, so no other handle observes the cache between the batched operations.
    /// Every operation is available on the guard and runs on the held lock; calling
    /// the handle's own methods from the same thread would wait for the guard.
    pub fn lock(&self) -> CacheGuard<'_> {
        self.guard(true)
    }

    fn guard(&self, batch: bool) -> CacheGuard<'_> {
        CacheGuard {
            store: &*self.shared.store,
            guard: self.registry().map(|registry| registry.lock()),
            batch,
        }
    }

    /// History of an item, newest first
    ///
    /// With `count == 0` returns every record in `(ts.sec - seconds, ts]`. Otherwise
    /// returns up to `count` records at or before `ts`, limited to the same window
    /// unless `seconds` is 0.
    pub fn get_values(
        &self,
        itemid: ItemId,
        value_type: ValueType,
        seconds: i64,
        count: usize,
        ts: Timespec,
    ) -> Result<Vec<HistoryRecord>> {
        self.guard(false)
            .get_values(itemid, value_type, seconds, count, ts)
    }

    /// Most recent record at or before `ts`, looking back at most `ts.sec` seconds
    pub fn get_value(
        &self,
        itemid: ItemId,
        value_type: ValueType,
        ts: Timespec,
    ) -> Result<Option<HistoryRecord>> {
        self.guard(false).get_value(itemid, value_type, ts)
    }

    /// Persist new values and add them to cached items
    ///
    /// The store write happens first; if it fails the cache is left untouched.
    pub fn add_values(&self, values: &[ItemValue]) -> Result<()> {
        self.shared.store.append(values)?;

        if let Some(registry) = self.registry() {
            ingest::add_values(&mut registry.lock(), values);
        }
        Ok(())
    }

    /// Drop items from the cache
    ///
    /// Items in use by a request are dropped once the request completes.
    pub fn remove_items(&self, itemids: &[ItemId]) {
        self.guard(false).remove_items(itemids);
    }

    /// Drop all cached history and zero the statistics
    ///
    /// Works on disabled handles too.
    pub fn reset(&self) {
        if let Some(registry) = &self.shared.registry {
            registry.lock().reset();
            info!("value cache reset");
        }
    }

    /// Cache-wide statistics
    pub fn statistics(&self) -> Result<CacheStats> {
        self.guard(false).statistics()
    }

    /// Memory budget details
    pub fn memory_stats(&self) -> Result<MemoryStats> {
        self.guard(false).memory_stats()
    }

    /// Per-item statistics, largest item first
    pub fn item_stats(&self) -> Vec<ItemStats> {
        self.guard(false).item_stats()
    }

    /// The `n` items holding the most records
    pub fn top_items(&self, n: usize) -> Vec<ItemStats> {
        self.guard(false).top_items(n)
    }

    /// Release all cached history and shut the cache down
    pub fn destroy(self) {
        if let Some(registry) = &self.shared.registry {
            let mut registry = registry.lock();
            let stats = registry.stats();
            registry.reset();
            info!(
                items = stats.items,
                values = stats.values,
                hits = stats.hits,
                misses = stats.misses,
                "value cache destroyed"
            );
        }
    }
}

/// Cache lock held across several requests
///
/// Obtained from [`ValueCache::lock`]; released on drop or [`CacheGuard::unlock`].
/// Holds nothing when the handle is disabled.
pub struct CacheGuard<'a> {
    store: &'a dyn HistoryStore,
    guard: Option<MutexGuard<'a, Registry>>,
    batch: bool,
}

impl CacheGuard<'_> {
    /// Same as [`ValueCache::get_values`]
    pub fn get_values(
        &mut self,
        itemid: ItemId,
        value_type: ValueType,
        seconds: i64,
        count: usize,
        ts: Timespec,
    ) -> Result<Vec<HistoryRecord>> {
        let req = Request {
            itemid,
            value_type,
            seconds,
            count,
            ts,
        };

        let values = match self.guard.as_mut() {
            Some(guard) => {
                query::get_values(&mut Locked::new(guard, self.batch), self.store, &req)?
            }
            None => query::read_direct(self.store, &req)?,
        };
        Ok(values)
    }

    /// Same as [`ValueCache::get_value`]
    pub fn get_value(
        &mut self,
        itemid: ItemId,
        value_type: ValueType,
        ts: Timespec,
    ) -> Result<Option<HistoryRecord>> {
        let values = self.get_values(itemid, value_type, ts.sec, 1, ts)?;
        Ok(values.into_iter().next())
    }

    /// Same as [`ValueCache::add_values`]
    pub fn add_values(&mut self, values: &[ItemValue]) -> Result<()> {
        self.store.append(values)?;

        if let Some(guard) = self.guard.as_mut() {
            ingest::add_values(guard, values);
        }
        Ok(())
    }

    /// Same as [`ValueCache::remove_items`]
    pub fn remove_items(&mut self, itemids: &[ItemId]) {
        if let Some(guard) = self.guard.as_mut() {
            for &itemid in itemids {
                guard.request_removal(itemid);
            }
        }
    }

    /// Same as [`ValueCache::reset`], but a no-op on a disabled handle
    pub fn reset(&mut self) {
        if let Some(guard) = self.guard.as_mut() {
            guard.reset();
            info!("value cache reset");
        }
    }

    /// Same as [`ValueCache::statistics`]
    pub fn statistics(&self) -> Result<CacheStats> {
        let guard = self.guard.as_ref().ok_or(CacheError::Disabled)?;
        Ok(guard.stats())
    }

    /// Same as [`ValueCache::memory_stats`]
    pub fn memory_stats(&self) -> Result<MemoryStats> {
        let guard = self.guard.as_ref().ok_or(CacheError::Disabled)?;
        Ok(guard.memory.stats())
    }

    /// Same as [`ValueCache::item_stats`]
    pub fn item_stats(&self) -> Vec<ItemStats> {
        self.guard
            .as_ref()
            .map(|guard| guard.item_stats())
            .unwrap_or_default()
    }

    /// Same as [`ValueCache::top_items`]
    pub fn top_items(&self, n: usize) -> Vec<ItemStats> {
        let mut stats = self.item_stats();
        stats.truncate(n);
        stats
    }

    /// Release the lock
    pub fn unlock(self) {}
}

/// Registry access for one request
///
/// Store reads go through [`Locked::unlocked`], which drops the lock for the
/// duration of the read unless the caller holds a batch lock.
pub(crate) struct Locked<'g, 'a> {
    guard: &'g mut MutexGuard<'a, Registry>,
    batch: bool,
}

impl<'g, 'a> Locked<'g, 'a> {
    pub(crate) fn new(guard: &'g mut MutexGuard<'a, Registry>, batch: bool) -> Self {
        Self { guard, batch }
    }

    /// Run `f` with the registry lock released
    pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        if self.batch {
            return f();
        }
        MutexGuard::unlocked(&mut *self.guard, f)
    }
}

impl Deref for Locked<'_, '_> {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        &**self.guard
    }
}

impl DerefMut for Locked<'_, '_> {
    fn deref_mut(&mut self) -> &mut Registry {
        &mut **self.guard
    }
}
