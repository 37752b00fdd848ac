//! Item registry
//!
//! All mutable cache state lives in [`Registry`], guarded by the single cache lock:
//! the item map, the string pool, the memory budget, global hit/miss counters and
//! the operating mode.
//!
//! # Item references
//!
//! A request pins an item with [`Registry::addref`] before it may drop the lock to
//! read from the history store, and unpins it with [`Registry::release_item`]
//! afterwards. Eviction never touches a pinned item. Removal of a pinned item is
//! deferred by marking it [`ItemState::RemovePending`]; the last release then
//! performs it.
//!
//! # Checking items out
//!
//! Item mutations can allocate, and allocation can evict other items. To keep both
//! borrows apart, [`Registry::with_item`] takes the item out of the map for the
//! duration of the mutation. An item that is checked out is invisible to eviction.

use super::chunk::{CachedLog, CachedValue, LOG_VALUE_SIZE};
use super::item::{CacheItem, ItemState, ItemStats, ITEM_ENTRY_SIZE};
use super::strpool::{StrHandle, StringPool};
use super::CacheStats;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::memory::MemoryTracker;
use crate::metrics;
use crate::types::{HistoryValue, ItemId, ValueType};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Upper bound of the minimum amount freed per eviction round
pub(crate) const MIN_FREE_REQUEST_CAP: usize = 128 * 1024;

/// Cache operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Items are admitted on first request
    #[default]
    Normal,
    /// The budget ran out; no new items are admitted until the mode resets
    LowMemory,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheMode::Normal => write!(f, "normal"),
            CacheMode::LowMemory => write!(f, "low memory"),
        }
    }
}

/// Shared cache state
pub(crate) struct Registry {
    pub(crate) items: HashMap<ItemId, CacheItem>,
    pub(crate) strings: StringPool,
    pub(crate) memory: MemoryTracker,
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) mode: CacheMode,
    /// When the current mode was entered
    pub(crate) mode_time: i64,
    pub(crate) last_warning_time: i64,
    pub(crate) min_free_request: usize,
    pub(crate) config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl Registry {
    pub(crate) fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let size = config.size as usize;
        let memory = MemoryTracker::new(size);
        metrics::update_memory(size, memory.free_bytes());

        Self {
            items: HashMap::new(),
            strings: StringPool::new(),
            memory,
            hits: 0,
            misses: 0,
            mode: CacheMode::Normal,
            mode_time: 0,
            last_warning_time: 0,
            min_free_request: (size / 100 * 5).min(MIN_FREE_REQUEST_CAP),
            config: config.clone(),
            clock,
        }
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Admit a new, empty item
    pub(crate) fn create_item(
        &mut self,
        itemid: ItemId,
        value_type: ValueType,
    ) -> Result<(), CacheError> {
        self.alloc(itemid, ITEM_ENTRY_SIZE)?;
        let now = self.now();
        self.items
            .insert(itemid, CacheItem::new(itemid, value_type, now));
        metrics::update_items(self.items.len());
        trace!(itemid, %value_type, "item admitted");
        Ok(())
    }

    pub(crate) fn addref(&mut self, itemid: ItemId) {
        if let Some(item) = self.items.get_mut(&itemid) {
            item.refcount += 1;
        }
    }

    /// Drop a reference and run the deferred removal or trim on the last one
    pub(crate) fn release_item(&mut self, itemid: ItemId) {
        let now = self.now();
        let Some(item) = self.items.get_mut(&itemid) else {
            return;
        };

        item.refcount = item.refcount.saturating_sub(1);
        if item.refcount > 0 {
            return;
        }

        match item.state {
            ItemState::Active => {}
            ItemState::RemovePending => {
                self.remove_item(itemid);
            }
            ItemState::CleanPending => {
                self.with_item(itemid, |reg, item| {
                    item.trim_to_active_range(reg, now);
                    item.state = ItemState::Active;
                });
            }
        }
    }

    /// Remove an item and release everything it holds
    ///
    /// Returns the bytes returned to the budget.
    pub(crate) fn remove_item(&mut self, itemid: ItemId) -> usize {
        let Some(mut item) = self.items.remove(&itemid) else {
            return 0;
        };

        let freed = item.free_chunks(self) + ITEM_ENTRY_SIZE;
        self.memory.free(ITEM_ENTRY_SIZE);
        metrics::update_items(self.items.len());
        trace!(itemid, freed, "item removed");
        freed
    }

    /// Remove an item now if unreferenced, otherwise once released
    pub(crate) fn request_removal(&mut self, itemid: ItemId) {
        match self.items.get_mut(&itemid) {
            Some(item) if item.refcount > 0 => item.mark_remove_pending(),
            Some(_) => {
                self.remove_item(itemid);
            }
            None => {}
        }
    }

    /// Run `f` on an item checked out of the map
    ///
    /// Returns `None` if the item is not cached.
    pub(crate) fn with_item<R>(
        &mut self,
        itemid: ItemId,
        f: impl FnOnce(&mut Registry, &mut CacheItem) -> R,
    ) -> Option<R> {
        let mut item = self.items.remove(&itemid)?;
        let result = f(self, &mut item);
        self.items.insert(itemid, item);
        Some(result)
    }

    /// Charge `size` bytes on behalf of item `source`
    ///
    /// On exhaustion other items are evicted and the charge is retried once.
    pub(crate) fn alloc(&mut self, source: ItemId, size: usize) -> Result<(), CacheError> {
        if self.memory.try_alloc(size) {
            return Ok(());
        }

        self.release_space(source, size);

        if self.memory.try_alloc(size) {
            return Ok(());
        }

        Err(CacheError::OutOfMemory { requested: size })
    }

    pub(crate) fn free(&mut self, size: usize) {
        self.memory.free(size);
    }

    /// Take a reference to `s` in the string pool, charging a new entry to `owner`
    pub(crate) fn intern(&mut self, owner: ItemId, s: &str) -> Result<StrHandle, CacheError> {
        if let Some(handle) = self.strings.lookup(s) {
            return Ok(handle);
        }
        self.alloc(owner, StringPool::entry_size(s))?;
        Ok(self.strings.insert(s))
    }

    pub(crate) fn release_str(&mut self, handle: StrHandle) -> usize {
        let freed = self.strings.release(handle);
        if freed > 0 {
            self.memory.free(freed);
        }
        freed
    }

    /// Copy a value into cache-owned storage
    pub(crate) fn copy_value(
        &mut self,
        owner: ItemId,
        value: &HistoryValue,
    ) -> Result<CachedValue, CacheError> {
        match value {
            HistoryValue::Float(v) => Ok(CachedValue::Float(*v)),
            HistoryValue::Uint(v) => Ok(CachedValue::Uint(*v)),
            HistoryValue::Str(s) => Ok(CachedValue::Str(self.intern(owner, s)?)),
            HistoryValue::Text(s) => Ok(CachedValue::Text(self.intern(owner, s)?)),
            HistoryValue::Log(log) => {
                self.alloc(owner, LOG_VALUE_SIZE)?;

                let source = match log.source.as_deref().map(|s| self.intern(owner, s)) {
                    Some(Ok(handle)) => Some(handle),
                    Some(Err(e)) => {
                        self.free(LOG_VALUE_SIZE);
                        return Err(e);
                    }
                    None => None,
                };

                let value = match self.intern(owner, &log.value) {
                    Ok(handle) => handle,
                    Err(e) => {
                        if let Some(handle) = source {
                            self.release_str(handle);
                        }
                        self.free(LOG_VALUE_SIZE);
                        return Err(e);
                    }
                };

                Ok(CachedValue::Log(Box::new(CachedLog {
                    timestamp: log.timestamp,
                    logeventid: log.logeventid,
                    severity: log.severity,
                    source,
                    value,
                })))
            }
        }
    }

    /// Release a cached value; returns the bytes returned to the budget
    pub(crate) fn release_value(&mut self, value: CachedValue) -> usize {
        match value {
            CachedValue::Float(_) | CachedValue::Uint(_) => 0,
            CachedValue::Str(handle) | CachedValue::Text(handle) => self.release_str(handle),
            CachedValue::Log(log) => {
                let CachedLog { source, value, .. } = *log;
                self.free(LOG_VALUE_SIZE);

                let mut freed = LOG_VALUE_SIZE;
                if let Some(handle) = source {
                    freed += self.release_str(handle);
                }
                freed + self.release_str(value)
            }
        }
    }

    /// Account a served request
    ///
    /// Item hits and access time are updated only if the item is still cached.
    pub(crate) fn update_statistics(&mut self, itemid: Option<ItemId>, hits: usize, misses: usize) {
        let now = self.now();
        if let Some(item) = itemid.and_then(|id| self.items.get_mut(&id)) {
            item.hits += hits as u64;
            item.last_accessed = now;
        }

        self.hits += hits as u64;
        self.misses += misses as u64;
        metrics::record_request(hits, misses);
    }

    /// Drop all unreferenced items, mark the rest for removal and zero the counters
    pub(crate) fn reset(&mut self) {
        let itemids: Vec<ItemId> = self.items.keys().copied().collect();
        for itemid in itemids {
            self.request_removal(itemid);
        }

        self.hits = 0;
        self.misses = 0;
        self.mode = CacheMode::Normal;
        self.mode_time = 0;
        self.last_warning_time = 0;
        metrics::update_mode(false);
    }

    pub(crate) fn stats(&self) -> CacheStats {
        let memory = self.memory.stats();
        metrics::update_memory(memory.total_size, memory.free_size);

        CacheStats {
            hits: self.hits,
            misses: self.misses,
            mode: self.mode,
            total_size: memory.total_size,
            free_size: memory.free_size,
            used_size: memory.used_size,
            items: self.items.len(),
            values: self.items.values().map(|item| item.values_total).sum(),
            strings: self.strings.len(),
        }
    }

    /// Per-item snapshots, largest first
    pub(crate) fn item_stats(&self) -> Vec<ItemStats> {
        let mut stats: Vec<ItemStats> = self.items.values().map(CacheItem::stats).collect();
        stats.sort_by(|a, b| b.values.cmp(&a.values).then(a.itemid.cmp(&b.itemid)));
        stats
    }
}
