//! Read path
//!
//! A request is answered from an item's cached history whenever possible. Missing
//! history older than the cached tail is read from the store with the cache lock
//! released, prepended to the chunk list and then served from the cache. Requests
//! the cache cannot take (item not admitted, type mismatch, allocation failure) are
//! answered from the store directly.
//!
//! The store resolves time only to the second. Count-based reads therefore ask for
//! one record more than needed: a full answer means the oldest second may be
//! incomplete, and that second is read again as a whole.

use super::chunk::CachedRecord;
use super::item::{CacheItem, ItemState};
use super::registry::CacheMode;
use super::Locked;
use crate::error::{CacheError, Error, StoreError};
use crate::metrics;
use crate::store::HistoryStore;
use crate::types::{HistoryRecord, ItemId, Timespec, ValueType, MAX_HISTORY_TIMESTAMP};
use tracing::{debug, trace};

/// A history request
#[derive(Debug, Clone, Copy)]
pub(crate) struct Request {
    pub(crate) itemid: ItemId,
    pub(crate) value_type: ValueType,
    /// Time window ending at `ts`; 0 means unbounded
    pub(crate) seconds: i64,
    /// Records wanted; 0 means every record in the window
    pub(crate) count: usize,
    pub(crate) ts: Timespec,
}

/// Answer a request, newest record first
pub(crate) fn get_values(
    locked: &mut Locked<'_, '_>,
    store: &dyn HistoryStore,
    req: &Request,
) -> Result<Vec<HistoryRecord>, StoreError> {
    if locked.mode == CacheMode::LowMemory {
        locked.warn_low_memory();
    }

    let admitted = admit(locked, req);
    let mut cached = None;

    if admitted {
        locked.addref(req.itemid);
        match get_cached_values(locked, store, req) {
            Ok(values) => cached = Some(values),
            Err(e) => {
                debug!(itemid = req.itemid, error = %e, "request not served from value cache");
                if let Some(item) = locked.items.get_mut(&req.itemid) {
                    item.mark_remove_pending();
                }
            }
        }
    }

    let result = match cached {
        Some(values) => Ok(values),
        None => {
            let result = locked.unlocked(|| read_direct(store, req));
            if let Ok(values) = &result {
                locked.update_statistics(None, 0, values.len());
            }
            result
        }
    };

    if admitted {
        locked.release_item(req.itemid);
    }
    result
}

fn admit(locked: &mut Locked<'_, '_>, req: &Request) -> bool {
    if locked.items.contains_key(&req.itemid) {
        return true;
    }
    if locked.mode != CacheMode::Normal {
        return false;
    }

    match locked.create_item(req.itemid, req.value_type) {
        Ok(()) => true,
        Err(e) => {
            debug!(itemid = req.itemid, error = %e, "item not admitted to value cache");
            false
        }
    }
}

fn get_cached_values(
    locked: &mut Locked<'_, '_>,
    store: &dyn HistoryStore,
    req: &Request,
) -> Result<Vec<HistoryRecord>, Error> {
    let item = locked
        .items
        .get(&req.itemid)
        .ok_or(CacheError::ItemMissing(req.itemid))?;
    if item.state == ItemState::RemovePending {
        return Err(CacheError::RemovePending(req.itemid).into());
    }
    if item.value_type != req.value_type {
        return Err(CacheError::TypeMismatch {
            itemid: req.itemid,
            cached: item.value_type,
            requested: req.value_type,
        }
        .into());
    }

    let read = if req.count == 0 {
        let range_start = (req.ts.sec - req.seconds).max(0);
        cache_values_by_time(locked, store, req, range_start)?
    } else {
        let range_start = match req.seconds {
            0 => 0,
            seconds => (req.ts.sec - seconds).max(0),
        };
        cache_values_by_count(locked, store, req, range_start)?
    };

    let now = locked.now();
    let item = locked
        .items
        .get_mut(&req.itemid)
        .ok_or(CacheError::ItemMissing(req.itemid))?;
    let values = if req.count == 0 {
        item.collect_by_time(req.seconds, req.ts, now)
    } else {
        item.collect_by_count(req.seconds, req.count, req.ts, now)
    };

    let misses = read.min(values.len());
    locked.update_statistics(Some(req.itemid), values.len() - misses, misses);
    trace!(itemid = req.itemid, returned = values.len(), read, "served from value cache");

    Ok(values)
}

/// Cache state needed before deciding on a store read
struct Coverage {
    cached_all: bool,
    db_cached_from: Option<i64>,
    oldest_sec: Option<i64>,
    tail_writes: u64,
}

impl Coverage {
    fn of(locked: &Locked<'_, '_>, itemid: ItemId) -> Result<Self, CacheError> {
        let item = locked.items.get(&itemid).ok_or(CacheError::ItemMissing(itemid))?;
        Ok(Self {
            cached_all: item.cached_all,
            db_cached_from: item.db_cached_from,
            oldest_sec: item.chunks.oldest().map(|r| r.timestamp.sec),
            tail_writes: item.tail_writes,
        })
    }

    /// Whether the store has nothing from `range_start` on that is not cached
    fn covers(&self, range_start: i64) -> bool {
        self.cached_all || self.db_cached_from.map_or(false, |from| range_start >= from)
    }

    /// Newest second not yet cached below the cached tail
    fn range_end(&self) -> i64 {
        self.oldest_sec.map_or(MAX_HISTORY_TIMESTAMP, |sec| sec - 1)
    }
}

/// Make sure all history from `range_start` on is cached
///
/// Returns the number of records read from the store.
fn cache_values_by_time(
    locked: &mut Locked<'_, '_>,
    store: &dyn HistoryStore,
    req: &Request,
    range_start: i64,
) -> Result<usize, Error> {
    let coverage = Coverage::of(locked, req.itemid)?;
    if coverage.covers(range_start) {
        return Ok(0);
    }

    let range_end = coverage.range_end();
    if range_start >= range_end {
        return Ok(0);
    }

    let start = exclusive_start(range_start);
    let mut records = locked.unlocked(|| read_by_time(store, req, start, range_end))?;
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    push_tail(locked, req.itemid, &coverage, &records, |item| {
        item.cached_all = false;
        item.db_cached_from = Some(range_start);
    })?;

    Ok(records.len())
}

/// Make sure `count` records at or before `ts` (and none older than `range_start`)
/// are cached
///
/// Returns the number of records read from the store.
fn cache_values_by_count(
    locked: &mut Locked<'_, '_>,
    store: &dyn HistoryStore,
    req: &Request,
    range_start: i64,
) -> Result<usize, Error> {
    let coverage = Coverage::of(locked, req.itemid)?;
    if coverage.covers(range_start) {
        return Ok(0);
    }

    let cached = locked
        .items
        .get(&req.itemid)
        .map_or(0, |item| item.chunks.count_at_or_before(req.ts, req.count));
    if cached >= req.count {
        return Ok(0);
    }

    let needed = req.count - cached;
    let range_end = coverage.range_end();

    let (mut records, counted) = locked.unlocked(|| -> Result<_, StoreError> {
        let mut records = Vec::new();
        let mut end = range_end;

        // uncached records newer than `ts` do not count towards the request
        if end > req.ts.sec {
            records = read_by_time(store, req, req.ts.sec, end)?;
            end = req.ts.sec;
        }

        let older = read_by_count(store, req, range_start, needed, end)?;
        let counted = older.len();
        records.extend(older);
        Ok((records, counted))
    })?;
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let read = records.len();
    let oldest_read = records.first().map(|r| r.timestamp.sec);

    push_tail(locked, req.itemid, &coverage, &records, |item| {
        match oldest_read {
            Some(sec) if needed <= counted || range_start == 0 => item.db_cached_from = Some(sec),
            _ if range_start != 0 => item.db_cached_from = Some(range_start),
            _ => {}
        }
    })?;

    Ok(read)
}

/// Prepend records read while the lock was released
///
/// A write that went below the cached tail during the read may be missing from
/// `records`, so they are discarded if `tail_writes` moved since `coverage`.
fn push_tail(
    locked: &mut Locked<'_, '_>,
    itemid: ItemId,
    coverage: &Coverage,
    records: &[HistoryRecord],
    on_success: impl FnOnce(&mut CacheItem),
) -> Result<(), CacheError> {
    locked
        .with_item(itemid, |reg, item| -> Result<(), CacheError> {
            if item.tail_writes != coverage.tail_writes || item.state == ItemState::RemovePending {
                return Err(CacheError::TailChanged(itemid));
            }

            item.push_tail(reg, records)?;
            on_success(item);
            Ok(())
        })
        .ok_or(CacheError::ItemMissing(itemid))?
}

/// Read the history store without touching the cache
pub(crate) fn read_direct(
    store: &dyn HistoryStore,
    req: &Request,
) -> Result<Vec<HistoryRecord>, StoreError> {
    let mut records = if req.count == 0 {
        read_by_time(store, req, (req.ts.sec - req.seconds).max(0), req.ts.sec)?
    } else {
        let range_start = match req.seconds {
            0 => 0,
            seconds => req.ts.sec - seconds + 1,
        };
        read_by_count(store, req, range_start, req.count, req.ts.sec)?
    };

    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    records.retain(|r| r.timestamp <= req.ts);
    if req.count > 0 {
        records.truncate(req.count);
    }
    Ok(records)
}

fn exclusive_start(range_start: i64) -> i64 {
    if range_start > 0 {
        range_start - 1
    } else {
        0
    }
}

fn read_by_time(
    store: &dyn HistoryStore,
    req: &Request,
    start: i64,
    end: i64,
) -> Result<Vec<HistoryRecord>, StoreError> {
    metrics::record_store_read("time");
    store.read_by_time(req.itemid, req.value_type, start, end)
}

/// Read at least `count` records at or before `req.ts` with whole seconds only
///
/// Reads from `range_start` (inclusive) up to `end`. Fewer records come back only if
/// the store holds no more in that range.
fn read_by_count(
    store: &dyn HistoryStore,
    req: &Request,
    range_start: i64,
    count: usize,
    end: i64,
) -> Result<Vec<HistoryRecord>, StoreError> {
    let start = exclusive_start(range_start);
    let mut records = Vec::new();
    let mut needed = count;
    let mut end = end;

    loop {
        metrics::record_store_read("count");
        let mut batch = store.read_by_count(req.itemid, req.value_type, start, needed + 1, end)?;
        if batch.len() <= needed {
            records.append(&mut batch);
            return Ok(records);
        }

        batch.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let oldest = batch[batch.len() - 1].timestamp.sec;
        batch.retain(|r| r.timestamp.sec != oldest);
        records.append(&mut batch);
        records.extend(read_by_time(store, req, oldest - 1, oldest)?);

        let found = records.iter().filter(|r| r.timestamp <= req.ts).count();
        if found >= count || oldest - 1 <= start {
            return Ok(records);
        }

        needed = count - found;
        end = oldest - 1;
    }
}

impl CacheItem {
    /// Cached records in `(ts.sec - seconds, ts]`, newest first
    pub(crate) fn collect_by_time(
        &mut self,
        seconds: i64,
        ts: Timespec,
        now: i64,
    ) -> Vec<HistoryRecord> {
        let start = ts.sec - seconds;
        let values = match self.chunks.find_last_at_or_before(ts) {
            Some(pos) => self
                .chunks
                .iter_back(pos)
                .take_while(|r| r.timestamp.sec > start)
                .map(CachedRecord::to_history)
                .collect(),
            None => Vec::new(),
        };

        self.update_range(seconds + now - ts.sec + 1, now);
        values
    }

    /// Up to `count` cached records at or before `ts`, newest first
    ///
    /// With `seconds != 0` records must also be newer than `ts.sec - seconds`. An
    /// unbounded request that comes up short has seen the item's entire history.
    pub(crate) fn collect_by_count(
        &mut self,
        seconds: i64,
        count: usize,
        ts: Timespec,
        now: i64,
    ) -> Vec<HistoryRecord> {
        let start = (seconds != 0).then(|| ts.sec - seconds);
        let values: Vec<HistoryRecord> = match self.chunks.find_last_at_or_before(ts) {
            Some(pos) => self
                .chunks
                .iter_back(pos)
                .take_while(|r| start.map_or(true, |start| r.timestamp.sec > start))
                .take(count)
                .map(CachedRecord::to_history)
                .collect(),
            None => Vec::new(),
        };

        if values.len() < count && seconds == 0 {
            self.cached_all = true;
            self.active_range = 0;
            self.daily_range = 0;
            return values;
        }

        // a met count only needs history back to the oldest returned second
        let range = match values.last() {
            Some(oldest) if values.len() == count => now - oldest.timestamp.sec + 1,
            _ => seconds + now - ts.sec + 1,
        };
        self.update_range(range, now);
        values
    }
}
