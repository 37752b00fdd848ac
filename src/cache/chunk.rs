//! Chunked per-item history storage
//!
//! Every cached item keeps its history in a doubly linked list of fixed-capacity
//! chunks, ordered oldest (tail) to newest (head). The list lives in a small
//! per-item arena: chunks are addressed by index and linked with `Option<index>`,
//! freed slots are reused.
//!
//! ```text
//!   tail                                  head
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!  │ . . r0 r1 r2 │ ⇄ │ r3 r4 r5 r6  │ ⇄ │ r7 r8 . . .  │
//!  └──────────────┘   └──────────────┘   └──────────────┘
//!    ^ free space                          free space ^
//! ```
//!
//! Records only enter at the two ends: older history read from the store is
//! pushed at the tail, freshly written values at the head. Free capacity therefore
//! only exists at the low end of the tail chunk and the high end of the head chunk.
//!
//! # Second granularity
//!
//! The history store answers in whole seconds, so the cache must never hold only
//! part of the records of one second. Trimming and out-of-order writes both drop
//! whole seconds rather than splitting them.

use super::item::{CacheItem, ItemState};
use super::registry::Registry;
use super::strpool::StrHandle;
use crate::error::CacheError;
use crate::types::{HistoryRecord, HistoryValue, LogValue, Timespec};
use std::mem;
use tracing::error;

/// Arena index of a chunk
pub(crate) type ChunkId = usize;

/// Position of a record: chunk and slot index
pub(crate) type SlotPos = (ChunkId, usize);

/// Log payload as held by the cache
pub(crate) struct CachedLog {
    pub(crate) timestamp: i64,
    pub(crate) logeventid: i32,
    pub(crate) severity: i32,
    pub(crate) source: Option<StrHandle>,
    pub(crate) value: StrHandle,
}

/// Cached value; string payloads are interned
pub(crate) enum CachedValue {
    Float(f64),
    Uint(u64),
    Str(StrHandle),
    Text(StrHandle),
    Log(Box<CachedLog>),
}

impl CachedValue {
    /// Deep copy into an owned value for the caller
    pub(crate) fn to_history_value(&self) -> HistoryValue {
        match self {
            CachedValue::Float(v) => HistoryValue::Float(*v),
            CachedValue::Uint(v) => HistoryValue::Uint(*v),
            CachedValue::Str(s) => HistoryValue::Str(s.as_str().to_string()),
            CachedValue::Text(s) => HistoryValue::Text(s.as_str().to_string()),
            CachedValue::Log(log) => HistoryValue::Log(LogValue {
                timestamp: log.timestamp,
                logeventid: log.logeventid,
                severity: log.severity,
                source: log.source.as_ref().map(|s| s.as_str().to_string()),
                value: log.value.as_str().to_string(),
            }),
        }
    }
}

/// A record held in a chunk slot
pub(crate) struct CachedRecord {
    pub(crate) timestamp: Timespec,
    pub(crate) value: CachedValue,
}

impl CachedRecord {
    pub(crate) fn to_history(&self) -> HistoryRecord {
        HistoryRecord::new(self.timestamp, self.value.to_history_value())
    }
}

/// Bytes charged for a cached log payload (strings are charged separately)
pub(crate) const LOG_VALUE_SIZE: usize = mem::size_of::<CachedLog>();

/// Bytes charged per chunk slot
pub(crate) const RECORD_SIZE: usize = mem::size_of::<Option<CachedRecord>>();

/// Bytes charged per chunk on top of its slots
pub(crate) const CHUNK_HEADER_SIZE: usize = mem::size_of::<Chunk>();

/// Smallest chunk
pub(crate) const MIN_CHUNK_RECORDS: usize = 2;

/// Largest chunk: about 64 KiB of slots
pub(crate) const MAX_CHUNK_RECORDS: usize = (64 * 1024 - CHUNK_HEADER_SIZE) / RECORD_SIZE + 1;

/// Target upper bound of chunks per item
pub(crate) const MAX_ITEM_CHUNKS: usize = 32;

/// Bytes charged for a chunk with `slots` slots
pub(crate) fn chunk_size(slots: usize) -> usize {
    CHUNK_HEADER_SIZE + slots * RECORD_SIZE
}

/// Fixed-capacity segment of an item's history
///
/// Valid records occupy `slots[start..end]` in ascending timestamp order.
pub(crate) struct Chunk {
    prev: Option<ChunkId>,
    next: Option<ChunkId>,
    start: usize,
    end: usize,
    slots: Box<[Option<CachedRecord>]>,
}

impl Chunk {
    fn new(slots_num: usize) -> Self {
        Self {
            prev: None,
            next: None,
            start: 0,
            end: 0,
            slots: (0..slots_num).map(|_| None).collect(),
        }
    }

    pub(crate) fn slots_num(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.end - self.start
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub(crate) fn record(&self, index: usize) -> Option<&CachedRecord> {
        if index < self.start || index >= self.end {
            return None;
        }
        self.slots.get(index)?.as_ref()
    }

    pub(crate) fn first(&self) -> Option<&CachedRecord> {
        self.record(self.start)
    }

    pub(crate) fn last(&self) -> Option<&CachedRecord> {
        self.record(self.end.checked_sub(1)?)
    }

    fn pop_front(&mut self) -> Option<CachedRecord> {
        if self.is_empty() {
            return None;
        }
        let record = self.slots[self.start].take();
        self.start += 1;
        record
    }

    /// Index of the newest record with timestamp <= `ts`
    fn search_last_at_or_before(&self, ts: Timespec) -> Option<usize> {
        let n = self.slots[self.start..self.end]
            .partition_point(|slot| slot.as_ref().map_or(false, |r| r.timestamp <= ts));
        n.checked_sub(1).map(|offset| self.start + offset)
    }
}

/// Arena of one item's chunks
#[derive(Default)]
pub(crate) struct ChunkStore {
    chunks: Vec<Option<Chunk>>,
    free: Vec<ChunkId>,
    head: Option<ChunkId>,
    tail: Option<ChunkId>,
    count: usize,
}

impl ChunkStore {
    pub(crate) fn head(&self) -> Option<ChunkId> {
        self.head
    }

    pub(crate) fn tail(&self) -> Option<ChunkId> {
        self.tail
    }

    /// Number of linked chunks
    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)?.as_ref()
    }

    fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(id)?.as_mut()
    }

    /// Newest cached record
    pub(crate) fn newest(&self) -> Option<&CachedRecord> {
        self.get(self.head?)?.last()
    }

    /// Oldest cached record
    pub(crate) fn oldest(&self) -> Option<&CachedRecord> {
        self.get(self.tail?)?.first()
    }

    /// Link `chunk` at the head (`before == None`) or right before `before`
    fn link(&mut self, mut chunk: Chunk, before: Option<ChunkId>) -> ChunkId {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.chunks.push(None);
                self.chunks.len() - 1
            }
        };

        match before {
            None => {
                chunk.prev = self.head;
                chunk.next = None;
                match self.head.and_then(|h| self.get_mut(h)) {
                    Some(head) => head.next = Some(id),
                    None => self.tail = Some(id),
                }
                self.head = Some(id);
            }
            Some(before) => {
                let prev = self.get(before).and_then(|c| c.prev);
                chunk.prev = prev;
                chunk.next = Some(before);
                if let Some(next) = self.get_mut(before) {
                    next.prev = Some(id);
                }
                match prev.and_then(|p| self.get_mut(p)) {
                    Some(prev) => prev.next = Some(id),
                    None => self.tail = Some(id),
                }
            }
        }

        self.chunks[id] = Some(chunk);
        self.count += 1;
        id
    }

    fn unlink(&mut self, id: ChunkId) -> Option<Chunk> {
        let chunk = self.chunks.get_mut(id)?.take()?;

        match chunk.prev.and_then(|p| self.get_mut(p)) {
            Some(prev) => prev.next = chunk.next,
            None => self.tail = chunk.next,
        }
        match chunk.next.and_then(|n| self.get_mut(n)) {
            Some(next) => next.prev = chunk.prev,
            None => self.head = chunk.prev,
        }

        self.count -= 1;
        if self.count == 0 {
            self.chunks.clear();
            self.free.clear();
        } else {
            self.free.push(id);
        }
        Some(chunk)
    }

    /// Unlink every chunk at once
    fn drain(&mut self) -> Vec<Chunk> {
        self.head = None;
        self.tail = None;
        self.count = 0;
        self.free.clear();
        self.chunks.drain(..).flatten().collect()
    }

    /// Locate the newest record with timestamp <= `ts`
    ///
    /// Walks back from the head to the first chunk whose oldest record is not newer
    /// than `ts`, then binary searches inside it.
    pub(crate) fn find_last_at_or_before(&self, ts: Timespec) -> Option<SlotPos> {
        let mut id = self.head?;
        loop {
            let chunk = self.get(id)?;
            if chunk.first().map_or(false, |r| r.timestamp <= ts) {
                return chunk.search_last_at_or_before(ts).map(|index| (id, index));
            }
            id = chunk.prev?;
        }
    }

    /// Position of the record preceding `pos`
    pub(crate) fn prev_pos(&self, (id, index): SlotPos) -> Option<SlotPos> {
        let chunk = self.get(id)?;
        if index > chunk.start {
            return Some((id, index - 1));
        }
        let prev_id = chunk.prev?;
        let prev = self.get(prev_id)?;
        if prev.is_empty() {
            return None;
        }
        Some((prev_id, prev.end - 1))
    }

    /// Records from `from` backwards to the oldest cached record
    pub(crate) fn iter_back(&self, from: SlotPos) -> RevRecords<'_> {
        RevRecords {
            store: self,
            pos: Some(from),
        }
    }

    /// Count cached records at or before `ts`, stopping early once `limit` is reached
    pub(crate) fn count_at_or_before(&self, ts: Timespec, limit: usize) -> usize {
        let Some((id, index)) = self.find_last_at_or_before(ts) else {
            return 0;
        };
        let Some(chunk) = self.get(id) else {
            return 0;
        };

        let mut count = index + 1 - chunk.start;
        let mut prev = chunk.prev;
        while count < limit {
            let Some(chunk) = prev.and_then(|p| self.get(p)) else {
                break;
            };
            count += chunk.len();
            prev = chunk.prev;
        }
        count
    }

    fn take(&mut self, (id, index): SlotPos) -> Option<CachedRecord> {
        self.get_mut(id)?.slots.get_mut(index)?.take()
    }

    fn put(&mut self, (id, index): SlotPos, record: CachedRecord) {
        if let Some(slot) = self.get_mut(id).and_then(|c| c.slots.get_mut(index)) {
            *slot = Some(record);
        }
    }
}

/// Backward iterator over cached records
pub(crate) struct RevRecords<'a> {
    store: &'a ChunkStore,
    pos: Option<SlotPos>,
}

impl<'a> Iterator for RevRecords<'a> {
    type Item = &'a CachedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.pos?;
        let record = self.store.get(pos.0).and_then(|c| c.record(pos.1));
        self.pos = record.and_then(|_| self.store.prev_pos(pos));
        record
    }
}

// ============================================================================
// Item history operations
// ============================================================================

impl CacheItem {
    /// Slot count for a new chunk that has to take `values_new` more values
    ///
    /// Grows with the square root of the item's history, so both the walk across
    /// chunks and the unused space of a half-filled chunk stay around
    /// `sqrt(values)`, with the chunk count kept near [`MAX_ITEM_CHUNKS`].
    pub(crate) fn chunk_capacity(&self, values_new: usize) -> usize {
        let values = self.values_total + values_new;
        let mut slots = (values as f64).sqrt() as usize;

        if slots > 0 && (values + slots - 1) / slots + 1 > MAX_ITEM_CHUNKS {
            slots = values / MAX_ITEM_CHUNKS;
        }

        slots.clamp(MIN_CHUNK_RECORDS, MAX_CHUNK_RECORDS)
    }

    /// Allocate and link an empty chunk at the head or before `before`
    pub(crate) fn add_chunk(
        &mut self,
        reg: &mut Registry,
        slots: usize,
        before: Option<ChunkId>,
    ) -> Result<ChunkId, CacheError> {
        reg.alloc(self.itemid, chunk_size(slots))?;
        Ok(self.chunks.link(Chunk::new(slots), before))
    }

    /// Unlink a chunk and release its records and memory
    ///
    /// Returns the bytes returned to the budget.
    pub(crate) fn remove_chunk(&mut self, reg: &mut Registry, id: ChunkId) -> usize {
        match self.chunks.unlink(id) {
            Some(chunk) => self.free_chunk(reg, chunk),
            None => 0,
        }
    }

    fn free_chunk(&mut self, reg: &mut Registry, chunk: Chunk) -> usize {
        let size = chunk_size(chunk.slots_num());
        let mut freed = size;

        for record in chunk.slots.into_vec().into_iter().flatten() {
            freed += reg.release_value(record.value);
            self.values_total = self.values_total.saturating_sub(1);
        }

        reg.free(size);
        freed
    }

    /// Release the whole chunk list
    pub(crate) fn free_chunks(&mut self, reg: &mut Registry) -> usize {
        let freed = self
            .chunks
            .drain()
            .into_iter()
            .map(|chunk| self.free_chunk(reg, chunk))
            .sum();
        self.values_total = 0;
        freed
    }

    fn drop_oldest_record(&mut self, reg: &mut Registry, id: ChunkId) -> usize {
        match self.chunks.get_mut(id).and_then(Chunk::pop_front) {
            Some(record) => {
                self.values_total = self.values_total.saturating_sub(1);
                reg.release_value(record.value)
            }
            None => 0,
        }
    }

    /// Add a freshly written value
    ///
    /// Values newer than the cached head are appended. A value older than the
    /// whole cached range cannot be placed without knowing the history below it:
    /// the second it falls into is dropped from the cache instead and
    /// `db_cached_from` moves past it, so the next request re-reads that second from
    /// the store. Anything in between is shift-inserted in order.
    pub(crate) fn push_head(
        &mut self,
        reg: &mut Registry,
        record: &HistoryRecord,
    ) -> Result<(), CacheError> {
        let ts = record.timestamp;
        let newest = self.chunks.newest().map(|r| r.timestamp);
        let oldest = self.chunks.oldest().map(|r| r.timestamp);

        match (newest, oldest) {
            (Some(newest), Some(oldest)) if newest > ts => {
                if oldest > ts {
                    self.tail_writes += 1;
                    self.drop_through_second(reg, ts.sec);
                    return Ok(());
                }
                self.insert_ordered(reg, record)
            }
            // an empty item only vouches for history from db_cached_from on
            (None, _) if !self.cached_all && self.db_cached_from.map_or(false, |from| ts.sec < from) => {
                self.tail_writes += 1;
                Ok(())
            }
            _ => self.append_head(reg, record),
        }
    }

    /// Drop every cached record of second `sec` or older
    fn drop_through_second(&mut self, reg: &mut Registry, sec: i64) {
        self.cached_all = false;

        while let Some(tail) = self.chunks.tail() {
            let due = self
                .chunks
                .get(tail)
                .and_then(Chunk::first)
                .map_or(false, |r| r.timestamp.sec <= sec);
            if !due {
                break;
            }
            self.drop_oldest_record(reg, tail);
            if self.chunks.get(tail).map_or(true, Chunk::is_empty) {
                self.remove_chunk(reg, tail);
            }
        }

        if self.db_cached_from.map_or(true, |from| from <= sec) {
            self.db_cached_from = Some(sec + 1);
        }

        // an empty item could later receive a value while older records of the
        // same second are still uncached
        if self.chunks.is_empty() {
            self.state = ItemState::RemovePending;
        }
    }

    fn append_head(&mut self, reg: &mut Registry, record: &HistoryRecord) -> Result<(), CacheError> {
        let value = reg.copy_value(self.itemid, &record.value)?;
        let pos = match self.open_head_slot(reg) {
            Ok(pos) => pos,
            Err(e) => {
                reg.release_value(value);
                return Err(e);
            }
        };

        self.chunks.put(
            pos,
            CachedRecord {
                timestamp: record.timestamp,
                value,
            },
        );
        self.values_total += 1;
        Ok(())
    }

    /// Reserve the slot after the newest record, adding a head chunk if needed
    fn open_head_slot(&mut self, reg: &mut Registry) -> Result<SlotPos, CacheError> {
        if let Some(head) = self.chunks.head() {
            if let Some(chunk) = self.chunks.get_mut(head) {
                if chunk.end < chunk.slots_num() {
                    let index = chunk.end;
                    chunk.end += 1;
                    return Ok((head, index));
                }
            }
        }

        let slots = self.chunk_capacity(1);
        let id = self.add_chunk(reg, slots, None)?;
        if let Some(chunk) = self.chunks.get_mut(id) {
            chunk.end = 1;
        }
        Ok((id, 0))
    }

    fn insert_ordered(&mut self, reg: &mut Registry, record: &HistoryRecord) -> Result<(), CacheError> {
        let ts = record.timestamp;
        let itemid = self.itemid;

        let Some(after) = self.chunks.find_last_at_or_before(ts) else {
            error!(itemid, timestamp = %ts, "out of order value has no cached predecessor");
            return Err(CacheError::InvariantViolation {
                itemid,
                reason: format!("no cached record at or before {}", ts),
            });
        };

        let value = reg.copy_value(itemid, &record.value)?;
        let mut dst = match self.open_head_slot(reg) {
            Ok(pos) => pos,
            Err(e) => {
                reg.release_value(value);
                return Err(e);
            }
        };

        // shift everything newer than `ts` one slot towards the head
        loop {
            let Some(src) = self.chunks.prev_pos(dst) else {
                error!(itemid, timestamp = %ts, "out of order insert walked past the chunk tail");
                reg.release_value(value);
                return Err(CacheError::InvariantViolation {
                    itemid,
                    reason: "out of order insert walked past the chunk tail".to_string(),
                });
            };
            if src == after {
                break;
            }
            if let Some(moved) = self.chunks.take(src) {
                self.chunks.put(dst, moved);
            }
            dst = src;
        }

        self.chunks.put(dst, CachedRecord { timestamp: ts, value });
        self.values_total += 1;
        Ok(())
    }

    /// Add older history read from the store
    ///
    /// `records` must be sorted ascending. Records at or after the oldest cached
    /// second are skipped: another worker may have cached them while this one was
    /// reading.
    pub(crate) fn push_tail(
        &mut self,
        reg: &mut Registry,
        records: &[HistoryRecord],
    ) -> Result<(), CacheError> {
        let mut count = records.len();
        if let Some(oldest) = self.chunks.oldest() {
            let sec = oldest.timestamp.sec;
            while count > 0 && records[count - 1].timestamp.sec >= sec {
                count -= 1;
            }
        }

        while count > 0 {
            let tail = match self.chunks.tail() {
                Some(id) if self.chunks.get(id).map_or(false, |c| c.start > 0) => id,
                tail => {
                    let slots = self.chunk_capacity(count);
                    let id = self.add_chunk(reg, slots, tail)?;
                    if let Some(chunk) = self.chunks.get_mut(id) {
                        chunk.start = slots;
                        chunk.end = slots;
                    }
                    id
                }
            };

            let room = self.chunks.get(tail).map_or(0, |c| c.start);
            let copied = room.min(count);

            for record in records[count - copied..count].iter().rev() {
                let value = match reg.copy_value(self.itemid, &record.value) {
                    Ok(value) => value,
                    Err(e) => {
                        if self.chunks.get(tail).map_or(false, Chunk::is_empty) {
                            self.remove_chunk(reg, tail);
                        }
                        return Err(e);
                    }
                };
                if let Some(chunk) = self.chunks.get_mut(tail) {
                    chunk.start -= 1;
                    chunk.slots[chunk.start] = Some(CachedRecord {
                        timestamp: record.timestamp,
                        value,
                    });
                }
                self.values_total += 1;
            }

            count -= copied;
        }

        Ok(())
    }

    /// Drop tail chunks older than the active range
    ///
    /// The head chunk and any chunk holding the newest second are kept. Records of
    /// the dropped chunk's last second are removed from the next chunk as well; if
    /// the next chunk holds nothing but that second, trimming stops there.
    pub(crate) fn trim_to_active_range(&mut self, reg: &mut Registry, now: i64) {
        if self.active_range == 0 {
            return;
        }
        let Some(newest_sec) = self.chunks.newest().map(|r| r.timestamp.sec) else {
            return;
        };
        let boundary = now - self.active_range;
        let mut trimmed = false;

        while let Some(tail) = self.chunks.tail() {
            let Some(chunk) = self.chunks.get(tail) else {
                break;
            };
            let (Some(last_sec), Some(next)) = (chunk.last().map(|r| r.timestamp.sec), chunk.next)
            else {
                break;
            };
            if last_sec >= boundary || last_sec == newest_sec {
                break;
            }

            let Some(next_chunk) = self.chunks.get(next) else {
                break;
            };
            let (Some(next_first), Some(next_last)) = (
                next_chunk.first().map(|r| r.timestamp.sec),
                next_chunk.last().map(|r| r.timestamp.sec),
            ) else {
                break;
            };

            if next_first == last_sec {
                if next_last == last_sec {
                    break;
                }
                while self
                    .chunks
                    .get(next)
                    .and_then(Chunk::first)
                    .map_or(false, |r| r.timestamp.sec == last_sec)
                {
                    self.drop_oldest_record(reg, next);
                }
            }

            self.db_cached_from = Some(last_sec + 1);
            self.remove_chunk(reg, tail);
            trimmed = true;
        }

        if trimmed {
            self.cached_all = false;
        }
    }

    /// Check that records are non-decreasing within and across chunks
    #[cfg(test)]
    pub(crate) fn assert_ordered(&self) {
        let mut previous: Option<Timespec> = None;
        let mut id = self.chunks.tail();
        let mut seen = 0;

        while let Some(chunk) = id.and_then(|id| self.chunks.get(id)) {
            for index in chunk.start..chunk.end {
                let record = chunk.record(index).expect("hole inside a chunk");
                if let Some(prev) = previous {
                    assert!(prev <= record.timestamp, "{} after {}", record.timestamp, prev);
                }
                previous = Some(record.timestamp);
                seen += 1;
            }
            id = chunk.next;
        }

        assert_eq!(seen, self.values_total);
    }

    /// Cached timestamps, oldest first
    #[cfg(test)]
    pub(crate) fn timestamps(&self) -> Vec<Timespec> {
        let mut out: Vec<Timespec> = match self.chunks.newest().map(|r| r.timestamp) {
            Some(ts) => self
                .chunks
                .find_last_at_or_before(ts)
                .map(|pos| self.chunks.iter_back(pos).map(|r| r.timestamp).collect())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::registry::Registry;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::types::ValueType;
    use std::sync::Arc;

    const ITEM: u64 = 1;

    fn registry(size: u64) -> Registry {
        Registry::new(&CacheConfig::with_size(size), Arc::new(ManualClock::new(1_000_000)))
    }

    fn float(sec: i64, ns: i32) -> HistoryRecord {
        HistoryRecord::new(Timespec::new(sec, ns), HistoryValue::Float(sec as f64))
    }

    fn text(sec: i64, s: &str) -> HistoryRecord {
        HistoryRecord::new(Timespec::new(sec, 0), HistoryValue::Text(s.to_string()))
    }

    fn with_item<R>(
        reg: &mut Registry,
        value_type: ValueType,
        f: impl FnOnce(&mut Registry, &mut CacheItem) -> R,
    ) -> R {
        if !reg.items.contains_key(&ITEM) {
            reg.create_item(ITEM, value_type).unwrap();
        }
        reg.with_item(ITEM, f).unwrap()
    }

    #[test]
    fn test_chunk_capacity_bounds() {
        let mut item = CacheItem::new(ITEM, ValueType::Float, 0);
        assert_eq!(item.chunk_capacity(1), MIN_CHUNK_RECORDS);
        assert_eq!(item.chunk_capacity(100), 10);

        // chunk count is kept near MAX_ITEM_CHUNKS
        item.values_total = 2000;
        assert_eq!(item.chunk_capacity(0), 2000 / MAX_ITEM_CHUNKS);

        item.values_total = 100_000_000;
        assert_eq!(item.chunk_capacity(0), MAX_CHUNK_RECORDS);
    }

    #[test]
    fn test_push_tail_and_find() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            let records: Vec<_> = (1..=10).map(|s| float(s * 10, 0)).collect();
            item.push_tail(reg, &records).unwrap();
            item.assert_ordered();
            assert_eq!(item.values_total, 10);

            let pos = item.chunks.find_last_at_or_before(Timespec::new(55, 0)).unwrap();
            let found = item.chunks.iter_back(pos).next().unwrap();
            assert_eq!(found.timestamp, Timespec::new(50, 0));

            assert!(item.chunks.find_last_at_or_before(Timespec::new(9, 0)).is_none());
            assert_eq!(item.chunks.count_at_or_before(Timespec::new(100, 0), 100), 10);
            assert_eq!(item.chunks.count_at_or_before(Timespec::new(35, 0), 100), 3);
        });
    }

    #[test]
    fn test_push_tail_skips_cached_seconds() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            item.push_tail(reg, &[float(20, 0), float(30, 0)]).unwrap();
            // 20 is already cached, only 10 and 15 are older
            item.push_tail(reg, &[float(10, 0), float(15, 0), float(20, 0)])
                .unwrap();
            item.assert_ordered();
            assert_eq!(
                item.timestamps(),
                vec![
                    Timespec::new(10, 0),
                    Timespec::new(15, 0),
                    Timespec::new(20, 0),
                    Timespec::new(30, 0)
                ]
            );
        });
    }

    #[test]
    fn test_push_head_appends_across_chunks() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            for s in 1..=50 {
                item.push_head(reg, &float(s, 0)).unwrap();
            }
            item.assert_ordered();
            assert_eq!(item.values_total, 50);
            assert!(item.chunks.len() > 1);
            assert_eq!(item.chunks.newest().unwrap().timestamp, Timespec::new(50, 0));
        });
    }

    #[test]
    fn test_push_head_out_of_order_shift_insert() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            let records: Vec<_> = (1..=9).map(|s| float(s * 10, 0)).collect();
            item.push_tail(reg, &records).unwrap();
            for s in 10..=12 {
                item.push_head(reg, &float(s * 10, 0)).unwrap();
            }

            item.push_head(reg, &float(45, 0)).unwrap();
            item.assert_ordered();
            assert_eq!(item.values_total, 13);

            let pos = item.chunks.find_last_at_or_before(Timespec::new(46, 0)).unwrap();
            assert_eq!(
                item.chunks.iter_back(pos).next().unwrap().timestamp,
                Timespec::new(45, 0)
            );
        });
    }

    #[test]
    fn test_push_head_older_than_tail_drops_second() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            item.push_tail(reg, &[float(100, 10), float(100, 20), float(101, 0)])
                .unwrap();
            item.db_cached_from = Some(100);
            item.cached_all = true;

            item.push_head(reg, &float(100, 5)).unwrap();

            // the whole second 100 left the cache, the new value was not added
            assert_eq!(item.timestamps(), vec![Timespec::new(101, 0)]);
            assert_eq!(item.db_cached_from, Some(101));
            assert!(!item.cached_all);
            assert_eq!(item.state, ItemState::Active);
            item.assert_ordered();
        });
    }

    #[test]
    fn test_push_head_older_than_everything_empties_item() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            item.push_tail(reg, &[float(100, 10), float(100, 20)]).unwrap();
            item.push_head(reg, &float(100, 5)).unwrap();

            assert!(item.chunks.is_empty());
            assert_eq!(item.values_total, 0);
            assert_eq!(item.state, ItemState::RemovePending);
        });
    }

    #[test]
    fn test_push_head_below_coverage_of_empty_item_ignored() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            item.db_cached_from = Some(940);

            item.push_head(reg, &float(500, 0)).unwrap();
            assert!(item.chunks.is_empty());

            item.push_head(reg, &float(950, 0)).unwrap();
            assert_eq!(item.values_total, 1);
        });
    }

    #[test]
    fn test_equal_timestamp_appends() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            item.push_head(reg, &float(10, 0)).unwrap();
            item.push_head(reg, &float(10, 0)).unwrap();
            assert_eq!(item.values_total, 2);
            item.assert_ordered();
        });
    }

    #[test]
    fn test_string_values_are_interned() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Text, |reg, item| {
            item.push_tail(reg, &[text(1, "ok"), text(2, "ok"), text(3, "fail")])
                .unwrap();
            assert_eq!(reg.strings.len(), 2);
            assert_eq!(reg.strings.refcount("ok"), 2);

            item.free_chunks(reg);
            assert!(reg.strings.is_empty());
        });
    }

    #[test]
    fn test_remove_chunk_returns_memory() {
        let mut reg = registry(1 << 20);
        reg.create_item(ITEM, ValueType::Text).unwrap();
        let baseline = reg.memory.used_bytes();

        reg.with_item(ITEM, |reg, item| {
            item.push_tail(reg, &[text(1, "a"), text(2, "b")]).unwrap();
            item.free_chunks(reg);
        });

        assert_eq!(reg.memory.used_bytes(), baseline);
    }

    #[test]
    fn test_trim_to_active_range() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            // four chunks of two: [1,2] [3,4] [5,6] [7,8]
            for pair in (1..=8).collect::<Vec<i64>>().chunks(2).rev() {
                item.push_tail(reg, &[float(pair[0], 0), float(pair[1], 0)])
                    .unwrap();
            }
            assert_eq!(item.chunks.len(), 4);

            item.active_range = 5;
            item.trim_to_active_range(reg, 10);

            // chunks whose newest second is older than 10 - 5 = 5 are gone
            assert_eq!(item.timestamps().first(), Some(&Timespec::new(5, 0)));
            assert_eq!(item.db_cached_from, Some(5));
            item.assert_ordered();
        });
    }

    #[test]
    fn test_trim_drops_split_second_from_next_chunk() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            // chunks of two: [1, 4.0] [4.100, 5] [6, 8]
            for record in [
                float(1, 0),
                float(4, 0),
                float(4, 100),
                float(5, 0),
                float(6, 0),
                float(8, 0),
            ] {
                item.push_head(reg, &record).unwrap();
            }
            assert_eq!(item.chunks.len(), 3);

            item.active_range = 3;
            item.trim_to_active_range(reg, 10);

            assert_eq!(
                item.timestamps(),
                vec![Timespec::new(6, 0), Timespec::new(8, 0)]
            );
            assert_eq!(item.db_cached_from, Some(6));
            item.assert_ordered();
        });
    }

    #[test]
    fn test_trim_stops_at_chunk_of_one_second() {
        let mut reg = registry(1 << 20);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            // chunks of two: [1, 4.0] [4.100, 4.200] [6, 8]
            for record in [
                float(1, 0),
                float(4, 0),
                float(4, 100),
                float(4, 200),
                float(6, 0),
                float(8, 0),
            ] {
                item.push_head(reg, &record).unwrap();
            }

            item.active_range = 3;
            item.trim_to_active_range(reg, 10);

            assert_eq!(item.values_total, 6);
            assert_eq!(item.db_cached_from, None);
            item.assert_ordered();
        });
    }

    #[test]
    fn test_out_of_memory_leaves_item_consistent() {
        // room for the item entry and little else
        let mut reg = registry(2048);
        with_item(&mut reg, ValueType::Float, |reg, item| {
            let records: Vec<_> = (1..=1000).map(|s| float(s, 0)).collect();
            let result = item.push_tail(reg, &records);

            assert!(matches!(result, Err(CacheError::OutOfMemory { .. })));
            item.assert_ordered();
        });
    }
}
