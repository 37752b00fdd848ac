//! In-memory history store
//!
//! Keeps all history in ordered maps. Intended for:
//! - **Unit and integration testing** of the cache without a database
//! - **Benchmarking** cache hit paths
//! - **Embedding** where history does not need to outlive the process
//!
//! Every read is recorded as a [`ReadRequest`] so tests can assert exactly what the
//! cache asked for, and reads or writes can be made to fail on demand.
//!
//! # Example
//!
//! ```rust
//! use kuba_valuecache::store::{HistoryStore, MemoryHistoryStore};
//! use kuba_valuecache::types::{HistoryValue, ItemValue, Timespec, ValueType};
//!
//! let store = MemoryHistoryStore::new();
//! store
//!     .append(&[ItemValue::new(1, Timespec::new(10, 0), HistoryValue::Uint(5))])
//!     .unwrap();
//!
//! let records = store.read_by_time(1, ValueType::Uint, 0, 100).unwrap();
//! assert_eq!(records.len(), 1);
//! ```

use super::HistoryStore;
use crate::error::StoreError;
use crate::types::{HistoryRecord, HistoryValue, ItemId, ItemValue, Timespec, ValueType};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// A read issued against [`MemoryHistoryStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRequest {
    /// `read_by_time`
    ByTime {
        /// Item read
        itemid: ItemId,
        /// Exclusive start second
        start: i64,
        /// Inclusive end second
        end: i64,
    },
    /// `read_by_count`
    ByCount {
        /// Item read
        itemid: ItemId,
        /// Exclusive start second
        start: i64,
        /// Requested record count
        count: usize,
        /// Inclusive end second
        end: i64,
    },
}

/// History store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    /// (item, value type) -> records ordered by timestamp
    history: RwLock<HashMap<(ItemId, ValueType), BTreeMap<Timespec, HistoryValue>>>,
    /// Reads served, oldest first
    requests: Mutex<Vec<ReadRequest>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryHistoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with `records` for one item
    pub fn with_records(itemid: ItemId, records: Vec<HistoryRecord>) -> Self {
        let store = Self::new();
        store.insert(itemid, records);
        store
    }

    /// Insert records directly, bypassing `append` and its failure switch
    pub fn insert(&self, itemid: ItemId, records: Vec<HistoryRecord>) {
        let mut history = self.history.write();
        for record in records {
            history
                .entry((itemid, record.value.value_type()))
                .or_default()
                .insert(record.timestamp, record.value);
        }
    }

    /// Number of records held for an item
    pub fn len(&self, itemid: ItemId, value_type: ValueType) -> usize {
        self.history
            .read()
            .get(&(itemid, value_type))
            .map_or(0, BTreeMap::len)
    }

    /// Make every subsequent read fail (or succeed again)
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Make every subsequent append fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Reads served so far
    pub fn requests(&self) -> Vec<ReadRequest> {
        self.requests.lock().clone()
    }

    /// Number of reads served so far
    pub fn read_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Forget recorded reads
    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }

    fn range(
        &self,
        itemid: ItemId,
        value_type: ValueType,
        start: i64,
        end: i64,
    ) -> Vec<HistoryRecord> {
        if start >= end {
            return Vec::new();
        }
        let history = self.history.read();
        let Some(records) = history.get(&(itemid, value_type)) else {
            return Vec::new();
        };

        records
            .range(Timespec::new(start + 1, 0)..Timespec::new(end + 1, 0))
            .map(|(ts, value)| HistoryRecord::new(*ts, value.clone()))
            .collect()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn read_by_time(
        &self,
        itemid: ItemId,
        value_type: ValueType,
        start: i64,
        end: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        self.check_reads()?;
        self.requests
            .lock()
            .push(ReadRequest::ByTime { itemid, start, end });

        Ok(self.range(itemid, value_type, start, end))
    }

    fn read_by_count(
        &self,
        itemid: ItemId,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        self.check_reads()?;
        self.requests.lock().push(ReadRequest::ByCount {
            itemid,
            start,
            count,
            end,
        });

        // newest first, as a "ORDER BY clock DESC LIMIT n" backend would answer
        let mut records = self.range(itemid, value_type, start, end);
        records.reverse();
        records.truncate(count);
        Ok(records)
    }

    fn append(&self, values: &[ItemValue]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::WriteFailed("writes disabled".to_string()));
        }

        let mut history = self.history.write();
        for value in values {
            history
                .entry((value.itemid, value.value_type()))
                .or_default()
                .insert(value.record.timestamp, value.record.value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float(sec: i64, ns: i32, v: f64) -> HistoryRecord {
        HistoryRecord::new(Timespec::new(sec, ns), HistoryValue::Float(v))
    }

    #[test]
    fn test_read_by_time_bounds() {
        let store = MemoryHistoryStore::with_records(
            1,
            vec![float(10, 0, 1.0), float(11, 5, 2.0), float(12, 0, 3.0)],
        );

        let records = store.read_by_time(1, ValueType::Float, 10, 12).unwrap();
        let secs: Vec<i64> = records.iter().map(|r| r.timestamp.sec).collect();
        assert_eq!(secs, vec![11, 12]);

        assert_eq!(
            store.requests(),
            vec![ReadRequest::ByTime {
                itemid: 1,
                start: 10,
                end: 12
            }]
        );
    }

    #[test]
    fn test_read_by_count_newest_first() {
        let store = MemoryHistoryStore::with_records(
            1,
            (1..=5).map(|s| float(s, 0, s as f64)).collect(),
        );

        let records = store.read_by_count(1, ValueType::Float, 0, 2, 4).unwrap();
        let secs: Vec<i64> = records.iter().map(|r| r.timestamp.sec).collect();
        assert_eq!(secs, vec![4, 3]);
    }

    #[test]
    fn test_value_type_separates_history() {
        let store = MemoryHistoryStore::with_records(1, vec![float(10, 0, 1.0)]);
        assert!(store
            .read_by_time(1, ValueType::Uint, 0, 100)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_failure_injection() {
        let store = MemoryHistoryStore::new();
        store.fail_reads(true);
        assert!(store.read_by_time(1, ValueType::Float, 0, 10).is_err());
        store.fail_reads(false);
        assert!(store.read_by_time(1, ValueType::Float, 0, 10).is_ok());

        store.fail_writes(true);
        let value = ItemValue::new(1, Timespec::new(1, 0), HistoryValue::Float(1.0));
        assert!(store.append(&[value]).is_err());
        assert_eq!(store.len(1, ValueType::Float), 0);
    }
}
