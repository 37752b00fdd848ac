//! History store interface
//!
//! The value cache sits in front of a slower persistent history backend. The
//! backend is reached only through [`HistoryStore`]; it is expected to be safe to
//! call from several workers at once and is always called without the cache lock
//! held (outside of an explicit batch lock).

pub mod memory;

pub use memory::{MemoryHistoryStore, ReadRequest};

use crate::error::StoreError;
use crate::types::{HistoryRecord, ItemId, ItemValue, ValueType};

/// Persistent history backend
pub trait HistoryStore: Send + Sync + 'static {
    /// Read all records of an item with `start < timestamp.sec <= end`
    ///
    /// The start bound is exclusive. Records may be returned in any order.
    fn read_by_time(
        &self,
        itemid: ItemId,
        value_type: ValueType,
        start: i64,
        end: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Read the newest `count` records of an item with `start < timestamp.sec <= end`
    ///
    /// The start bound is exclusive. Records may be returned in any order. The
    /// backend works at second granularity only, so the oldest second of the result
    /// may be incomplete; reconciling that is the caller's job.
    fn read_by_count(
        &self,
        itemid: ItemId,
        value_type: ValueType,
        start: i64,
        count: usize,
        end: i64,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    /// Persist new values
    fn append(&self, values: &[ItemValue]) -> Result<(), StoreError>;
}
