//! Core data types shared by the cache and the history store
//!
//! # Key Types
//!
//! - **`Timespec`**: second + nanosecond timestamp, ordered by seconds first
//! - **`ValueType`**: the five history value kinds
//! - **`HistoryValue`** / **`HistoryRecord`**: owned values returned to callers
//! - **`ItemValue`**: a record tagged with the item it belongs to, used for ingest
//!
//! # Example
//!
//! ```rust
//! use kuba_valuecache::types::{HistoryRecord, HistoryValue, Timespec, ValueType};
//!
//! let record = HistoryRecord::new(Timespec::new(1000, 0), HistoryValue::Float(1.5));
//! assert_eq!(record.value.value_type(), ValueType::Float);
//! assert!(Timespec::new(1000, 1) > Timespec::new(1000, 0));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a monitored item
pub type ItemId = u64;

/// Upper time bound used when reading "everything older than the cache" from the
/// history store of an item that has no cached records yet (2038-01-01 00:00:00 UTC).
pub const MAX_HISTORY_TIMESTAMP: i64 = 2_145_916_800;

/// History value type of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ValueType {
    /// Floating point numbers
    Float = 0,
    /// Short strings
    Str = 1,
    /// Log records
    Log = 2,
    /// Unsigned 64-bit integers
    Uint = 3,
    /// Long texts
    Text = 4,
}

impl ValueType {
    /// Whether values of this type carry interned string payloads
    pub fn is_string_like(self) -> bool {
        matches!(self, ValueType::Str | ValueType::Text | ValueType::Log)
    }

    /// Lowercase name of the type
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Float => "float",
            ValueType::Str => "str",
            ValueType::Log => "log",
            ValueType::Uint => "uint",
            ValueType::Text => "text",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for ValueType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ValueType::Float),
            1 => Ok(ValueType::Str),
            2 => Ok(ValueType::Log),
            3 => Ok(ValueType::Uint),
            4 => Ok(ValueType::Text),
            other => Err(other),
        }
    }
}

/// Timestamp with nanosecond resolution
///
/// Ordering compares seconds first, then nanoseconds. History is stored by the
/// store at second granularity, so several records may share `sec`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timespec {
    /// Seconds since the Unix epoch
    pub sec: i64,
    /// Nanoseconds within the second
    pub ns: i32,
}

impl Timespec {
    /// Create a timestamp
    pub const fn new(sec: i64, ns: i32) -> Self {
        Self { sec, ns }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.ns)
    }
}

/// Log record payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogValue {
    /// Timestamp reported by the log source
    pub timestamp: i64,
    /// Event identifier
    pub logeventid: i32,
    /// Event severity
    pub severity: i32,
    /// Event source, if any
    pub source: Option<String>,
    /// Log line
    pub value: String,
}

/// Owned history value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HistoryValue {
    /// Floating point value
    Float(f64),
    /// Unsigned integer value
    Uint(u64),
    /// Short string value
    Str(String),
    /// Long text value
    Text(String),
    /// Log record
    Log(LogValue),
}

impl HistoryValue {
    /// Value type this value belongs to
    pub fn value_type(&self) -> ValueType {
        match self {
            HistoryValue::Float(_) => ValueType::Float,
            HistoryValue::Uint(_) => ValueType::Uint,
            HistoryValue::Str(_) => ValueType::Str,
            HistoryValue::Text(_) => ValueType::Text,
            HistoryValue::Log(_) => ValueType::Log,
        }
    }
}

/// A single history record: timestamp and value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// When the value was collected
    pub timestamp: Timespec,
    /// The value
    pub value: HistoryValue,
}

impl HistoryRecord {
    /// Create a record
    pub fn new(timestamp: Timespec, value: HistoryValue) -> Self {
        Self { timestamp, value }
    }
}

/// A history record tagged with its item, as written by the history syncer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemValue {
    /// Item the record belongs to
    pub itemid: ItemId,
    /// The record
    pub record: HistoryRecord,
}

impl ItemValue {
    /// Create an item value
    pub fn new(itemid: ItemId, timestamp: Timespec, value: HistoryValue) -> Self {
        Self {
            itemid,
            record: HistoryRecord::new(timestamp, value),
        }
    }

    /// Value type of the carried record
    pub fn value_type(&self) -> ValueType {
        self.record.value.value_type()
    }
}
