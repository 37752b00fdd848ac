//! Error types for the value cache

use crate::types::{ItemId, ValueType};
use thiserror::Error;

/// Main error type for the value cache
#[derive(Error, Debug)]
pub enum Error {
    /// Cache engine error
    #[error("Value cache error: {0}")]
    Cache(#[from] CacheError),

    /// History store error
    #[error("History store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised inside the cache engine
///
/// Apart from [`CacheError::Disabled`] none of these reach a query caller: a failed
/// cache operation marks the item for removal and the request is answered from the
/// history store instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The memory budget is exhausted even after eviction
    #[error("Out of value cache memory: requested {requested} bytes")]
    OutOfMemory {
        /// Bytes requested by the failed allocation
        requested: usize,
    },

    /// Chunk ordering could not be maintained
    #[error("Chunk invariant violated for item {itemid}: {reason}")]
    InvariantViolation {
        /// Item whose chunk list was being modified
        itemid: ItemId,
        /// What went wrong
        reason: String,
    },

    /// Item is cached with another value type
    #[error("Item {itemid} is cached as {cached}, requested as {requested}")]
    TypeMismatch {
        /// Item identifier
        itemid: ItemId,
        /// Value type in the cache
        cached: ValueType,
        /// Value type of the request
        requested: ValueType,
    },

    /// Item has not been read for longer than the expire period
    #[error("Item {itemid} idle since {last_accessed}")]
    Expired {
        /// Item identifier
        itemid: ItemId,
        /// Last request time (unix seconds)
        last_accessed: i64,
    },

    /// A write went below the cached tail while older history was being read
    #[error("Item {0} changed below its cached tail during a store read")]
    TailChanged(ItemId),

    /// Item is waiting to be dropped once its last reference is released
    #[error("Item {0} is pending removal")]
    RemovePending(ItemId),

    /// Item is not present in the registry
    #[error("Item {0} is not cached")]
    ItemMissing(ItemId),

    /// The cache is disabled for this handle
    #[error("Value cache is disabled")]
    Disabled,
}

/// History store (backing storage) errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Read request failed
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Append request failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Backend cannot be reached
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Validation errors
///
/// Raised while validating configuration values.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Value is out of allowed range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        /// Field name being validated
        field: String,
        /// The invalid value
        value: String,
        /// Minimum allowed value
        min: String,
        /// Maximum allowed value
        max: String,
    },

    /// Invalid format
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat {
        /// Field name being validated
        field: String,
        /// Description of the format error
        message: String,
    },
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Configuration(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_becomes_configuration() {
        let err: Error = ValidationError::OutOfRange {
            field: "size".to_string(),
            value: "10".to_string(),
            min: "131072".to_string(),
            max: "68719476736".to_string(),
        }
        .into();

        match err {
            Error::Configuration(msg) => assert!(msg.contains("size value 10")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_type_mismatch_display() {
        let err = CacheError::TypeMismatch {
            itemid: 7,
            cached: ValueType::Float,
            requested: ValueType::Str,
        };
        assert_eq!(
            err.to_string(),
            "Item 7 is cached as float, requested as str"
        );
    }
}
