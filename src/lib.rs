//! Kuba value cache - in-memory history cache for monitoring item values
//!
//! This library keeps the recent history of monitored items in memory in front of
//! a slower history store:
//! - Time-window and last-N queries answered from memory
//! - Chunked per-item storage with second-granular consistency
//! - Fixed memory budget with expiry and weight-based eviction
//! - Low-memory mode with automatic recovery
//! - Interned string, text and log payloads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod memory;
pub mod store;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Value cache engine: registry, chunked history, read and write paths
pub mod cache;

// Re-export main types
pub use cache::{CacheGuard, CacheMode, CacheStats, ItemStats, ValueCache};
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use store::{HistoryStore, MemoryHistoryStore};
pub use types::{HistoryRecord, HistoryValue, ItemId, ItemValue, LogValue, Timespec, ValueType};
