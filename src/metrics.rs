//! Metrics and telemetry for the value cache
//!
//! Prometheus collectors for request outcomes, history store traffic, evictions,
//! operating mode and memory usage.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder, IntCounterVec,
    IntGauge, IntGaugeVec, TextEncoder,
};

lazy_static! {
    /// Values served, split into cache hits and misses
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "valuecache_values_total",
        "History values returned by the value cache",
        &["result"]
    ).unwrap();

    /// Requests sent to the history store
    pub static ref STORE_READS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "valuecache_store_reads_total",
        "History store reads issued by the value cache",
        &["kind"]
    ).unwrap();

    /// Items dropped from the cache
    pub static ref EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "valuecache_evictions_total",
        "Items removed from the value cache",
        &["reason"]
    ).unwrap();

    /// 0 = normal, 1 = low memory
    pub static ref MODE: IntGauge = register_int_gauge!(
        "valuecache_mode",
        "Value cache operating mode (0 normal, 1 low memory)"
    ).unwrap();

    /// Cached items
    pub static ref ITEMS: IntGauge = register_int_gauge!(
        "valuecache_items",
        "Number of items in the value cache"
    ).unwrap();

    /// Memory budget usage
    pub static ref MEMORY_BYTES: IntGaugeVec = register_int_gauge_vec!(
        "valuecache_memory_bytes",
        "Value cache memory in bytes",
        &["kind"]
    ).unwrap();
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record served values
#[inline]
pub fn record_request(hits: usize, misses: usize) {
    if hits > 0 {
        REQUESTS_TOTAL.with_label_values(&["hit"]).inc_by(hits as u64);
    }
    if misses > 0 {
        REQUESTS_TOTAL.with_label_values(&["miss"]).inc_by(misses as u64);
    }
}

/// Record a history store read
#[inline]
pub fn record_store_read(kind: &str) {
    STORE_READS_TOTAL.with_label_values(&[kind]).inc();
}

/// Record an item eviction
#[inline]
pub fn record_eviction(reason: &str) {
    EVICTIONS_TOTAL.with_label_values(&[reason]).inc();
}

/// Update the operating mode gauge
#[inline]
pub fn update_mode(low_memory: bool) {
    MODE.set(i64::from(low_memory));
}

/// Update the cached item count
#[inline]
pub fn update_items(count: usize) {
    ITEMS.set(count as i64);
}

/// Update memory usage
#[inline]
pub fn update_memory(total: usize, free: usize) {
    MEMORY_BYTES.with_label_values(&["total"]).set(total as i64);
    MEMORY_BYTES.with_label_values(&["free"]).set(free as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        record_request(3, 1);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("valuecache_values_total"));
    }

    #[test]
    fn test_gather_metrics() {
        update_mode(false);
        update_memory(1024, 512);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("valuecache_mode"));
        assert!(metrics.contains("valuecache_memory_bytes"));
    }
}
