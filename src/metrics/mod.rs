//! Metrics module
//!
//! Prometheus counters and histograms for uploads, chunks, retries and
//! atomic group items. Recording can be switched off process-wide with
//! [`set_enabled`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "preweave_uploads_total",
        "Total number of uploads",
        &["method", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "preweave_upload_bytes_total",
        "Total bytes uploaded"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "preweave_upload_duration_seconds",
        "Upload duration in seconds",
        &["method"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0, 1000.0]
    ).unwrap();

    // Chunk metrics
    pub static ref CHUNKS_TOTAL: CounterVec = register_counter_vec!(
        "preweave_chunks_total",
        "Chunk deliveries by outcome",
        &["status"]
    ).unwrap();

    pub static ref CHUNK_BYTES_TOTAL: Counter = register_counter!(
        "preweave_chunk_bytes_total",
        "Bytes acknowledged in chunk deliveries"
    ).unwrap();

    // Retry metrics
    pub static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "preweave_retries_total",
        "Retried attempts by operation",
        &["operation"]
    ).unwrap();

    // Atomic group metrics
    pub static ref ATOMIC_ITEMS_TOTAL: CounterVec = register_counter_vec!(
        "preweave_atomic_items_total",
        "Atomic group item uploads by outcome",
        &["status"]
    ).unwrap();
}

/// Enable or disable metric recording
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Record a successful upload
pub fn record_upload_success(method: &str, bytes: u64) {
    if !enabled() {
        return;
    }
    UPLOADS_TOTAL.with_label_values(&[method, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed upload
pub fn record_upload_failure(method: &str) {
    if !enabled() {
        return;
    }
    UPLOADS_TOTAL.with_label_values(&[method, "failure"]).inc();
}

/// Record upload duration
pub fn record_upload_duration(method: &str, duration_secs: f64) {
    if !enabled() {
        return;
    }
    UPLOAD_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

/// Record an acknowledged chunk
pub fn record_chunk_success(bytes: u64) {
    if !enabled() {
        return;
    }
    CHUNKS_TOTAL.with_label_values(&["success"]).inc();
    CHUNK_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a chunk that exhausted its retries
pub fn record_chunk_failure() {
    if !enabled() {
        return;
    }
    CHUNKS_TOTAL.with_label_values(&["failure"]).inc();
}

/// Record one retried attempt
pub fn record_retry(operation: &str) {
    if !enabled() {
        return;
    }
    RETRIES_TOTAL.with_label_values(&[operation]).inc();
}

/// Record the outcome of one atomic group item
pub fn record_atomic_item(success: bool) {
    if !enabled() {
        return;
    }
    let status = if success { "success" } else { "failure" };
    ATOMIC_ITEMS_TOTAL.with_label_values(&[status]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn encode_text() -> String {
    // Unlabelled metrics show up even before anything was recorded
    lazy_static::initialize(&UPLOAD_BYTES_TOTAL);
    lazy_static::initialize(&CHUNK_BYTES_TOTAL);

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
