//! Prometheus metrics for the Tessera server.
//!
//! Exposes counters for the upload lifecycle (init, chunk writes, merges),
//! background cleanup, and session expiry, plus latency histograms.
//!
//! The `/metrics` endpoint is unauthenticated. Metrics carry no owner IDs,
//! digests, or file names, but they do reveal aggregate usage; restrict
//! the endpoint to the Prometheus scraper at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Session metrics
pub static UPLOADS_INITIALIZED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tessera_uploads_initialized_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_RESUMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tessera_uploads_resumed_total",
        "Total number of init calls that resumed an existing session",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tessera_sessions_expired_total",
        "Total number of expired sessions removed by the sweeper",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tessera_chunks_uploaded_total",
        "Total number of chunks written to storage",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tessera_chunks_deduplicated_total",
        "Total number of chunk uploads skipped because the chunk was already present",
    )
    .expect("metric creation failed")
});

pub static CHUNK_BYTES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tessera_chunk_bytes_total",
        "Total chunk bytes written to storage",
    )
    .expect("metric creation failed")
});

// Merge metrics
pub static MERGES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tessera_merges_total", "Total number of successful merges")
        .expect("metric creation failed")
});

pub static MERGE_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "tessera_merge_failures_total",
            "Total failed merges by error kind",
        ),
        &["error_type"],
    )
    .expect("metric creation failed")
});

pub static INTEGRITY_WARNINGS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tessera_integrity_warnings_total",
        "Total merges whose result size differed from the declared size",
    )
    .expect("metric creation failed")
});

// Cleanup metrics
pub static CLEANUP_OBJECTS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tessera_cleanup_objects_deleted_total",
        "Total chunk objects deleted by the cleanup worker",
    )
    .expect("metric creation failed")
});

pub static CLEANUP_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "tessera_cleanup_failures_total",
        "Total failed cleanup attempts, including failures to enqueue",
    )
    .expect("metric creation failed")
});

// Timing metrics
pub static CHUNK_UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "tessera_chunk_upload_duration_seconds",
            "Time taken to store a single chunk",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

pub static MERGE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "tessera_merge_duration_seconds",
            "Time taken to compose and record a merged upload",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOADS_INITIALIZED.clone()),
            Box::new(UPLOADS_RESUMED.clone()),
            Box::new(SESSIONS_EXPIRED.clone()),
            Box::new(CHUNKS_UPLOADED.clone()),
            Box::new(CHUNKS_DEDUPLICATED.clone()),
            Box::new(CHUNK_BYTES.clone()),
            Box::new(MERGES.clone()),
            Box::new(MERGE_FAILURES.clone()),
            Box::new(INTEGRITY_WARNINGS.clone()),
            Box::new(CLEANUP_OBJECTS_DELETED.clone()),
            Box::new(CLEANUP_FAILURES.clone()),
            Box::new(CHUNK_UPLOAD_DURATION.clone()),
            Box::new(MERGE_DURATION.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Helper to record merge failures by type.
pub fn record_merge_failure(error_type: &str) {
    MERGE_FAILURES.with_label_values(&[error_type]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // This would panic if any metric creation failed
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_metric_names_are_exported() {
        register_metrics();
        CHUNKS_UPLOADED.inc();
        record_merge_failure("storage_error");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("tessera_chunks_uploaded_total"));
        assert!(text.contains("tessera_merge_failures_total{error_type=\"storage_error\"}"));
    }
}
