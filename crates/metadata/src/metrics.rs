//! Prometheus metrics for the reference-counting protocols.
//!
//! The store records transaction conflicts; the GC client records protocol
//! outcomes and durations. Everything lives in one registry so a process
//! exposes a single scrape target.

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Transaction metrics
pub static TXN_CONFLICTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "chunkref_txn_conflicts_total",
            "Serialization conflicts that forced a transaction restart, by operation",
        ),
        &["operation"],
    )
    .expect("metric creation failed")
});

pub static TXN_RETRIES_EXHAUSTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "chunkref_txn_retries_exhausted_total",
            "Transactions abandoned after reaching the configured attempt cap, by operation",
        ),
        &["operation"],
    )
    .expect("metric creation failed")
});

// Protocol metrics
pub static RESERVATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "chunkref_reservations_total",
        "Total number of successful chunk reservations",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_FLUSHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "chunkref_chunks_flushed_total",
        "Chunks found mid-deletion during a reservation and handed to flush",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_MARKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "chunkref_chunks_marked_total",
        "Chunks marked for deletion after their last reference was removed",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "chunkref_chunks_deleted_total",
        "Chunks physically removed by the storage server",
    )
    .expect("metric creation failed")
});

pub static OPERATION_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "chunkref_operation_errors_total",
            "Failed client operations by operation and error kind",
        ),
        &["operation", "kind"],
    )
    .expect("metric creation failed")
});

pub static OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "chunkref_operation_duration_seconds",
            "Duration of client operations including the server hand-off",
        )
        .buckets(vec![
            0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
        ]),
        &["operation"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(TXN_CONFLICTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TXN_RETRIES_EXHAUSTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(RESERVATIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_FLUSHED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_MARKED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(OPERATION_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(OPERATION_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// Encode the registry in the Prometheus text exposition format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
