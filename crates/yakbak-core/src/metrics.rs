//! Prometheus metrics helpers for the yakbak feed engine.
//!
//! # Usage
//!
//! ```rust,ignore
//! use yakbak_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("feed_records_merged_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: subsystem (`feed_`, `fanout_`, `catchup_`, `live_`, `cache_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only bounded ones (outcome, mode); never endpoint URLs

use std::net::SocketAddr;

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics recorder.
///
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_feed_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_feed_metrics();
    Some(handle)
}

/// Serve `/metrics` on `port` from a background task.
///
/// The listener is bound before returning so a port conflict surfaces here.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::warn!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for every metric the feed engine records.
///
/// Called automatically by [`init_metrics`].
pub fn register_feed_metrics() {
    // =========================================================================
    // Fan-out
    // =========================================================================

    describe_counter!(
        "fanout_queries_total",
        "Multi-endpoint queries issued"
    );
    describe_counter!(
        "fanout_endpoint_failures_total",
        "Endpoint queries that failed or timed out (label: reason)"
    );
    describe_histogram!(
        "fanout_duration_seconds",
        "Wall time of a fan-out from first request to union"
    );

    // =========================================================================
    // Catch-up
    // =========================================================================

    describe_counter!(
        "catchup_participants_total",
        "Participants processed by catch-up rounds"
    );
    describe_counter!(
        "catchup_participants_skipped_total",
        "Participants skipped because their watermark was fresh"
    );
    describe_histogram!(
        "catchup_duration_seconds",
        "Duration of a complete catch-up round"
    );

    // =========================================================================
    // Merge window
    // =========================================================================

    describe_counter!(
        "feed_records_merged_total",
        "Records added to a merge window (label: path)"
    );
    describe_counter!(
        "feed_records_duplicate_total",
        "Records dropped because the cache already held them"
    );
    describe_counter!(
        "feed_pagination_passes_total",
        "Backward pagination passes (label: outcome)"
    );
    describe_gauge!("feed_sessions_active", "Feed sessions currently running");

    // =========================================================================
    // Live tail
    // =========================================================================

    describe_counter!("live_records_total", "Records delivered by live subscriptions");
    describe_counter!(
        "live_notifications_lagged_total",
        "Relay pool notifications dropped because a subscription fell behind"
    );
    describe_counter!(
        "live_resubscribe_total",
        "Live subscriptions re-established after ending"
    );

    // =========================================================================
    // Cache
    // =========================================================================

    describe_counter!("cache_inserts_total", "Records newly written to the cache");
    describe_counter!("cache_errors_total", "Cache operations that failed");
    describe_counter!(
        "watermark_flushes_total",
        "Watermark table writes to the key/value store"
    );
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter carrying one label.
#[inline]
pub fn increment_labeled(name: &'static str, label: &'static str, value: &'static str, count: u64) {
    metrics::counter!(name, label => value).increment(count);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

/// Record a duration in seconds.
#[inline]
pub fn record_duration(name: &'static str, elapsed: std::time::Duration) {
    metrics::histogram!(name).record(elapsed.as_secs_f64());
}
