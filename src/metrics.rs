//! Metric names and Prometheus recorder wiring.
//!
//! Without an installed recorder (unit tests, library use) every macro call
//! is a no-op, so instrumented code paths never need to care.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Normalized messages accepted by the ingest paths, labelled by `type`.
pub const MESSAGES_RECEIVED_TOTAL: &str = "messages_received_total";
/// Trades committed to storage (incremented per flush batch).
pub const TRADES_INGESTED_TOTAL: &str = "trades_ingested_total";
/// Depth-book resyncs, labelled by `connector`.
pub const CONNECTOR_RESTARTS_TOTAL: &str = "connector_restarts_total";
/// Transaction latency, labelled by `operation`.
pub const DB_WRITE_LATENCY_SECONDS: &str = "db_write_latency_seconds";

/// Install the process-wide Prometheus recorder and return the render handle
/// served at `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(DB_WRITE_LATENCY_SECONDS.to_string()),
            &[
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ],
        )
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    metrics::describe_counter!(MESSAGES_RECEIVED_TOTAL, "Total normalized messages received");
    metrics::describe_counter!(TRADES_INGESTED_TOTAL, "Total trades ingested into storage");
    metrics::describe_counter!(CONNECTOR_RESTARTS_TOTAL, "Total connector restarts/resyncs");
    metrics::describe_histogram!(
        DB_WRITE_LATENCY_SECONDS,
        metrics::Unit::Seconds,
        "Database write latency in seconds"
    );

    Ok(handle)
}
