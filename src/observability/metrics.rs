//! Storage metrics and the Prometheus exporter.

use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Instant;

/// Records operation metrics for a storage call.
///
/// Two series are written per call:
/// 1. `storage_operations_total` - counter by backend, operation and status
/// 2. `storage_operation_duration_ms` - latency histogram with the same labels
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Records entries removed by an expiry sweep.
pub fn record_reaped(backend: &'static str, removed: u64) {
    metrics::counter!("storage_entries_reaped_total", "backend" => backend).increment(removed);
}

/// Installs the Prometheus recorder with an HTTP listener on `addr`.
///
/// Must be called from within a tokio runtime; the exporter task is spawned
/// onto the current runtime.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or a global recorder is
/// already installed.
pub fn install_prometheus(addr: SocketAddr) -> Result<PrometheusHandle> {
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()
        .map_err(|e| Error::operation("metrics_exporter_build", e))?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| Error::operation("metrics_recorder_install", e))?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::warn!(error = ?e, "Prometheus exporter stopped");
        }
    });
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(handle)
}
