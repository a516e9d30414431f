//! Prometheus metrics
//!
//! The bootstrapper is short-lived, so nothing scrapes it. When a textfile
//! path is configured, the recorder's rendering is written there on exit for
//! node-exporter's textfile collector.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::Path;
use std::time::Duration;

/// Setup Prometheus metrics recorder
/// Returns a handle that can be used to render metrics
pub fn setup_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    tracing::debug!("Prometheus metrics recorder installed");

    Ok(handle)
}

/// Write the current rendering to `path` atomically
pub fn write_textfile(handle: &PrometheusHandle, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create metrics directory: {:?}", parent))?;
    }

    let temp = path.with_extension("prom.tmp");
    std::fs::write(&temp, handle.render())
        .with_context(|| format!("Failed to write metrics file: {:?}", temp))?;
    std::fs::rename(&temp, path)
        .with_context(|| format!("Failed to rename metrics file: {:?}", path))?;

    tracing::debug!(path = ?path, "Metrics textfile written");
    Ok(())
}

/// Record how the install step resolved (`present`, `installed`, `failed`)
pub fn record_install(outcome: &'static str) {
    metrics::counter!("vt_bootstrap_install_total", "outcome" => outcome).increment(1);
}

/// Record how the service step resolved (`spawned`, `external`, `failed`)
pub fn record_service(outcome: &'static str) {
    metrics::counter!("vt_bootstrap_service_total", "outcome" => outcome).increment(1);
}

/// Record a readiness wait
pub fn record_readiness(attempts: u32, elapsed: Duration, ready: bool) {
    metrics::gauge!("vt_bootstrap_readiness_attempts").set(attempts as f64);
    metrics::histogram!("vt_bootstrap_readiness_seconds",
        "ready" => ready.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Record a model pull
pub fn record_pull(model: &str, outcome: &'static str, elapsed: Duration) {
    metrics::counter!("vt_bootstrap_pulls_total",
        "model" => model.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("vt_bootstrap_pull_seconds",
        "model" => model.to_string()
    )
    .record(elapsed.as_secs_f64());
}
