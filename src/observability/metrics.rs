//! Prometheus metrics for the reconciler.
//!
//! Provides metrics for:
//! - Raw per-source usage amounts, labelled by org and day offset
//! - Upload-access violations caught by the nightly check
//! - Check freshness timestamps for alerting on stale cycles

use std::sync::OnceLock;

use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;

/// Global Prometheus handle for the metrics endpoint.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(MetricsError::Install)?;

    // Store handle for the metrics endpoint
    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))?;

    Ok(())
}

/// Get the Prometheus handle for rendering metrics.
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record the usage one source reported for one org-day.
///
/// Published for every record the usage check fetches, before any
/// reconciliation, so dashboards can compare the sources directly.
///
/// # Arguments
/// * `source` - Source of record ("warehouse", "transactional_db", "billing_platform")
/// * `instance` - The org's external id
/// * `days_ago` - Whole days between the check cycle's start and the usage day
/// * `unit` - Unit of measure for the amount
/// * `amount` - Usage total the source reported
pub fn record_usage_amount(source: &str, instance: &str, days_ago: i64, unit: &str, amount: i64) {
    gauge!(
        "billable_usage_recorded",
        "source" => source.to_string(),
        "instance" => instance.to_string(),
        "days_ago" => days_ago.to_string(),
        "unit" => unit.to_string()
    )
    .set(amount as f64);
}

/// Record when the usage check last completed, in unix seconds.
///
/// Set to 0 when a cycle fails so staleness alerts fire.
pub fn record_usage_check_time(unix_secs: f64) {
    gauge!("billable_usage_recorded_check_time").set(unix_secs);
}

/// Record how many instances refused data upload yet still reported usage.
pub fn record_access_violations(count: usize) {
    gauge!("instance_denial_violations").set(count as f64);
}

/// Record when the access check last completed, in unix seconds.
///
/// Set to 0 when a cycle fails so staleness alerts fire.
pub fn record_access_check_time(unix_secs: f64) {
    gauge!("instance_denial_violations_check_time").set(unix_secs);
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
