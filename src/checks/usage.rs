//! Periodic usage reconciliation check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::checks::StopSignal;
use crate::config::ReconcilerConfig;
use crate::observability::metrics;
use crate::reconcile::{self, ReconcileError, ReconcileWindow, floor_to_day};

/// Starts the usage check as a background task.
///
/// Each cycle reconciles the trailing fully-elapsed day across the three
/// sources of record, publishes every fetched amount as a gauge, and logs
/// the orgs whose sources disagree. Runs until `stop` fires.
pub async fn start_usage_check(config: Arc<ReconcilerConfig>, stop: StopSignal) {
    let check = &config.checks.usage;
    if !check.enabled {
        tracing::info!("Usage check disabled by configuration");
        return;
    }

    tracing::info!(
        interval_hours = check.interval_hours,
        orgs = ?check.orgs,
        policy = ?check.discrepancy_policy,
        "Starting usage check"
    );

    let interval = Duration::from_secs(check.interval_hours * 60 * 60);

    loop {
        match run_usage_check(&config).await {
            Ok(reports) => {
                if reports > 0 {
                    tracing::warn!(reports, "Usage check complete with discrepancies");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Error while checking usage");
                metrics::record_usage_check_time(0.0);
            }
        }

        if stop.wait_timeout(interval).await {
            tracing::info!("Usage check stopped");
            return;
        }
    }
}

/// Run a single check cycle. Returns how many orgs were flagged.
async fn run_usage_check(config: &ReconcilerConfig) -> Result<usize, ReconcileError> {
    let check = &config.checks.usage;
    let now = Utc::now();
    let today = floor_to_day(now).date_naive();
    let window = ReconcileWindow::trailing_days(now);

    let outcome = reconcile::run(
        config,
        check.orgs.as_deref(),
        &window,
        check.discrepancy_policy,
    )
    .await?;

    // Gauge labels carry the external id, not the engine's identity key.
    let external_ids: HashMap<&str, &str> = outcome
        .orgs
        .iter()
        .map(|org| (org.internal_id.as_str(), org.external_id.as_str()))
        .collect();

    for (source, records) in &outcome.records_by_source {
        for record in records {
            let instance = external_ids
                .get(record.org_ref.as_str())
                .copied()
                .unwrap_or(record.org_ref.as_str());
            metrics::record_usage_amount(
                source.as_str(),
                instance,
                (today - record.day).num_days(),
                &record.unit,
                record.amount,
            );
        }
    }

    for report in &outcome.reports {
        let days: Vec<_> = report.days.iter().map(|d| d.day).collect();
        tracing::warn!(
            org = %report.org.external_id,
            days = ?days,
            window = %window,
            "Billable usage disagrees between sources"
        );
    }

    let published: usize = outcome.records_by_source.values().map(Vec::len).sum();
    tracing::info!(
        orgs = outcome.orgs.len(),
        records = published,
        discrepancies = outcome.reports.len(),
        window = %window,
        "Usage check cycle finished"
    );
    metrics::record_usage_check_time(Utc::now().timestamp() as f64);

    Ok(outcome.reports.len())
}
