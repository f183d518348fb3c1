//! On-demand month reports.

use chrono::{NaiveDate, Utc};

use crate::config::ReconcilerConfig;
use crate::models::DiscrepancyReport;
use crate::reconcile::{self, ReconcileError, ReconcileWindow};

/// Reconcile the month containing `date` across every billing-enrolled org.
///
/// The window end is clamped to the start of today while the month is still
/// in progress. Runs the full pipeline, so a report is as fresh as the
/// sources are at the moment of the request.
pub async fn generate_report(
    config: &ReconcilerConfig,
    date: NaiveDate,
) -> Result<Vec<DiscrepancyReport>, ReconcileError> {
    let window = ReconcileWindow::month_of(date, Utc::now());
    tracing::debug!(%window, "Generating discrepancy report");

    let outcome = reconcile::run(
        config,
        None,
        &window,
        config.checks.usage.discrepancy_policy,
    )
    .await?;

    Ok(outcome.reports)
}
