//! HTTP surface: the report form, rendered discrepancy tables, health and
//! metrics endpoints.

use std::sync::Arc;

use axum::extract::{Form, State};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::config::ReconcilerConfig;
use crate::models::{AmountsBySource, DiscrepancyReport, SourceName, amount_or_zero};
use crate::observability::metrics::get_prometheus_handle;
use crate::reports;

/// Shared handler state.
pub type AppState = Arc<ReconcilerConfig>;

/// Assemble the router.
pub fn build_app(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/", get(index))
        .route("/discrepancies", post(discrepancies))
        .route("/health", get(health));

    if state.observability.metrics.enabled {
        app = app.route("/metrics", get(metrics));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// The report form.
async fn index() -> Html<String> {
    let today = Utc::now().date_naive();
    Html(format!(
        r#"<html>
<head>
<title>Billing Reconciler</title>
</head>
<body>
<h1>Billing Reconciler</h1>
<h2>Discrepancy Report</h2>
<p>
    Compares usage recorded in the warehouse, the aggregates database and the
    billing platform, listing the days where they disagree.
</p>
<form action="/discrepancies" method="post">
    <label for="date">Date in month</label>
    <input name="date" id="date" value="{today}">
    <button>Run</button>
</form>
</body>
</html>
"#
    ))
}

#[derive(Debug, Deserialize)]
struct ReportForm {
    /// Any date inside the month to report on.
    date: NaiveDate,
}

/// Run the month report and render it.
#[tracing::instrument(name = "routes.discrepancies", skip_all, fields(date = %form.date))]
async fn discrepancies(
    State(config): State<AppState>,
    Form(form): Form<ReportForm>,
) -> Result<Html<String>, (StatusCode, String)> {
    let reports = reports::generate_report(&config, form.date)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Report generation failed");
            (
                StatusCode::BAD_GATEWAY,
                format!("Report generation failed: {e}"),
            )
        })?;

    Ok(Html(render_report(&reports)))
}

/// Health status response.
#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    version: &'static str,
}

/// Liveness endpoint for probes and monitoring.
async fn health() -> impl IntoResponse {
    Json(HealthStatus {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Prometheus metrics endpoint.
///
/// Returns metrics in Prometheus text format.
async fn metrics() -> impl IntoResponse {
    match get_prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain")],
            "Metrics not initialized".to_string(),
        ),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Report rendering
// ─────────────────────────────────────────────────────────────────────────────

/// Render reports as an HTML table: one row per flagged day, a totals row
/// per org, and a blank separator row between orgs.
fn render_report(reports: &[DiscrepancyReport]) -> String {
    let mut rows = String::new();
    for report in reports {
        for day in &report.days {
            rows.push_str(&table_row(
                &report.org.external_id,
                &day.day.to_string(),
                &day.amounts,
                false,
            ));
        }
        rows.push_str(&table_row(
            &report.org.external_id,
            "total",
            &report.total,
            true,
        ));
        rows.push_str("        <tr></tr>\n");
    }

    format!(
        r#"<html>
<head>
<title>Billing Reconciler: Discrepancy Report</title>
</head>
<body>
<h1>Discrepancy Report</h1>
<table>
    <thead>
        <tr><td>instance</td><td>date</td><td>warehouse</td><td>+/-</td><td>transactional_db</td><td>+/-</td><td>billing_platform</td></tr>
    </thead>
    <tbody>
{rows}    </tbody>
</table>
</body>
</html>
"#
    )
}

fn table_row(instance: &str, date: &str, amounts: &AmountsBySource, totals_row: bool) -> String {
    format!(
        "        <tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
        html_escape(instance),
        date,
        amount_or_zero(amounts, SourceName::Warehouse),
        delta(
            amounts,
            SourceName::Warehouse,
            SourceName::TransactionalDb,
            totals_row
        ),
        amount_or_zero(amounts, SourceName::TransactionalDb),
        delta(
            amounts,
            SourceName::TransactionalDb,
            SourceName::BillingPlatform,
            totals_row
        ),
        amount_or_zero(amounts, SourceName::BillingPlatform),
    )
}

/// Signed difference between two adjacent source columns. A zero renders as
/// an empty cell except on totals rows, where it stays visible.
fn delta(
    amounts: &AmountsBySource,
    from: SourceName,
    to: SourceName,
    include_zeros: bool,
) -> String {
    let diff = amount_or_zero(amounts, to) - amount_or_zero(amounts, from);
    if diff > 0 {
        format!("+{diff}")
    } else if diff == 0 && !include_zeros {
        String::new()
    } else {
        diff.to_string()
    }
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
