//! Usage source adapters.
//!
//! Three independent systems record billable usage: the analytics warehouse
//! (BigQuery), the transactional aggregates database (Postgres), and the
//! external billing platform. Each adapter turns a time window plus a set of
//! orgs into normalized [`UsageRecord`]s, hiding the query and pagination
//! mechanics of its backend.
//!
//! Adapters are built fresh for each reconciliation and dropped at the end of
//! it. Backend handles (pools, HTTP clients, cached tokens) live no longer
//! than the adapter that owns them.

mod billing_platform;
mod transactional;
mod warehouse;

use async_trait::async_trait;
pub use billing_platform::{
    BillingPlatformClient, BillingPlatformSource, PlatformUsageRow, UsageAssignment, UsageUpload,
};
use thiserror::Error;
pub use transactional::TransactionalDbSource;
pub use warehouse::{QueryParameter, WarehouseClient, WarehouseSource};

use crate::{
    db::DbError,
    models::{Org, SourceName, UsageRecord},
    reconcile::ReconcileWindow,
};

/// Why a source could not produce its records for a window.
///
/// Any variant aborts the reconciliation that requested the fetch; partial
/// data is never compared. The caller logs and carries on with the next
/// cycle.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid source configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("database query failed: {0}")]
    Db(#[from] DbError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("upstream returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("query did not complete within {0:?}")]
    Timeout(std::time::Duration),

    /// The upstream answered 2xx but flagged the operation as failed in the
    /// response body.
    #[error("billing platform reported failure: {0}")]
    Unsuccessful(String),

    #[error("malformed upstream payload: {0}")]
    Payload(String),

    #[error("csv encoding failed: {0}")]
    Csv(#[from] csv::Error),

    /// The upstream violated a shape the adapter depends on, such as the
    /// one-subscription-per-account cardinality of the billing platform.
    /// Never coerced into a best-effort value.
    #[error("upstream contract violation: {0}")]
    ContractViolation(String),

    #[error("org {0} has no billing account reference")]
    MissingBillingRef(String),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// A system of record that can report billable usage per org and day.
///
/// Windows are half-open `[start, end)`. An org with no usage in the window
/// yields no records at all, not zero-valued ones.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Which of the three sources this adapter speaks for.
    fn name(&self) -> SourceName;

    async fn fetch(&self, orgs: &[Org], window: &ReconcileWindow) -> SourceResult<Vec<UsageRecord>>;
}

/// Decode a JSON response body, surfacing non-2xx statuses with a trimmed
/// slice of the error body and decode failures with the caller's context.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> SourceResult<T> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(SourceError::Api {
            status: status.as_u16(),
            message: truncate_message(&message),
        });
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| SourceError::Payload(format!("{what}: {e}")))
}

/// Upstream error bodies can be whole HTML pages; keep enough to diagnose.
fn truncate_message(message: &str) -> String {
    const LIMIT: usize = 600;
    if message.len() <= LIMIT {
        return message.to_string();
    }
    let mut end = LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
