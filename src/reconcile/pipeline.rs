//! One reconciliation pass, end to end.
//!
//! Everything here is reentrant: each call resolves orgs, builds its own
//! adapters on fresh connections, and drops them before returning, so the
//! scheduled checks and ad-hoc report requests can overlap freely without
//! shared mutable state.

use std::collections::BTreeMap;

use sqlx::PgPool;
use thiserror::Error;

use crate::{
    config::{DiscrepancyPolicy, ReconcilerConfig},
    db::{self, DbError, OrgRegistry, PostgresOrgRegistry},
    models::{DiscrepancyReport, Org, SourceName, UsageRecord},
    reconcile::{ReconcileWindow, detect, index},
    sources::{
        BillingPlatformSource, SourceError, SourceResult, TransactionalDbSource, UsageSource,
        WarehouseSource,
    },
};

/// Why a reconciliation pass produced no reports.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The org registry was unreachable or the lookup failed. Nothing was
    /// fetched.
    #[error("org resolution failed: {0}")]
    Resolution(#[source] DbError),

    /// One of the three sources failed. No partial reports are produced
    /// from the sources that did answer.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Everything one pass produced: the resolved orgs, the raw per-source
/// records (all units, pre-filtering), and the detector's reports.
pub struct ReconcileOutcome {
    pub orgs: Vec<Org>,
    pub records_by_source: BTreeMap<SourceName, Vec<UsageRecord>>,
    pub reports: Vec<DiscrepancyReport>,
}

/// Run one reconciliation over the window: resolve the org set, fetch all
/// three sources, merge, and detect.
///
/// `external_ids` narrows the run to named orgs; `None` reconciles every
/// org enrolled in external billing.
pub async fn run(
    config: &ReconcilerConfig,
    external_ids: Option<&[String]>,
    window: &ReconcileWindow,
    policy: DiscrepancyPolicy,
) -> Result<ReconcileOutcome, ReconcileError> {
    let users_pool = db::connect(&config.databases.users)
        .await
        .map_err(ReconcileError::Resolution)?;
    let resolved = resolve_orgs(&users_pool, external_ids).await;
    users_pool.close().await;
    let orgs = resolved?;

    tracing::debug!(orgs = orgs.len(), %window, "reconciling");

    let billing_pool = db::connect(&config.databases.billing)
        .await
        .map_err(SourceError::from)?;
    let fetched = fetch_all_sources(config, &billing_pool, &orgs, window).await;
    billing_pool.close().await;
    let records_by_source = fetched?;

    let reports = detect(&orgs, &index(&records_by_source), window, policy);

    Ok(ReconcileOutcome {
        orgs,
        records_by_source,
        reports,
    })
}

async fn resolve_orgs(
    pool: &PgPool,
    external_ids: Option<&[String]>,
) -> Result<Vec<Org>, ReconcileError> {
    PostgresOrgRegistry::new(pool.clone())
        .resolve(external_ids)
        .await
        .map_err(ReconcileError::Resolution)
}

async fn fetch_all_sources(
    config: &ReconcilerConfig,
    billing_pool: &PgPool,
    orgs: &[Org],
    window: &ReconcileWindow,
) -> SourceResult<BTreeMap<SourceName, Vec<UsageRecord>>> {
    let warehouse = WarehouseSource::new(&config.warehouse)?;
    let transactional = TransactionalDbSource::new(billing_pool.clone());
    let billing = BillingPlatformSource::new(&config.billing_platform)?;

    let (warehouse_records, db_records, platform_records) = tokio::try_join!(
        warehouse.fetch(orgs, window),
        transactional.fetch(orgs, window),
        billing.fetch(orgs, window),
    )?;

    Ok(BTreeMap::from([
        (warehouse.name(), warehouse_records),
        (transactional.name(), db_records),
        (billing.name(), platform_records),
    ]))
}
