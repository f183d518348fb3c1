//! Adapter for the transactional aggregates database.
//!
//! The lightest of the three sources: the heavy lifting (daily summing and
//! trial exclusion) happens inside the SQL in [`crate::db::repos`], so this
//! adapter only binds a per-cycle pool to the common [`UsageSource`] shape.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::{
    db::{AggregatesRepo, PostgresAggregatesRepo},
    models::{Org, SourceName, UsageRecord},
    reconcile::ReconcileWindow,
    sources::{SourceResult, UsageSource},
};

pub struct TransactionalDbSource {
    repo: Box<dyn AggregatesRepo>,
}

impl TransactionalDbSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            repo: Box::new(PostgresAggregatesRepo::new(pool)),
        }
    }

    #[cfg(test)]
    fn with_repo(repo: Box<dyn AggregatesRepo>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl UsageSource for TransactionalDbSource {
    fn name(&self) -> SourceName {
        SourceName::TransactionalDb
    }

    #[tracing::instrument(skip(self, orgs), fields(source = "transactional_db", orgs = orgs.len(), window = %window))]
    async fn fetch(&self, orgs: &[Org], window: &ReconcileWindow) -> SourceResult<Vec<UsageRecord>> {
        Ok(self.repo.sum_usage(orgs, window.start, window.end).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::db::DbResult;

    type Call = (Vec<Org>, DateTime<Utc>, DateTime<Utc>);

    /// Captures the arguments `fetch` forwards to the repository.
    struct RecordingRepo {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    #[async_trait]
    impl AggregatesRepo for RecordingRepo {
        async fn sum_usage(
            &self,
            orgs: &[Org],
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> DbResult<Vec<UsageRecord>> {
            self.calls
                .lock()
                .unwrap()
                .push((orgs.to_vec(), start, end));
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn forwards_orgs_and_window_bounds() {
        let calls = Arc::new(Mutex::new(vec![]));
        let source = TransactionalDbSource::with_repo(Box::new(RecordingRepo {
            calls: Arc::clone(&calls),
        }));

        let org = Org {
            internal_id: "7".into(),
            external_id: "acme".into(),
            trial_expires_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            billing_account_ref: Some("A-1".into()),
        };
        let window = ReconcileWindow {
            start: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap(),
        };

        source.fetch(std::slice::from_ref(&org), &window).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (orgs, start, end) = &calls[0];
        assert_eq!(orgs[0].trial_expires_at, org.trial_expires_at);
        assert_eq!(*start, window.start);
        assert_eq!(*end, window.end);
    }

    #[test]
    fn reports_as_transactional_db() {
        let source = TransactionalDbSource::with_repo(Box::new(RecordingRepo {
            calls: Arc::new(Mutex::new(vec![])),
        }));
        assert_eq!(source.name(), SourceName::TransactionalDb);
    }
}
