use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::{
    db::error::DbResult,
    models::{Org, UsageRecord},
};

/// Read access to the pre-aggregated usage table in the billing database.
#[async_trait]
pub trait AggregatesRepo: Send + Sync {
    /// Per-org, per-day, per-unit usage sums within `[start, end)`.
    ///
    /// Buckets at or before an org's trial expiry are excluded entirely;
    /// trial usage is never billable from this source. Orgs without rows in
    /// the window produce no records.
    async fn sum_usage(
        &self,
        orgs: &[Org],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<UsageRecord>>;
}

pub struct PostgresAggregatesRepo {
    pool: PgPool,
}

impl PostgresAggregatesRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AggregatesRepo for PostgresAggregatesRepo {
    async fn sum_usage(
        &self,
        orgs: &[Org],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<UsageRecord>> {
        if orgs.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = orgs.iter().map(|o| o.internal_id.clone()).collect();
        let trial_ends: Vec<DateTime<Utc>> = orgs.iter().map(|o| o.trial_expires_at).collect();

        // The per-org trial cutoff rides along as an unnested value table so
        // one query covers every org.
        let rows = sqlx::query(
            r#"
            SELECT a.instance_id,
                   (a.bucket_start AT TIME ZONE 'UTC')::date AS day,
                   a.amount_type,
                   SUM(a.amount_value)::bigint AS amount
            FROM aggregates a
            JOIN unnest($1::text[], $2::timestamptz[])
                 AS trials(instance_id, trial_expires_at)
              ON a.instance_id = trials.instance_id
            WHERE a.bucket_start >= $3
              AND a.bucket_start < $4
              AND a.bucket_start > trials.trial_expires_at
            GROUP BY a.instance_id, day, a.amount_type
            ORDER BY a.instance_id ASC, day DESC
            "#,
        )
        .bind(&ids)
        .bind(&trial_ends)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| UsageRecord {
                org_ref: row.get("instance_id"),
                day: row.get("day"),
                unit: row.get("amount_type"),
                amount: row.get("amount"),
            })
            .collect())
    }
}
