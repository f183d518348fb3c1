use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{db::error::DbResult, models::Org};

/// Read access to the customer-org registry in the users database.
#[async_trait]
pub trait OrgRegistry: Send + Sync {
    /// Load orgs by external id, or every org enrolled in external billing
    /// when `external_ids` is None.
    ///
    /// Never partially succeeds: an unreachable registry is an error, not an
    /// empty list.
    async fn resolve(&self, external_ids: Option<&[String]>) -> DbResult<Vec<Org>>;
}

pub struct PostgresOrgRegistry {
    pool: PgPool,
}

impl PostgresOrgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn org_from_row(row: &PgRow) -> Org {
        Org {
            internal_id: row.get("internal_id"),
            external_id: row.get("external_id"),
            trial_expires_at: row.get("trial_expires_at"),
            // The registry stores "not enrolled" as either NULL or "".
            billing_account_ref: row
                .get::<Option<String>, _>("billing_account_ref")
                .filter(|r| !r.is_empty()),
        }
    }
}

#[async_trait]
impl OrgRegistry for PostgresOrgRegistry {
    async fn resolve(&self, external_ids: Option<&[String]>) -> DbResult<Vec<Org>> {
        let rows = match external_ids {
            Some(ids) => {
                sqlx::query(
                    r#"
                    SELECT id::text AS internal_id,
                           external_id,
                           trial_expires_at,
                           zuora_account_number AS billing_account_ref
                    FROM organizations
                    WHERE deleted_at IS NULL
                      AND external_id = ANY($1)
                    ORDER BY id
                    "#,
                )
                .bind(ids)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id::text AS internal_id,
                           external_id,
                           trial_expires_at,
                           zuora_account_number AS billing_account_ref
                    FROM organizations
                    WHERE deleted_at IS NULL
                      AND zuora_account_number IS NOT NULL
                      AND zuora_account_number <> ''
                    ORDER BY id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(Self::org_from_row).collect())
    }
}
