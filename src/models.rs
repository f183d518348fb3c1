use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The unit of measure that reconciliation compares. Records carrying any
/// other unit are dropped during indexing.
pub const BILLABLE_UNIT: &str = "node-seconds";

/// A billable customer organization.
///
/// `internal_id` is the identity key everywhere inside the engine; `external_id`
/// is the only identifier exposed in reports, logs, and metric labels. Orgs are
/// reloaded at the start of every check cycle because trial state can change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Org {
    pub internal_id: String,
    pub external_id: String,
    /// Usage bucketed at or before this instant is trial usage, never billable.
    pub trial_expires_at: DateTime<Utc>,
    /// Account reference in the external billing platform. Orgs without one
    /// are not enrolled in external billing and cannot be reconciled.
    pub billing_account_ref: Option<String>,
}

/// One day of usage for one org from one source, already summed server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// The org's `internal_id`.
    pub org_ref: String,
    /// Calendar-day bucket in UTC; sub-day timestamps are floored.
    pub day: NaiveDate,
    pub unit: String,
    pub amount: i64,
}

/// The three systems of record that feed the detector. The set is closed;
/// variant order is the display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    Warehouse,
    TransactionalDb,
    BillingPlatform,
}

impl SourceName {
    pub const ALL: [SourceName; 3] = [
        SourceName::Warehouse,
        SourceName::TransactionalDb,
        SourceName::BillingPlatform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceName::Warehouse => "warehouse",
            SourceName::TransactionalDb => "transactional_db",
            SourceName::BillingPlatform => "billing_platform",
        }
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-source amounts for one org/day. An absent source means it reported
/// nothing for that day, which comparisons treat as 0.
pub type AmountsBySource = BTreeMap<SourceName, i64>;

/// One flagged day inside a discrepancy report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayAmounts {
    pub day: NaiveDate,
    pub amounts: AmountsBySource,
}

/// All disagreeing days for one org within a reconciliation window, plus the
/// per-source totals over the whole window (including days that matched).
///
/// Produced fresh each cycle and handed straight to a sink; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscrepancyReport {
    pub org: Org,
    /// Flagged days in ascending date order.
    pub days: Vec<DayAmounts>,
    pub total: AmountsBySource,
}

/// Read one source's amount, with absent treated as 0.
pub fn amount_or_zero(amounts: &AmountsBySource, source: SourceName) -> i64 {
    amounts.get(&source).copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_name_display_order_matches_variant_order() {
        let mut names = vec![
            SourceName::BillingPlatform,
            SourceName::Warehouse,
            SourceName::TransactionalDb,
        ];
        names.sort();
        assert_eq!(
            names,
            vec![
                SourceName::Warehouse,
                SourceName::TransactionalDb,
                SourceName::BillingPlatform,
            ]
        );
    }

    #[test]
    fn source_name_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&SourceName::TransactionalDb).unwrap(),
            "\"transactional_db\""
        );
        assert_eq!(SourceName::BillingPlatform.as_str(), "billing_platform");
        assert_eq!(SourceName::Warehouse.to_string(), "warehouse");
    }

    #[test]
    fn absent_sources_read_as_zero() {
        let amounts = AmountsBySource::from([(SourceName::Warehouse, 42)]);
        assert_eq!(amount_or_zero(&amounts, SourceName::Warehouse), 42);
        assert_eq!(amount_or_zero(&amounts, SourceName::BillingPlatform), 0);
    }
}
