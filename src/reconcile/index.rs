use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::models::{AmountsBySource, BILLABLE_UNIT, SourceName, UsageRecord};

/// Ephemeral merged view of every source's usage, keyed by org internal id
/// and day. Built fresh for each reconciliation, never persisted.
#[derive(Debug, Default)]
pub struct AggregateIndex {
    entries: BTreeMap<String, BTreeMap<NaiveDate, AmountsBySource>>,
}

impl AggregateIndex {
    /// The per-source amounts recorded for one org/day, if any source
    /// reported anything. A returned map is never empty.
    pub fn day_amounts(&self, org_ref: &str, day: NaiveDate) -> Option<&AmountsBySource> {
        self.entries.get(org_ref)?.get(&day)
    }

    #[allow(dead_code)] // Only the tests look at emptiness so far.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Merge per-source record sequences into a single `(org, day)` view.
///
/// Pure function, no I/O. Records whose unit is not [`BILLABLE_UNIT`] are
/// dropped, not errored. Adapters sum server-side, so duplicate
/// `(org, day, source)` records do not normally occur; if one slips through,
/// the later record wins.
pub fn index(records_by_source: &BTreeMap<SourceName, Vec<UsageRecord>>) -> AggregateIndex {
    let mut entries: BTreeMap<String, BTreeMap<NaiveDate, AmountsBySource>> = BTreeMap::new();

    for (source, records) in records_by_source {
        for record in records {
            if record.unit != BILLABLE_UNIT {
                continue;
            }
            entries
                .entry(record.org_ref.clone())
                .or_default()
                .entry(record.day)
                .or_default()
                .insert(*source, record.amount);
        }
    }

    AggregateIndex { entries }
}
