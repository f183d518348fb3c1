use crate::config::DiscrepancyPolicy;
use crate::models::{
    AmountsBySource, DayAmounts, DiscrepancyReport, Org, SourceName, amount_or_zero,
};
use crate::reconcile::index::AggregateIndex;
use crate::reconcile::window::ReconcileWindow;

/// Compare every source's view of every org/day in the window and report
/// the orgs where they disagree.
///
/// Days with no data in any source are skipped outright: an org that never
/// reported usage is silent everywhere, which is agreement, not a
/// discrepancy. Once at least one source has an amount for a day, the other
/// sources are read as zero and the day is flagged unless all three match.
///
/// Window totals always cover every day that had data, flagged or not, so a
/// report shows how much the sources diverge overall and not just on the bad
/// days. Under [`DiscrepancyPolicy::DayOrTotal`] a report is also emitted
/// when only the totals disagree.
///
/// Pure function: same inputs, same reports. Orgs come out in input order,
/// days in ascending order within each report.
pub fn detect(
    orgs: &[Org],
    index: &AggregateIndex,
    window: &ReconcileWindow,
    policy: DiscrepancyPolicy,
) -> Vec<DiscrepancyReport> {
    let mut reports = Vec::new();

    for org in orgs {
        let mut days = Vec::new();
        let mut total = AmountsBySource::new();
        let mut saw_data = false;

        for day in window.days() {
            let Some(day_amounts) = index.day_amounts(&org.internal_id, day) else {
                continue;
            };
            saw_data = true;

            for (source, amount) in day_amounts {
                *total.entry(*source).or_insert(0) += amount;
            }

            if !sources_agree(day_amounts) {
                days.push(DayAmounts {
                    day,
                    amounts: fill_missing_sources(day_amounts),
                });
            }
        }

        let emit = match policy {
            DiscrepancyPolicy::PerDay => !days.is_empty(),
            DiscrepancyPolicy::DayOrTotal => {
                !days.is_empty() || (saw_data && !sources_agree(&total))
            }
        };

        if emit {
            reports.push(DiscrepancyReport {
                org: org.clone(),
                days,
                total: fill_missing_sources(&total),
            });
        }
    }

    reports
}

/// Whether all three sources read the same, with absent sources read as zero.
fn sources_agree(amounts: &AmountsBySource) -> bool {
    let mut readings = SourceName::ALL
        .iter()
        .map(|source| amount_or_zero(amounts, *source));
    match readings.next() {
        Some(first) => readings.all(|amount| amount == first),
        None => true,
    }
}

/// Emitted rows carry an explicit zero for a silent source rather than
/// omitting it, so report consumers never have to guess.
fn fill_missing_sources(amounts: &AmountsBySource) -> AmountsBySource {
    SourceName::ALL
        .iter()
        .map(|source| (*source, amount_or_zero(amounts, *source)))
        .collect()
}
