use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};

/// Half-open `[start, end)` range a reconciliation cycle evaluates.
///
/// Both bounds are UTC-midnight aligned by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReconcileWindow {
    /// The standard check window: the trailing two complete days,
    /// `[floor(now - 2d), ceil(now - 1d))`.
    ///
    /// Warehouse and billing-platform ingestion both lag, so the current
    /// (incomplete) day is never part of the window.
    pub fn trailing_days(now: DateTime<Utc>) -> Self {
        Self {
            start: floor_to_day(now - Duration::days(2)),
            end: ceil_to_day(now - Duration::days(1)),
        }
    }

    /// The calendar month containing `date`, with the end clamped to the
    /// start of today when the month is still in progress.
    pub fn month_of(date: NaiveDate, now: DateTime<Utc>) -> Self {
        let today = floor_to_day(now).date_naive();
        let first = date.with_day(1).unwrap_or(date);
        let next_month = first.checked_add_months(Months::new(1)).unwrap_or(today);

        Self {
            start: day_start(first),
            end: day_start(next_month.min(today)),
        }
    }

    /// Every calendar day in the window, ascending. Empty when `end <= start`.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start
            .date_naive()
            .iter_days()
            .take_while(move |d| day_start(*d) < end)
    }
}

impl std::fmt::Display for ReconcileWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

/// Midnight UTC at the start of `day`.
pub fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// `ts` truncated to the start of its UTC day.
pub fn floor_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    day_start(ts.date_naive())
}

/// The next UTC midnight at or after `ts`. A timestamp already on a midnight
/// is returned unchanged.
pub fn ceil_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floored = floor_to_day(ts);
    if floored == ts {
        ts
    } else {
        floored + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[rstest]
    #[case::midday(utc(2024, 1, 15, 13, 45, 10), date(2024, 1, 15), date(2024, 1, 16))]
    #[case::exact_midnight(utc(2024, 1, 15, 0, 0, 0), date(2024, 1, 15), date(2024, 1, 15))]
    #[case::one_second_past(utc(2024, 1, 15, 0, 0, 1), date(2024, 1, 15), date(2024, 1, 16))]
    #[case::year_boundary(utc(2024, 12, 31, 23, 59, 59), date(2024, 12, 31), date(2025, 1, 1))]
    fn floor_and_ceil(
        #[case] ts: DateTime<Utc>,
        #[case] floor: NaiveDate,
        #[case] ceil: NaiveDate,
    ) {
        assert_eq!(floor_to_day(ts), day_start(floor));
        assert_eq!(ceil_to_day(ts), day_start(ceil));
    }

    #[test]
    fn trailing_days_covers_two_full_days() {
        let now = utc(2024, 1, 15, 9, 30, 0);
        let window = ReconcileWindow::trailing_days(now);

        assert_eq!(window.start, utc(2024, 1, 13, 0, 0, 0));
        assert_eq!(window.end, utc(2024, 1, 15, 0, 0, 0));
        assert_eq!(
            window.days().collect::<Vec<_>>(),
            vec![date(2024, 1, 13), date(2024, 1, 14)]
        );
    }

    #[test]
    fn trailing_days_at_exact_midnight() {
        // ceil(now - 1d) is a no-op at midnight, leaving a one-day window.
        let now = utc(2024, 1, 15, 0, 0, 0);
        let window = ReconcileWindow::trailing_days(now);

        assert_eq!(window.start, utc(2024, 1, 13, 0, 0, 0));
        assert_eq!(window.end, utc(2024, 1, 14, 0, 0, 0));
        assert_eq!(window.days().collect::<Vec<_>>(), vec![date(2024, 1, 13)]);
    }

    #[test]
    fn month_of_past_month() {
        let now = utc(2024, 3, 10, 12, 0, 0);
        let window = ReconcileWindow::month_of(date(2024, 2, 14), now);

        assert_eq!(window.start, utc(2024, 2, 1, 0, 0, 0));
        assert_eq!(window.end, utc(2024, 3, 1, 0, 0, 0));
        assert_eq!(window.days().count(), 29);
    }

    #[test]
    fn month_of_current_month_clamps_to_today() {
        let now = utc(2024, 3, 10, 12, 0, 0);
        let window = ReconcileWindow::month_of(date(2024, 3, 4), now);

        assert_eq!(window.start, utc(2024, 3, 1, 0, 0, 0));
        assert_eq!(window.end, utc(2024, 3, 10, 0, 0, 0));
        assert_eq!(window.days().count(), 9);
    }

    #[test]
    fn month_of_future_month_is_empty() {
        let now = utc(2024, 3, 10, 12, 0, 0);
        let window = ReconcileWindow::month_of(date(2024, 6, 1), now);

        assert!(window.end <= window.start);
        assert_eq!(window.days().count(), 0);
    }

    #[test]
    fn window_display() {
        let window = ReconcileWindow::trailing_days(utc(2024, 1, 15, 9, 0, 0));
        assert_eq!(window.to_string(), "[2024-01-13, 2024-01-15)");
    }
}
