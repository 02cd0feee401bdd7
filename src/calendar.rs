//! Trading Calendar
//!
//! Classifies calendar dates as weekend, holiday or session day and produces
//! the weekly expiry series. Pure computation: no I/O, no wall-clock.
//!
//! Holidays follow the US federal calendar (the same rule table exchanges
//! publish their closures from): fixed-date holidays shift to the nearest
//! weekday, floating holidays land on the n-th / last weekday of the month.

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::collections::BTreeSet;
use std::fmt;

// =============================================================================
// Day classification
// =============================================================================

/// How a single calendar date is treated by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DayKind {
    /// Saturday or Sunday.
    Weekend,
    /// A weekday present in the holiday set.
    Holiday,
    /// Neither weekend nor holiday: rows are generated for this day.
    SessionDay,
}

impl DayKind {
    #[inline]
    pub fn is_session_day(self) -> bool {
        self == DayKind::SessionDay
    }
}

impl fmt::Display for DayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayKind::Weekend => write!(f, "weekend"),
            DayKind::Holiday => write!(f, "holiday"),
            DayKind::SessionDay => write!(f, "session day"),
        }
    }
}

#[inline]
pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Classify a date. Weekend wins over holiday so every date lands in exactly
/// one bucket; a holiday falling on a weekend is still excluded from expiries
/// through `HolidaySet::contains`.
pub fn classify(date: NaiveDate, holidays: &HolidaySet) -> DayKind {
    if is_weekend(date) {
        DayKind::Weekend
    } else if holidays.contains(date) {
        DayKind::Holiday
    } else {
        DayKind::SessionDay
    }
}

// =============================================================================
// Holiday set
// =============================================================================

/// Holidays observed inside a closed date range, computed once up front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolidaySet {
    dates: BTreeSet<NaiveDate>,
}

impl HolidaySet {
    /// Observed US federal holidays in `[start, end]`. An inverted range
    /// yields an empty set.
    pub fn us_federal(start: NaiveDate, end: NaiveDate) -> Self {
        if start > end {
            return Self::default();
        }

        // Observed New Year's Day can fall on Dec 31 of the prior year, so
        // generate one year on each side and clip.
        let dates = (start.year() - 1..=end.year() + 1)
            .flat_map(us_federal_holidays)
            .filter(|d| *d >= start && *d <= end)
            .collect();

        Self { dates }
    }

    /// Build a set from explicit dates (exchange-specific closures, tests).
    pub fn from_dates<I: IntoIterator<Item = NaiveDate>>(dates: I) -> Self {
        Self {
            dates: dates.into_iter().collect(),
        }
    }

    #[inline]
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.dates.iter().copied()
    }
}

/// Observed federal holidays for one year.
fn us_federal_holidays(year: i32) -> Vec<NaiveDate> {
    let mut out = Vec::with_capacity(11);

    let mut fixed = |month: u32, day: u32| {
        if let Some(d) = NaiveDate::from_ymd_opt(year, month, day) {
            out.push(nearest_workday(d));
        }
    };
    fixed(1, 1); // New Year's Day
    fixed(7, 4); // Independence Day
    fixed(11, 11); // Veterans Day
    fixed(12, 25); // Christmas
    if year >= 2021 {
        fixed(6, 19); // Juneteenth
    }

    let floating = [
        (1, Weekday::Mon, 3),  // Martin Luther King Jr. Day
        (2, Weekday::Mon, 3),  // Washington's Birthday
        (9, Weekday::Mon, 1),  // Labor Day
        (10, Weekday::Mon, 2), // Columbus Day
        (11, Weekday::Thu, 4), // Thanksgiving
    ];
    for (month, weekday, n) in floating {
        if month == 1 && year < 1986 {
            continue;
        }
        if let Some(d) = NaiveDate::from_weekday_of_month_opt(year, month, weekday, n) {
            out.push(d);
        }
    }

    if let Some(d) = last_weekday_of_month(year, 5, Weekday::Mon) {
        out.push(d); // Memorial Day
    }

    out
}

/// Saturday holidays are observed on Friday, Sunday holidays on Monday.
fn nearest_workday(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut d = first_of_next.pred_opt()?;
    while d.weekday() != weekday {
        d = d.pred_opt()?;
    }
    Some(d)
}

// =============================================================================
// Expiry series
// =============================================================================

/// First date strictly after `date` that falls on `target`.
pub fn next_weekday_match(date: NaiveDate, target: Weekday) -> NaiveDate {
    let ahead = (target.num_days_from_monday() as i64
        - date.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    let ahead = if ahead == 0 { 7 } else { ahead };
    date + Duration::days(ahead)
}

/// Unbounded, strictly increasing sequence of `target` weekdays after a start
/// date, with holidays skipped. Bound it with `take(n)` at the call site.
#[derive(Debug, Clone)]
pub struct ExpirySeries<'a> {
    cursor: NaiveDate,
    target: Weekday,
    holidays: &'a HolidaySet,
}

impl<'a> ExpirySeries<'a> {
    pub fn new(from: NaiveDate, target: Weekday, holidays: &'a HolidaySet) -> Self {
        Self {
            cursor: from,
            target,
            holidays,
        }
    }
}

impl Iterator for ExpirySeries<'_> {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        loop {
            self.cursor = next_weekday_match(self.cursor, self.target);
            if !self.holidays.contains(self.cursor) {
                return Some(self.cursor);
            }
        }
    }
}

/// Shorthand for the bounded prefix the orchestrator needs per day.
pub fn expiry_series(
    from: NaiveDate,
    target: Weekday,
    holidays: &HolidaySet,
    count: usize,
) -> Vec<NaiveDate> {
    ExpirySeries::new(from, target, holidays).take(count).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_us_federal_holidays_2024() {
        let set = HolidaySet::us_federal(d(2024, 1, 1), d(2024, 12, 31));
        let expected = [
            d(2024, 1, 1),
            d(2024, 1, 15),
            d(2024, 2, 19),
            d(2024, 5, 27),
            d(2024, 6, 19),
            d(2024, 7, 4),
            d(2024, 9, 2),
            d(2024, 10, 14),
            d(2024, 11, 11),
            d(2024, 11, 28),
            d(2024, 12, 25),
        ];
        assert_eq!(set.iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_observed_shift() {
        // July 4 2026 is a Saturday, observed Friday the 3rd.
        let set = HolidaySet::us_federal(d(2026, 7, 1), d(2026, 7, 31));
        assert!(set.contains(d(2026, 7, 3)));
        assert!(!set.contains(d(2026, 7, 4)));

        // Jan 1 2022 is a Saturday, observed Dec 31 2021.
        let set = HolidaySet::us_federal(d(2021, 12, 1), d(2022, 1, 31));
        assert!(set.contains(d(2021, 12, 31)));
    }

    #[test]
    fn test_range_is_clipped() {
        let set = HolidaySet::us_federal(d(2024, 7, 5), d(2024, 8, 30));
        assert!(set.is_empty());

        let inverted = HolidaySet::us_federal(d(2024, 12, 31), d(2024, 1, 1));
        assert!(inverted.is_empty());
    }

    #[test]
    fn test_classify_partitions_range() {
        let start = d(2024, 1, 1);
        let end = d(2024, 3, 31);
        let set = HolidaySet::us_federal(start, end);

        let mut cur = start;
        let (mut weekend, mut holiday, mut session) = (0, 0, 0);
        while cur <= end {
            match classify(cur, &set) {
                DayKind::Weekend => {
                    assert!(is_weekend(cur));
                    weekend += 1;
                }
                DayKind::Holiday => {
                    assert!(!is_weekend(cur) && set.contains(cur));
                    holiday += 1;
                }
                DayKind::SessionDay => {
                    assert!(!is_weekend(cur) && !set.contains(cur));
                    session += 1;
                }
            }
            cur = cur.succ_opt().unwrap();
        }
        assert_eq!(weekend + holiday + session, 91);
        assert_eq!(holiday, 3);
    }

    #[test]
    fn test_next_weekday_match_is_strict() {
        // 2024-01-05 is a Friday
        assert_eq!(next_weekday_match(d(2024, 1, 5), Weekday::Fri), d(2024, 1, 12));
        assert_eq!(next_weekday_match(d(2024, 1, 4), Weekday::Fri), d(2024, 1, 5));
        assert_eq!(next_weekday_match(d(2024, 1, 6), Weekday::Fri), d(2024, 1, 12));
        assert_eq!(next_weekday_match(d(2024, 1, 6), Weekday::Mon), d(2024, 1, 8));
    }

    #[test]
    fn test_expiry_series_skips_holidays() {
        // Dec 25 2026 and Jan 1 2027 are both Fridays.
        let set = HolidaySet::us_federal(d(2026, 12, 1), d(2027, 2, 28));
        let series = expiry_series(d(2026, 12, 14), Weekday::Fri, &set, 4);
        assert_eq!(
            series,
            vec![d(2026, 12, 18), d(2027, 1, 8), d(2027, 1, 15), d(2027, 1, 22)]
        );
    }

    #[test]
    fn test_expiry_series_properties() {
        let set = HolidaySet::from_dates([d(2024, 1, 12), d(2024, 1, 19), d(2024, 2, 2)]);
        let series: Vec<_> = ExpirySeries::new(d(2024, 1, 2), Weekday::Fri, &set)
            .take(20)
            .collect();

        assert_eq!(series.len(), 20);
        assert!(series.iter().all(|e| e.weekday() == Weekday::Fri));
        assert!(series.iter().all(|e| !set.contains(*e)));
        assert!(series.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(series[0], d(2024, 1, 5));
        assert_eq!(series[1], d(2024, 1, 26));
    }

    #[test]
    fn test_empty_holiday_set() {
        let set = HolidaySet::default();
        let series = expiry_series(d(2024, 1, 1), Weekday::Fri, &set, 3);
        assert_eq!(series, vec![d(2024, 1, 5), d(2024, 1, 12), d(2024, 1, 19)]);
    }
}
