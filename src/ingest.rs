//! Ingest Orchestrator
//!
//! Walks a date range day by day, skips weekends and holidays, and for every
//! session timestamp generates one chain snapshot and hands it to the bulk
//! loader. Each day is committed once.
//!
//! Failures are isolated: a failed insert loses that timestamp only, a failed
//! commit loses that day only, and the run continues. Rows staged on a
//! connection that drops mid-day are gone with it; they are counted as lost,
//! never as committed. Progress and failures
//! go to an [`IngestObserver`]; the orchestrator itself does no I/O besides
//! the loader.

use crate::calendar::{classify, expiry_series, DayKind, HolidaySet};
use crate::config::Settings;
use crate::generator::generate_for_ts;
use crate::loader::{BulkLoader, LoadError};
use crate::pricing::{pricing_columns, PRICING_TABLE};
use crate::session::{SessionClock, SessionError};
use crate::store::Connector;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, info, warn};

// =============================================================================
// Plan
// =============================================================================

/// Everything one run needs, resolved from settings and CLI arguments.
#[derive(Debug, Clone)]
pub struct IngestPlan {
    pub fund: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub step: Duration,
    pub tz: Tz,
    pub num_expiries: usize,
    pub num_strikes: usize,
    pub expiry_weekday: Weekday,
    pub table: String,
}

impl IngestPlan {
    /// Plan with the default session and chain shape.
    pub fn new(fund: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        let settings = Settings::default();
        Self {
            fund: fund.into(),
            start,
            end,
            open: settings.session.open,
            close: settings.session.close,
            step: Duration::minutes(5),
            tz: settings.session.tz,
            num_expiries: settings.chain.num_expiries,
            num_strikes: settings.chain.num_strikes,
            expiry_weekday: settings.chain.expiry_weekday,
            table: PRICING_TABLE.to_string(),
        }
    }

    pub fn from_settings(
        fund: impl Into<String>,
        start: NaiveDate,
        end: NaiveDate,
        settings: &Settings,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            fund: fund.into(),
            start,
            end,
            open: settings.session.open,
            close: settings.session.close,
            step: settings.session.step()?,
            tz: settings.session.tz,
            num_expiries: settings.chain.num_expiries,
            num_strikes: settings.chain.num_strikes,
            expiry_weekday: settings.chain.expiry_weekday,
            table: settings.chain.table.clone(),
        })
    }

    /// Session days for which a snapshot is loaded, given `holidays`.
    pub fn session_days<'a>(
        &'a self,
        holidays: &'a HolidaySet,
    ) -> impl Iterator<Item = NaiveDate> + 'a {
        self.start
            .iter_days()
            .take_while(move |d| *d <= self.end)
            .filter(move |d| classify(*d, holidays).is_session_day())
    }

    /// Holidays over the range plus the expiry look-ahead, so expiries past
    /// `end` are filtered too. Every skipped holiday pushes the series out
    /// by a week, hence the doubled window.
    pub fn holiday_set(&self) -> HolidaySet {
        let weeks = 2 * self.num_expiries as i64 + 2;
        let horizon = self
            .end
            .checked_add_signed(Duration::weeks(weeks))
            .unwrap_or(NaiveDate::MAX);
        HolidaySet::us_federal(self.start, horizon)
    }

    fn validate(&self) -> Result<(), SessionError> {
        SessionClock::new(self.start, self.open, self.close, self.step, Tz::UTC).map(|_| ())
    }
}

// =============================================================================
// Observer
// =============================================================================

/// A failure the orchestrator absorbed and moved past.
#[derive(Debug)]
pub enum IngestFailure {
    Insert {
        ts: DateTime<Tz>,
        error: LoadError,
    },
    Commit {
        day: NaiveDate,
        error: LoadError,
    },
    /// A reconnect discarded rows staged earlier in the day.
    Lost {
        day: NaiveDate,
        timestamps: u64,
        rows: u64,
    },
    Session {
        day: NaiveDate,
        error: SessionError,
    },
}

impl IngestFailure {
    pub fn day(&self) -> NaiveDate {
        match self {
            Self::Insert { ts, .. } => ts.date_naive(),
            Self::Commit { day, .. } | Self::Lost { day, .. } | Self::Session { day, .. } => {
                *day
            }
        }
    }
}

impl fmt::Display for IngestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert { ts, error } => write!(f, "insert for {} failed: {}", ts, error),
            Self::Commit { day, error } => write!(f, "commit for {} failed: {}", day, error),
            Self::Lost {
                day,
                timestamps,
                rows,
            } => write!(
                f,
                "{} rows from {} timestamps of {} were lost with the connection",
                rows, timestamps, day
            ),
            Self::Session { day, error } => write!(f, "no session for {}: {}", day, error),
        }
    }
}

/// Outcome of one session day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayReport {
    pub day: NaiveDate,
    /// Copied and still staged on the live connection at commit time.
    pub timestamps_loaded: u64,
    pub timestamps_failed: u64,
    /// Copied, then discarded by a reconnect.
    pub timestamps_lost: u64,
    pub rows_copied: u64,
    pub rows_lost: u64,
    pub rows_committed: u64,
    pub committed: bool,
}

impl DayReport {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            timestamps_loaded: 0,
            timestamps_failed: 0,
            timestamps_lost: 0,
            rows_copied: 0,
            rows_lost: 0,
            rows_committed: 0,
            committed: false,
        }
    }
}

/// Receives run events. Implementations must not block; every method
/// defaults to a no-op.
pub trait IngestObserver {
    fn on_day_start(&mut self, _day: NaiveDate, _timestamps: u64) {}

    fn on_progress(&mut self, _ts: DateTime<Tz>, _done: u64, _total: u64) {}

    fn on_day_skipped(&mut self, _day: NaiveDate, _kind: DayKind) {}

    fn on_error(&mut self, _failure: &IngestFailure) {}

    fn on_day_complete(&mut self, _report: &DayReport) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl IngestObserver for NullObserver {}

/// Turns run events into log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl IngestObserver for TracingObserver {
    fn on_day_start(&mut self, day: NaiveDate, timestamps: u64) {
        info!(%day, timestamps, "loading day");
    }

    fn on_progress(&mut self, ts: DateTime<Tz>, done: u64, total: u64) {
        debug!(%ts, "{}/{}", done, total);
    }

    fn on_day_skipped(&mut self, day: NaiveDate, kind: DayKind) {
        info!(%day, reason = %kind, "skipping day");
    }

    fn on_error(&mut self, failure: &IngestFailure) {
        match failure {
            IngestFailure::Insert { .. }
            | IngestFailure::Commit { .. }
            | IngestFailure::Lost { .. } => error!(day = %failure.day(), "{}", failure),
            IngestFailure::Session { .. } => warn!(day = %failure.day(), "{}", failure),
        }
    }

    fn on_day_complete(&mut self, report: &DayReport) {
        info!(
            day = %report.day,
            loaded = report.timestamps_loaded,
            failed = report.timestamps_failed,
            lost = report.timestamps_lost,
            rows = report.rows_committed,
            committed = report.committed,
            "day complete"
        );
    }
}

// =============================================================================
// Run
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub days_loaded: u64,
    pub days_skipped: u64,
    pub days_failed: u64,
    pub timestamps_loaded: u64,
    pub timestamps_failed: u64,
    pub timestamps_lost: u64,
    pub failed_commits: u64,
    pub rows_copied: u64,
    pub rows_lost: u64,
    pub rows_committed: u64,
}

impl IngestSummary {
    fn absorb(&mut self, report: &DayReport) {
        self.timestamps_loaded += report.timestamps_loaded;
        self.timestamps_failed += report.timestamps_failed;
        self.timestamps_lost += report.timestamps_lost;
        self.rows_copied += report.rows_copied;
        self.rows_lost += report.rows_lost;
        self.rows_committed += report.rows_committed;
        if report.committed {
            self.days_loaded += 1;
        } else {
            self.days_failed += 1;
            self.failed_commits += 1;
        }
    }
}

/// Load `plan` through `loader`. Only an unusable plan (inverted session,
/// non-positive step) is an error; store failures are reported to `observer`
/// and counted in the summary.
pub fn run<C, R, O>(
    loader: &mut BulkLoader<C>,
    plan: &IngestPlan,
    rng: &mut R,
    observer: &mut O,
) -> anyhow::Result<IngestSummary>
where
    C: Connector,
    R: Rng,
    O: IngestObserver + ?Sized,
{
    plan.validate()?;

    let holidays = plan.holiday_set();
    let columns = pricing_columns();
    let mut summary = IngestSummary::default();

    for day in plan.start.iter_days().take_while(|d| *d <= plan.end) {
        let kind = classify(day, &holidays);
        if !kind.is_session_day() {
            summary.days_skipped += 1;
            observer.on_day_skipped(day, kind);
            continue;
        }

        let clock = match SessionClock::new(day, plan.open, plan.close, plan.step, plan.tz) {
            Ok(clock) => clock,
            Err(error) => {
                summary.days_failed += 1;
                observer.on_error(&IngestFailure::Session { day, error });
                continue;
            }
        };

        let report = load_day(loader, plan, &clock, &holidays, &columns, rng, observer);
        summary.absorb(&report);
        observer.on_day_complete(&report);
    }

    Ok(summary)
}

fn load_day<C, R, O>(
    loader: &mut BulkLoader<C>,
    plan: &IngestPlan,
    clock: &SessionClock,
    holidays: &HolidaySet,
    columns: &[String],
    rng: &mut R,
    observer: &mut O,
) -> DayReport
where
    C: Connector,
    R: Rng,
    O: IngestObserver + ?Sized,
{
    let day = clock.day();
    let expiries = expiry_series(day, plan.expiry_weekday, holidays, plan.num_expiries);
    let total = clock.step_count();
    let mut report = DayReport::new(day);
    let mut staged = Staged::default();
    let mut generation = loader.generation();

    observer.on_day_start(day, total);
    for (done, ts) in (1u64..).zip(clock.timestamps()) {
        let rows = generate_for_ts(rng, ts, &plan.fund, &expiries, plan.num_strikes);
        let result = loader.insert_batch(&plan.table, columns, rows);
        if loader.generation() != generation {
            generation = loader.generation();
            staged.discard(&mut report, observer);
        }
        match result {
            Ok(written) => {
                report.timestamps_loaded += 1;
                report.rows_copied += written;
                staged.timestamps += 1;
                staged.rows += written;
            }
            Err(error) => {
                report.timestamps_failed += 1;
                observer.on_error(&IngestFailure::Insert { ts, error });
            }
        }
        observer.on_progress(ts, done, total);
    }

    match loader.commit() {
        Ok(()) => {
            if loader.generation() != generation {
                staged.discard(&mut report, observer);
            }
            report.committed = true;
            report.rows_committed = staged.rows;
        }
        Err(error) => observer.on_error(&IngestFailure::Commit { day, error }),
    }
    report
}

/// Work copied on the current connection and not yet committed.
#[derive(Debug, Default)]
struct Staged {
    timestamps: u64,
    rows: u64,
}

impl Staged {
    /// The connection was replaced: move everything staged from loaded to lost.
    fn discard<O>(&mut self, report: &mut DayReport, observer: &mut O)
    where
        O: IngestObserver + ?Sized,
    {
        if self.timestamps == 0 {
            return;
        }
        report.timestamps_loaded -= self.timestamps;
        report.timestamps_lost += self.timestamps;
        report.rows_lost += self.rows;
        observer.on_error(&IngestFailure::Lost {
            day: report.day,
            timestamps: self.timestamps,
            rows: self.rows,
        });
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CopyValue, MemoryStore};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// 7 hourly stamps, 2 expiries, 2 strikes: 56 rows per day.
    fn small_plan(start: NaiveDate, end: NaiveDate) -> IngestPlan {
        IngestPlan {
            step: Duration::hours(1),
            num_expiries: 2,
            num_strikes: 2,
            ..IngestPlan::new("SPX", start, end)
        }
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Start(NaiveDate, u64),
        Progress(u64, u64),
        Skipped(NaiveDate, DayKind),
        Error(NaiveDate),
        Complete(NaiveDate, bool),
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    impl Recorder {
        fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
            self.events.iter().filter(|e| f(e)).count()
        }
    }

    impl IngestObserver for Recorder {
        fn on_day_start(&mut self, day: NaiveDate, timestamps: u64) {
            self.events.push(Event::Start(day, timestamps));
        }
        fn on_progress(&mut self, _ts: DateTime<Tz>, done: u64, total: u64) {
            self.events.push(Event::Progress(done, total));
        }
        fn on_day_skipped(&mut self, day: NaiveDate, kind: DayKind) {
            self.events.push(Event::Skipped(day, kind));
        }
        fn on_error(&mut self, failure: &IngestFailure) {
            self.events.push(Event::Error(failure.day()));
        }
        fn on_day_complete(&mut self, report: &DayReport) {
            self.events
                .push(Event::Complete(report.day, report.committed));
        }
    }

    fn run_plan(store: &MemoryStore, plan: &IngestPlan, seed: u64) -> (IngestSummary, Recorder) {
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut recorder = Recorder::default();
        let summary = run(&mut loader, plan, &mut rng, &mut recorder).unwrap();
        (summary, recorder)
    }

    #[test]
    fn test_weekend_and_holiday_are_skipped() {
        // Fri 12th, weekend, MLK Monday 15th, Tue 16th
        let store = MemoryStore::new();
        let plan = small_plan(d(2024, 1, 12), d(2024, 1, 16));
        let (summary, rec) = run_plan(&store, &plan, 1);

        assert_eq!(summary.days_loaded, 2);
        assert_eq!(summary.days_skipped, 3);
        assert_eq!(summary.timestamps_loaded, 14);
        assert_eq!(summary.rows_committed, 112);
        assert_eq!(store.committed_count(PRICING_TABLE), 112);

        let skipped: Vec<_> = rec
            .events
            .iter()
            .filter(|e| matches!(e, Event::Skipped(..)))
            .collect();
        assert_eq!(
            skipped,
            vec![
                &Event::Skipped(d(2024, 1, 13), DayKind::Weekend),
                &Event::Skipped(d(2024, 1, 14), DayKind::Weekend),
                &Event::Skipped(d(2024, 1, 15), DayKind::Holiday),
            ]
        );
        assert_eq!(rec.events[0], Event::Start(d(2024, 1, 12), 7));
        assert_eq!(rec.count(|e| matches!(e, Event::Progress(_, 7))), 14);
    }

    #[test]
    fn test_failed_inserts_do_not_stop_the_day() {
        let store = MemoryStore::new();
        store.reject_next_copies(2);
        let plan = small_plan(d(2024, 1, 16), d(2024, 1, 16));
        let (summary, rec) = run_plan(&store, &plan, 2);

        assert_eq!(summary.timestamps_failed, 2);
        assert_eq!(summary.timestamps_loaded, 5);
        assert_eq!(summary.days_loaded, 1);
        assert_eq!(store.committed_count(PRICING_TABLE), 5 * 8);
        assert_eq!(rec.count(|e| matches!(e, Event::Error(_))), 2);
        assert_eq!(rec.count(|e| matches!(e, Event::Progress(..))), 7);
    }

    #[test]
    fn test_failed_commit_does_not_stop_the_run() {
        let store = MemoryStore::new();
        store.reject_next_commits(1);
        let plan = small_plan(d(2024, 1, 16), d(2024, 1, 17));
        let (summary, rec) = run_plan(&store, &plan, 3);

        assert_eq!(summary.failed_commits, 1);
        assert_eq!(summary.days_failed, 1);
        assert_eq!(summary.days_loaded, 1);
        assert_eq!(summary.rows_copied, 112);
        assert_eq!(summary.rows_committed, 56);
        assert_eq!(store.committed_count(PRICING_TABLE), 56);
        assert!(rec
            .events
            .contains(&Event::Complete(d(2024, 1, 16), false)));
        assert!(rec.events.contains(&Event::Complete(d(2024, 1, 17), true)));
    }

    /// Arms a dropped connection right after the given timestamp is copied.
    struct DropAfter {
        store: MemoryStore,
        after: u64,
        inner: Recorder,
    }

    impl IngestObserver for DropAfter {
        fn on_progress(&mut self, ts: DateTime<Tz>, done: u64, total: u64) {
            if done == self.after {
                self.store.drop_connection_on_next_copies(1);
            }
            self.inner.on_progress(ts, done, total);
        }
        fn on_error(&mut self, failure: &IngestFailure) {
            self.inner.on_error(failure);
        }
    }

    #[test]
    fn test_reconnect_mid_day_counts_staged_rows_as_lost() {
        let store = MemoryStore::new();
        let plan = small_plan(d(2024, 1, 16), d(2024, 1, 16));
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let mut observer = DropAfter {
            store: store.clone(),
            after: 2,
            inner: Recorder::default(),
        };
        let summary = run(&mut loader, &plan, &mut rng, &mut observer).unwrap();

        assert_eq!(store.committed_count(PRICING_TABLE), 40);
        assert_eq!(summary.rows_committed, 40);
        assert_eq!(summary.rows_copied, 56);
        assert_eq!(summary.rows_lost, 16);
        assert_eq!(summary.timestamps_loaded, 5);
        assert_eq!(summary.timestamps_lost, 2);
        assert_eq!(summary.days_loaded, 1);
        assert_eq!(observer.inner.count(|e| matches!(e, Event::Error(_))), 1);
    }

    #[test]
    fn test_reconnect_during_commit_commits_nothing() {
        let store = MemoryStore::new();
        store.drop_connection_on_next_commits(1);
        let plan = small_plan(d(2024, 1, 16), d(2024, 1, 16));
        let (summary, rec) = run_plan(&store, &plan, 7);

        assert_eq!(store.committed_count(PRICING_TABLE), 0);
        assert_eq!(summary.days_loaded, 1);
        assert_eq!(summary.rows_committed, 0);
        assert_eq!(summary.rows_lost, 56);
        assert_eq!(summary.timestamps_loaded, 0);
        assert_eq!(summary.timestamps_lost, 7);
        assert_eq!(rec.count(|e| matches!(e, Event::Error(_))), 1);
    }

    #[test]
    fn test_expiries_skip_holidays_past_range_end() {
        // Juneteenth (Fri 2026-06-19) and observed July 4th (Fri 2026-07-03)
        let store = MemoryStore::new();
        let plan = IngestPlan {
            num_expiries: 3,
            num_strikes: 1,
            close: NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            ..IngestPlan::new("SPX", d(2026, 6, 15), d(2026, 6, 15))
        };
        run_plan(&store, &plan, 4);

        let mut expiries: Vec<CopyValue> = store
            .committed_rows(PRICING_TABLE)
            .into_iter()
            .map(|row| row[2].clone())
            .collect();
        expiries.dedup();
        assert_eq!(
            expiries,
            vec![
                CopyValue::Date(d(2026, 6, 26)),
                CopyValue::Date(d(2026, 7, 10)),
                CopyValue::Date(d(2026, 7, 17)),
            ]
        );
    }

    #[test]
    fn test_same_seed_same_rows() {
        let plan = small_plan(d(2024, 1, 16), d(2024, 1, 16));
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        run_plan(&a, &plan, 99);
        run_plan(&b, &plan, 99);
        assert_eq!(a.committed_rows(PRICING_TABLE), b.committed_rows(PRICING_TABLE));
    }

    #[test]
    fn test_inverted_session_is_rejected_up_front() {
        let store = MemoryStore::new();
        let plan = IngestPlan {
            open: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            ..small_plan(d(2024, 1, 16), d(2024, 1, 16))
        };
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        assert!(run(&mut loader, &plan, &mut rng, &mut NullObserver).is_err());
        assert_eq!(store.copy_attempts(), 0);
    }

    #[test]
    fn test_session_days() {
        let plan = small_plan(d(2024, 1, 12), d(2024, 1, 16));
        let holidays = plan.holiday_set();
        let days: Vec<_> = plan.session_days(&holidays).collect();
        assert_eq!(days, vec![d(2024, 1, 12), d(2024, 1, 16)]);
    }
}
