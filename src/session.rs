//! Session Time-Stepper
//!
//! Enumerates the snapshot timestamps of one trading day: `open`,
//! `open + step`, ... up to and including `close` when it aligns.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use std::fmt;

/// Errors building a session clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `open` is later than `close`.
    InvertedSession { open: NaiveTime, close: NaiveTime },
    /// Step must be strictly positive.
    NonPositiveStep,
    /// The wall-clock time does not exist in the zone (DST gap).
    NonexistentLocalTime { at: NaiveDateTime, tz: Tz },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvertedSession { open, close } => {
                write!(f, "session open {} is after close {}", open, close)
            }
            Self::NonPositiveStep => write!(f, "session step must be positive"),
            Self::NonexistentLocalTime { at, tz } => {
                write!(f, "local time {} does not exist in {}", at, tz.name())
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// One trading day's stepping parameters, resolved to absolute instants.
#[derive(Debug, Clone)]
pub struct SessionClock {
    day: NaiveDate,
    open: DateTime<Tz>,
    close: DateTime<Tz>,
    step: Duration,
}

impl SessionClock {
    pub fn new(
        day: NaiveDate,
        open: NaiveTime,
        close: NaiveTime,
        step: Duration,
        tz: Tz,
    ) -> Result<Self, SessionError> {
        if open > close {
            return Err(SessionError::InvertedSession { open, close });
        }
        if step <= Duration::zero() {
            return Err(SessionError::NonPositiveStep);
        }

        Ok(Self {
            day,
            open: localize(day.and_time(open), tz)?,
            close: localize(day.and_time(close), tz)?,
            step,
        })
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn open(&self) -> DateTime<Tz> {
        self.open
    }

    pub fn close(&self) -> DateTime<Tz> {
        self.close
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// `floor((close - open) / step) + 1`, the length of `timestamps()`.
    pub fn step_count(&self) -> u64 {
        let span = self.close - self.open;
        match (span.num_nanoseconds(), self.step.num_nanoseconds()) {
            (Some(span), Some(step)) => (span / step) as u64 + 1,
            // Step longer than ~292 years: only `open` fits
            (Some(_), None) => 1,
            _ => (span.num_milliseconds() / self.step.num_milliseconds().max(1)) as u64 + 1,
        }
    }

    pub fn timestamps(&self) -> SessionTimestamps {
        SessionTimestamps {
            current: Some(self.open),
            close: self.close,
            step: self.step,
        }
    }
}

/// Iterator returned by [`SessionClock::timestamps`].
#[derive(Debug, Clone)]
pub struct SessionTimestamps {
    current: Option<DateTime<Tz>>,
    close: DateTime<Tz>,
    step: Duration,
}

impl Iterator for SessionTimestamps {
    type Item = DateTime<Tz>;

    fn next(&mut self) -> Option<DateTime<Tz>> {
        let ts = self.current.filter(|ts| *ts <= self.close)?;
        self.current = ts.checked_add_signed(self.step);
        Some(ts)
    }
}

/// Resolve a wall-clock time in `tz`. Ambiguous times (DST fall-back) take
/// the earlier instant.
pub fn localize(at: NaiveDateTime, tz: Tz) -> Result<DateTime<Tz>, SessionError> {
    tz.from_local_datetime(&at)
        .earliest()
        .ok_or(SessionError::NonexistentLocalTime { at, tz })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::America::Chicago;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 12).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_regular_session_five_minutes() {
        let clock = SessionClock::new(day(), t(8, 30), t(15, 0), Duration::minutes(5), Chicago)
            .unwrap();
        let stamps: Vec<_> = clock.timestamps().collect();

        assert_eq!(clock.step_count(), 79);
        assert_eq!(stamps.len(), 79);
        assert_eq!(stamps[0].time(), t(8, 30));
        assert_eq!(stamps[78].time(), t(15, 0));
        assert!(stamps.windows(2).all(|w| w[1] - w[0] == Duration::minutes(5)));
    }

    #[test]
    fn test_unaligned_close_is_not_emitted() {
        let clock = SessionClock::new(day(), t(8, 30), t(15, 0), Duration::hours(1), Chicago)
            .unwrap();
        let stamps: Vec<_> = clock.timestamps().collect();

        assert_eq!(clock.step_count(), 7);
        assert_eq!(stamps.len(), 7);
        assert_eq!(stamps.last().unwrap().hour(), 14);
        assert_eq!(stamps.last().unwrap().minute(), 30);
    }

    #[test]
    fn test_count_matches_iterator_for_various_steps() {
        for minutes in [1, 7, 13, 30, 45, 390, 400] {
            let clock = SessionClock::new(
                day(),
                t(8, 30),
                t(15, 0),
                Duration::minutes(minutes),
                Chicago,
            )
            .unwrap();
            assert_eq!(clock.timestamps().count() as u64, clock.step_count());
        }
    }

    #[test]
    fn test_count_matches_iterator_for_sub_millisecond_steps() {
        for micros in [1500, 999, 333, 2001] {
            let clock = SessionClock::new(
                day(),
                t(8, 30),
                t(8, 31),
                Duration::microseconds(micros),
                Chicago,
            )
            .unwrap();
            assert_eq!(clock.timestamps().count() as u64, clock.step_count());
        }
        let clock =
            SessionClock::new(day(), t(8, 30), t(8, 31), Duration::microseconds(1500), Chicago)
                .unwrap();
        assert_eq!(clock.step_count(), 40_001);
    }

    #[test]
    fn test_open_equals_close() {
        let clock = SessionClock::new(day(), t(9, 0), t(9, 0), Duration::minutes(5), Chicago)
            .unwrap();
        assert_eq!(clock.timestamps().count(), 1);
        assert_eq!(clock.step_count(), 1);
    }

    #[test]
    fn test_invalid_parameters() {
        assert_eq!(
            SessionClock::new(day(), t(15, 0), t(8, 30), Duration::minutes(5), Chicago)
                .unwrap_err(),
            SessionError::InvertedSession {
                open: t(15, 0),
                close: t(8, 30)
            }
        );
        assert_eq!(
            SessionClock::new(day(), t(8, 30), t(15, 0), Duration::zero(), Chicago).unwrap_err(),
            SessionError::NonPositiveStep
        );
    }

    #[test]
    fn test_dst_gap_is_reported() {
        // 2024-03-10 02:30 does not exist in Chicago
        let dst_day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let err = SessionClock::new(dst_day, t(2, 30), t(3, 30), Duration::minutes(5), Chicago)
            .unwrap_err();
        assert!(matches!(err, SessionError::NonexistentLocalTime { .. }));
    }
}
