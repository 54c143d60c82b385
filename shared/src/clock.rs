//! Clock & Time-Window (C1).
//!
//! Grounded on `task_dispatcher.py`'s `_is_in_valid_time_range` /
//! `_get_next_valid_time_start`, with the inclusivity ambiguity resolved per the
//! design notes: inclusive-start, exclusive-end (see DESIGN.md).

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

/// `[start_hour, end_hour)` in local-day terms; `None` means unrestricted.
pub type TimeWindow = Option<(u8, u8)>;

/// Injectable source of "now", so scheduler tests can drive time without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        SystemClock
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// True iff `w` is `None`, or `start <= hour(t) < end`.
///
/// The spec's own §4.1 prose states the window inclusive at both ends; §9's open
/// question resolves the ambiguity explicitly in favour of a half-open window, which
/// is what this function implements. Keeping both ends inclusive would make
/// `hour == end` simultaneously "in window" and "past today's window" for the
/// next-window computation below, which cannot both be true.
pub fn in_window(t: DateTime<Utc>, w: TimeWindow) -> bool {
    match w {
        None => true,
        Some((start, end)) => {
            let hour = t.hour_of_day();
            hour >= start && hour < end
        }
    }
}

/// If `w` is `None`, returns `t` unchanged. Otherwise returns the `start:00:00` of
/// the same local day as `t` if `t`'s hour precedes `start`; otherwise the
/// `start:00:00` of the following day. Windows are same-day only; callers must not
/// pass an inverted range (`start >= end`).
pub fn next_window_start(t: DateTime<Utc>, w: TimeWindow) -> DateTime<Utc> {
    let Some((start, _end)) = w else {
        return t;
    };
    let start_time = NaiveTime::from_hms_opt(start as u32, 0, 0).expect("valid hour 0..=23");
    let today_start = Utc
        .from_utc_datetime(&t.date_naive().and_time(start_time));

    if t.hour_of_day() < start {
        today_start
    } else {
        today_start + Duration::days(1)
    }
}

trait HourOfDay {
    fn hour_of_day(&self) -> u8;
}

impl HourOfDay for DateTime<Utc> {
    fn hour_of_day(&self) -> u8 {
        use chrono::Timelike;
        self.time().hour() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 31, hour, 0, 0).unwrap()
    }

    #[test]
    fn unrestricted_window_always_in_range() {
        assert!(in_window(at(3), None));
        assert!(in_window(at(23), None));
    }

    #[test]
    fn inclusive_start_exclusive_end() {
        let w = Some((9, 18));
        assert!(in_window(at(9), w));
        assert!(in_window(at(17), w));
        assert!(!in_window(at(18), w));
        assert!(!in_window(at(8), w));
    }

    #[test]
    fn next_window_start_same_day_when_before_start() {
        let w = Some((9, 18));
        let next = next_window_start(at(3), w);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 7, 31, 9, 0, 0).unwrap());
    }

    #[test]
    fn next_window_start_following_day_when_at_or_past_end() {
        let w = Some((9, 18));
        let next = next_window_start(at(19), w);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap());
        let next_at_end = next_window_start(at(18), w);
        assert_eq!(next_at_end, Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).unwrap());
    }
}
