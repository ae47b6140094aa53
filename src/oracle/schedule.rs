//! Draw calendar and time source.
//!
//! The poller needs two answers: which draw should be next, and whether its
//! results can have been published yet. Both depend on "now", so time is read
//! through the [`Clock`] trait.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use std::sync::RwLock;

use crate::config::ScheduleConfig;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: RwLock::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Weekly draw calendar with a fixed publication delay.
#[derive(Debug, Clone)]
pub struct DrawSchedule {
    weekdays: Vec<Weekday>,
    availability_offset: Duration,
}

impl DrawSchedule {
    pub fn new(weekdays: Vec<Weekday>, availability_offset: Duration) -> Self {
        Self {
            weekdays,
            availability_offset,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(
            config.draw_weekdays.clone(),
            Duration::hours(config.availability_offset_hours),
        )
    }

    pub fn is_draw_day(&self, date: NaiveDate) -> bool {
        self.weekdays.contains(&date.weekday())
    }

    /// First draw date strictly after `date`.
    pub fn next_draw_after(&self, date: NaiveDate) -> NaiveDate {
        (1..=7)
            .map(|days| date + Duration::days(days))
            .find(|d| self.is_draw_day(*d))
            .unwrap_or(date + Duration::days(7))
    }

    /// Latest draw date on or before `date`.
    pub fn latest_draw_on_or_before(&self, date: NaiveDate) -> NaiveDate {
        (0..7)
            .map(|days| date - Duration::days(days))
            .find(|d| self.is_draw_day(*d))
            .unwrap_or(date)
    }

    /// The draw the pipeline should be waiting for: the one after the latest
    /// stored draw, or the most recent scheduled one for an empty store.
    pub fn expected_after(&self, latest: Option<NaiveDate>, now: DateTime<Utc>) -> NaiveDate {
        match latest {
            Some(date) => self.next_draw_after(date),
            None => self.latest_draw_on_or_before(now.date_naive()),
        }
    }

    /// When results for the draw on `date` are expected to be published.
    pub fn available_at(&self, date: NaiveDate) -> DateTime<Utc> {
        Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)) + self.availability_offset
    }

    pub fn is_available(&self, date: NaiveDate, now: DateTime<Utc>) -> bool {
        now >= self.available_at(date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn schedule() -> DrawSchedule {
        DrawSchedule::from_config(&ScheduleConfig::default())
    }

    #[test]
    fn test_next_draw_skips_non_draw_days() {
        let s = schedule();
        // 2024-03-02 is a Saturday
        assert_eq!(s.next_draw_after(date(2024, 3, 2)), date(2024, 3, 4));
        assert_eq!(s.next_draw_after(date(2024, 3, 4)), date(2024, 3, 6));
        assert_eq!(s.next_draw_after(date(2024, 3, 6)), date(2024, 3, 9));
    }

    #[test]
    fn test_latest_draw_on_or_before() {
        let s = schedule();
        assert_eq!(s.latest_draw_on_or_before(date(2024, 3, 2)), date(2024, 3, 2));
        assert_eq!(s.latest_draw_on_or_before(date(2024, 3, 5)), date(2024, 3, 4));
    }

    #[test]
    fn test_availability_offset() {
        let s = schedule();
        let draw = date(2024, 3, 4);
        let published = Utc.with_ymd_and_hms(2024, 3, 5, 4, 0, 0).unwrap();
        assert_eq!(s.available_at(draw), published);
        assert!(!s.is_available(draw, published - Duration::seconds(1)));
        assert!(s.is_available(draw, published));
    }

    #[test]
    fn test_expected_after_empty_store_uses_today() {
        let s = schedule();
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
        assert_eq!(s.expected_after(None, now), date(2024, 3, 4));
        assert_eq!(s.expected_after(Some(date(2024, 3, 4)), now), date(2024, 3, 6));
    }

    #[test]
    fn test_fixed_clock_moves_only_when_told() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        clock.set(start + Duration::hours(2));
        assert_eq!(clock.now(), start + Duration::hours(2));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
