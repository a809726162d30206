//! Trading calendar and closed-interval computation.
//!
//! A [`MarketCalendar`] describes a recurring weekly schedule (open/close
//! wall-clock times on working days) in one IANA time zone plus a set of
//! holidays. [`MarketCalendar::closed_intervals`] returns every stretch of time
//! within a range during which the market is closed, merged so that no two
//! returned intervals touch or overlap.
//!
//! Notes:
//! - Local wall-clock times are resolved to UTC deterministically: ambiguous
//!   (fall-back) times take the earlier instant, nonexistent (spring-forward)
//!   times shift forward to the first valid minute.
//! - The scan snaps `from` back to the last open at or before it and `to`
//!   forward to the next open at or after it, so the first and last returned
//!   intervals may extend past the requested range.
//! - Holidays can be supplied in any order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Upper bound on day-by-day walks; a calendar with a longer closure is malformed.
const MAX_DAY_WALK: usize = 400;

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("invalid time zone: {0}")]
    InvalidTimezone(String),

    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),

    #[error("invalid holiday '{0}', expected YYYY-MM-DD")]
    InvalidHoliday(String),

    #[error("close time {close} must be after open time {open}")]
    InvalidHours { open: NaiveTime, close: NaiveTime },

    #[error("calendar has no working days")]
    NoWorkingDays,
}

/// A closed stretch of time, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClosedInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ClosedInterval {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// `true` when `[from, to)` lies entirely inside this interval.
    pub fn covers(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start <= from && to <= self.end
    }
}

/// Weekly trading schedule plus holidays, in one time zone.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    working_days: [bool; 7],
    holidays: BTreeSet<NaiveDate>,
    /// Holiday closures keyed by start, for closest-at-or-before lookups.
    holiday_ranges: BTreeMap<DateTime<Utc>, DateTime<Utc>>,
}

impl MarketCalendar {
    pub fn new(
        tz: Tz,
        open: NaiveTime,
        close: NaiveTime,
        working_days: &[Weekday],
        holidays: impl IntoIterator<Item = NaiveDate>,
    ) -> Result<Self, CalendarError> {
        if close <= open {
            return Err(CalendarError::InvalidHours { open, close });
        }

        let mut days = [false; 7];
        for day in working_days {
            days[day.num_days_from_monday() as usize] = true;
        }
        if !days.iter().any(|d| *d) {
            return Err(CalendarError::NoWorkingDays);
        }

        let mut calendar = Self {
            tz,
            open,
            close,
            working_days: days,
            holidays: holidays.into_iter().collect(),
            holiday_ranges: BTreeMap::new(),
        };

        let ranges = calendar
            .holidays
            .iter()
            .map(|date| calendar.holiday_range(*date))
            .collect();
        calendar.holiday_ranges = ranges;

        Ok(calendar)
    }

    /// Build a Monday-Friday calendar from textual settings.
    ///
    /// `holidays` is a comma-separated list of `YYYY-MM-DD` dates; blanks are skipped.
    pub fn from_settings(
        tz_name: &str,
        open: &str,
        close: &str,
        holidays: &str,
    ) -> Result<Self, CalendarError> {
        let tz: Tz = tz_name
            .parse()
            .map_err(|_| CalendarError::InvalidTimezone(tz_name.to_string()))?;
        let open = parse_time(open)?;
        let close = parse_time(close)?;

        let mut dates = Vec::new();
        for raw in holidays.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| CalendarError::InvalidHoliday(raw.to_string()))?;
            dates.push(date);
        }

        Self::new(
            tz,
            open,
            close,
            &[Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            dates,
        )
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Working weekday that is not a holiday.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.working_days[date.weekday().num_days_from_monday() as usize]
            && !self.holidays.contains(&date)
    }

    pub fn open_at(&self, date: NaiveDate) -> DateTime<Utc> {
        local_to_utc(self.tz, date.and_time(self.open))
    }

    pub fn close_at(&self, date: NaiveDate) -> DateTime<Utc> {
        local_to_utc(self.tz, date.and_time(self.close))
    }

    fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        local_to_utc(self.tz, date.and_time(NaiveTime::MIN))
    }

    fn local_date(&self, t: DateTime<Utc>) -> NaiveDate {
        t.with_timezone(&self.tz).date_naive()
    }

    /// First trading day strictly after `date`.
    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut day = date;
        for _ in 0..MAX_DAY_WALK {
            day = succ(day);
            if self.is_trading_day(day) {
                return day;
            }
        }
        succ(date)
    }

    /// A holiday closes from its local midnight through the next trading open.
    fn holiday_range(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.midnight(date);
        let end = self.open_at(self.next_trading_day(date));
        (start, end)
    }

    /// Closed stretch that follows `date`: from its close (or its midnight if
    /// the market never opens that day) to the next day's open.
    fn daily_closure(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = if self.is_trading_day(date) {
            self.close_at(date)
        } else {
            self.midnight(date)
        };
        (start, self.open_at(succ(date)))
    }

    /// Last trading day whose open is at or before `t`.
    fn snap_back(&self, t: DateTime<Utc>) -> NaiveDate {
        let mut day = self.local_date(t);
        for _ in 0..MAX_DAY_WALK {
            if self.is_trading_day(day) && self.open_at(day) <= t {
                return day;
            }
            day = pred(day);
        }
        self.local_date(t)
    }

    /// First trading day whose open is at or after `t`.
    fn snap_forward(&self, t: DateTime<Utc>) -> NaiveDate {
        let mut day = self.local_date(t);
        for _ in 0..MAX_DAY_WALK {
            if self.is_trading_day(day) && self.open_at(day) >= t {
                return day;
            }
            day = succ(day);
        }
        succ(self.local_date(t))
    }

    /// Merged, ordered closed intervals covering every closed moment in `[from, to]`.
    pub fn closed_intervals(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<ClosedInterval> {
        if from > to {
            return Vec::new();
        }

        let first_day = self.snap_back(from);
        let last_day = self.snap_forward(to);

        // Ordered by start, then end.
        let mut candidates: BTreeSet<(DateTime<Utc>, DateTime<Utc>)> = BTreeSet::new();

        let mut day = first_day;
        while day < last_day {
            candidates.insert(self.daily_closure(day));
            day = succ(day);
        }

        let window_start = self.open_at(first_day);
        let window_end = self.open_at(last_day);
        for (start, end) in self.holiday_ranges.range(..=window_end) {
            if *end >= window_start {
                candidates.insert((*start, *end));
            }
        }

        merge_ranges(candidates)
    }

    /// `true` if the market is closed at instant `t`.
    pub fn is_closed_at(&self, t: DateTime<Utc>) -> bool {
        if let Some((_, end)) = self.holiday_ranges.range(..=t).next_back() {
            if t < *end {
                return true;
            }
        }

        let day = self.local_date(t);
        !self.is_trading_day(day) || t < self.open_at(day) || t >= self.close_at(day)
    }
}

impl Default for MarketCalendar {
    /// US equities: 09:30-16:00 America/New_York, Monday to Friday, no holidays.
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::New_York,
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
            working_days: [true, true, true, true, true, false, false],
            holidays: BTreeSet::new(),
            holiday_ranges: BTreeMap::new(),
        }
    }
}

/// Walk ranges ordered by `(start, end)`, fusing any that overlap or touch.
fn merge_ranges(
    ranges: impl IntoIterator<Item = (DateTime<Utc>, DateTime<Utc>)>,
) -> Vec<ClosedInterval> {
    let mut merged = Vec::new();
    let mut current: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

    for (start, end) in ranges {
        if end <= start {
            continue;
        }
        current = match current {
            Some((cur_start, cur_end)) if start <= cur_end => Some((cur_start, cur_end.max(end))),
            Some((cur_start, cur_end)) => {
                merged.push(ClosedInterval { start: cur_start, end: cur_end });
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }

    if let Some((start, end)) = current {
        merged.push(ClosedInterval { start, end });
    }
    merged
}

/// Resolve a local wall-clock time to UTC.
///
/// Ambiguous times pick the earlier instant; nonexistent times move forward a
/// minute at a time (at most two hours) until they exist.
fn local_to_utc(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let mut t = naive;
            for _ in 0..120 {
                t += Duration::minutes(1);
                if let LocalResult::Single(dt) = tz.from_local_datetime(&t) {
                    return dt.with_timezone(&Utc);
                }
            }
            Utc.from_utc_datetime(&naive)
        }
    }
}

fn parse_time(raw: &str) -> Result<NaiveTime, CalendarError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| CalendarError::InvalidTime(raw.to_string()))
}

fn succ(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}

fn pred(date: NaiveDate) -> NaiveDate {
    date.pred_opt().unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekend_closure_is_one_interval() {
        // Fri 2024-03-08 close 16:00 EST = 21:00Z; Mon 2024-03-11 open 09:30 EDT = 13:30Z
        let calendar = MarketCalendar::default();

        let closed = calendar.closed_intervals(utc(2024, 3, 8, 15, 0), utc(2024, 3, 11, 15, 0));

        assert_eq!(
            closed,
            vec![ClosedInterval {
                start: utc(2024, 3, 8, 21, 0),
                end: utc(2024, 3, 11, 13, 30),
            }]
        );
    }

    #[test]
    fn overnight_closures_are_separate_intervals() {
        let calendar = MarketCalendar::default();

        // Tue 2024-01-09 through Thu 2024-01-11, all EST (UTC-5)
        let closed = calendar.closed_intervals(utc(2024, 1, 9, 15, 0), utc(2024, 1, 11, 15, 0));

        assert_eq!(
            closed,
            vec![
                ClosedInterval { start: utc(2024, 1, 9, 21, 0), end: utc(2024, 1, 10, 14, 30) },
                ClosedInterval { start: utc(2024, 1, 10, 21, 0), end: utc(2024, 1, 11, 14, 30) },
            ]
        );
    }

    #[test]
    fn holiday_extends_closure_to_next_open() {
        // Wed 2024-12-25 is a holiday.
        let calendar = MarketCalendar::from_settings("America/New_York", "09:30", "16:00", "2024-12-25")
            .unwrap();

        let closed = calendar.closed_intervals(utc(2024, 12, 24, 15, 0), utc(2024, 12, 26, 15, 0));

        assert_eq!(
            closed,
            vec![ClosedInterval {
                start: utc(2024, 12, 24, 21, 0),
                end: utc(2024, 12, 26, 14, 30),
            }]
        );
    }

    #[test]
    fn unsorted_holidays_are_tolerated() {
        let sorted = MarketCalendar::from_settings(
            "America/New_York",
            "09:30",
            "16:00",
            "2024-07-04,2024-11-28,2024-12-25",
        )
        .unwrap();
        let unsorted = MarketCalendar::from_settings(
            "America/New_York",
            "09:30",
            "16:00",
            "2024-12-25, 2024-07-04,2024-11-28",
        )
        .unwrap();

        let from = utc(2024, 6, 1, 0, 0);
        let to = utc(2024, 12, 31, 0, 0);
        assert_eq!(sorted.closed_intervals(from, to), unsorted.closed_intervals(from, to));
        assert!(unsorted.is_closed_at(utc(2024, 7, 4, 15, 0)));
    }

    #[test]
    fn snapped_range_covers_request_edges() {
        let calendar = MarketCalendar::default();
        // Saturday noon to Sunday noon: entirely closed
        let from = utc(2024, 3, 9, 17, 0);
        let to = utc(2024, 3, 10, 16, 0);

        let closed = calendar.closed_intervals(from, to);

        assert_eq!(closed.len(), 1);
        assert!(closed[0].covers(from, to));
    }

    #[test]
    fn reversed_range_is_empty() {
        let calendar = MarketCalendar::default();
        assert!(calendar
            .closed_intervals(utc(2024, 3, 9, 0, 0), utc(2024, 3, 8, 0, 0))
            .is_empty());
    }

    #[test]
    fn is_closed_at_matches_schedule() {
        let calendar = MarketCalendar::default();
        assert!(!calendar.is_closed_at(utc(2024, 1, 10, 15, 0)));
        assert!(calendar.is_closed_at(utc(2024, 1, 10, 22, 0)));
        assert!(calendar.is_closed_at(utc(2024, 1, 13, 15, 0)));
    }

    #[test]
    fn next_trading_day_skips_weekend_and_holiday() {
        let calendar =
            MarketCalendar::from_settings("America/New_York", "09:30", "16:00", "2024-09-02").unwrap();
        // Fri 2024-08-30 -> Labor Day Mon 2024-09-02 is a holiday -> Tue 2024-09-03
        assert_eq!(calendar.next_trading_day(date(2024, 8, 30)), date(2024, 9, 3));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            MarketCalendar::from_settings("Mars/Olympus", "09:30", "16:00", ""),
            Err(CalendarError::InvalidTimezone(_))
        ));
        assert!(matches!(
            MarketCalendar::from_settings("UTC", "16:00", "09:30", ""),
            Err(CalendarError::InvalidHours { .. })
        ));
        assert!(matches!(
            MarketCalendar::from_settings("UTC", "09:30", "16:00", "2024-13-01"),
            Err(CalendarError::InvalidHoliday(_))
        ));
    }

    #[test]
    fn merge_fuses_touching_ranges() {
        let a = utc(2024, 1, 1, 0, 0);
        let b = utc(2024, 1, 1, 1, 0);
        let c = utc(2024, 1, 1, 2, 0);

        let merged = merge_ranges(vec![(a, b), (b, c)]);

        assert_eq!(merged, vec![ClosedInterval { start: a, end: c }]);
    }

    proptest! {
        #[test]
        fn closed_intervals_are_disjoint_and_sorted(
            start_offset in 0i64..(365 * 24),
            span_hours in 0i64..(24 * 21),
        ) {
            let calendar = MarketCalendar::from_settings(
                "America/New_York", "09:30", "16:00", "2024-07-04,2024-12-25,2024-11-28",
            ).unwrap();
            let from = utc(2024, 1, 1, 0, 0) + Duration::hours(start_offset);
            let to = from + Duration::hours(span_hours);

            let closed = calendar.closed_intervals(from, to);

            for interval in &closed {
                prop_assert!(interval.start < interval.end);
            }
            for pair in closed.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
        }

        #[test]
        fn closed_intervals_agree_with_point_lookup(
            start_offset in 0i64..(365 * 24),
            offset_minutes in 0i64..(60 * 24 * 7),
        ) {
            let calendar = MarketCalendar::from_settings(
                "America/New_York", "09:30", "16:00", "2024-07-04,2024-12-25",
            ).unwrap();
            let from = utc(2024, 1, 1, 0, 0) + Duration::hours(start_offset);
            let to = from + Duration::days(7);
            let instant = from + Duration::minutes(offset_minutes);

            let closed = calendar.closed_intervals(from, to);
            let in_interval = closed.iter().any(|i| i.contains(instant));

            prop_assert_eq!(in_interval, calendar.is_closed_at(instant));
        }
    }
}
