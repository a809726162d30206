//! UTC bucket boundaries for Hour / Day / Week aggregation.
//!
//! Hour and day buckets are fixed-width offsets from the Unix epoch. Week
//! buckets start on Monday 00:00Z, using 1969-12-29 as the week epoch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const SECS_PER_HOUR: i64 = 3_600;
const SECS_PER_DAY: i64 = 24 * SECS_PER_HOUR;
const SECS_PER_WEEK: i64 = 7 * SECS_PER_DAY;

/// Shift so Monday 1969-12-29 00:00Z is week zero.
const WEEK_MONDAY_ANCHOR_OFFSET_SECS: i64 = 3 * SECS_PER_DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketSize {
    Hour,
    Day,
    Week,
}

impl BucketSize {
    fn width_secs(self) -> i64 {
        match self {
            BucketSize::Hour => SECS_PER_HOUR,
            BucketSize::Day => SECS_PER_DAY,
            BucketSize::Week => SECS_PER_WEEK,
        }
    }

    pub fn width(self) -> Duration {
        Duration::seconds(self.width_secs())
    }

    /// Start of the bucket containing `ts`.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.width_secs();
        let offset = match self {
            BucketSize::Week => WEEK_MONDAY_ANCHOR_OFFSET_SECS,
            _ => 0,
        };
        let secs = ts.timestamp() + offset;
        let start = secs.div_euclid(width) * width - offset;
        DateTime::<Utc>::from_timestamp(start, 0).unwrap_or(ts)
    }
}

impl fmt::Display for BucketSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BucketSize::Hour => "hour",
            BucketSize::Day => "day",
            BucketSize::Week => "week",
        };
        f.write_str(name)
    }
}

impl FromStr for BucketSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" | "h" => Ok(BucketSize::Hour),
            "day" | "d" => Ok(BucketSize::Day),
            "week" | "w" => Ok(BucketSize::Week),
            other => Err(format!("unknown bucket size: {}", other)),
        }
    }
}

/// Half-open bucket window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BucketWindow {
    pub fn containing(size: BucketSize, ts: DateTime<Utc>) -> Self {
        let start = size.floor(ts);
        Self {
            start,
            end: start + size.width(),
        }
    }

    pub fn previous(&self, size: BucketSize) -> Self {
        Self {
            start: self.start - size.width(),
            end: self.start,
        }
    }

    /// Last instant inside the window, for inclusive range queries.
    pub fn last_instant(&self) -> DateTime<Utc> {
        self.end - Duration::milliseconds(1)
    }
}

/// `count` consecutive windows, oldest first, the last one containing `end`.
pub fn windows_ending_at(size: BucketSize, end: DateTime<Utc>, count: usize) -> Vec<BucketWindow> {
    let mut windows = Vec::with_capacity(count);
    let mut current = BucketWindow::containing(size, end);
    for _ in 0..count {
        windows.push(current);
        current = current.previous(size);
    }
    windows.reverse();
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hour_floor_truncates_minutes() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 14, 37, 12).unwrap();
        assert_eq!(
            BucketSize::Hour.floor(t),
            Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap()
        );
    }

    #[test]
    fn week_starts_on_monday() {
        // 2024-03-07 is a Thursday; its week starts Monday 2024-03-04.
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 9, 0, 0).unwrap();
        assert_eq!(
            BucketSize::Week.floor(t),
            Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn week_floor_before_epoch_is_monday() {
        let t = Utc.with_ymd_and_hms(1969, 12, 31, 12, 0, 0).unwrap();
        assert_eq!(
            BucketSize::Week.floor(t),
            Utc.with_ymd_and_hms(1969, 12, 29, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn windows_end_with_bucket_containing_end() {
        let end = Utc.with_ymd_and_hms(2024, 3, 5, 14, 37, 0).unwrap();
        let windows = windows_ending_at(BucketSize::Hour, end, 3);

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2].start, Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap());
        assert_eq!(windows[0].start, Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap());
        assert_eq!(windows[0].end, windows[1].start);
    }

    #[test]
    fn parse_accepts_short_names() {
        assert_eq!("D".parse::<BucketSize>(), Ok(BucketSize::Day));
        assert_eq!("week".parse::<BucketSize>(), Ok(BucketSize::Week));
        assert!("month".parse::<BucketSize>().is_err());
    }
}
