//! Bar intervals and their timestamp arithmetic.
//!
//! Intraday intervals are integer minutes; `D1` is the daily sentinel.
//! The 1-minute interval is privileged: in backtest it is the only interval
//! streamed from storage, every larger intraday interval is generated from it.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Supported bar intervals.
///
/// `slot()` maps each interval onto a dense index so per-symbol containers
/// can be small fixed arrays instead of nested maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    /// Number of interval slots (length of per-symbol fixed arrays).
    pub const COUNT: usize = 6;

    /// All intraday intervals, smallest first.
    pub const INTRADAY: [Interval; 5] =
        [Interval::M1, Interval::M5, Interval::M15, Interval::M30, Interval::H1];

    /// Dense index for fixed-array storage.
    pub fn slot(self) -> usize {
        match self {
            Interval::M1 => 0,
            Interval::M5 => 1,
            Interval::M15 => 2,
            Interval::M30 => 3,
            Interval::H1 => 4,
            Interval::D1 => 5,
        }
    }

    pub fn from_slot(slot: usize) -> Option<Interval> {
        match slot {
            0 => Some(Interval::M1),
            1 => Some(Interval::M5),
            2 => Some(Interval::M15),
            3 => Some(Interval::M30),
            4 => Some(Interval::H1),
            5 => Some(Interval::D1),
            _ => None,
        }
    }

    /// Parse a config integer (minutes) into an intraday interval.
    pub fn from_minutes(minutes: u32) -> Option<Interval> {
        match minutes {
            1 => Some(Interval::M1),
            5 => Some(Interval::M5),
            15 => Some(Interval::M15),
            30 => Some(Interval::M30),
            60 => Some(Interval::H1),
            _ => None,
        }
    }

    /// Parse an interval token as used in indicator names and scanner
    /// schedules: "1m", "5m", "15m", "30m", "1h", "1d".
    pub fn parse_token(token: &str) -> Option<Interval> {
        match token {
            "1m" => Some(Interval::M1),
            "5m" => Some(Interval::M5),
            "15m" => Some(Interval::M15),
            "30m" => Some(Interval::M30),
            "1h" | "60m" => Some(Interval::H1),
            "1d" => Some(Interval::D1),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::D1 => "1d",
        }
    }

    pub fn is_intraday(self) -> bool {
        !matches!(self, Interval::D1)
    }

    /// Interval length in minutes. Daily bars use the calendar day.
    pub fn minutes(self) -> u32 {
        match self {
            Interval::M1 => 1,
            Interval::M5 => 5,
            Interval::M15 => 15,
            Interval::M30 => 30,
            Interval::H1 => 60,
            Interval::D1 => 1440,
        }
    }

    pub fn seconds(self) -> i64 {
        self.minutes() as i64 * 60
    }

    pub fn duration(self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// True if `ts` sits on this interval's timestamp grid.
    ///
    /// The grid is anchored at midnight UTC, so a 09:30 session open aligns
    /// for 1m/5m/15m/30m while hourly buckets fall on the top of the hour.
    pub fn aligns(self, ts: DateTime<Utc>) -> bool {
        if self == Interval::D1 {
            return ts.time().num_seconds_from_midnight() == 0;
        }
        ts.timestamp() % self.seconds() == 0
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let rem = ts.timestamp().rem_euclid(self.seconds());
        ts - Duration::seconds(rem)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}
