//! Bar — the fundamental market data unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Interval;

/// OHLCV bar for a single symbol over one interval.
///
/// `timestamp` marks the *start* of the interval: a 1-minute bar stamped
/// 09:30:00 covers `[09:30:00, 09:31:00)` and is complete at 09:31:00.
/// Bars are written once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub interval: Interval,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// The instant this bar is complete.
    pub fn interval_end(&self) -> DateTime<Utc> {
        self.timestamp + self.interval.duration()
    }

    /// Basic OHLC sanity check: high is the top, low is the bottom,
    /// prices are positive and finite.
    pub fn is_sane(&self) -> bool {
        let finite = self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite();
        finite
            && self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
    }

    /// True if this bar sits on its own interval grid.
    pub fn is_aligned(&self) -> bool {
        self.interval.aligns(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_bar() -> Bar {
        Bar {
            symbol: "AAPL".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap(),
            interval: Interval::M1,
            open: 185.0,
            high: 185.4,
            low: 184.9,
            close: 185.2,
            volume: 120_000,
        }
    }

    #[test]
    fn bar_is_sane() {
        assert!(sample_bar().is_sane());
    }

    #[test]
    fn bar_detects_inverted_high_low() {
        let mut bar = sample_bar();
        bar.high = 184.0; // below low
        assert!(!bar.is_sane());
    }

    #[test]
    fn bar_detects_nan() {
        let mut bar = sample_bar();
        bar.close = f64::NAN;
        assert!(!bar.is_sane());
    }

    #[test]
    fn interval_end_is_start_plus_interval() {
        let bar = sample_bar();
        assert_eq!(
            bar.interval_end(),
            Utc.with_ymd_and_hms(2024, 1, 2, 14, 31, 0).unwrap()
        );
    }

    #[test]
    fn serialization_roundtrip() {
        let bar = sample_bar();
        let json = serde_json::to_string(&bar).unwrap();
        let deser: Bar = serde_json::from_str(&json).unwrap();
        assert_eq!(bar, deser);
    }
}
