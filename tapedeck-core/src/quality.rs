//! Data-quality scoring — pure functions over the aligned timestamp grid.
//!
//! Quality for a `(symbol, interval)` is the percentage of expected bars
//! actually present. Expectation is derived from elapsed trading time, not
//! from the raw count, so gaps are attributed to specific grid slots.

use chrono::{DateTime, Utc};

use crate::domain::{Bar, Interval};

/// A run of missing bars on the interval grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Grid timestamp of the first missing bar.
    pub start: DateTime<Utc>,
    /// Number of consecutive missing bars.
    pub missing: usize,
}

/// Bars expected in `[open, until)` for `interval`.
///
/// Hourly buckets are anchored to the top of the hour, so the first bucket of
/// a 09:30 session is partial and not expected.
pub fn expected_bars(open: DateTime<Utc>, until: DateTime<Utc>, interval: Interval) -> usize {
    if until <= open {
        return 0;
    }
    let secs = interval.seconds();
    let first_slot = if interval.aligns(open) {
        open
    } else {
        interval.bucket_start(open) + interval.duration()
    };
    if until <= first_slot {
        return 0;
    }
    let elapsed = (until - first_slot).num_seconds();
    (elapsed / secs) as usize
}

/// Single-pass gap scan comparing successive timestamps against
/// `previous + interval`. The leading edge (bars missing before the first
/// stored bar) is reported against `open` when the first bar is late.
pub fn find_gaps(open: DateTime<Utc>, bars: &[Bar], interval: Interval) -> Vec<Gap> {
    let mut gaps = Vec::new();
    let step = interval.duration();
    let first_slot = if interval.aligns(open) {
        open
    } else {
        interval.bucket_start(open) + step
    };

    let mut expected_ts = first_slot;
    for bar in bars {
        if bar.timestamp > expected_ts {
            let missing = ((bar.timestamp - expected_ts).num_seconds() / interval.seconds()) as usize;
            gaps.push(Gap { start: expected_ts, missing });
        }
        expected_ts = bar.timestamp + step;
    }
    gaps
}

/// `100 × received / expected`, clamped to `[0, 100]`.
///
/// An empty expectation (session not yet reaching the first grid slot)
/// scores a clean 100.
pub fn quality_pct(received: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 100.0;
    }
    (100.0 * received as f64 / expected as f64).clamp(0.0, 100.0)
}

/// Quality of a session series given the open and the current instant.
pub fn session_quality(
    open: DateTime<Utc>,
    now: DateTime<Utc>,
    bars: &[Bar],
    interval: Interval,
) -> f64 {
    quality_pct(bars.len(), expected_bars(open, now, interval))
}
