//! Shared fixtures for the runner integration tests: an in-memory
//! repository and regular-session bar generators.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;

use tapedeck_core::domain::{Bar, Interval};
use tapedeck_core::repository::{HistoricalRepository, RepositoryError};
use tapedeck_runner::config::{
    BacktestConfig, ScanWindow, ScannerDecl, SessionConfig, SessionMode,
};

/// In-memory repository with an optional leading failure budget, for
/// exercising the retry path.
#[derive(Debug, Default)]
pub struct FakeRepository {
    bars: Mutex<HashMap<(String, Interval), Vec<Bar>>>,
    fail_remaining: AtomicU32,
}

impl FakeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, symbol: &str, interval: Interval, mut bars: Vec<Bar>) {
        bars.sort_by_key(|b| b.timestamp);
        let mut map = self.bars.lock();
        map.entry((symbol.to_string(), interval)).or_default().extend(bars);
        map.get_mut(&(symbol.to_string(), interval)).unwrap().sort_by_key(|b| b.timestamp);
    }

    /// Fail the next `n` fetches with `Unavailable`.
    pub fn fail_times(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }
}

impl HistoricalRepository for FakeRepository {
    fn fetch_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, RepositoryError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(RepositoryError::Unavailable("injected outage".into()));
        }
        let map = self.bars.lock();
        Ok(map
            .get(&(symbol.to_string(), interval))
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.timestamp >= start && b.timestamp < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// 14:30 UTC == 09:30 New York for the January 2024 test dates.
pub fn session_open_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(14, 30, 0).unwrap())
}

/// A full regular session of 1m bars (390), minus the minutes-from-open
/// listed in `skip`. Bar 0 opens 09:30 New York.
pub fn day_bars(symbol: &str, date: NaiveDate, skip: &[u32]) -> Vec<Bar> {
    let open = session_open_utc(date);
    (0..390u32)
        .filter(|m| !skip.contains(m))
        .map(|m| {
            let close = 100.0 + (m as f64 * 0.05).sin() * 2.0;
            Bar {
                symbol: symbol.to_string(),
                timestamp: open + Duration::minutes(m as i64),
                interval: Interval::M1,
                open: close - 0.1,
                high: close + 0.4,
                low: close - 0.4,
                close,
                volume: 10_000 + (m as u64 * 7) % 3_000,
            }
        })
        .collect()
}

pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

pub fn backtest_config(
    symbols: &[&str],
    intervals: &[u32],
    trailing_days: usize,
    start: NaiveDate,
    end: NaiveDate,
) -> SessionConfig {
    SessionConfig {
        session_name: "it".into(),
        mode: SessionMode::Backtest,
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        intervals: intervals.to_vec(),
        trailing_days,
        data_api: "fake".into(),
        indicators: Vec::new(),
        backtest: Some(BacktestConfig { start_date: start, end_date: end, speed: 0.0 }),
        scanners: Vec::new(),
    }
}

pub fn watchlist_decl(candidates: &[&str], start: &str, end: &str, interval: &str) -> ScannerDecl {
    ScannerDecl {
        module: "watchlist".into(),
        pre_session: false,
        regular_session: Some(vec![ScanWindow {
            start: start.into(),
            end: end.into(),
            interval: interval.into(),
        }]),
        config: serde_json::json!({
            "candidates": candidates.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        }),
    }
}
