//! TimeAuthority — the single source of "now".
//!
//! In backtest the session coordinator owns a virtual clock and is the only
//! writer; everyone else reads a lock-free atomic instant. In live mode the
//! clock is the wall clock and `advance_to` is rejected.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::calendar::TradingCalendar;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    /// A computed advancement target was behind the current virtual time.
    /// This is a coordinator bug, not a data condition.
    #[error("time regression: attempted to move clock from {now} back to {target}")]
    TimeRegression { now: DateTime<Utc>, target: DateTime<Utc> },

    #[error("advance_to is unsupported in live mode")]
    UnsupportedInLive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    Backtest,
    Live,
}

/// Bounded memo for trading-day lookups.
///
/// Repeated `is_trading_day` checks against the same handful of dates are
/// free after the first; eviction is oldest-insertion-first.
#[derive(Debug)]
struct TradingDayMemo {
    map: HashMap<NaiveDate, bool>,
    order: VecDeque<NaiveDate>,
    capacity: usize,
}

impl TradingDayMemo {
    fn new(capacity: usize) -> Self {
        Self { map: HashMap::new(), order: VecDeque::new(), capacity }
    }

    fn get_or_insert(&mut self, date: NaiveDate, compute: impl FnOnce() -> bool) -> bool {
        if let Some(&hit) = self.map.get(&date) {
            return hit;
        }
        let value = compute();
        if self.map.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.map.insert(date, value);
        self.order.push_back(date);
        value
    }
}

/// The authoritative clock for one session run.
pub struct TimeAuthority {
    mode: ClockMode,
    /// Virtual now as nanoseconds since the Unix epoch (backtest only).
    now_nanos: AtomicI64,
    calendar: Arc<TradingCalendar>,
    memo: Mutex<TradingDayMemo>,
}

impl TimeAuthority {
    const MEMO_CAPACITY: usize = 100;

    pub fn backtest(start: DateTime<Utc>, calendar: Arc<TradingCalendar>) -> Self {
        Self {
            mode: ClockMode::Backtest,
            now_nanos: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or(0)),
            calendar,
            memo: Mutex::new(TradingDayMemo::new(Self::MEMO_CAPACITY)),
        }
    }

    pub fn live(calendar: Arc<TradingCalendar>) -> Self {
        Self {
            mode: ClockMode::Live,
            now_nanos: AtomicI64::new(0),
            calendar,
            memo: Mutex::new(TradingDayMemo::new(Self::MEMO_CAPACITY)),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self.mode {
            ClockMode::Live => Utc::now(),
            ClockMode::Backtest => {
                let nanos = self.now_nanos.load(Ordering::Acquire);
                Utc.timestamp_nanos(nanos)
            }
        }
    }

    /// Move virtual time forward. Only the session coordinator calls this.
    ///
    /// Monotonic non-decreasing: a target behind `now()` is rejected as
    /// `TimeRegression`. Equal targets are a no-op.
    pub fn advance_to(&self, target: DateTime<Utc>) -> Result<(), ClockError> {
        if self.mode == ClockMode::Live {
            return Err(ClockError::UnsupportedInLive);
        }
        let target_nanos = target.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let now_nanos = self.now_nanos.load(Ordering::Acquire);
        if target_nanos < now_nanos {
            return Err(ClockError::TimeRegression { now: Utc.timestamp_nanos(now_nanos), target });
        }
        self.now_nanos.store(target_nanos, Ordering::Release);
        Ok(())
    }

    /// The exchange-local date of the current instant.
    pub fn session_date(&self) -> NaiveDate {
        self.calendar.local_date(self.now())
    }

    /// True once `now()` has reached the close of the current session date.
    /// Non-trading dates are considered after-close.
    pub fn is_after_close(&self) -> bool {
        let now = self.now();
        match self.calendar.session_window(self.calendar.local_date(now)) {
            Some(window) => now >= window.close_utc,
            None => true,
        }
    }

    /// Memoized trading-day check.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.memo.lock().get_or_insert(date, || self.calendar.is_trading_day(date))
    }

    pub fn first_trading_date_on_or_after(&self, date: NaiveDate) -> Option<NaiveDate> {
        self.calendar.first_trading_day_on_or_after(date)
    }

    pub fn calendar(&self) -> &Arc<TradingCalendar> {
        &self.calendar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cal() -> Arc<TradingCalendar> {
        Arc::new(TradingCalendar::us_equities())
    }

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, h, m, 0).unwrap()
    }

    #[test]
    fn advance_moves_now_forward() {
        let clock = TimeAuthority::backtest(t(14, 30), cal());
        clock.advance_to(t(14, 31)).unwrap();
        assert_eq!(clock.now(), t(14, 31));
    }

    #[test]
    fn advance_to_same_instant_is_noop() {
        let clock = TimeAuthority::backtest(t(14, 30), cal());
        clock.advance_to(t(14, 30)).unwrap();
        assert_eq!(clock.now(), t(14, 30));
    }

    #[test]
    fn regression_is_rejected() {
        let clock = TimeAuthority::backtest(t(14, 31), cal());
        let err = clock.advance_to(t(14, 30)).unwrap_err();
        assert!(matches!(err, ClockError::TimeRegression { .. }));
        assert_eq!(clock.now(), t(14, 31));
    }

    #[test]
    fn live_rejects_advance() {
        let clock = TimeAuthority::live(cal());
        assert_eq!(clock.advance_to(t(14, 30)).unwrap_err(), ClockError::UnsupportedInLive);
    }

    #[test]
    fn session_date_uses_exchange_timezone() {
        // 01:00 UTC on Jan 3 is still Jan 2 in New York
        let clock = TimeAuthority::backtest(
            Utc.with_ymd_and_hms(2024, 1, 3, 1, 0, 0).unwrap(),
            cal(),
        );
        assert_eq!(clock.session_date(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }

    #[test]
    fn after_close_flips_at_close() {
        let clock = TimeAuthority::backtest(t(20, 59), cal());
        assert!(!clock.is_after_close());
        clock.advance_to(t(21, 0)).unwrap();
        assert!(clock.is_after_close());
    }

    #[test]
    fn trading_day_memo_is_consistent() {
        let clock = TimeAuthority::backtest(t(14, 30), cal());
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        // first call computes, second hits the memo; answers agree
        assert!(clock.is_trading_day(date));
        assert!(clock.is_trading_day(date));
        assert!(!clock.is_trading_day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
    }

    #[test]
    fn memo_eviction_keeps_answers_correct() {
        let clock = TimeAuthority::backtest(t(14, 30), cal());
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        for offset in 0..250 {
            let date = base + chrono::Duration::days(offset);
            assert_eq!(clock.is_trading_day(date), clock.calendar().is_trading_day(date));
        }
        // re-query an evicted date
        assert!(!clock.is_trading_day(base));
    }
}
