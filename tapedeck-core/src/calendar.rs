//! Trading calendar — pure date math over an injected holiday table.
//!
//! The calendar is constructed once from holiday/early-close data and never
//! touches a database during a session. Session windows are expressed in the
//! exchange's local time and converted to UTC DST-correctly.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

/// Open/close instants for one trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub open_utc: DateTime<Utc>,
    pub close_utc: DateTime<Utc>,
    pub early_close: bool,
}

/// Pure-function trading calendar for a single exchange.
///
/// Holidays and early closes are injected at construction. Lookups outside
/// `[horizon_start, horizon_end]` return `None` — the holiday table is not
/// authoritative there.
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    tz: Tz,
    open_local: NaiveTime,
    close_local: NaiveTime,
    holidays: BTreeSet<NaiveDate>,
    early_closes: HashMap<NaiveDate, NaiveTime>,
    horizon_start: NaiveDate,
    horizon_end: NaiveDate,
}

impl TradingCalendar {
    pub fn new(
        tz: Tz,
        open_local: NaiveTime,
        close_local: NaiveTime,
        holidays: impl IntoIterator<Item = NaiveDate>,
        early_closes: impl IntoIterator<Item = (NaiveDate, NaiveTime)>,
        horizon_start: NaiveDate,
        horizon_end: NaiveDate,
    ) -> Self {
        Self {
            tz,
            open_local,
            close_local,
            holidays: holidays.into_iter().collect(),
            early_closes: early_closes.into_iter().collect(),
            horizon_start,
            horizon_end,
        }
    }

    /// US equities calendar (NYSE/Nasdaq), 09:30–16:00 America/New_York,
    /// with the full-session holidays and 13:00 early closes for 2024–2026.
    pub fn us_equities() -> Self {
        let d = |y, m, dd| NaiveDate::from_ymd_opt(y, m, dd).expect("valid holiday date");
        let one_pm = NaiveTime::from_hms_opt(13, 0, 0).expect("valid time");
        let holidays = vec![
            // 2024
            d(2024, 1, 1),
            d(2024, 1, 15),
            d(2024, 2, 19),
            d(2024, 3, 29),
            d(2024, 5, 27),
            d(2024, 6, 19),
            d(2024, 7, 4),
            d(2024, 9, 2),
            d(2024, 11, 28),
            d(2024, 12, 25),
            // 2025
            d(2025, 1, 1),
            d(2025, 1, 9), // national day of mourning
            d(2025, 1, 20),
            d(2025, 2, 17),
            d(2025, 4, 18),
            d(2025, 5, 26),
            d(2025, 6, 19),
            d(2025, 7, 4),
            d(2025, 9, 1),
            d(2025, 11, 27),
            d(2025, 12, 25),
            // 2026
            d(2026, 1, 1),
            d(2026, 1, 19),
            d(2026, 2, 16),
            d(2026, 4, 3),
            d(2026, 5, 25),
            d(2026, 6, 19),
            d(2026, 7, 3),
            d(2026, 9, 7),
            d(2026, 11, 26),
            d(2026, 12, 25),
        ];
        let early = vec![
            (d(2024, 7, 3), one_pm),
            (d(2024, 11, 29), one_pm),
            (d(2024, 12, 24), one_pm),
            (d(2025, 7, 3), one_pm),
            (d(2025, 11, 28), one_pm),
            (d(2025, 12, 24), one_pm),
            (d(2026, 11, 27), one_pm),
            (d(2026, 12, 24), one_pm),
        ];
        Self::new(
            chrono_tz::America::New_York,
            NaiveTime::from_hms_opt(9, 30, 0).expect("valid time"),
            NaiveTime::from_hms_opt(16, 0, 0).expect("valid time"),
            holidays,
            early,
            d(2024, 1, 1),
            d(2026, 12, 31),
        )
    }

    pub fn in_horizon(&self, date: NaiveDate) -> bool {
        date >= self.horizon_start && date <= self.horizon_end
    }

    /// Weekends and listed holidays are non-trading days.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday();
        if weekday == Weekday::Sat || weekday == Weekday::Sun {
            return false;
        }
        !self.holidays.contains(&date)
    }

    /// Open/close for a trading day, in UTC. `None` for non-trading days
    /// or dates outside the horizon.
    pub fn session_window(&self, date: NaiveDate) -> Option<SessionWindow> {
        if !self.in_horizon(date) || !self.is_trading_day(date) {
            return None;
        }
        let close_local = self.early_closes.get(&date).copied();
        let early_close = close_local.is_some();
        let close_local = close_local.unwrap_or(self.close_local);
        Some(SessionWindow {
            open_utc: self.local_to_utc(date, self.open_local),
            close_utc: self.local_to_utc(date, close_local),
            early_close,
        })
    }

    /// First trading day strictly after `date`, bounded by the horizon.
    pub fn next_trading_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut candidate = date.succ_opt()?;
        while self.in_horizon(candidate) {
            if self.is_trading_day(candidate) {
                return Some(candidate);
            }
            candidate = candidate.succ_opt()?;
        }
        None
    }

    /// Last trading day strictly before `date`, bounded by the horizon.
    pub fn previous_trading_day(&self, date: NaiveDate) -> Option<NaiveDate> {
        let mut candidate = date.pred_opt()?;
        while self.in_horizon(candidate) {
            if self.is_trading_day(candidate) {
                return Some(candidate);
            }
            candidate = candidate.pred_opt()?;
        }
        None
    }

    /// `date` itself if it trades, otherwise the next trading day.
    pub fn first_trading_day_on_or_after(&self, date: NaiveDate) -> Option<NaiveDate> {
        if self.in_horizon(date) && self.is_trading_day(date) {
            return Some(date);
        }
        self.next_trading_day(date)
    }

    /// Number of trading days in `[start, end]` (inclusive).
    pub fn count_trading_days(&self, start: NaiveDate, end: NaiveDate) -> usize {
        if start > end {
            return 0;
        }
        let mut count = 0;
        let mut day = start;
        while day <= end {
            if self.is_trading_day(day) {
                count += 1;
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        count
    }

    /// The exchange-local calendar date of a UTC instant.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    fn local_to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        // Session times never land inside a DST transition (02:00 local),
        // so the local datetime maps to exactly one instant.
        self.tz
            .from_local_datetime(&date.and_time(time))
            .single()
            .expect("session time is unambiguous in exchange timezone")
            .with_timezone(&Utc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cal() -> TradingCalendar {
        TradingCalendar::us_equities()
    }

    fn d(y: i32, m: u32, dd: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, dd).unwrap()
    }

    #[test]
    fn weekends_are_closed() {
        assert!(!cal().is_trading_day(d(2024, 1, 6))); // Saturday
        assert!(!cal().is_trading_day(d(2024, 1, 7))); // Sunday
        assert!(cal().is_trading_day(d(2024, 1, 8)));
    }

    #[test]
    fn holidays_are_closed() {
        assert!(!cal().is_trading_day(d(2024, 1, 1)));
        assert!(!cal().is_trading_day(d(2024, 7, 4)));
        assert!(!cal().is_trading_day(d(2025, 12, 25)));
    }

    #[test]
    fn session_window_winter_utc() {
        // EST = UTC-5: 09:30 NY == 14:30 UTC
        let win = cal().session_window(d(2024, 1, 2)).unwrap();
        assert_eq!(win.open_utc, Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap());
        assert_eq!(win.close_utc, Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap());
        assert!(!win.early_close);
    }

    #[test]
    fn session_window_summer_utc() {
        // EDT = UTC-4: 09:30 NY == 13:30 UTC
        let win = cal().session_window(d(2024, 6, 3)).unwrap();
        assert_eq!(win.open_utc, Utc.with_ymd_and_hms(2024, 6, 3, 13, 30, 0).unwrap());
        assert_eq!(win.close_utc, Utc.with_ymd_and_hms(2024, 6, 3, 20, 0, 0).unwrap());
    }

    #[test]
    fn early_close_is_one_pm() {
        let win = cal().session_window(d(2024, 11, 29)).unwrap();
        assert!(win.early_close);
        // 13:00 EST == 18:00 UTC
        assert_eq!(win.close_utc, Utc.with_ymd_and_hms(2024, 11, 29, 18, 0, 0).unwrap());
    }

    #[test]
    fn no_window_on_holiday() {
        assert!(cal().session_window(d(2024, 12, 25)).is_none());
        assert!(cal().session_window(d(2024, 1, 6)).is_none());
    }

    #[test]
    fn next_trading_day_skips_weekend_and_holiday() {
        // Friday 2024-03-28 -> Good Friday 03-29 and the weekend are skipped
        assert_eq!(cal().next_trading_day(d(2024, 3, 28)), Some(d(2024, 4, 1)));
        assert_eq!(cal().next_trading_day(d(2024, 1, 2)), Some(d(2024, 1, 3)));
    }

    #[test]
    fn previous_trading_day_skips_backward() {
        assert_eq!(cal().previous_trading_day(d(2024, 4, 1)), Some(d(2024, 3, 28)));
    }

    #[test]
    fn first_on_or_after_identity_for_trading_day() {
        assert_eq!(cal().first_trading_day_on_or_after(d(2024, 1, 2)), Some(d(2024, 1, 2)));
        assert_eq!(cal().first_trading_day_on_or_after(d(2024, 1, 1)), Some(d(2024, 1, 2)));
    }

    #[test]
    fn count_trading_days_inclusive() {
        // 2024-01-02 .. 2024-01-05: Tue..Fri, all trading
        assert_eq!(cal().count_trading_days(d(2024, 1, 2), d(2024, 1, 5)), 4);
        // week with MLK (Mon 01-15 closed)
        assert_eq!(cal().count_trading_days(d(2024, 1, 13), d(2024, 1, 19)), 4);
        assert_eq!(cal().count_trading_days(d(2024, 1, 5), d(2024, 1, 2)), 0);
    }

    #[test]
    fn out_of_horizon_returns_none() {
        assert!(cal().session_window(d(2030, 1, 2)).is_none());
        assert!(cal().next_trading_day(d(2026, 12, 31)).is_none());
    }
}
