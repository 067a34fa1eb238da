//! Mid-session scanner promotion: history, queue, and idempotency.

mod common;

use std::sync::Arc;

use chrono::Duration;
use tapedeck_core::calendar::TradingCalendar;
use tapedeck_core::domain::{Interval, SymbolSource};
use tapedeck_runner::Session;

use common::{backtest_config, date, day_bars, session_open_utc, watchlist_decl, FakeRepository};

#[test]
fn scanner_promotes_symbol_at_first_slot() {
    let repo = Arc::new(FakeRepository::new());
    repo.insert("AAPL", Interval::M1, day_bars("AAPL", date(2), &[]));
    repo.insert("MSFT", Interval::M1, day_bars("MSFT", date(2), &[]));

    let mut config = backtest_config(&["AAPL"], &[1], 0, date(2), date(2));
    config.indicators = vec!["sma_5_1m".into()];
    config.scanners = vec![watchlist_decl(&["MSFT"], "09:35", "15:55", "5m")];

    let session = Session::new(config, repo, Arc::new(TradingCalendar::us_equities())).unwrap();
    let store = session.store();

    let summary = session.run().unwrap();
    let report = &summary.sessions[0].metrics;

    // promoted exactly once: the 09:40 re-promotion is a no-op
    assert_eq!(report.classes["symbol.promoted"].count, 1);
    assert_eq!(summary.sessions[0].promotions, 1);
    assert_eq!(store.symbol_source("MSFT"), Some(SymbolSource::Adhoc));

    // the promoted symbol's quality appears in the report alongside AAPL's
    assert!(summary.sessions[0].quality.contains_key("MSFT"));

    // MSFT's stream starts at the 09:35 bar, not backfilled to the open
    assert_eq!(store.historical_bar_count("MSFT", Interval::M1, date(2)), 385);
    let first = store.recent_bars("MSFT", Interval::M1, 385).unwrap();
    assert_eq!(first[0].timestamp, session_open_utc(date(2)) + Duration::minutes(5));

    // the config symbol streamed the whole day alongside
    assert_eq!(store.historical_bar_count("AAPL", Interval::M1, date(2)), 390);

    // indicators were computed during the session and invalidated by the roll
    let sma = store.get_indicator("MSFT", "sma_5_1m").unwrap();
    assert!(sma.value.is_finite());
    assert!(!sma.valid);
}

#[test]
fn pre_session_scan_promotes_before_open() {
    let repo = Arc::new(FakeRepository::new());
    repo.insert("AAPL", Interval::M1, day_bars("AAPL", date(2), &[]));
    repo.insert("NVDA", Interval::M1, day_bars("NVDA", date(2), &[]));

    let mut config = backtest_config(&["AAPL"], &[1], 0, date(2), date(2));
    config.scanners = vec![tapedeck_runner::config::ScannerDecl {
        module: "watchlist".into(),
        pre_session: true,
        regular_session: None,
        config: serde_json::json!({ "candidates": ["NVDA"] }),
    }];

    let session = Session::new(config, repo, Arc::new(TradingCalendar::us_equities())).unwrap();
    let store = session.store();
    session.run().unwrap();

    // promoted pre-session, so the full day streamed
    assert_eq!(store.historical_bar_count("NVDA", Interval::M1, date(2)), 390);
}

#[test]
fn unknown_scanner_module_fails_startup() {
    let repo = Arc::new(FakeRepository::new());
    let mut config = backtest_config(&["AAPL"], &[1], 0, date(2), date(2));
    config.scanners = vec![tapedeck_runner::config::ScannerDecl {
        module: "does_not_exist".into(),
        pre_session: true,
        regular_session: None,
        config: serde_json::json!({}),
    }];
    let err =
        Session::new(config, repo, Arc::new(TradingCalendar::us_equities())).unwrap_err();
    assert_eq!(err.taxonomy(), "ConfigError");
}
