//! End-to-end single-day backtests: the happy path and the gap scenario.

mod common;

use std::sync::Arc;

use chrono::Duration;
use tapedeck_core::calendar::TradingCalendar;
use tapedeck_core::domain::Interval;
use tapedeck_runner::Session;

use common::{backtest_config, date, day_bars, session_open_utc, FakeRepository};

fn calendar() -> Arc<TradingCalendar> {
    Arc::new(TradingCalendar::us_equities())
}

#[test]
fn full_session_generates_and_scores_cleanly() {
    let repo = Arc::new(FakeRepository::new());
    repo.insert("AAPL", Interval::M1, day_bars("AAPL", date(2), &[]));

    let config = backtest_config(&["AAPL"], &[1, 5], 0, date(2), date(2));
    let session = Session::new(config, repo, calendar()).unwrap();
    let store = session.store();
    let handle = session.handle();

    let summary = session.run().unwrap();
    assert_eq!(summary.sessions.len(), 1);

    let report = &summary.sessions[0].metrics;
    assert_eq!(report.classes["bar.streamed"].count, 390);
    assert_eq!(report.classes["bar.generated"].count, 78);
    assert_eq!(report.classes["overrun.dp_input_total"].mean, 0.0);

    // the session report carries the final quality and promotion count
    assert_eq!(summary.sessions[0].quality["AAPL"]["1m"], 100.0);
    assert_eq!(summary.sessions[0].quality["AAPL"]["5m"], 100.0);
    assert_eq!(summary.sessions[0].promotions, 0);

    // exactly one roll: the session landed in historical storage
    assert_eq!(store.historical_bar_count("AAPL", Interval::M1, date(2)), 390);
    assert_eq!(store.historical_bar_count("AAPL", Interval::M5, date(2)), 78);
    assert_eq!(store.session_bar_count("AAPL", Interval::M1), 0);

    // virtual time stopped exactly at the close
    let close = session_open_utc(date(2)) + Duration::minutes(390);
    assert_eq!(handle.status().virtual_now, close);

    assert_eq!(store.get_quality("AAPL", Interval::M1), Some(100.0));
    assert_eq!(store.get_quality("AAPL", Interval::M5), Some(100.0));
}

#[test]
fn feed_gap_skips_partial_bucket_and_scores_down() {
    let repo = Arc::new(FakeRepository::new());
    // 10:00..10:04 missing: minutes 30..34 from the open
    repo.insert("AAPL", Interval::M1, day_bars("AAPL", date(2), &[30, 31, 32, 33, 34]));

    let config = backtest_config(&["AAPL"], &[1, 5], 0, date(2), date(2));
    let session = Session::new(config, repo, calendar()).unwrap();
    let store = session.store();

    let summary = session.run().unwrap();

    assert_eq!(store.historical_bar_count("AAPL", Interval::M1, date(2)), 385);
    // the 10:00 bucket is all-or-nothing: not emitted
    assert_eq!(store.historical_bar_count("AAPL", Interval::M5, date(2)), 77);

    let q1 = store.get_quality("AAPL", Interval::M1).unwrap();
    let q5 = store.get_quality("AAPL", Interval::M5).unwrap();
    assert!((q1 - 100.0 * 385.0 / 390.0).abs() < 1e-6, "q1 = {q1}");
    assert!((q5 - 100.0 * 77.0 / 78.0).abs() < 1e-6, "q5 = {q5}");

    // the same scores land in the session report
    let reported = &summary.sessions[0].quality["AAPL"];
    assert!((reported["1m"] - q1).abs() < 1e-12);
    assert!((reported["5m"] - q5).abs() < 1e-12);
}

#[test]
fn bar_at_close_is_dropped_and_session_ends() {
    let repo = Arc::new(FakeRepository::new());
    let mut bars = day_bars("AAPL", date(2), &[]);
    // one extra bar stamped exactly at the close
    let mut extra = bars.last().unwrap().clone();
    extra.timestamp = session_open_utc(date(2)) + Duration::minutes(390);
    bars.push(extra);
    repo.insert("AAPL", Interval::M1, bars);

    let config = backtest_config(&["AAPL"], &[1], 0, date(2), date(2));
    let session = Session::new(config, repo, calendar()).unwrap();
    let store = session.store();

    let summary = session.run().unwrap();
    let report = &summary.sessions[0].metrics;
    assert_eq!(report.classes["bar.streamed"].count, 390);
    assert_eq!(report.classes["bar.dropped_after_close"].count, 1);
    assert_eq!(store.historical_bar_count("AAPL", Interval::M1, date(2)), 390);
}

#[test]
fn two_symbols_merge_deterministically() {
    let repo = Arc::new(FakeRepository::new());
    repo.insert("MSFT", Interval::M1, day_bars("MSFT", date(2), &[]));
    repo.insert("AAPL", Interval::M1, day_bars("AAPL", date(2), &[]));

    let config = backtest_config(&["MSFT", "AAPL"], &[1], 0, date(2), date(2));
    let session = Session::new(config, repo, calendar()).unwrap();
    let store = session.store();

    let summary = session.run().unwrap();
    assert_eq!(summary.sessions[0].metrics.classes["bar.streamed"].count, 780);
    assert_eq!(store.historical_bar_count("AAPL", Interval::M1, date(2)), 390);
    assert_eq!(store.historical_bar_count("MSFT", Interval::M1, date(2)), 390);
}

#[test]
fn repository_outage_recovers_within_retry_budget() {
    let repo = Arc::new(FakeRepository::new());
    repo.insert("AAPL", Interval::M1, day_bars("AAPL", date(2), &[]));
    repo.fail_times(2); // third attempt succeeds

    let config = backtest_config(&["AAPL"], &[1], 0, date(2), date(2));
    let session = Session::new(config, repo, calendar()).unwrap();
    session.run().unwrap();
}

#[test]
fn repository_outage_beyond_retries_is_fatal() {
    let repo = Arc::new(FakeRepository::new());
    repo.insert("AAPL", Interval::M1, day_bars("AAPL", date(2), &[]));
    repo.fail_times(10);

    let config = backtest_config(&["AAPL"], &[1], 0, date(2), date(2));
    let session = Session::new(config, repo, calendar()).unwrap();
    let err = session.run().unwrap_err();
    assert_eq!(err.taxonomy(), "RepositoryUnavailable");
}
