//! Backtest feed — per-symbol queues and the chronological merge.
//!
//! Phase 3 fills one queue per streamed symbol; Phase 5 repeatedly asks for
//! the earliest head across all queues. Ties break on lexicographic symbol
//! order so replays are deterministic.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};

use tapedeck_core::domain::Bar;

/// Per-symbol FIFO queues of streamed bars for one session.
#[derive(Default)]
pub struct BacktestFeed {
    queues: BTreeMap<String, VecDeque<Bar>>,
}

impl BacktestFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a symbol's session queue (bars already ascending).
    pub fn load(&mut self, symbol: &str, bars: Vec<Bar>) {
        self.queues.insert(symbol.to_string(), bars.into());
    }

    /// Earliest head across all queues; ties resolve to the
    /// lexicographically smallest symbol (BTreeMap iteration order).
    pub fn next_candidate(&self) -> Option<(&str, DateTime<Utc>)> {
        let mut best: Option<(&str, DateTime<Utc>)> = None;
        for (symbol, queue) in &self.queues {
            if let Some(bar) = queue.front() {
                match best {
                    Some((_, ts)) if ts <= bar.timestamp => {}
                    _ => best = Some((symbol.as_str(), bar.timestamp)),
                }
            }
        }
        best
    }

    /// Pop the head bar of `symbol`.
    pub fn pop(&mut self, symbol: &str) -> Option<Bar> {
        self.queues.get_mut(symbol)?.pop_front()
    }

    pub fn is_exhausted(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty)
    }

    pub fn remaining(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tapedeck_core::domain::Interval;

    fn bar(symbol: &str, minute: u32) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 14, 30 + minute, 0).unwrap(),
            interval: Interval::M1,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1_000,
        }
    }

    #[test]
    fn merge_picks_earliest() {
        let mut feed = BacktestFeed::new();
        feed.load("AAPL", vec![bar("AAPL", 1), bar("AAPL", 2)]);
        feed.load("MSFT", vec![bar("MSFT", 0), bar("MSFT", 3)]);
        let (symbol, ts) = feed.next_candidate().unwrap();
        assert_eq!(symbol, "MSFT");
        assert_eq!(ts, bar("MSFT", 0).timestamp);
    }

    #[test]
    fn ties_break_lexicographically() {
        let mut feed = BacktestFeed::new();
        feed.load("MSFT", vec![bar("MSFT", 0)]);
        feed.load("AAPL", vec![bar("AAPL", 0)]);
        let (symbol, _) = feed.next_candidate().unwrap();
        assert_eq!(symbol, "AAPL");
    }

    #[test]
    fn pop_advances_queue() {
        let mut feed = BacktestFeed::new();
        feed.load("AAPL", vec![bar("AAPL", 0), bar("AAPL", 1)]);
        assert_eq!(feed.remaining(), 2);
        let popped = feed.pop("AAPL").unwrap();
        assert_eq!(popped.timestamp, bar("AAPL", 0).timestamp);
        assert_eq!(feed.remaining(), 1);
        assert!(!feed.is_exhausted());
        feed.pop("AAPL").unwrap();
        assert!(feed.is_exhausted());
        assert!(feed.next_candidate().is_none());
    }

    #[test]
    fn full_drain_is_globally_ordered() {
        let mut feed = BacktestFeed::new();
        feed.load("AAPL", vec![bar("AAPL", 0), bar("AAPL", 2)]);
        feed.load("MSFT", vec![bar("MSFT", 0), bar("MSFT", 1)]);
        let mut seen = Vec::new();
        while let Some((symbol, ts)) = feed.next_candidate().map(|(s, t)| (s.to_string(), t)) {
            feed.pop(&symbol).unwrap();
            seen.push((symbol, ts));
        }
        let timestamps: Vec<_> = seen.iter().map(|(_, t)| *t).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
        // AAPL@0 before MSFT@0
        assert_eq!(seen[0].0, "AAPL");
        assert_eq!(seen[1].0, "MSFT");
    }
}
