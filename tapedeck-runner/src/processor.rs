//! Data processor — derives higher-interval bars and recomputes indicators.
//!
//! A single long-running thread. Each coordinator tick hands it one freshly
//! appended 1-minute bar through the tick slot; it rolls any generated
//! buckets that just closed, recomputes affected indicators, signals the
//! analysis subscription, and hands control back. No I/O, no waiting on
//! anything but its subscription: in data-driven mode the coordinator's wait
//! is bounded by compute time on one bar.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use tapedeck_core::domain::{Bar, Interval};
use tapedeck_core::indicators::IndicatorRegistry;
use tapedeck_core::store::SessionStateStore;
use tapedeck_core::subscription::{Subscription, WaitOutcome};

use crate::metrics::MetricsRegistry;

/// One coordinator tick: which symbol advanced and the 1m bar's start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickJob {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
}

/// Single-slot mailbox written by the coordinator before each signal.
#[derive(Default)]
pub struct TickSlot {
    slot: Mutex<Option<TickJob>>,
}

impl TickSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, job: TickJob) {
        *self.slot.lock() = Some(job);
    }

    pub fn take(&self) -> Option<TickJob> {
        self.slot.lock().take()
    }
}

pub struct DataProcessor {
    store: Arc<SessionStateStore>,
    registry: Arc<IndicatorRegistry>,
    metrics: Arc<MetricsRegistry>,
    /// Signalled by the coordinator once per appended 1m bar.
    input: Arc<Subscription>,
    /// Signalled back when this tick's derived data is in the store.
    done: Arc<Subscription>,
    /// External consumers (analysis engine) wait here.
    analysis: Arc<Subscription>,
    ticks: Arc<TickSlot>,
}

impl DataProcessor {
    pub fn new(
        store: Arc<SessionStateStore>,
        registry: Arc<IndicatorRegistry>,
        metrics: Arc<MetricsRegistry>,
        input: Arc<Subscription>,
        done: Arc<Subscription>,
        analysis: Arc<Subscription>,
        ticks: Arc<TickSlot>,
    ) -> Self {
        Self { store, registry, metrics, input, done, analysis, ticks }
    }

    pub fn run(self) {
        info!("data processor started");
        loop {
            match self.input.wait() {
                WaitOutcome::Cancelled => break,
                WaitOutcome::TimedOut => continue,
                WaitOutcome::Ready => {}
            }
            if let Some(job) = self.ticks.take() {
                self.process_tick(&job);
            }
            self.analysis.signal();
            // re-arm before completing the handshake so the coordinator's
            // next signal never sees a stale gate
            self.input.reset();
            self.done.signal();
        }
        info!("data processor stopped");
    }

    fn process_tick(&self, job: &TickJob) {
        let rolled = self.roll_generated(job);
        self.recompute_indicators(job, &rolled);
    }

    /// Roll every generated bucket the 1m bar at `job.timestamp` closes.
    /// All-or-nothing: a bucket missing any 1m bar is skipped, which also
    /// discards the first bucket when the session started mid-bucket.
    fn roll_generated(&self, job: &TickJob) -> Vec<Interval> {
        let closed_at = job.timestamp + Interval::M1.duration();
        let mut rolled = Vec::new();
        for interval in self.store.generated_intervals() {
            if !interval.is_intraday() || !interval.aligns(closed_at) {
                continue;
            }
            let bucket_start = closed_at - interval.duration();
            // derive inside a block so the read view drops before the append
            let derived = {
                let bars = match self.store.get_bars_since(&job.symbol, Interval::M1, bucket_start)
                {
                    Ok(view) => view,
                    Err(e) => {
                        error!(symbol = %job.symbol, error = %e, "bucket read failed");
                        continue;
                    }
                };
                if bars.len() != interval.minutes() as usize {
                    debug!(
                        symbol = %job.symbol,
                        %interval,
                        have = bars.len(),
                        "partial bucket skipped"
                    );
                    None
                } else {
                    Some(derive_bar(&bars, interval, bucket_start))
                }
            };
            let Some(bar) = derived else { continue };
            match self.store.append_generated_bar(bar) {
                Ok(()) => {
                    self.metrics.incr("bar.generated");
                    rolled.push(interval);
                }
                Err(e) => error!(symbol = %job.symbol, %interval, error = %e, "derived append failed"),
            }
        }
        rolled
    }

    /// Recompute every registered indicator whose input interval updated on
    /// this tick (1m always, plus any bucket that just rolled).
    fn recompute_indicators(&self, job: &TickJob, rolled: &[Interval]) {
        let at = job.timestamp + Interval::M1.duration();
        self.registry.for_each(|id, entry| {
            let interval = entry.spec.interval;
            if interval != Interval::M1 && !rolled.contains(&interval) {
                return;
            }
            let window = match self.store.recent_bars(
                &job.symbol,
                interval,
                entry.kernel.window_hint(),
            ) {
                Ok(bars) => bars,
                Err(e) => {
                    error!(symbol = %job.symbol, indicator = %entry.spec.name, error = %e, "window read failed");
                    return;
                }
            };
            let value = entry.kernel.latest(&window);
            if let Err(e) = self.store.set_indicator(&job.symbol, id, value, at) {
                error!(symbol = %job.symbol, indicator = %entry.spec.name, error = %e, "indicator write failed");
            }
        });
    }
}

/// Pure roll of 1m bars into one derived bar. Byte-identical for identical
/// inputs: open from the first, close from the last, extremes and volume
/// across the bucket.
pub fn derive_bar(bars: &[Bar], interval: Interval, bucket_start: DateTime<Utc>) -> Bar {
    debug_assert!(!bars.is_empty());
    let first = &bars[0];
    let last = &bars[bars.len() - 1];
    Bar {
        symbol: first.symbol.clone(),
        timestamp: bucket_start,
        interval,
        open: first.open,
        high: bars.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max),
        low: bars.iter().map(|b| b.low).fold(f64::INFINITY, f64::min),
        close: last.close,
        volume: bars.iter().map(|b| b.volume).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, h, m, 0).unwrap()
    }

    fn minute_bar(m: u32, close: f64, volume: u64) -> Bar {
        Bar {
            symbol: "AAPL".into(),
            timestamp: ts(14, m),
            interval: Interval::M1,
            open: close - 0.2,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume,
        }
    }

    #[test]
    fn derive_bar_aggregates_ohlcv() {
        let bars: Vec<Bar> = (30..35)
            .map(|m| minute_bar(m, 100.0 + (m - 30) as f64, 1_000))
            .collect();
        let derived = derive_bar(&bars, Interval::M5, ts(14, 30));
        assert_eq!(derived.timestamp, ts(14, 30));
        assert_eq!(derived.interval, Interval::M5);
        assert_eq!(derived.open, bars[0].open);
        assert_eq!(derived.close, bars[4].close);
        assert_eq!(derived.high, 104.5);
        assert_eq!(derived.low, 99.5);
        assert_eq!(derived.volume, 5_000);
    }

    #[test]
    fn derive_bar_is_pure() {
        let bars: Vec<Bar> = (30..35).map(|m| minute_bar(m, 101.25, 2_000)).collect();
        let a = derive_bar(&bars, Interval::M5, ts(14, 30));
        let b = derive_bar(&bars, Interval::M5, ts(14, 30));
        assert_eq!(a, b);
    }

    #[test]
    fn tick_slot_hands_over_latest() {
        let slot = TickSlot::new();
        assert!(slot.take().is_none());
        slot.publish(TickJob { symbol: "AAPL".into(), timestamp: ts(14, 30) });
        assert_eq!(
            slot.take(),
            Some(TickJob { symbol: "AAPL".into(), timestamp: ts(14, 30) })
        );
        assert!(slot.take().is_none());
    }
}
