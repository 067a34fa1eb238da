//! Metrics registry — running statistics per event class.
//!
//! Hot-path friendly: `observe` is one short mutex hold, no allocation after
//! the first observation of a class. Drained into a serializable report at
//! the end of each session.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Running min/max/mean/count accumulator.
#[derive(Debug, Clone, Copy)]
pub struct RunningStat {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
}

impl RunningStat {
    fn new() -> Self {
        Self { count: 0, min: f64::INFINITY, max: f64::NEG_INFINITY, sum: 0.0 }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }
}

/// Frozen view of one event class, as it appears in the session report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl From<RunningStat> for StatSummary {
    fn from(stat: RunningStat) -> Self {
        let empty = stat.count == 0;
        Self {
            count: stat.count,
            min: if empty { 0.0 } else { stat.min },
            max: if empty { 0.0 } else { stat.max },
            mean: stat.mean(),
        }
    }
}

/// End-of-session metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub classes: BTreeMap<String, StatSummary>,
}

/// Registry of running statistics keyed by event class.
#[derive(Default)]
pub struct MetricsRegistry {
    stats: Mutex<BTreeMap<String, RunningStat>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, class: &str, value: f64) {
        let mut stats = self.stats.lock();
        stats.entry(class.to_string()).or_insert_with(RunningStat::new).observe(value);
    }

    /// Count an occurrence with no magnitude.
    pub fn incr(&self, class: &str) {
        self.observe(class, 1.0);
    }

    pub fn count(&self, class: &str) -> u64 {
        self.stats.lock().get(class).map(|s| s.count()).unwrap_or(0)
    }

    /// Snapshot without resetting.
    pub fn report(&self) -> MetricsReport {
        let stats = self.stats.lock();
        MetricsReport {
            classes: stats.iter().map(|(k, &v)| (k.clone(), StatSummary::from(v))).collect(),
        }
    }

    /// Snapshot and reset, for per-session reports.
    pub fn drain(&self) -> MetricsReport {
        let mut stats = self.stats.lock();
        let report = MetricsReport {
            classes: stats.iter().map(|(k, &v)| (k.clone(), StatSummary::from(v))).collect(),
        };
        stats.clear();
        report
    }
}
