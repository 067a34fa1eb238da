//! Per-symbol state owned by the session state store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::domain::{Bar, Interval, SymbolSource};

/// Snapshot of one indicator output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatorValue {
    pub value: f64,
    pub valid: bool,
    pub last_update: DateTime<Utc>,
}

/// Running per-symbol aggregates for the current session.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SymbolMetrics {
    pub session_volume: u64,
    pub session_high: f64,
    pub session_low: f64,
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for SymbolMetrics {
    fn default() -> Self {
        Self {
            session_volume: 0,
            session_high: f64::NEG_INFINITY,
            session_low: f64::INFINITY,
            last_update: None,
        }
    }
}

/// All state for one registered symbol.
///
/// Owned exclusively by the store behind a per-symbol RwLock; interval-keyed
/// containers are fixed arrays indexed by `Interval::slot()`.
pub struct SymbolState {
    pub(crate) source: SymbolSource,
    /// True once the symbol carries full data (streams + indicators), either
    /// from the config sweep or a promotion.
    pub(crate) full_data: bool,
    pub(crate) lock_reasons: BTreeSet<String>,
    pub(crate) session: [Vec<Bar>; Interval::COUNT],
    pub(crate) historical: [BTreeMap<NaiveDate, Vec<Bar>>; Interval::COUNT],
    /// Indexed by `IndicatorId`; grown lazily as indicators register.
    pub(crate) indicators: Vec<Option<IndicatorValue>>,
    pub(crate) quality: [f64; Interval::COUNT],
    pub(crate) metrics: SymbolMetrics,
    /// O(1) latest-bar cache per interval.
    pub(crate) latest: [Option<Arc<Bar>>; Interval::COUNT],
}

impl SymbolState {
    pub(crate) fn new(source: SymbolSource, full_data: bool) -> Self {
        Self {
            source,
            full_data,
            lock_reasons: BTreeSet::new(),
            session: Default::default(),
            historical: Default::default(),
            indicators: Vec::new(),
            quality: [100.0; Interval::COUNT],
            metrics: SymbolMetrics::default(),
            latest: Default::default(),
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        !self.lock_reasons.is_empty()
    }

    /// Move the session into `historical[day]`, drop the realtime surface,
    /// and evict days beyond the retention cap (oldest first). Quality keeps
    /// its last published value until the next session writes over it.
    pub(crate) fn roll_into(&mut self, day: NaiveDate, retain_days: usize) {
        for slot in 0..Interval::COUNT {
            let bars = std::mem::take(&mut self.session[slot]);
            if !bars.is_empty() {
                self.historical[slot].insert(day, bars);
            }
            while self.historical[slot].len() > retain_days {
                self.historical[slot].pop_first();
            }
            self.latest[slot] = None;
        }
        for value in self.indicators.iter_mut().flatten() {
            value.valid = false;
        }
        self.metrics = SymbolMetrics::default();
    }
}
