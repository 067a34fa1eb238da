//! SessionStateStore — the single in-memory source of truth.
//!
//! Bars, indicator values, quality scores, and symbol registration all live
//! here. Many readers, few writers: global structures sit behind one guard,
//! each symbol behind its own, and the global guard is always taken before a
//! per-symbol guard. No guard is ever held across a suspension point.

mod symbol;

pub use symbol::{IndicatorValue, SymbolMetrics, SymbolState};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::domain::{Bar, Interval, StreamKind, SymbolSource};
use crate::indicators::{IndicatorId, IndicatorRegistry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Removal refused while any lock reason remains.
    #[error("symbol {symbol} is locked ({reasons:?})")]
    Locked { symbol: String, reasons: Vec<String> },

    /// Config-declared symbols persist until process exit.
    #[error("symbol {0} is declared in the session config and cannot be removed")]
    ConfigSymbol(String),

    #[error("out-of-order bar for {symbol}/{interval}: {attempted} after {last}")]
    OutOfOrder { symbol: String, interval: Interval, last: DateTime<Utc>, attempted: DateTime<Utc> },

    #[error("misaligned bar for {symbol}/{interval} at {timestamp}")]
    Misaligned { symbol: String, interval: Interval, timestamp: DateTime<Utc> },

    #[error("bar for {symbol} failed OHLC sanity: {detail}")]
    InvalidBar { symbol: String, detail: String },

    /// Write through the wrong entry point for the interval's stream kind.
    #[error("interval {interval} is {kind:?} for this session")]
    StreamKindViolation { interval: Interval, kind: StreamKind },

    #[error("session is not active")]
    SessionInactive,

    #[error("promotion queue is full")]
    PromotionQueueFull,
}

/// Outcome of a registration-style call that may find existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    Inserted,
    AlreadyPresent,
}

/// Outcome of `add_symbol`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Promotion queued; the coordinator will load history and indicators.
    Queued,
    /// Symbol already carries full data — nothing to do.
    AlreadyFull,
}

struct Global {
    symbols: BTreeMap<String, Arc<RwLock<SymbolState>>>,
    config_symbols: BTreeSet<String>,
    current_date: NaiveDate,
    trailing_days: usize,
    stream_kinds: [StreamKind; Interval::COUNT],
}

/// Zero-copy view over a contiguous run of session bars.
///
/// Holds the per-symbol read guard for its whole lifetime: cheap to create,
/// but drop it before calling any store write method for the same symbol.
pub struct BarsView {
    guard: ArcRwLockReadGuard<RawRwLock, SymbolState>,
    slot: usize,
    start: usize,
    end: usize,
}

impl Deref for BarsView {
    type Target = [Bar];

    fn deref(&self) -> &[Bar] {
        &self.guard.session[self.slot][self.start..self.end]
    }
}

impl BarsView {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

const PROMOTION_QUEUE_CAP: usize = 256;

/// The store. All public operations are atomic relative to each other.
pub struct SessionStateStore {
    global: RwLock<Global>,
    promotions: Mutex<VecDeque<String>>,
    active: AtomicBool,
    registry: Arc<IndicatorRegistry>,
}

impl SessionStateStore {
    pub fn new(
        current_date: NaiveDate,
        trailing_days: usize,
        registry: Arc<IndicatorRegistry>,
    ) -> Self {
        Self {
            global: RwLock::new(Global {
                symbols: BTreeMap::new(),
                config_symbols: BTreeSet::new(),
                current_date,
                trailing_days,
                stream_kinds: [StreamKind::Ignored; Interval::COUNT],
            }),
            promotions: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(false),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<IndicatorRegistry> {
        &self.registry
    }

    // ─── Session globals ─────────────────────────────────────────────

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn current_date(&self) -> NaiveDate {
        self.global.read().current_date
    }

    pub fn trailing_days(&self) -> usize {
        self.global.read().trailing_days
    }

    /// Assign the per-interval stream kinds. Called once per session in
    /// Phase 1; immutable until the next session.
    pub fn set_stream_kinds(&self, kinds: [StreamKind; Interval::COUNT]) {
        self.global.write().stream_kinds = kinds;
    }

    pub fn stream_kind(&self, interval: Interval) -> StreamKind {
        self.global.read().stream_kinds[interval.slot()]
    }

    pub fn generated_intervals(&self) -> Vec<Interval> {
        let global = self.global.read();
        (0..Interval::COUNT)
            .filter(|&slot| global.stream_kinds[slot] == StreamKind::Generated)
            .filter_map(Interval::from_slot)
            .collect()
    }

    // ─── Registration ────────────────────────────────────────────────

    /// Ensure a `SymbolState` exists. Idempotent; never touches data.
    pub fn register_symbol(&self, symbol: &str, source: SymbolSource) -> Registered {
        let mut global = self.global.write();
        if global.symbols.contains_key(symbol) {
            return Registered::AlreadyPresent;
        }
        let full_data = source == SymbolSource::Config;
        global
            .symbols
            .insert(symbol.to_string(), Arc::new(RwLock::new(SymbolState::new(source, full_data))));
        if source == SymbolSource::Config {
            global.config_symbols.insert(symbol.to_string());
        }
        Registered::Inserted
    }

    /// Full-data registration: ensure the symbol exists, mark it full-data,
    /// and queue a promotion for the coordinator to load history and
    /// indicators. Idempotent — a symbol that already carries full data is
    /// left untouched. Safe from any thread, including inside a scan.
    pub fn add_symbol(&self, symbol: &str) -> Result<AddOutcome, StoreError> {
        let mut global = self.global.write();
        let existing = global.symbols.get(symbol).cloned();
        if let Some(slot) = &existing {
            if slot.read().full_data {
                global.config_symbols.insert(symbol.to_string());
                return Ok(AddOutcome::AlreadyFull);
            }
        }
        {
            // refuse before mutating anything
            let queue = self.promotions.lock();
            if queue.len() >= PROMOTION_QUEUE_CAP {
                return Err(StoreError::PromotionQueueFull);
            }
        }
        global.config_symbols.insert(symbol.to_string());
        match existing {
            Some(slot) => slot.write().full_data = true,
            None => {
                global.symbols.insert(
                    symbol.to_string(),
                    Arc::new(RwLock::new(SymbolState::new(SymbolSource::Adhoc, true))),
                );
            }
        }
        self.promotions.lock().push_back(symbol.to_string());
        debug!(symbol, "promotion queued");
        Ok(AddOutcome::Queued)
    }

    /// Take all pending promotions, oldest first.
    pub fn drain_promotions(&self) -> Vec<String> {
        self.promotions.lock().drain(..).collect()
    }

    /// Remove an unlocked adhoc symbol and all its storage.
    pub fn remove_symbol(&self, symbol: &str) -> Result<(), StoreError> {
        let mut global = self.global.write();
        let slot = global
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSymbol(symbol.to_string()))?;
        {
            let state = slot.read();
            if state.is_locked() {
                return Err(StoreError::Locked {
                    symbol: symbol.to_string(),
                    reasons: state.lock_reasons.iter().cloned().collect(),
                });
            }
            if state.source == SymbolSource::Config {
                return Err(StoreError::ConfigSymbol(symbol.to_string()));
            }
        }
        global.symbols.remove(symbol);
        global.config_symbols.remove(symbol);
        Ok(())
    }

    pub fn lock_symbol(&self, symbol: &str, reason: &str) -> Result<(), StoreError> {
        let slot = self.symbol_slot(symbol)?;
        slot.write().lock_reasons.insert(reason.to_string());
        Ok(())
    }

    /// Remove one lock reason; the symbol stays locked while any remain.
    pub fn unlock_symbol(&self, symbol: &str, reason: &str) -> Result<(), StoreError> {
        let slot = self.symbol_slot(symbol)?;
        slot.write().lock_reasons.remove(reason);
        Ok(())
    }

    pub fn is_locked(&self, symbol: &str) -> Result<bool, StoreError> {
        Ok(self.symbol_slot(symbol)?.read().is_locked())
    }

    pub fn contains_symbol(&self, symbol: &str) -> bool {
        self.global.read().symbols.contains_key(symbol)
    }

    pub fn is_full_data(&self, symbol: &str) -> bool {
        self.global
            .read()
            .symbols
            .get(symbol)
            .map(|slot| slot.read().full_data)
            .unwrap_or(false)
    }

    pub fn symbol_source(&self, symbol: &str) -> Option<SymbolSource> {
        self.global.read().symbols.get(symbol).map(|slot| slot.read().source)
    }

    /// All registered symbols, lexicographic.
    pub fn symbols(&self) -> Vec<String> {
        self.global.read().symbols.keys().cloned().collect()
    }

    /// Symbols carrying full data, lexicographic.
    pub fn full_data_symbols(&self) -> Vec<String> {
        let global = self.global.read();
        global
            .symbols
            .iter()
            .filter(|(_, slot)| slot.read().full_data)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn symbol_count(&self) -> usize {
        self.global.read().symbols.len()
    }

    // ─── Bars ────────────────────────────────────────────────────────

    /// Coordinator entry point for Streamed intervals.
    pub fn append_streamed_bar(&self, bar: Bar) -> Result<(), StoreError> {
        self.append_validated(bar, StreamKind::Streamed)
    }

    /// Data-processor entry point for Generated intervals. External callers
    /// going through `append_streamed_bar` cannot write these.
    pub fn append_generated_bar(&self, bar: Bar) -> Result<(), StoreError> {
        self.append_validated(bar, StreamKind::Generated)
    }

    fn append_validated(&self, bar: Bar, required_kind: StreamKind) -> Result<(), StoreError> {
        if !self.is_active() {
            return Err(StoreError::SessionInactive);
        }
        if !bar.is_sane() {
            return Err(StoreError::InvalidBar {
                symbol: bar.symbol.clone(),
                detail: format!("ohlc=({}, {}, {}, {})", bar.open, bar.high, bar.low, bar.close),
            });
        }
        if !bar.is_aligned() {
            return Err(StoreError::Misaligned {
                symbol: bar.symbol.clone(),
                interval: bar.interval,
                timestamp: bar.timestamp,
            });
        }
        let slot_arc = {
            let global = self.global.read();
            let kind = global.stream_kinds[bar.interval.slot()];
            if kind != required_kind {
                return Err(StoreError::StreamKindViolation { interval: bar.interval, kind });
            }
            global
                .symbols
                .get(&bar.symbol)
                .cloned()
                .ok_or_else(|| StoreError::UnknownSymbol(bar.symbol.clone()))?
        };

        let mut state = slot_arc.write();
        let slot = bar.interval.slot();
        if let Some(last) = state.session[slot].last() {
            if bar.timestamp <= last.timestamp {
                return Err(StoreError::OutOfOrder {
                    symbol: bar.symbol.clone(),
                    interval: bar.interval,
                    last: last.timestamp,
                    attempted: bar.timestamp,
                });
            }
        }

        state.metrics.session_volume += bar.volume;
        state.metrics.session_high = state.metrics.session_high.max(bar.high);
        state.metrics.session_low = state.metrics.session_low.min(bar.low);
        state.metrics.last_update = Some(bar.interval_end());
        state.latest[slot] = Some(Arc::new(bar.clone()));
        state.session[slot].push(bar);
        Ok(())
    }

    /// Install one day of historical bars. Bars must be ascending; the day
    /// is replaced wholesale if already present.
    pub fn load_historical_day(
        &self,
        symbol: &str,
        interval: Interval,
        day: NaiveDate,
        bars: Vec<Bar>,
    ) -> Result<(), StoreError> {
        for pair in bars.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(StoreError::OutOfOrder {
                    symbol: symbol.to_string(),
                    interval,
                    last: pair[0].timestamp,
                    attempted: pair[1].timestamp,
                });
            }
        }
        let slot_arc = self.symbol_slot(symbol)?;
        let mut state = slot_arc.write();
        state.historical[interval.slot()].insert(day, bars);
        Ok(())
    }

    pub fn historical_days(&self, symbol: &str, interval: Interval) -> Result<Vec<NaiveDate>, StoreError> {
        let slot_arc = self.symbol_slot(symbol)?;
        let state = slot_arc.read();
        Ok(state.historical[interval.slot()].keys().copied().collect())
    }

    pub fn historical_bar_count(&self, symbol: &str, interval: Interval, day: NaiveDate) -> usize {
        self.symbol_slot(symbol)
            .map(|slot| {
                slot.read().historical[interval.slot()].get(&day).map(|b| b.len()).unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Latest bar via the O(1) cache.
    pub fn get_latest_bar(&self, symbol: &str, interval: Interval) -> Option<Arc<Bar>> {
        let slot_arc = self.symbol_slot(symbol).ok()?;
        let state = slot_arc.read();
        state.latest[interval.slot()].clone()
    }

    pub fn session_bar_count(&self, symbol: &str, interval: Interval) -> usize {
        self.symbol_slot(symbol)
            .map(|slot| slot.read().session[interval.slot()].len())
            .unwrap_or(0)
    }

    /// Zero-copy view of the last `n` session bars (fewer if the session is
    /// younger than `n`).
    pub fn get_last_n_bars(
        &self,
        symbol: &str,
        interval: Interval,
        n: usize,
    ) -> Result<BarsView, StoreError> {
        let slot_arc = self.symbol_slot(symbol)?;
        let guard = slot_arc.read_arc();
        let slot = interval.slot();
        let len = guard.session[slot].len();
        Ok(BarsView { guard, slot, start: len.saturating_sub(n), end: len })
    }

    /// Zero-copy view of session bars with `timestamp >= since`, found by
    /// reverse scan from the tail.
    pub fn get_bars_since(
        &self,
        symbol: &str,
        interval: Interval,
        since: DateTime<Utc>,
    ) -> Result<BarsView, StoreError> {
        let slot_arc = self.symbol_slot(symbol)?;
        let guard = slot_arc.read_arc();
        let slot = interval.slot();
        let bars = &guard.session[slot];
        let mut start = bars.len();
        while start > 0 && bars[start - 1].timestamp >= since {
            start -= 1;
        }
        let end = bars.len();
        Ok(BarsView { guard, slot, start, end })
    }

    /// Owned copy of up to `n` most recent bars, reaching back through the
    /// historical tail when the session is short. Used for indicator warmup
    /// windows that straddle the session boundary.
    pub fn recent_bars(
        &self,
        symbol: &str,
        interval: Interval,
        n: usize,
    ) -> Result<Vec<Bar>, StoreError> {
        let slot_arc = self.symbol_slot(symbol)?;
        let state = slot_arc.read();
        let slot = interval.slot();
        let session = &state.session[slot];
        if session.len() >= n {
            return Ok(session[session.len() - n..].to_vec());
        }
        let mut out: Vec<Bar> = Vec::with_capacity(n);
        let need = n - session.len();
        let mut tail: Vec<Bar> = Vec::with_capacity(need);
        for bars in state.historical[slot].values().rev() {
            for bar in bars.iter().rev() {
                tail.push(bar.clone());
                if tail.len() == need {
                    break;
                }
            }
            if tail.len() == need {
                break;
            }
        }
        out.extend(tail.into_iter().rev());
        out.extend_from_slice(session);
        Ok(out)
    }

    // ─── Indicators & quality ────────────────────────────────────────

    pub fn set_indicator(
        &self,
        symbol: &str,
        id: IndicatorId,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let slot_arc = self.symbol_slot(symbol)?;
        let mut state = slot_arc.write();
        if state.indicators.len() <= id.0 {
            state.indicators.resize(id.0 + 1, None);
        }
        state.indicators[id.0] =
            Some(IndicatorValue { value, valid: value.is_finite(), last_update: at });
        Ok(())
    }

    pub fn get_indicator(&self, symbol: &str, name: &str) -> Option<IndicatorValue> {
        let id = self.registry.lookup(name)?;
        self.get_indicator_by_id(symbol, id)
    }

    pub fn get_indicator_by_id(&self, symbol: &str, id: IndicatorId) -> Option<IndicatorValue> {
        let slot_arc = self.symbol_slot(symbol).ok()?;
        let state = slot_arc.read();
        state.indicators.get(id.0).copied().flatten()
    }

    pub fn set_quality(&self, symbol: &str, interval: Interval, pct: f64) -> Result<(), StoreError> {
        let slot_arc = self.symbol_slot(symbol)?;
        slot_arc.write().quality[interval.slot()] = pct.clamp(0.0, 100.0);
        Ok(())
    }

    pub fn get_quality(&self, symbol: &str, interval: Interval) -> Option<f64> {
        let slot_arc = self.symbol_slot(symbol).ok()?;
        let value = slot_arc.read().quality[interval.slot()];
        Some(value)
    }

    pub fn metrics(&self, symbol: &str) -> Option<SymbolMetrics> {
        let slot_arc = self.symbol_slot(symbol).ok()?;
        let value = slot_arc.read().metrics;
        Some(value)
    }

    // ─── Session roll ────────────────────────────────────────────────

    /// Move the current session into historical storage and prepare for
    /// `next_date`. Idempotent: rolling to the current date is a no-op.
    ///
    /// The just-ended day is always retained; older days are evicted beyond
    /// the trailing window.
    pub fn roll_session(&self, next_date: NaiveDate) {
        let mut global = self.global.write();
        if global.current_date == next_date {
            return;
        }
        let ended = global.current_date;
        let retain = global.trailing_days.max(1);
        for slot in global.symbols.values() {
            slot.write().roll_into(ended, retain);
        }
        global.current_date = next_date;
        debug!(%ended, %next_date, "session rolled");
    }

    fn symbol_slot(&self, symbol: &str) -> Result<Arc<RwLock<SymbolState>>, StoreError> {
        self.global
            .read()
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSymbol(symbol.to_string()))
    }
}
