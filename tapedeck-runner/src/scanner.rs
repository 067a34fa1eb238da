//! Scanners — pre-session and scheduled intra-session screening.
//!
//! A scanner has `setup` / `scan` / `teardown` and reads the store through a
//! context; promotions it returns are applied through `add_symbol`, which
//! handles idempotency. Scan failures are isolated: a failing scanner is
//! marked failed and the session continues, unless more than half of the
//! configured scanners fail during pre-session setup.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use tapedeck_core::calendar::{SessionWindow, TradingCalendar};
use tapedeck_core::domain::Interval;
use tapedeck_core::store::SessionStateStore;

use crate::config::{ScanWindow, ScannerDecl};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("unknown scanner module '{0}'")]
    UnknownModule(String),

    #[error("scanner '{module}' config invalid: {detail}")]
    BadConfig { module: String, detail: String },

    #[error("scan failed: {0}")]
    Failed(String),
}

/// Read access handed to scanners. Scanners never mutate the store directly;
/// they return promotions in the scan result.
pub struct ScanContext<'a> {
    pub store: &'a SessionStateStore,
    pub calendar: &'a TradingCalendar,
    pub now: DateTime<Utc>,
    pub config: &'a serde_json::Value,
}

/// Outcome of one scan invocation.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub promoted_symbols: Vec<String>,
    pub metadata: serde_json::Value,
}

pub trait Scanner: Send {
    fn name(&self) -> &str;

    fn setup(&mut self, _ctx: &ScanContext) -> Result<(), ScanError> {
        Ok(())
    }

    fn scan(&mut self, ctx: &ScanContext) -> Result<ScanResult, ScanError>;

    fn teardown(&mut self, _ctx: &ScanContext) -> Result<(), ScanError> {
        Ok(())
    }
}

// ─── Built-in scanners ───────────────────────────────────────────────

/// Promotes a fixed candidate list. The simplest useful screener: hand-picked
/// watchlists that should join the session at a scheduled time.
struct WatchlistScanner {
    candidates: Vec<String>,
}

#[derive(Deserialize)]
struct WatchlistConfig {
    candidates: Vec<String>,
}

impl WatchlistScanner {
    fn from_config(config: &serde_json::Value) -> Result<Self, ScanError> {
        let parsed: WatchlistConfig =
            serde_json::from_value(config.clone()).map_err(|e| ScanError::BadConfig {
                module: "watchlist".into(),
                detail: e.to_string(),
            })?;
        Ok(Self { candidates: parsed.candidates })
    }
}

impl Scanner for WatchlistScanner {
    fn name(&self) -> &str {
        "watchlist"
    }

    fn scan(&mut self, _ctx: &ScanContext) -> Result<ScanResult, ScanError> {
        Ok(ScanResult {
            promoted_symbols: self.candidates.clone(),
            metadata: serde_json::json!({ "candidates": self.candidates.len() }),
        })
    }
}

/// Promotes candidates when any trigger symbol prints unusual 1-minute
/// volume: latest bar volume >= multiple × mean of the preceding lookback.
struct VolumeSpikeScanner {
    trigger_symbols: Vec<String>,
    lookback: usize,
    multiple: f64,
    candidates: Vec<String>,
}

#[derive(Deserialize)]
struct VolumeSpikeConfig {
    trigger_symbols: Vec<String>,
    #[serde(default = "default_lookback")]
    lookback: usize,
    #[serde(default = "default_multiple")]
    multiple: f64,
    candidates: Vec<String>,
}

fn default_lookback() -> usize {
    20
}

fn default_multiple() -> f64 {
    3.0
}

impl VolumeSpikeScanner {
    fn from_config(config: &serde_json::Value) -> Result<Self, ScanError> {
        let parsed: VolumeSpikeConfig =
            serde_json::from_value(config.clone()).map_err(|e| ScanError::BadConfig {
                module: "volume_spike".into(),
                detail: e.to_string(),
            })?;
        if parsed.lookback == 0 {
            return Err(ScanError::BadConfig {
                module: "volume_spike".into(),
                detail: "lookback must be >= 1".into(),
            });
        }
        Ok(Self {
            trigger_symbols: parsed.trigger_symbols,
            lookback: parsed.lookback,
            multiple: parsed.multiple,
            candidates: parsed.candidates,
        })
    }
}

impl Scanner for VolumeSpikeScanner {
    fn name(&self) -> &str {
        "volume_spike"
    }

    fn scan(&mut self, ctx: &ScanContext) -> Result<ScanResult, ScanError> {
        let mut fired = Vec::new();
        for symbol in &self.trigger_symbols {
            let bars = match ctx.store.get_last_n_bars(symbol, Interval::M1, self.lookback + 1) {
                Ok(view) => view,
                Err(_) => continue, // trigger not registered (yet)
            };
            if bars.len() < self.lookback + 1 {
                continue;
            }
            let (head, tail) = bars.split_at(bars.len() - 1);
            let mean = head.iter().map(|b| b.volume as f64).sum::<f64>() / head.len() as f64;
            if mean > 0.0 && tail[0].volume as f64 >= self.multiple * mean {
                fired.push(symbol.clone());
            }
        }
        let promoted = if fired.is_empty() { Vec::new() } else { self.candidates.clone() };
        Ok(ScanResult {
            promoted_symbols: promoted,
            metadata: serde_json::json!({ "triggers_fired": fired }),
        })
    }
}

/// Promotes candidates when any trigger symbol prints a new session high
/// since the previous scan. The first scan of a session only records the
/// baseline; highs are tracked per symbol and cleared on setup.
struct SessionHighScanner {
    trigger_symbols: Vec<String>,
    candidates: Vec<String>,
    highs: HashMap<String, f64>,
}

#[derive(Deserialize)]
struct SessionHighConfig {
    trigger_symbols: Vec<String>,
    candidates: Vec<String>,
}

impl SessionHighScanner {
    fn from_config(config: &serde_json::Value) -> Result<Self, ScanError> {
        let parsed: SessionHighConfig =
            serde_json::from_value(config.clone()).map_err(|e| ScanError::BadConfig {
                module: "session_high".into(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            trigger_symbols: parsed.trigger_symbols,
            candidates: parsed.candidates,
            highs: HashMap::new(),
        })
    }
}

impl Scanner for SessionHighScanner {
    fn name(&self) -> &str {
        "session_high"
    }

    fn setup(&mut self, _ctx: &ScanContext) -> Result<(), ScanError> {
        self.highs.clear();
        Ok(())
    }

    fn scan(&mut self, ctx: &ScanContext) -> Result<ScanResult, ScanError> {
        let mut fired = Vec::new();
        for symbol in &self.trigger_symbols {
            let Some(metrics) = ctx.store.metrics(symbol) else { continue };
            if metrics.last_update.is_none() {
                continue; // no session bars yet
            }
            let high = metrics.session_high;
            if let Some(&prev) = self.highs.get(symbol) {
                if high > prev {
                    fired.push(symbol.clone());
                }
            }
            self.highs.insert(symbol.clone(), high);
        }
        let promoted = if fired.is_empty() { Vec::new() } else { self.candidates.clone() };
        Ok(ScanResult {
            promoted_symbols: promoted,
            metadata: serde_json::json!({ "new_highs": fired }),
        })
    }
}

/// Resolve a built-in scanner module name. Startup fails on unknown names.
pub fn build_scanner(
    module: &str,
    config: &serde_json::Value,
) -> Result<Box<dyn Scanner>, ScanError> {
    match module {
        "watchlist" => Ok(Box::new(WatchlistScanner::from_config(config)?)),
        "volume_spike" => Ok(Box::new(VolumeSpikeScanner::from_config(config)?)),
        "session_high" => Ok(Box::new(SessionHighScanner::from_config(config)?)),
        other => Err(ScanError::UnknownModule(other.to_string())),
    }
}

// ─── Scheduling ──────────────────────────────────────────────────────

/// A scan window resolved against one session date, in UTC.
#[derive(Debug, Clone, Copy)]
struct ResolvedWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: chrono::Duration,
}

#[derive(Debug, Default)]
struct ScheduleState {
    windows: Vec<ResolvedWindow>,
    window_idx: usize,
    next_scan: Option<DateTime<Utc>>,
}

impl ScheduleState {
    /// Resolve config windows (exchange-local HH:MM) onto a session date.
    /// The first slot is the window start, already >= session open by config
    /// validation; windows are clamped to the actual (possibly early) close.
    fn resolve(decl_windows: &[ScanWindow], session: &SessionWindow) -> Self {
        let mut windows = Vec::new();
        for w in decl_windows {
            let (Some(start_t), Some(end_t), Some(interval)) =
                (w.start_time(), w.end_time(), w.interval())
            else {
                continue; // validated at config load
            };
            let start = window_instant(session, start_t).max(session.open_utc);
            let end = window_instant(session, end_t).min(session.close_utc);
            if start < end {
                windows.push(ResolvedWindow { start, end, step: interval.duration() });
            }
        }
        windows.sort_by_key(|w| w.start);
        let next_scan = windows.first().map(|w| w.start);
        Self { windows, window_idx: 0, next_scan }
    }

    fn due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.next_scan, Some(next) if next <= now)
    }

    /// Advance past `now`, hopping to the next window when the current one
    /// is exhausted. Slots skipped because time jumped are counted.
    fn advance(&mut self, now: DateTime<Utc>) -> usize {
        let mut skipped = 0;
        while let Some(next) = self.next_scan {
            let window = &self.windows[self.window_idx];
            let candidate = next + window.step;
            let candidate = if candidate >= window.end {
                self.window_idx += 1;
                match self.windows.get(self.window_idx) {
                    Some(w) => w.start,
                    None => {
                        self.next_scan = None;
                        return skipped;
                    }
                }
            } else {
                candidate
            };
            self.next_scan = Some(candidate);
            if candidate > now {
                return skipped;
            }
            skipped += 1;
        }
        skipped
    }

    fn is_done(&self) -> bool {
        self.next_scan.is_none()
    }
}

/// Exchange-local HH:MM mapped to UTC as an offset from the 09:30 open.
/// Correct across DST because the open itself carries the day's offset.
fn window_instant(session: &SessionWindow, time: chrono::NaiveTime) -> DateTime<Utc> {
    let open = chrono::NaiveTime::from_hms_opt(9, 30, 0).expect("valid time");
    session.open_utc + (time - open)
}

// ─── Manager ─────────────────────────────────────────────────────────

struct ScannerEntry {
    decl: ScannerDecl,
    scanner: Box<dyn Scanner>,
    setup_done: bool,
    torn_down: bool,
    failed: bool,
    schedule: ScheduleState,
}

/// Owns the scanner trait objects and their schedules.
pub struct ScannerManager {
    entries: Vec<ScannerEntry>,
}

impl ScannerManager {
    /// Instantiate every declared scanner. Any unloadable scanner fails
    /// startup.
    pub fn load(decls: &[ScannerDecl]) -> Result<Self, ScanError> {
        let mut entries = Vec::with_capacity(decls.len());
        for decl in decls {
            let scanner = build_scanner(&decl.module, &decl.config)?;
            entries.push(ScannerEntry {
                decl: decl.clone(),
                scanner,
                setup_done: false,
                torn_down: false,
                failed: false,
                schedule: ScheduleState::default(),
            });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.failed).count()
    }

    /// Phase 2.5: setup everything, run pre-session-only scans, tear the
    /// pre-session-only scanners back down. Returns the number of scanners
    /// that failed; the caller aborts if a majority failed.
    pub fn setup_pre_session_scanners(
        &mut self,
        store: &SessionStateStore,
        calendar: &TradingCalendar,
        now: DateTime<Utc>,
    ) -> usize {
        for entry in &mut self.entries {
            let ctx = ScanContext { store, calendar, now, config: &entry.decl.config };
            match entry.scanner.setup(&ctx) {
                Ok(()) => entry.setup_done = true,
                Err(e) => {
                    warn!(scanner = entry.scanner.name(), error = %e, "scanner setup failed");
                    entry.failed = true;
                }
            }
        }
        for entry in &mut self.entries {
            if entry.failed || !entry.decl.is_pre_session_only() {
                continue;
            }
            let ctx = ScanContext { store, calendar, now, config: &entry.decl.config };
            match entry.scanner.scan(&ctx) {
                Ok(result) => apply_promotions(store, entry.scanner.name(), &result),
                Err(e) => {
                    warn!(scanner = entry.scanner.name(), error = %e, "pre-session scan failed");
                    entry.failed = true;
                }
            }
            let ctx = ScanContext { store, calendar, now, config: &entry.decl.config };
            if let Err(e) = entry.scanner.teardown(&ctx) {
                warn!(scanner = entry.scanner.name(), error = %e, "teardown failed");
            }
            entry.torn_down = true;
        }
        self.failed_count()
    }

    /// Phase 4: arm schedules for the session date.
    pub fn on_session_start(&mut self, session: &SessionWindow) {
        for entry in &mut self.entries {
            let windows = entry.decl.regular_session.as_deref().unwrap_or(&[]);
            entry.schedule = if entry.failed || entry.torn_down || windows.is_empty() {
                ScheduleState::default()
            } else {
                ScheduleState::resolve(windows, session)
            };
        }
    }

    /// Dispatch every scan due at or before `now`. Promotions are applied
    /// through `add_symbol`; the store's promotion queue carries them to the
    /// coordinator. Returns the number of scans executed.
    pub fn check_and_execute_scans(
        &mut self,
        store: &SessionStateStore,
        calendar: &TradingCalendar,
        now: DateTime<Utc>,
    ) -> usize {
        let mut executed = 0;
        for entry in &mut self.entries {
            if entry.failed || !entry.schedule.due(now) {
                continue;
            }
            let ctx = ScanContext { store, calendar, now, config: &entry.decl.config };
            match entry.scanner.scan(&ctx) {
                Ok(result) => {
                    apply_promotions(store, entry.scanner.name(), &result);
                    executed += 1;
                }
                Err(e) => {
                    warn!(scanner = entry.scanner.name(), error = %e, "scheduled scan failed");
                    entry.failed = true;
                }
            }
            let skipped = entry.schedule.advance(now);
            if skipped > 0 {
                warn!(scanner = entry.scanner.name(), skipped, "scan slots skipped");
            }
            if entry.schedule.is_done() {
                info!(scanner = entry.scanner.name(), "schedule exhausted for session");
            }
        }
        executed
    }

    /// Phase 6: tear down everything still standing.
    pub fn on_session_end(
        &mut self,
        store: &SessionStateStore,
        calendar: &TradingCalendar,
        now: DateTime<Utc>,
    ) {
        for entry in &mut self.entries {
            if entry.torn_down || !entry.setup_done {
                continue;
            }
            let ctx = ScanContext { store, calendar, now, config: &entry.decl.config };
            if let Err(e) = entry.scanner.teardown(&ctx) {
                warn!(scanner = entry.scanner.name(), error = %e, "teardown failed");
            }
            entry.torn_down = true;
        }
    }

    /// Phase 1 of the next session: schedules re-arm, teardown state resets.
    pub fn reset_for_new_session(&mut self) {
        for entry in &mut self.entries {
            if !entry.decl.is_pre_session_only() {
                entry.torn_down = false;
            }
            entry.schedule = ScheduleState::default();
        }
    }
}

fn apply_promotions(store: &SessionStateStore, scanner: &str, result: &ScanResult) {
    for symbol in &result.promoted_symbols {
        match store.add_symbol(symbol) {
            Ok(outcome) => info!(scanner, %symbol, ?outcome, "scanner promotion"),
            Err(e) => warn!(scanner, %symbol, error = %e, "promotion rejected"),
        }
    }
}
