//! Session aggregate — owns every subsystem and the two pipeline threads.
//!
//! No process-wide globals: the store, clock, calendar, subscriptions, and
//! metrics are explicit values owned here and handed to the coordinator and
//! data processor at construction. Test harnesses can run several sessions
//! side by side.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use tapedeck_core::calendar::TradingCalendar;
use tapedeck_core::clock::TimeAuthority;
use tapedeck_core::indicators::IndicatorRegistry;
use tapedeck_core::repository::{HistoricalRepository, LiveStream};
use tapedeck_core::store::SessionStateStore;
use tapedeck_core::subscription::{Subscription, SubscriptionMode};

use crate::config::{ConfigError, SessionConfig, SessionMode};
use crate::coordinator::{SessionCoordinator, SessionError};
use crate::metrics::{MetricsRegistry, MetricsReport};
use crate::processor::{DataProcessor, TickSlot};
use crate::scanner::ScannerManager;

/// Bounded wait for the data-processor thread at shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Consumer timeout on the live handshake.
const LIVE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// The analysis gate never blocks the producer; consumers poll at this pace.
const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle phase, readable from any thread for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Init,
    Historical,
    PreScan,
    QueueLoad,
    Active,
    Streaming,
    EndOfSession,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            1 => Phase::Init,
            2 => Phase::Historical,
            3 => Phase::PreScan,
            4 => Phase::QueueLoad,
            5 => Phase::Active,
            6 => Phase::Streaming,
            7 => Phase::EndOfSession,
            _ => Phase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Init => 1,
            Phase::Historical => 2,
            Phase::PreScan => 3,
            Phase::QueueLoad => 4,
            Phase::Active => 5,
            Phase::Streaming => 6,
            Phase::EndOfSession => 7,
        }
    }
}

/// Pause gate, shutdown token, and phase cell shared between the coordinator
/// and the control plane.
pub struct RunControls {
    paused: AtomicBool,
    shutdown: AtomicBool,
    phase: AtomicU8,
    gate: Mutex<()>,
    cond: Condvar,
}

impl Default for RunControls {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControls {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            phase: AtomicU8::new(Phase::Idle.as_u8()),
            gate: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Block while paused. Returns true if any pause was observed, so the
    /// caller can re-anchor wall-clock pacing.
    pub fn wait_if_paused(&self) -> bool {
        if !self.is_paused() {
            return false;
        }
        let mut guard = self.gate.lock();
        while self.is_paused() && !self.shutdown_requested() {
            self.cond.wait(&mut guard);
        }
        true
    }
}

/// One session's drained metrics, final quality, and promotion count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub date: NaiveDate,
    pub metrics: MetricsReport,
    /// Final quality per symbol, keyed by interval token, as published at
    /// Phase 6.
    pub quality: BTreeMap<String, BTreeMap<String, f64>>,
    /// Promotions fulfilled during this session.
    pub promotions: u64,
}

/// Result of a full run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub session_name: String,
    pub run_id: String,
    pub sessions: Vec<SessionReport>,
}

/// Live view into a running session for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub session_date: NaiveDate,
    pub virtual_now: DateTime<Utc>,
    pub active: bool,
    pub symbol_count: usize,
}

/// Cloneable handle: pause/resume/stop/status from any thread.
#[derive(Clone)]
pub struct SessionHandle {
    controls: Arc<RunControls>,
    store: Arc<SessionStateStore>,
    clock: Arc<TimeAuthority>,
    subscriptions: [Arc<Subscription>; 3],
}

impl SessionHandle {
    pub fn pause(&self) {
        info!("pause requested");
        self.controls.pause();
    }

    pub fn resume(&self) {
        info!("resume requested");
        self.controls.resume();
    }

    /// Cooperative shutdown: set the token and cancel every subscription so
    /// both threads wake, drain their current iteration, and exit.
    pub fn stop(&self) {
        info!("shutdown requested");
        self.controls.request_shutdown();
        for subscription in &self.subscriptions {
            subscription.cancel();
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.controls.phase(),
            session_date: self.store.current_date(),
            virtual_now: self.clock.now(),
            active: self.store.is_active(),
            symbol_count: self.store.full_data_symbols().len(),
        }
    }
}

/// The fully wired orchestrator for one run.
pub struct Session {
    config: SessionConfig,
    calendar: Arc<TradingCalendar>,
    repository: Arc<dyn HistoricalRepository>,
    live: Option<Box<dyn LiveStream>>,
    store: Arc<SessionStateStore>,
    clock: Arc<TimeAuthority>,
    registry: Arc<IndicatorRegistry>,
    metrics: Arc<MetricsRegistry>,
    controls: Arc<RunControls>,
    dp_input: Arc<Subscription>,
    dp_done: Arc<Subscription>,
    analysis: Arc<Subscription>,
    ticks: Arc<TickSlot>,
    scanners: ScannerManager,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        config: SessionConfig,
        repository: Arc<dyn HistoricalRepository>,
        calendar: Arc<TradingCalendar>,
    ) -> Result<Self, SessionError> {
        Self::with_live(config, repository, calendar, None)
    }

    pub fn with_live(
        config: SessionConfig,
        repository: Arc<dyn HistoricalRepository>,
        calendar: Arc<TradingCalendar>,
        live: Option<Box<dyn LiveStream>>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        if config.mode == SessionMode::Live && live.is_none() {
            return Err(SessionError::MissingLiveStream);
        }

        let registry = Arc::new(IndicatorRegistry::new());
        let scanners = ScannerManager::load(&config.scanners)?;

        let (clock, first_date) = match config.mode {
            SessionMode::Backtest => {
                let backtest = config.backtest.as_ref().ok_or_else(|| {
                    SessionError::Config(ConfigError::Invalid("backtest settings missing".into()))
                })?;
                let first = calendar
                    .first_trading_day_on_or_after(backtest.start_date)
                    .filter(|&d| d <= backtest.end_date)
                    .ok_or_else(|| {
                        SessionError::Config(ConfigError::Invalid(format!(
                            "no trading days in {}..{}",
                            backtest.start_date, backtest.end_date
                        )))
                    })?;
                let window = calendar
                    .session_window(first)
                    .ok_or(SessionError::NoSessionWindow(first))?;
                (TimeAuthority::backtest(window.open_utc, Arc::clone(&calendar)), first)
            }
            SessionMode::Live => {
                let clock = TimeAuthority::live(Arc::clone(&calendar));
                let today = clock.session_date();
                (clock, today)
            }
        };
        let clock = Arc::new(clock);

        let handshake_mode = match config.mode {
            SessionMode::Live => SubscriptionMode::Live { timeout: LIVE_HANDSHAKE_TIMEOUT },
            SessionMode::Backtest => {
                let speed = config.backtest.as_ref().map(|b| b.speed).unwrap_or(0.0);
                if speed > 0.0 {
                    SubscriptionMode::ClockDriven {
                        timeout: Duration::from_secs_f64(60.0 / speed),
                    }
                } else {
                    SubscriptionMode::DataDriven
                }
            }
        };

        let store = Arc::new(SessionStateStore::new(
            first_date,
            config.trailing_days,
            Arc::clone(&registry),
        ));

        Ok(Self {
            store,
            clock,
            registry,
            metrics: Arc::new(MetricsRegistry::new()),
            controls: Arc::new(RunControls::new()),
            dp_input: Arc::new(Subscription::new(handshake_mode)),
            dp_done: Arc::new(Subscription::new(handshake_mode)),
            // the processor never blocks on a slow analysis consumer;
            // overruns are counted on the gate instead
            analysis: Arc::new(Subscription::new(SubscriptionMode::Live {
                timeout: ANALYSIS_TIMEOUT,
            })),
            ticks: Arc::new(TickSlot::new()),
            scanners,
            config,
            calendar,
            repository,
            live,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            controls: Arc::clone(&self.controls),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            subscriptions: [
                Arc::clone(&self.dp_input),
                Arc::clone(&self.dp_done),
                Arc::clone(&self.analysis),
            ],
        }
    }

    /// External consumers (analysis engines) wait on this gate; it fires
    /// after every processed tick.
    pub fn analysis_subscription(&self) -> Arc<Subscription> {
        Arc::clone(&self.analysis)
    }

    pub fn store(&self) -> Arc<SessionStateStore> {
        Arc::clone(&self.store)
    }

    /// Run to completion on the calling thread. The data processor runs on
    /// its own thread and is joined (bounded) before returning.
    pub fn run(self) -> Result<RunSummary, SessionError> {
        let run_id = self.config.run_id();
        let session_name = self.config.session_name.clone();
        let short_id = &run_id[..12.min(run_id.len())];
        info!(session = %session_name, run_id = short_id, "run starting");

        let processor = DataProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            Arc::clone(&self.dp_input),
            Arc::clone(&self.dp_done),
            Arc::clone(&self.analysis),
            Arc::clone(&self.ticks),
        );
        let (done_tx, done_rx) = mpsc::channel();
        let dp_thread = std::thread::Builder::new()
            .name("tapedeck-dp".into())
            .spawn(move || {
                processor.run();
                let _ = done_tx.send(());
            })
            .expect("spawn data processor thread");

        let mut coordinator = SessionCoordinator::new(
            self.config,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::clone(&self.calendar),
            self.repository,
            self.live,
            self.scanners,
            Arc::clone(&self.metrics),
            Arc::clone(&self.controls),
            Arc::clone(&self.dp_input),
            Arc::clone(&self.dp_done),
            Arc::clone(&self.ticks),
        );
        let result = coordinator.run();

        // cooperative shutdown: wake the processor and give it a bounded
        // window to drain
        self.dp_input.cancel();
        self.dp_done.cancel();
        self.analysis.cancel();
        let joined = done_rx.recv_timeout(JOIN_TIMEOUT).is_ok();
        if joined {
            if dp_thread.join().is_err() {
                error!("data processor thread panicked");
            }
        } else {
            warn!(timeout = ?JOIN_TIMEOUT, "data processor leaked at shutdown");
        }

        let sessions = result?;
        if !joined {
            return Err(SessionError::ShutdownTimeout(JOIN_TIMEOUT));
        }
        self.controls.set_phase(Phase::Idle);
        info!(session = %session_name, sessions = sessions.len(), "run complete");
        Ok(RunSummary { session_name, run_id, sessions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_u8() {
        for phase in [
            Phase::Idle,
            Phase::Init,
            Phase::Historical,
            Phase::PreScan,
            Phase::QueueLoad,
            Phase::Active,
            Phase::Streaming,
            Phase::EndOfSession,
        ] {
            assert_eq!(Phase::from_u8(phase.as_u8()), phase);
        }
    }

    #[test]
    fn controls_pause_resume() {
        let controls = RunControls::new();
        assert!(!controls.wait_if_paused());
        controls.pause();
        assert!(controls.is_paused());
        controls.resume();
        assert!(!controls.is_paused());
    }

    #[test]
    fn paused_waiter_released_by_resume() {
        let controls = Arc::new(RunControls::new());
        controls.pause();
        let waiter = {
            let controls = Arc::clone(&controls);
            std::thread::spawn(move || controls.wait_if_paused())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        controls.resume();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn paused_waiter_released_by_shutdown() {
        let controls = Arc::new(RunControls::new());
        controls.pause();
        let waiter = {
            let controls = Arc::clone(&controls);
            std::thread::spawn(move || controls.wait_if_paused())
        };
        std::thread::sleep(Duration::from_millis(20));
        controls.request_shutdown();
        assert!(waiter.join().unwrap());
    }
}
