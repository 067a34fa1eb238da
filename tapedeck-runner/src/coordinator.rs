//! Session coordinator — drives the lifecycle and owns virtual time.
//!
//! One long-running thread per run. Each trading day goes through six phases:
//! initialization, historical load, pre-session scans, queue load, activation,
//! streaming, end-of-session. The coordinator is the only component that
//! advances the clock; derived data is the data processor's job, reached
//! through the subscription handshake.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use tapedeck_core::calendar::{SessionWindow, TradingCalendar};
use tapedeck_core::clock::{ClockError, TimeAuthority};
use tapedeck_core::domain::{Interval, StreamKind, SymbolSource};
use tapedeck_core::quality::{expected_bars, quality_pct};
use tapedeck_core::repository::{HistoricalRepository, LiveStream, RepositoryError};
use tapedeck_core::store::{SessionStateStore, StoreError};
use tapedeck_core::subscription::{Subscription, WaitOutcome};

use crate::config::{ConfigError, SessionConfig, SessionMode};
use crate::feed::BacktestFeed;
use crate::metrics::MetricsRegistry;
use crate::processor::{TickJob, TickSlot};
use crate::scanner::{ScanError, ScannerManager};
use crate::session::{Phase, RunControls, SessionReport};

/// Calendar-day horizon for the Phase 6 next-day search.
const NEXT_DAY_HORIZON: u32 = 30;
/// Publish quality every N appended 1m bars per symbol.
const QUALITY_EVERY: usize = 10;
/// Repository retry policy: attempts and base backoff.
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_millis(50);
/// Live stream idle wait per poll.
const LIVE_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("repository unavailable after {attempts} attempts: {source}")]
    RepositoryUnavailable { attempts: u32, source: RepositoryError },

    #[error("data integrity violation: {0}")]
    DataIntegrity(#[from] StoreError),

    #[error("clock violation: {0}")]
    Clock(#[from] ClockError),

    #[error("no trading day within {horizon} days after {after}")]
    NoNextTradingDay { after: NaiveDate, horizon: u32 },

    #[error("no session window for {0}")]
    NoSessionWindow(NaiveDate),

    #[error("indicator {name} could not be warmed up for {symbol} (missing trailing days)")]
    IndicatorWarmup { name: String, symbol: String },

    #[error("scanner error: {0}")]
    Scanner(#[from] ScanError),

    #[error("{failed} of {total} scanners failed pre-session")]
    ScannersFailed { failed: usize, total: usize },

    #[error("shutdown join timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("live mode requires a live stream")]
    MissingLiveStream,
}

impl SessionError {
    /// Taxonomy name for the one-line CLI diagnostic.
    pub fn taxonomy(&self) -> &'static str {
        match self {
            SessionError::Config(_) => "ConfigError",
            SessionError::RepositoryUnavailable { .. } => "RepositoryUnavailable",
            SessionError::DataIntegrity(_) => "DataIntegrity",
            SessionError::Clock(ClockError::TimeRegression { .. }) => "TimeRegression",
            SessionError::Clock(ClockError::UnsupportedInLive) => "UnsupportedInLive",
            SessionError::NoNextTradingDay { .. } => "NoNextTradingDay",
            SessionError::NoSessionWindow(_) => "ConfigError",
            SessionError::IndicatorWarmup { .. } => "ConfigError",
            SessionError::Scanner(_) => "ConfigError",
            SessionError::ScannersFailed { .. } => "ConfigError",
            SessionError::ShutdownTimeout(_) => "ShutdownTimeout",
            SessionError::MissingLiveStream => "ConfigError",
        }
    }
}

/// Wall-clock pacing for clock-driven backtests (speed > 0).
struct ClockPace {
    speed: f64,
    anchor_wall: Instant,
    anchor_virtual: DateTime<Utc>,
}

impl ClockPace {
    fn new(speed: f64, virtual_now: DateTime<Utc>) -> Self {
        Self { speed, anchor_wall: Instant::now(), anchor_virtual: virtual_now }
    }

    /// Time does not advance while paused; the anchor moves instead.
    fn re_anchor(&mut self, virtual_now: DateTime<Utc>) {
        self.anchor_wall = Instant::now();
        self.anchor_virtual = virtual_now;
    }

    /// Sleep until the wall clock catches up with the scaled schedule for
    /// `target`. Sleeps in short chunks so shutdown stays responsive.
    fn sleep_until(&self, target: DateTime<Utc>, controls: &RunControls) {
        let virtual_ms = (target - self.anchor_virtual).num_milliseconds().max(0) as f64;
        let due = self.anchor_wall + Duration::from_millis((virtual_ms / self.speed) as u64);
        while !controls.shutdown_requested() {
            let now = Instant::now();
            if now >= due {
                return;
            }
            std::thread::sleep((due - now).min(Duration::from_millis(100)));
        }
    }
}

pub struct SessionCoordinator {
    config: SessionConfig,
    store: Arc<SessionStateStore>,
    clock: Arc<TimeAuthority>,
    calendar: Arc<TradingCalendar>,
    repository: Arc<dyn HistoricalRepository>,
    live: Option<Box<dyn LiveStream>>,
    scanners: ScannerManager,
    metrics: Arc<MetricsRegistry>,
    controls: Arc<RunControls>,
    dp_input: Arc<Subscription>,
    dp_done: Arc<Subscription>,
    ticks: Arc<TickSlot>,
    intervals: Vec<Interval>,
    /// Symbols whose history and queue were loaded this session.
    loaded: HashSet<String>,
    session_started: Instant,
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        store: Arc<SessionStateStore>,
        clock: Arc<TimeAuthority>,
        calendar: Arc<TradingCalendar>,
        repository: Arc<dyn HistoricalRepository>,
        live: Option<Box<dyn LiveStream>>,
        scanners: ScannerManager,
        metrics: Arc<MetricsRegistry>,
        controls: Arc<RunControls>,
        dp_input: Arc<Subscription>,
        dp_done: Arc<Subscription>,
        ticks: Arc<TickSlot>,
    ) -> Self {
        let intervals = config.parsed_intervals();
        Self {
            config,
            store,
            clock,
            calendar,
            repository,
            live,
            scanners,
            metrics,
            controls,
            dp_input,
            dp_done,
            ticks,
            intervals,
            loaded: HashSet::new(),
            session_started: Instant::now(),
        }
    }

    /// Run sessions until the date range is exhausted (backtest), the live
    /// loop is stopped, or a fatal error occurs.
    pub fn run(&mut self) -> Result<Vec<SessionReport>, SessionError> {
        match self.config.mode {
            SessionMode::Backtest => self.run_backtest(),
            SessionMode::Live => self.run_live(),
        }
    }

    fn run_backtest(&mut self) -> Result<Vec<SessionReport>, SessionError> {
        let backtest = self.config.backtest.clone().ok_or_else(|| {
            SessionError::Config(ConfigError::Invalid("backtest settings missing".into()))
        })?;
        let mut date = self
            .calendar
            .first_trading_day_on_or_after(backtest.start_date)
            .filter(|&d| d <= backtest.end_date)
            .ok_or_else(|| {
                SessionError::Config(ConfigError::Invalid(format!(
                    "no trading days in {}..{}",
                    backtest.start_date, backtest.end_date
                )))
            })?;

        let mut reports = Vec::new();
        loop {
            let window =
                self.calendar.session_window(date).ok_or(SessionError::NoSessionWindow(date))?;
            info!(%date, early_close = window.early_close, "session starting");

            self.phase_init(date, &window)?;
            self.phase_historical(&window)?;
            self.phase_pre_session_scans(&window)?;
            let mut feed = self.phase_load_queues(&window)?;
            self.phase_activate(&window);
            let halted = self.phase_stream(&mut feed, &window, backtest.speed)?;
            let (report, next) = self.phase_end(date, &window, Some(backtest.end_date))?;
            reports.push(report);

            if halted || self.controls.shutdown_requested() {
                info!("run halted by shutdown request");
                break;
            }
            match next {
                Some(next_date) if next_date <= backtest.end_date => date = next_date,
                _ => break,
            }
        }
        Ok(reports)
    }

    // ─── Phase 1: initialization ─────────────────────────────────────

    fn phase_init(&mut self, date: NaiveDate, window: &SessionWindow) -> Result<(), SessionError> {
        self.controls.set_phase(Phase::Init);
        self.loaded.clear();
        self.scanners.reset_for_new_session();

        // stream/generate marking, fixed for the session
        let mut kinds = [StreamKind::Ignored; Interval::COUNT];
        match self.config.mode {
            SessionMode::Backtest => {
                // hard rule: only 1-minute bars stream from storage
                kinds[Interval::M1.slot()] = StreamKind::Streamed;
                for &interval in &self.intervals {
                    if interval != Interval::M1 && interval.is_intraday() {
                        kinds[interval.slot()] = StreamKind::Generated;
                    }
                }
            }
            SessionMode::Live => {
                let streamed = self
                    .live
                    .as_ref()
                    .map(|s| s.capabilities())
                    .ok_or(SessionError::MissingLiveStream)?;
                for &interval in &self.intervals {
                    if !interval.is_intraday() {
                        continue;
                    }
                    if streamed.streamed_intervals.contains(&interval) {
                        kinds[interval.slot()] = StreamKind::Streamed;
                    } else {
                        kinds[interval.slot()] = StreamKind::Generated;
                    }
                }
                if streamed.ticks || streamed.quotes {
                    warn!("tick/quote streams unsupported; ignoring");
                }
                if kinds[Interval::M1.slot()] != StreamKind::Streamed {
                    return Err(SessionError::Config(ConfigError::Invalid(
                        "live source cannot stream 1-minute bars".into(),
                    )));
                }
            }
        }
        self.store.set_stream_kinds(kinds);

        // effective symbol set: config symbols plus surviving promotions
        for symbol in &self.config.symbols {
            self.store.register_symbol(symbol, SymbolSource::Config);
        }
        for name in &self.config.indicators {
            self.store.registry().register(name).map_err(|e| {
                SessionError::Config(ConfigError::Invalid(format!("indicator '{name}': {e}")))
            })?;
        }
        if self.store.full_data_symbols().is_empty() {
            return Err(SessionError::Config(ConfigError::Invalid(
                "session resolves to an empty symbol set".into(),
            )));
        }

        // pre-open: the virtual clock sits at the session open while
        // phases 2–4 run; the live clock is the wall clock
        if self.config.mode == SessionMode::Backtest {
            self.clock.advance_to(window.open_utc)?;
        }
        debug!(%date, "phase 1 complete");
        Ok(())
    }

    // ─── Phase 2: historical management ──────────────────────────────

    fn phase_historical(&mut self, window: &SessionWindow) -> Result<(), SessionError> {
        self.controls.set_phase(Phase::Historical);
        for symbol in self.store.full_data_symbols() {
            self.load_symbol_history(&symbol, window)?;
            self.loaded.insert(symbol);
        }
        Ok(())
    }

    /// Trailing-day history, indicator warmup, and historical quality for
    /// one symbol. Shared between Phase 2 and promotion fulfilment.
    fn load_symbol_history(
        &self,
        symbol: &str,
        session_window: &SessionWindow,
    ) -> Result<(), SessionError> {
        // the requirement set is the larger of the configured trailing
        // window and what indicator warmup asks for
        let mut required_days = self.config.trailing_days;
        self.store.registry().for_each(|_, entry| {
            let bars_per_day = (390 / entry.spec.interval.minutes().max(1)).max(1) as usize;
            required_days = required_days.max(entry.kernel.window_hint().div_ceil(bars_per_day));
        });

        let mut days = Vec::with_capacity(required_days);
        let mut cursor = self.store.current_date();
        for _ in 0..required_days {
            match self.calendar.previous_trading_day(cursor) {
                Some(day) => {
                    days.push(day);
                    cursor = day;
                }
                None => {
                    warn!(symbol, "trailing window truncated by calendar horizon");
                    break;
                }
            }
        }
        days.reverse();

        let mut missing_days = 0usize;
        for &day in &days {
            let Some(window) = self.calendar.session_window(day) else { continue };
            for &interval in &self.intervals {
                if !interval.is_intraday() {
                    continue;
                }
                let bars = self.fetch_with_retry(symbol, interval, window.open_utc, window.close_utc)?;
                if bars.is_empty() {
                    missing_days += 1;
                    warn!(symbol, %day, %interval, "no historical bars");
                    continue;
                }
                let expected = expected_bars(window.open_utc, window.close_utc, interval);
                let pct = quality_pct(bars.len(), expected);
                self.store.load_historical_day(symbol, interval, day, bars)?;
                self.store.set_quality(symbol, interval, pct)?;
            }
        }

        // indicator warmup from whatever history is on hand
        let mut warmup_failures = Vec::new();
        let store = &self.store;
        store.registry().for_each(|id, entry| {
            let window_hint = entry.kernel.window_hint();
            let value = match store.recent_bars(symbol, entry.spec.interval, window_hint) {
                Ok(bars) => entry.kernel.latest(&bars),
                Err(_) => f64::NAN,
            };
            if store.set_indicator(symbol, id, value, session_window.open_utc).is_err() {
                return;
            }
            if !value.is_finite() {
                warmup_failures.push(entry.spec.name.clone());
            }
        });
        if !warmup_failures.is_empty() {
            if missing_days > 0 {
                return Err(SessionError::IndicatorWarmup {
                    name: warmup_failures.remove(0),
                    symbol: symbol.to_string(),
                });
            }
            debug!(symbol, indicators = ?warmup_failures, "cold start, warmup deferred to session data");
        }
        Ok(())
    }

    // ─── Phase 2.5: pre-session scans ────────────────────────────────

    fn phase_pre_session_scans(&mut self, window: &SessionWindow) -> Result<(), SessionError> {
        self.controls.set_phase(Phase::PreScan);
        let total = self.scanners.len();
        if total == 0 {
            return Ok(());
        }
        let failed = self.scanners.setup_pre_session_scanners(
            &self.store,
            &self.calendar,
            self.clock.now(),
        );
        if failed * 2 > total {
            return Err(SessionError::ScannersFailed { failed, total });
        }
        // pre-session promotions take the normal fulfilment path; their
        // queues are covered by Phase 3 because they are full-data now
        self.fulfill_promotions(None, window)?;
        Ok(())
    }

    // ─── Phase 3: queue loading ──────────────────────────────────────

    fn phase_load_queues(&mut self, window: &SessionWindow) -> Result<BacktestFeed, SessionError> {
        self.controls.set_phase(Phase::QueueLoad);
        let mut feed = BacktestFeed::new();
        if self.config.mode == SessionMode::Live {
            return Ok(feed);
        }
        // one minute past the close so the boundary drop rule is exercised
        // against whatever storage actually holds
        let until = window.close_utc + Interval::M1.duration();
        for symbol in self.store.full_data_symbols() {
            let bars = self.fetch_with_retry(&symbol, Interval::M1, window.open_utc, until)?;
            debug!(%symbol, bars = bars.len(), "queue loaded");
            feed.load(&symbol, bars);
        }
        Ok(feed)
    }

    // ─── Phase 4: activation ─────────────────────────────────────────

    fn phase_activate(&mut self, window: &SessionWindow) {
        self.controls.set_phase(Phase::Active);
        self.session_started = Instant::now();
        self.store.set_active(true);
        self.scanners.on_session_start(window);
        info!(open = %window.open_utc, close = %window.close_utc, "session active");
    }

    // ─── Phase 5: streaming ──────────────────────────────────────────

    /// Main loop. Returns true if halted by a shutdown request.
    fn phase_stream(
        &mut self,
        feed: &mut BacktestFeed,
        window: &SessionWindow,
        speed: f64,
    ) -> Result<bool, SessionError> {
        self.controls.set_phase(Phase::Streaming);
        let mut pace = (speed > 0.0).then(|| ClockPace::new(speed, self.clock.now()));
        let mut quality_counters: HashMap<String, usize> = HashMap::new();

        loop {
            if self.controls.shutdown_requested() {
                return Ok(true);
            }
            if self.controls.wait_if_paused() {
                if self.controls.shutdown_requested() {
                    return Ok(true);
                }
                if let Some(pace) = &mut pace {
                    pace.re_anchor(self.clock.now());
                }
            }

            let Some((symbol, ts)) = feed.next_candidate().map(|(s, t)| (s.to_string(), t)) else {
                // queues dry with time left: jump straight to the close
                if self.clock.now() < window.close_utc {
                    self.clock.advance_to(window.close_utc)?;
                }
                return Ok(false);
            };

            if ts >= window.close_utc {
                // cross-day queue contents never leak into this session
                feed.pop(&symbol);
                self.metrics.incr("bar.dropped_after_close");
                debug!(%symbol, %ts, "bar at/after close dropped");
                if self.clock.now() < window.close_utc {
                    self.clock.advance_to(window.close_utc)?;
                }
                return Ok(false);
            }

            let target = ts + Interval::M1.duration();
            if let Some(pace) = &pace {
                pace.sleep_until(target, &self.controls);
            }
            self.clock.advance_to(target)?;

            let bar = feed.pop(&symbol).ok_or_else(|| {
                // the candidate came from this queue an instant ago
                SessionError::DataIntegrity(StoreError::UnknownSymbol(symbol.clone()))
            })?;
            self.store.append_streamed_bar(bar)?;
            self.metrics.incr("bar.streamed");

            self.ticks.publish(TickJob { symbol: symbol.clone(), timestamp: ts });
            self.dp_input.signal();
            match self.dp_done.wait() {
                WaitOutcome::Ready => self.dp_done.reset(),
                WaitOutcome::TimedOut => self.metrics.incr("overrun.handshake"),
                WaitOutcome::Cancelled => return Ok(true),
            }

            let scans = self.scanners.check_and_execute_scans(
                &self.store,
                &self.calendar,
                self.clock.now(),
            );
            if scans > 0 {
                self.metrics.observe("scan.executed", scans as f64);
            }
            self.fulfill_promotions(Some(feed), window)?;

            let counter = quality_counters.entry(symbol.clone()).or_insert(0);
            *counter += 1;
            if *counter % QUALITY_EVERY == 0 {
                self.publish_quality(&symbol, window);
            }
        }
    }

    /// Load history, warm indicators, and (in backtest) install the session
    /// queue for every symbol the promotion queue carries. Idempotent per
    /// session: already-loaded symbols are skipped.
    fn fulfill_promotions(
        &mut self,
        feed: Option<&mut BacktestFeed>,
        window: &SessionWindow,
    ) -> Result<(), SessionError> {
        let promoted = self.store.drain_promotions();
        if promoted.is_empty() {
            return Ok(());
        }
        let mut feed = feed;
        for symbol in promoted {
            if self.loaded.contains(&symbol) {
                continue;
            }
            info!(%symbol, "fulfilling promotion");
            self.load_symbol_history(&symbol, window)?;
            if let Some(feed) = feed.as_deref_mut() {
                let from = self.clock.now().max(window.open_utc);
                let until = window.close_utc + Interval::M1.duration();
                let bars = self.fetch_with_retry(&symbol, Interval::M1, from, until)?;
                feed.load(&symbol, bars);
            }
            self.loaded.insert(symbol);
            self.metrics.incr("symbol.promoted");
        }
        Ok(())
    }

    /// Intervals carrying data this session: Streamed plus Generated.
    fn active_intervals(&self) -> Vec<Interval> {
        (0..Interval::COUNT)
            .filter_map(Interval::from_slot)
            .filter(|&interval| self.store.stream_kind(interval) != StreamKind::Ignored)
            .collect()
    }

    fn publish_quality(&self, symbol: &str, window: &SessionWindow) {
        let now = self.clock.now().min(window.close_utc);
        for interval in self.active_intervals() {
            let received = self.store.session_bar_count(symbol, interval);
            let expected = expected_bars(window.open_utc, now, interval);
            let pct = quality_pct(received, expected);
            if self.store.set_quality(symbol, interval, pct).is_err() {
                break; // symbol removed mid-session
            }
        }
    }

    // ─── Phase 6: end of session ─────────────────────────────────────

    fn phase_end(
        &mut self,
        date: NaiveDate,
        window: &SessionWindow,
        end_date: Option<NaiveDate>,
    ) -> Result<(SessionReport, Option<NaiveDate>), SessionError> {
        self.controls.set_phase(Phase::EndOfSession);
        self.store.set_active(false);
        self.scanners.on_session_end(&self.store, &self.calendar, self.clock.now());

        let mut quality = BTreeMap::new();
        for symbol in self.store.full_data_symbols() {
            self.publish_quality(&symbol, window);
            let mut per_interval = BTreeMap::new();
            for interval in self.active_intervals() {
                if let Some(pct) = self.store.get_quality(&symbol, interval) {
                    per_interval.insert(interval.token().to_string(), pct);
                }
            }
            quality.insert(symbol, per_interval);
        }
        self.metrics
            .observe("session.duration_ms", self.session_started.elapsed().as_millis() as f64);
        self.metrics.observe("overrun.dp_input_total", self.dp_input.overruns() as f64);
        self.metrics.observe("overrun.dp_done_total", self.dp_done.overruns() as f64);

        let promotions = self.metrics.count("symbol.promoted");
        let report = SessionReport { date, metrics: self.metrics.drain(), quality, promotions };
        let next = self.next_session_date(date, end_date)?;
        self.store.roll_session(next.unwrap_or_else(|| {
            date.succ_opt().unwrap_or(date) // end of representable time
        }));
        info!(%date, next = ?next, "session ended");
        Ok((report, next))
    }

    /// Recursive holiday skip, bounded by `NEXT_DAY_HORIZON` calendar days.
    /// Running past the configured end date is normal termination, not an
    /// error; exhausting the horizon otherwise is `NoNextTradingDay`.
    fn next_session_date(
        &self,
        after: NaiveDate,
        end_date: Option<NaiveDate>,
    ) -> Result<Option<NaiveDate>, SessionError> {
        let mut candidate = after;
        for _ in 0..NEXT_DAY_HORIZON {
            candidate = match candidate.succ_opt() {
                Some(d) => d,
                None => return Ok(None),
            };
            if let Some(end) = end_date {
                if candidate > end {
                    return Ok(None);
                }
            }
            if self.clock.is_trading_day(candidate) {
                return Ok(Some(candidate));
            }
        }
        Err(SessionError::NoNextTradingDay { after, horizon: NEXT_DAY_HORIZON })
    }

    // ─── Live mode ───────────────────────────────────────────────────

    fn run_live(&mut self) -> Result<Vec<SessionReport>, SessionError> {
        if self.live.is_none() {
            return Err(SessionError::MissingLiveStream);
        }
        let mut reports = Vec::new();
        while !self.controls.shutdown_requested() {
            let today = self.clock.session_date();
            let Some(date) = self.calendar.first_trading_day_on_or_after(today) else {
                return Err(SessionError::NoNextTradingDay {
                    after: today,
                    horizon: NEXT_DAY_HORIZON,
                });
            };
            let window =
                self.calendar.session_window(date).ok_or(SessionError::NoSessionWindow(date))?;
            if self.clock.now() >= window.close_utc {
                // today's session is over; idle into the next day
                self.sleep_until_wall(window.close_utc + chrono::Duration::hours(1));
                continue;
            }

            self.phase_init(date, &window)?;
            self.phase_historical(&window)?;
            self.phase_pre_session_scans(&window)?;
            self.subscribe_live()?;
            self.sleep_until_wall(window.open_utc);
            if self.controls.shutdown_requested() {
                break;
            }
            self.phase_activate(&window);
            let halted = self.stream_live(&window)?;
            let (report, _next) = self.phase_end(date, &window, None)?;
            reports.push(report);
            if halted {
                break;
            }
        }
        Ok(reports)
    }

    fn subscribe_live(&mut self) -> Result<(), SessionError> {
        self.controls.set_phase(Phase::QueueLoad);
        let symbols = self.store.full_data_symbols();
        let streamed: Vec<Interval> = (0..Interval::COUNT)
            .filter_map(Interval::from_slot)
            .filter(|&iv| self.store.stream_kind(iv) == StreamKind::Streamed)
            .collect();
        let stream = self.live.as_mut().ok_or(SessionError::MissingLiveStream)?;
        for symbol in &symbols {
            for &interval in &streamed {
                stream.subscribe(symbol, interval).map_err(|source| {
                    SessionError::RepositoryUnavailable { attempts: 1, source }
                })?;
            }
        }
        Ok(())
    }

    fn stream_live(&mut self, window: &SessionWindow) -> Result<bool, SessionError> {
        self.controls.set_phase(Phase::Streaming);
        loop {
            if self.controls.shutdown_requested() {
                return Ok(true);
            }
            self.controls.wait_if_paused();
            if self.clock.now() >= window.close_utc {
                return Ok(false);
            }

            let event = {
                let stream = self.live.as_mut().ok_or(SessionError::MissingLiveStream)?;
                stream.next_bar(LIVE_POLL)
            };
            match event {
                Ok(Some(bar)) => {
                    if self.store.stream_kind(bar.interval) != StreamKind::Streamed {
                        warn!(symbol = %bar.symbol, interval = %bar.interval, "unsubscribed interval dropped");
                        continue;
                    }
                    // out-of-order live events are dropped, not fatal
                    if let Some(latest) = self.store.get_latest_bar(&bar.symbol, bar.interval) {
                        if bar.timestamp <= latest.timestamp {
                            warn!(symbol = %bar.symbol, %bar.timestamp, "out-of-order live bar dropped");
                            self.metrics.incr("bar.dropped_out_of_order");
                            continue;
                        }
                    }
                    let is_minute = bar.interval == Interval::M1;
                    let symbol = bar.symbol.clone();
                    let ts = bar.timestamp;
                    self.store.append_streamed_bar(bar)?;
                    self.metrics.incr("bar.streamed");
                    if is_minute {
                        self.ticks.publish(TickJob { symbol: symbol.clone(), timestamp: ts });
                        self.dp_input.signal();
                        match self.dp_done.wait() {
                            WaitOutcome::Ready => self.dp_done.reset(),
                            WaitOutcome::TimedOut => self.metrics.incr("timeout.dp_handshake"),
                            WaitOutcome::Cancelled => return Ok(true),
                        }
                    }
                    let scans = self.scanners.check_and_execute_scans(
                        &self.store,
                        &self.calendar,
                        self.clock.now(),
                    );
                    if scans > 0 {
                        self.metrics.observe("scan.executed", scans as f64);
                    }
                    self.fulfill_live_promotions(window)?;
                }
                Ok(None) => {
                    self.metrics.incr("timeout.live");
                    debug!("live stream idle");
                }
                Err(source) => {
                    return Err(SessionError::RepositoryUnavailable { attempts: 1, source });
                }
            }
        }
    }

    fn fulfill_live_promotions(&mut self, window: &SessionWindow) -> Result<(), SessionError> {
        let promoted = self.store.drain_promotions();
        for symbol in promoted {
            if self.loaded.contains(&symbol) {
                continue;
            }
            info!(%symbol, "fulfilling live promotion");
            self.load_symbol_history(&symbol, window)?;
            let streamed: Vec<Interval> = (0..Interval::COUNT)
                .filter_map(Interval::from_slot)
                .filter(|&iv| self.store.stream_kind(iv) == StreamKind::Streamed)
                .collect();
            let stream = self.live.as_mut().ok_or(SessionError::MissingLiveStream)?;
            for &interval in &streamed {
                stream
                    .subscribe(&symbol, interval)
                    .map_err(|source| SessionError::RepositoryUnavailable { attempts: 1, source })?;
            }
            self.loaded.insert(symbol);
            self.metrics.incr("symbol.promoted");
        }
        Ok(())
    }

    fn sleep_until_wall(&self, until: DateTime<Utc>) {
        while !self.controls.shutdown_requested() && self.clock.now() < until {
            std::thread::sleep(Duration::from_millis(250));
        }
    }

    // ─── Shared plumbing ─────────────────────────────────────────────

    /// Bounded-retry repository fetch with exponential backoff.
    fn fetch_with_retry(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<tapedeck_core::domain::Bar>, SessionError> {
        let mut backoff = FETCH_BACKOFF;
        let mut last_err = None;
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.repository.fetch_bars(symbol, interval, start, end) {
                Ok(bars) => return Ok(bars),
                Err(e) => {
                    warn!(symbol, %interval, attempt, error = %e, "repository fetch failed");
                    last_err = Some(e);
                    if attempt < FETCH_ATTEMPTS {
                        std::thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
            }
        }
        Err(SessionError::RepositoryUnavailable {
            attempts: FETCH_ATTEMPTS,
            source: last_err.unwrap_or_else(|| RepositoryError::Unavailable("unknown".into())),
        })
    }
}
