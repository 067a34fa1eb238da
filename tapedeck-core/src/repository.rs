//! Upstream data interfaces consumed by the orchestrator.
//!
//! The repository serves persisted bars for backtests and warmup; the live
//! stream pushes bars during live sessions. Both are trait seams so tests
//! and the CLI can plug in their own implementations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Bar, Interval};

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Transient upstream failure; the caller retries with backoff.
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt data for {symbol}: {detail}")]
    Corrupt { symbol: String, detail: String },

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
}

/// Query interface over persisted bars.
///
/// Implementations must return bars in ascending timestamp order, aligned to
/// `interval` boundaries, within `[start, end)`. Returning fewer bars than
/// the grid expects is fine — gap accounting is the orchestrator's concern.
pub trait HistoricalRepository: Send + Sync + std::fmt::Debug {
    fn fetch_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, RepositoryError>;
}

/// What a live source can push natively. Anything else is generated or
/// ignored by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct LiveCapabilities {
    pub streamed_intervals: Vec<Interval>,
    pub ticks: bool,
    pub quotes: bool,
}

/// Push stream of bars in live mode.
///
/// Delivery must be non-decreasing in timestamp per `(symbol, interval)`;
/// the orchestrator drops out-of-order events with a warning.
pub trait LiveStream: Send + std::fmt::Debug {
    fn capabilities(&self) -> LiveCapabilities;

    fn subscribe(&mut self, symbol: &str, interval: Interval) -> Result<(), RepositoryError>;

    /// Block up to `timeout` for the next bar. `Ok(None)` means idle.
    fn next_bar(&mut self, timeout: Duration) -> Result<Option<Bar>, RepositoryError>;
}
