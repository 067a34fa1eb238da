//! Domain types shared across the orchestrator.

mod bar;
mod interval;

pub use bar::Bar;
pub use interval::Interval;

use serde::{Deserialize, Serialize};

/// How a symbol entered the session.
///
/// Config symbols persist until process exit; adhoc symbols (scanner
/// promotions, management calls) can be removed again once unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolSource {
    Config,
    Adhoc,
}

/// Per-interval data-flow assignment, fixed for the whole session.
///
/// Streamed intervals arrive from the outside (repository in backtest, live
/// feed in live) and are appended by the coordinator; generated intervals are
/// derived by the data processor; ignored intervals carry no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Streamed,
    Generated,
    Ignored,
}
