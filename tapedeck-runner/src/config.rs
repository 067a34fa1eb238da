//! Serializable session configuration.
//!
//! Loaded from TOML at startup and validated before anything spins up. The
//! config is the complete description of a run: two runs with identical
//! configs share a `run_id`.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tapedeck_core::domain::Interval;
use tapedeck_core::indicators::IndicatorSpec;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config invalid: {0}")]
    Invalid(String),
}

/// Unique identifier for a session run (content-addressable hash).
pub type RunId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Backtest,
    Live,
}

/// Backtest-only settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacktestConfig {
    /// First session date (inclusive).
    pub start_date: NaiveDate,
    /// Last session date (inclusive).
    pub end_date: NaiveDate,
    /// 0 = data-driven (as fast as the pipeline runs); > 0 = wall-scaled.
    #[serde(default)]
    pub speed: f64,
}

/// One scheduled scan window, exchange-local times, half-open `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanWindow {
    pub start: String,
    pub end: String,
    /// Interval token, e.g. "5m".
    pub interval: String,
}

impl ScanWindow {
    pub fn start_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(&self.start, "%H:%M").ok()
    }

    pub fn end_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(&self.end, "%H:%M").ok()
    }

    pub fn interval(&self) -> Option<Interval> {
        Interval::parse_token(&self.interval)
    }
}

/// One scanner declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScannerDecl {
    /// Built-in scanner module name (resolved by the scanner factory).
    pub module: String,
    #[serde(default)]
    pub pre_session: bool,
    /// Scheduled intra-session windows; absent for pre-session-only scanners.
    #[serde(default)]
    pub regular_session: Option<Vec<ScanWindow>>,
    /// Opaque per-scanner settings, handed to the scanner verbatim.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ScannerDecl {
    pub fn is_pre_session_only(&self) -> bool {
        self.pre_session && self.regular_session.as_deref().map_or(true, |w| w.is_empty())
    }
}

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub session_name: String,
    pub mode: SessionMode,
    /// Config symbols: full data from Phase 1, never removable.
    pub symbols: Vec<String>,
    /// Intervals in minutes, e.g. [1, 5, 15].
    pub intervals: Vec<u32>,
    /// Prior trading days retained in historical storage.
    #[serde(default)]
    pub trailing_days: usize,
    /// Upstream data source key; opaque to the orchestrator.
    pub data_api: String,
    /// Indicator names (`<kind>_<period>_<interval>`) registered for every
    /// full-data symbol.
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default)]
    pub backtest: Option<BacktestConfig>,
    #[serde(default)]
    pub scanners: Vec<ScannerDecl>,
}

/// Wrapper matching the on-disk layout (`[session] ...`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    session: SessionConfig,
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        file.session.validate()?;
        Ok(file.session)
    }

    /// Deterministic content hash for cache keys and report naming.
    pub fn run_id(&self) -> RunId {
        let json = serde_json::to_string(self).expect("SessionConfig serialization failed");
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }

    /// Parsed interval set, deduplicated, smallest first.
    pub fn parsed_intervals(&self) -> Vec<Interval> {
        let set: BTreeSet<Interval> =
            self.intervals.iter().filter_map(|&m| Interval::from_minutes(m)).collect();
        set.into_iter().collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("symbols must not be empty".into()));
        }
        if self.intervals.is_empty() {
            return Err(ConfigError::Invalid("intervals must not be empty".into()));
        }
        for &minutes in &self.intervals {
            if Interval::from_minutes(minutes).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "unsupported interval: {minutes} minutes"
                )));
            }
        }
        match (self.mode, &self.backtest) {
            (SessionMode::Backtest, None) => {
                return Err(ConfigError::Invalid("backtest mode requires [session.backtest]".into()))
            }
            (SessionMode::Backtest, Some(bt)) => {
                if bt.start_date > bt.end_date {
                    return Err(ConfigError::Invalid(format!(
                        "start_date {} is after end_date {}",
                        bt.start_date, bt.end_date
                    )));
                }
                if bt.speed < 0.0 || !bt.speed.is_finite() {
                    return Err(ConfigError::Invalid(format!("speed must be >= 0, got {}", bt.speed)));
                }
                if !self.intervals.contains(&1) {
                    return Err(ConfigError::Invalid(
                        "backtest intervals must include 1 (the streamed interval)".into(),
                    ));
                }
            }
            (SessionMode::Live, _) => {}
        }
        for name in &self.indicators {
            let spec = IndicatorSpec::parse(name)
                .map_err(|e| ConfigError::Invalid(format!("indicator '{name}': {e}")))?;
            spec.build_kernel()
                .map_err(|e| ConfigError::Invalid(format!("indicator '{name}': {e}")))?;
        }
        let session_open = NaiveTime::from_hms_opt(9, 30, 0).expect("valid time");
        let session_close = NaiveTime::from_hms_opt(16, 0, 0).expect("valid time");
        for decl in &self.scanners {
            if decl.module.is_empty() {
                return Err(ConfigError::Invalid("scanner module must not be empty".into()));
            }
            for window in decl.regular_session.as_deref().unwrap_or(&[]) {
                let start = window.start_time().ok_or_else(|| {
                    ConfigError::Invalid(format!("bad scan window start '{}'", window.start))
                })?;
                let end = window.end_time().ok_or_else(|| {
                    ConfigError::Invalid(format!("bad scan window end '{}'", window.end))
                })?;
                if window.interval().is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "bad scan interval '{}'",
                        window.interval
                    )));
                }
                if start >= end {
                    return Err(ConfigError::Invalid(format!(
                        "scan window {} >= {}",
                        window.start, window.end
                    )));
                }
                if start < session_open || end > session_close {
                    return Err(ConfigError::Invalid(format!(
                        "scan window {}–{} lies outside session hours",
                        window.start, window.end
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
[session]
session_name = "smoke"
mode = "backtest"
symbols = ["AAPL"]
intervals = [1, 5]
trailing_days = 2
data_api = "alpaca"
indicators = ["sma_20_1m"]

[session.backtest]
start_date = "2024-01-02"
end_date = "2024-01-03"
speed = 0.0
"#
        .to_string()
    }

    #[test]
    fn parses_minimal_config() {
        let config = SessionConfig::from_toml(&minimal_toml()).unwrap();
        assert_eq!(config.session_name, "smoke");
        assert_eq!(config.mode, SessionMode::Backtest);
        assert_eq!(config.parsed_intervals(), vec![Interval::M1, Interval::M5]);
        assert_eq!(config.trailing_days, 2);
    }

    #[test]
    fn parses_scanner_decl() {
        let toml_str = format!(
            "{}\n{}",
            minimal_toml(),
            r#"
[[session.scanners]]
module = "watchlist"
pre_session = false
regular_session = [{ start = "09:35", end = "15:55", interval = "5m" }]

[session.scanners.config]
candidates = ["MSFT"]
"#
        );
        let config = SessionConfig::from_toml(&toml_str).unwrap();
        assert_eq!(config.scanners.len(), 1);
        let decl = &config.scanners[0];
        assert_eq!(decl.module, "watchlist");
        assert!(!decl.is_pre_session_only());
        let windows = decl.regular_session.as_ref().unwrap();
        assert_eq!(windows[0].interval(), Some(Interval::M5));
        assert_eq!(decl.config["candidates"][0], "MSFT");
    }

    #[test]
    fn rejects_reversed_dates() {
        let bad = minimal_toml().replace("end_date = \"2024-01-03\"", "end_date = \"2023-12-29\"");
        assert!(matches!(SessionConfig::from_toml(&bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_backtest_without_one_minute() {
        let bad = minimal_toml().replace("intervals = [1, 5]", "intervals = [5]");
        assert!(matches!(SessionConfig::from_toml(&bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_interval() {
        let bad = minimal_toml().replace("intervals = [1, 5]", "intervals = [1, 7]");
        assert!(matches!(SessionConfig::from_toml(&bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_indicator() {
        let bad = minimal_toml().replace("sma_20_1m", "vwap_20_1m");
        assert!(matches!(SessionConfig::from_toml(&bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_scan_window_outside_session() {
        let toml_str = format!(
            "{}\n{}",
            minimal_toml(),
            r#"
[[session.scanners]]
module = "watchlist"
regular_session = [{ start = "08:00", end = "09:00", interval = "5m" }]
"#
        );
        assert!(matches!(SessionConfig::from_toml(&toml_str), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn run_id_is_deterministic_and_sensitive() {
        let a = SessionConfig::from_toml(&minimal_toml()).unwrap();
        let b = SessionConfig::from_toml(&minimal_toml()).unwrap();
        assert_eq!(a.run_id(), b.run_id());
        let c = SessionConfig::from_toml(&minimal_toml().replace("\"smoke\"", "\"other\"")).unwrap();
        assert_ne!(a.run_id(), c.run_id());
    }
}
