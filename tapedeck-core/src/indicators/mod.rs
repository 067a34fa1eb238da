//! Indicator kernels and the per-session registry.
//!
//! Kernels are pure: bars in, values out. Names follow the
//! `<kind>_<period>_<interval>` convention (`sma_20_1m`); the registry
//! internalizes names to dense integer handles so hot-path lookups during
//! streaming are array indexing, not string hashing.

mod atr;
mod ema;
mod rsi;
mod sma;

pub use atr::Atr;
pub use ema::Ema;
pub use rsi::Rsi;
pub use sma::Sma;

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Bar, Interval};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndicatorError {
    #[error("unparseable indicator name '{0}' (expected <kind>_<period>_<interval>)")]
    BadName(String),

    #[error("unknown indicator kind '{0}'")]
    UnknownKind(String),

    #[error("indicator period must be >= 1 in '{0}'")]
    BadPeriod(String),
}

/// A pure indicator computation over a bar series.
///
/// `compute` returns one value per input bar with a NaN warmup prefix;
/// `latest` is the hot-path variant that only produces the final value.
pub trait IndicatorKernel: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> &'static str;

    fn period(&self) -> usize;

    /// Bars required before the first valid output.
    fn warmup_bars(&self) -> usize;

    /// How many trailing bars `latest` wants for a stable value. Defaults to
    /// the warmup window plus one; smoothed kernels ask for more.
    fn window_hint(&self) -> usize {
        self.warmup_bars() + 1
    }

    fn compute(&self, bars: &[Bar]) -> Vec<f64>;

    fn latest(&self, bars: &[Bar]) -> f64 {
        self.compute(bars).last().copied().unwrap_or(f64::NAN)
    }
}

/// Parsed form of an indicator name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: String,
    pub kind: String,
    pub period: usize,
    pub interval: Interval,
}

impl IndicatorSpec {
    /// Parse `sma_20_1m` into (kind `sma`, period 20, interval 1m).
    pub fn parse(name: &str) -> Result<Self, IndicatorError> {
        let mut parts = name.rsplitn(3, '_');
        let interval_token = parts.next().ok_or_else(|| IndicatorError::BadName(name.into()))?;
        let period_token = parts.next().ok_or_else(|| IndicatorError::BadName(name.into()))?;
        let kind = parts.next().ok_or_else(|| IndicatorError::BadName(name.into()))?;
        if kind.is_empty() {
            return Err(IndicatorError::BadName(name.into()));
        }
        let interval = Interval::parse_token(interval_token)
            .ok_or_else(|| IndicatorError::BadName(name.into()))?;
        let period: usize =
            period_token.parse().map_err(|_| IndicatorError::BadName(name.into()))?;
        if period == 0 {
            return Err(IndicatorError::BadPeriod(name.into()));
        }
        Ok(Self { name: name.to_string(), kind: kind.to_string(), period, interval })
    }

    /// Instantiate the kernel this spec names.
    pub fn build_kernel(&self) -> Result<Box<dyn IndicatorKernel>, IndicatorError> {
        match self.kind.as_str() {
            "sma" => Ok(Box::new(Sma::new(self.period))),
            "ema" => Ok(Box::new(Ema::new(self.period))),
            "rsi" => Ok(Box::new(Rsi::new(self.period))),
            "atr" => Ok(Box::new(Atr::new(self.period))),
            other => Err(IndicatorError::UnknownKind(other.to_string())),
        }
    }
}

/// Dense handle into the registry. Stable for the life of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndicatorId(pub usize);

pub struct RegisteredIndicator {
    pub spec: IndicatorSpec,
    pub kernel: Box<dyn IndicatorKernel>,
}

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<String, IndicatorId>,
    entries: Vec<RegisteredIndicator>,
}

/// Per-session indicator registry: name → handle → kernel.
///
/// Registration happens at session setup and on symbol promotion; the
/// streaming hot path only ever resolves handles.
#[derive(Default)]
pub struct IndicatorRegistry {
    inner: RwLock<RegistryInner>,
}

impl IndicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register by name; idempotent — an existing name returns its handle.
    pub fn register(&self, name: &str) -> Result<IndicatorId, IndicatorError> {
        if let Some(&id) = self.inner.read().by_name.get(name) {
            return Ok(id);
        }
        let spec = IndicatorSpec::parse(name)?;
        let kernel = spec.build_kernel()?;
        let mut inner = self.inner.write();
        // a racing registration may have won
        if let Some(&id) = inner.by_name.get(name) {
            return Ok(id);
        }
        let id = IndicatorId(inner.entries.len());
        inner.by_name.insert(name.to_string(), id);
        inner.entries.push(RegisteredIndicator { spec, kernel });
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<IndicatorId> {
        self.inner.read().by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` over the registered entry for `id`.
    pub fn with_entry<R>(&self, id: IndicatorId, f: impl FnOnce(&RegisteredIndicator) -> R) -> Option<R> {
        let inner = self.inner.read();
        inner.entries.get(id.0).map(f)
    }

    /// Run `f` over every registered entry, in handle order.
    pub fn for_each(&self, mut f: impl FnMut(IndicatorId, &RegisteredIndicator)) {
        let inner = self.inner.read();
        for (idx, entry) in inner.entries.iter().enumerate() {
            f(IndicatorId(idx), entry);
        }
    }
}

#[cfg(test)]
pub(crate) fn make_bars(closes: &[f64]) -> Vec<Bar> {
    use chrono::TimeZone;
    let open_ts = chrono::Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar {
            symbol: "TEST".into(),
            timestamp: open_ts + chrono::Duration::minutes(i as i64),
            interval: Interval::M1,
            open: close - 0.2,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1_000,
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "expected {expected}, got {actual}"
    );
}

#[cfg(test)]
pub(crate) const DEFAULT_EPSILON: f64 = 1e-9;
