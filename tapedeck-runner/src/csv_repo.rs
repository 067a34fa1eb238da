//! CSV-backed historical repository.
//!
//! Directory layout: `<root>/<SYMBOL>/<interval>.csv` with a header of
//! `timestamp,open,high,low,close,volume` and RFC 3339 timestamps. Files are
//! read once per fetch, validated, sorted, and deduplicated before serving —
//! imported data is not trusted to be clean.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use tapedeck_core::domain::{Bar, Interval};
use tapedeck_core::repository::{HistoricalRepository, RepositoryError};

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

/// Serves bars from a directory of per-symbol CSV files.
#[derive(Debug)]
pub struct CsvRepository {
    root: PathBuf,
}

impl CsvRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn file_for(&self, symbol: &str, interval: Interval) -> PathBuf {
        self.root.join(symbol).join(format!("{}.csv", interval.token()))
    }
}

impl HistoricalRepository for CsvRepository {
    fn fetch_bars(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, RepositoryError> {
        let path = self.file_for(symbol, interval);
        if !path.exists() {
            // absent file means no data for the range, not an outage
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path).map_err(|e| {
            RepositoryError::Unavailable(format!("{}: {e}", path.display()))
        })?;

        let mut bars = Vec::new();
        let mut dropped = 0usize;
        for row in reader.deserialize::<CsvRow>() {
            let row = row.map_err(|e| RepositoryError::Corrupt {
                symbol: symbol.to_string(),
                detail: e.to_string(),
            })?;
            if row.timestamp < start || row.timestamp >= end {
                continue;
            }
            let bar = Bar {
                symbol: symbol.to_string(),
                timestamp: row.timestamp,
                interval,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            };
            if !bar.is_sane() || !bar.is_aligned() {
                dropped += 1;
                continue;
            }
            bars.push(bar);
        }
        if dropped > 0 {
            warn!(symbol, %interval, dropped, "invalid rows dropped from import");
        }

        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by_key(|b| b.timestamp);
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn write_fixture(dir: &std::path::Path, symbol: &str, rows: &[(&str, f64, u64)]) {
        let sym_dir = dir.join(symbol);
        std::fs::create_dir_all(&sym_dir).unwrap();
        let mut content = String::from("timestamp,open,high,low,close,volume\n");
        for (ts, close, volume) in rows {
            content.push_str(&format!(
                "{ts},{o},{h},{l},{close},{volume}\n",
                o = close - 0.2,
                h = close + 0.5,
                l = close - 0.5,
            ));
        }
        std::fs::write(sym_dir.join("1m.csv"), content).unwrap();
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tapedeck_csv_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn reads_sorts_and_filters_range() {
        let dir = temp_dir("basic");
        write_fixture(
            &dir,
            "AAPL",
            &[
                ("2024-01-02T14:32:00Z", 101.0, 1200),
                ("2024-01-02T14:30:00Z", 100.0, 1000),
                ("2024-01-02T14:31:00Z", 100.5, 1100),
                ("2024-01-02T15:00:00Z", 102.0, 1300),
            ],
        );
        let repo = CsvRepository::new(&dir);
        let bars = repo
            .fetch_bars(
                "AAPL",
                Interval::M1,
                Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap(),
            )
            .unwrap();
        assert_eq!(bars.len(), 3);
        assert!(bars.windows(2).all(|p| p[0].timestamp < p[1].timestamp));
        assert_eq!(bars[0].close, 100.0);
    }

    #[test]
    fn missing_file_is_empty_not_error() {
        let dir = temp_dir("missing");
        let repo = CsvRepository::new(&dir);
        let bars = repo
            .fetch_bars(
                "GHOST",
                Interval::M1,
                Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap(),
            )
            .unwrap();
        assert!(bars.is_empty());
    }

    #[test]
    fn duplicate_and_misaligned_rows_are_dropped() {
        let dir = temp_dir("dirty");
        write_fixture(
            &dir,
            "AAPL",
            &[
                ("2024-01-02T14:30:00Z", 100.0, 1000),
                ("2024-01-02T14:30:00Z", 999.0, 9999), // duplicate timestamp
                ("2024-01-02T14:31:30Z", 100.5, 1100), // off-grid
            ],
        );
        let repo = CsvRepository::new(&dir);
        let bars = repo
            .fetch_bars(
                "AAPL",
                Interval::M1,
                Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap(),
            )
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 100.0);
    }
}
