//! CSV dataset loading for backtests
//!
//! Expected header: `timestamp,open,high,low,close,volume`. Timestamps are RFC3339,
//! `YYYY-MM-DD HH:MM:SS` (UTC) or epoch milliseconds.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::data::{Candle, CandleSeries};
use crate::error::DataError;

#[derive(Debug, Deserialize)]
struct OhlcvRecord {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Load a candle series from a CSV file.
///
/// Rows with a non-positive or non-finite close are skipped; the series is sorted and
/// deduplicated by timestamp.
pub fn load_csv(path: &Path) -> Result<CandleSeries, DataError> {
    let csv_error = |source| DataError::Csv {
        path: path.display().to_string(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;

    let mut candles = Vec::new();
    let mut skipped = 0usize;
    for row in reader.deserialize::<OhlcvRecord>() {
        let record = row.map_err(csv_error)?;
        if !record.close.is_finite() || record.close <= 0.0 {
            skipped += 1;
            continue;
        }
        candles.push(Candle::new(
            parse_timestamp(&record.timestamp)?,
            record.open,
            record.high,
            record.low,
            record.close,
            record.volume,
        ));
    }

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "Skipped rows with invalid close");
    }
    let series = CandleSeries::from_vec(candles);
    debug!(path = %path.display(), candles = series.len(), "Loaded dataset");
    Ok(series)
}

/// Parse a dataset timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DataError> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(millis) = value.parse::<i64>() {
        if let Some(dt) = Utc.timestamp_millis_opt(millis).single() {
            return Ok(dt);
        }
    }
    Err(DataError::Timestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_mixed_timestamp_formats() {
        let path = std::env::temp_dir().join(format!("trader_loader_{}.csv", std::process::id()));
        let csv_data = "timestamp,open,high,low,close,volume\n\
1704067260000,2,3,1,2.5,10\n\
2024-01-01T00:00:00Z,1,2,0.5,1.5,10\n\
2024-01-01 00:02:00,3,4,2,0,10\n";
        fs::write(&path, csv_data).unwrap();

        let series = load_csv(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(series.len(), 2);
        assert_eq!(series.closes(), vec![1.5, 2.5]);
    }

    #[test]
    fn rejects_unknown_timestamp() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(DataError::Timestamp(_))
        ));
    }
}
