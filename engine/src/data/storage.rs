//! Data storage and retrieval

use std::collections::BTreeMap;

use crate::data::{Candle, CandleSeries, Timeframe};

/// In-memory candle storage keyed by symbol and timeframe
#[derive(Debug, Clone, Default)]
pub struct DataStorage {
    series: BTreeMap<String, CandleSeries>,
}

impl DataStorage {
    /// Create new storage
    pub fn new() -> Self {
        Self {
            series: BTreeMap::new(),
        }
    }

    /// Get storage key from symbol and timeframe
    fn key(symbol: &str, timeframe: Timeframe) -> String {
        format!("{}:{}", symbol, timeframe)
    }

    /// Merge candles into the series for `symbol`/`timeframe`
    pub fn add_candles(&mut self, symbol: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.series
            .entry(Self::key(symbol, timeframe))
            .or_default()
            .merge(candles);
    }

    /// Replace the whole series for `symbol`/`timeframe`
    pub fn insert_series(&mut self, symbol: &str, timeframe: Timeframe, series: CandleSeries) {
        self.series.insert(Self::key(symbol, timeframe), series);
    }

    /// Get the series for symbol and timeframe
    pub fn get(&self, symbol: &str, timeframe: Timeframe) -> Option<&CandleSeries> {
        self.series.get(&Self::key(symbol, timeframe))
    }

    /// Get number of stored candles
    pub fn len(&self) -> usize {
        self.series.values().map(CandleSeries::len).sum()
    }

    /// Check if storage is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_storage() {
        let mut storage = DataStorage::new();
        let candle = Candle::new(Utc::now(), 100.0, 110.0, 95.0, 105.0, 1000.0);

        storage.add_candles("BTC/USDT", Timeframe::M5, vec![candle]);
        assert_eq!(storage.len(), 1);
        assert!(storage.get("BTC/USDT", Timeframe::M5).is_some());
        assert!(storage.get("BTC/USDT", Timeframe::H1).is_none());
    }
}
