//! Candles and per-symbol candle series

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV bar, stamped with its open time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Whether `price` lies within the bar's [low, high] range
    pub fn contains(&self, price: f64) -> bool {
        self.low <= price && price <= self.high
    }

}

/// Ordered, timestamp-deduplicated collection of candles.
///
/// Gaps in the timeline are kept as they are; no synthetic bars are inserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self {
            candles: Vec::new(),
        }
    }

    /// Create from an arbitrary batch; sorts and keeps the last candle per timestamp.
    pub fn from_vec(candles: Vec<Candle>) -> Self {
        let mut series = Self::new();
        series.merge(candles);
        series
    }

    /// Merge a fetched batch. Later batches win on duplicate timestamps.
    pub fn merge(&mut self, batch: Vec<Candle>) {
        if batch.is_empty() {
            return;
        }
        let mut combined = std::mem::take(&mut self.candles);
        combined.extend(batch);
        // stable sort keeps arrival order among equal timestamps
        combined.sort_by_key(|c| c.timestamp);

        let mut deduped: Vec<Candle> = Vec::with_capacity(combined.len());
        for candle in combined {
            match deduped.last_mut() {
                Some(last) if last.timestamp == candle.timestamp => *last = candle,
                _ => deduped.push(candle),
            }
        }
        self.candles = deduped;
    }

    /// Add a candle, replacing the last one if it carries the same timestamp
    pub fn push(&mut self, candle: Candle) {
        match self.candles.last_mut() {
            Some(last) if last.timestamp == candle.timestamp => *last = candle,
            Some(last) if last.timestamp > candle.timestamp => self.merge(vec![candle]),
            _ => self.candles.push(candle),
        }
    }

    /// Keep only the most recent `n` candles
    pub fn truncate_to(&mut self, n: usize) {
        if self.candles.len() > n {
            let excess = self.candles.len() - n;
            self.candles.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Every bar, oldest first
    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// The last `n` candles (fewer if the series is shorter)
    pub fn tail(&self, n: usize) -> &[Candle] {
        let start = self.candles.len().saturating_sub(n);
        &self.candles[start..]
    }

    /// Candles with `timestamp <= ts`
    pub fn up_to(&self, ts: DateTime<Utc>) -> &[Candle] {
        let end = self.candles.partition_point(|c| c.timestamp <= ts);
        &self.candles[..end]
    }

    /// Candle with exactly this timestamp
    pub fn at(&self, ts: DateTime<Utc>) -> Option<&Candle> {
        self.candles
            .binary_search_by_key(&ts, |c| c.timestamp)
            .ok()
            .map(|i| &self.candles[i])
    }

    /// Trim to `[start, end]`, keeping up to `lead` earlier candles ahead of `start`
    /// as indicator warm-up.
    pub fn retain_window(
        &mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        lead: usize,
    ) {
        if let Some(end) = end {
            let keep = self.candles.partition_point(|c| c.timestamp <= end);
            self.candles.truncate(keep);
        }
        if let Some(start) = start {
            let first = self.candles.partition_point(|c| c.timestamp < start);
            self.candles.drain(..first.saturating_sub(lead));
        }
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(minute: i64, close: f64) -> Candle {
        let ts = Utc.timestamp_opt(minute * 60, 0).unwrap();
        Candle::new(ts, close, close + 1.0, close - 1.0, close, 10.0)
    }

    #[test]
    fn merge_sorts_and_later_batch_wins() {
        let mut series = CandleSeries::from_vec(vec![bar(2, 102.0), bar(0, 100.0)]);
        series.merge(vec![bar(2, 222.0), bar(1, 101.0)]);

        let closes = series.closes();
        assert_eq!(closes, vec![100.0, 101.0, 222.0]);
    }

    #[test]
    fn gaps_stay_explicit() {
        let series = CandleSeries::from_vec(vec![bar(0, 1.0), bar(5, 2.0)]);
        assert_eq!(series.len(), 2);
        assert!(series.at(bar(3, 0.0).timestamp).is_none());
    }

    #[test]
    fn truncate_keeps_most_recent() {
        let mut series = CandleSeries::from_vec((0..10).map(|i| bar(i, i as f64)).collect());
        series.truncate_to(3);
        assert_eq!(series.closes(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn windows_by_timestamp() {
        let series = CandleSeries::from_vec((0..5).map(|i| bar(i, i as f64)).collect());
        assert_eq!(series.up_to(bar(2, 0.0).timestamp).len(), 3);
        assert_eq!(series.tail(2)[0].close, 3.0);
        assert_eq!(series.tail(50).len(), 5);
    }

    #[test]
    fn window_keeps_warmup_lead_before_start() {
        let mut series = CandleSeries::from_vec((0..10).map(|i| bar(i, i as f64)).collect());
        series.retain_window(Some(bar(5, 0.0).timestamp), Some(bar(8, 0.0).timestamp), 2);
        assert_eq!(series.closes(), vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

        let mut short = CandleSeries::from_vec((0..4).map(|i| bar(i, i as f64)).collect());
        short.retain_window(Some(bar(1, 0.0).timestamp), None, 5);
        assert_eq!(short.len(), 4);
    }
}
