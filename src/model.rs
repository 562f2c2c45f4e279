//! Data model shared across every component (§3).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Canonical bar width. `1M` is treated as 30 days for gap math, per spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl Interval {
    /// Canonical duration in milliseconds, used for bucket alignment and gap math.
    pub fn duration_ms(self) -> i64 {
        match self {
            Interval::M1 => 60_000,
            Interval::M3 => 180_000,
            Interval::M5 => 300_000,
            Interval::M15 => 900_000,
            Interval::M30 => 1_800_000,
            Interval::H1 => 3_600_000,
            Interval::H2 => 7_200_000,
            Interval::H4 => 14_400_000,
            Interval::H6 => 21_600_000,
            Interval::H8 => 28_800_000,
            Interval::H12 => 43_200_000,
            Interval::D1 => 86_400_000,
            Interval::D3 => 259_200_000,
            Interval::W1 => 604_800_000,
            Interval::Mo1 => 2_592_000_000,
        }
    }

    /// Truncates a millisecond timestamp down to this interval's bucket boundary.
    pub fn align(self, timestamp_ms: i64) -> i64 {
        let d = self.duration_ms();
        timestamp_ms.div_euclid(d) * d
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1M",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "1m" => Interval::M1,
            "3m" => Interval::M3,
            "5m" => Interval::M5,
            "15m" => Interval::M15,
            "30m" => Interval::M30,
            "1h" => Interval::H1,
            "2h" => Interval::H2,
            "4h" => Interval::H4,
            "6h" => Interval::H6,
            "8h" => Interval::H8,
            "12h" => Interval::H12,
            "1d" => Interval::D1,
            "3d" => Interval::D3,
            "1w" => Interval::W1,
            "1M" => Interval::Mo1,
            _ => return None,
        })
    }
}

/// OHLCV bar over the half-open range `[open_time, close_time)` for one (symbol, interval).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: Interval,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub complete: bool,
}

impl Candle {
    /// Starts a new live bar from a single trade, aligned to `interval`'s bucket boundary.
    pub fn open(symbol: &str, interval: Interval, trade_ts: i64, price: f64, volume: f64) -> Self {
        let open_time = interval.align(trade_ts);
        Candle {
            symbol: symbol.to_string(),
            interval,
            open_time,
            close_time: open_time + interval.duration_ms(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            complete: false,
        }
    }

    /// Folds one more trade into this bar. Caller is responsible for deciding
    /// whether the trade belongs in this bucket (`UpdateTrade`, §4.5).
    pub fn apply_trade(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }

    /// Invariant 1 (§8): `low <= min(open,close) <= max(open,close) <= high`, `volume >= 0`.
    pub fn is_arithmetically_valid(&self) -> bool {
        self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
            && self.volume >= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub updated_at: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    /// Invariant required at emission time: non-empty both sides, top bid < top ask.
    pub fn is_valid(&self) -> bool {
        match (self.bids.first(), self.asks.first()) {
            (Some(bid), Some(ask)) => bid.price < ask.price,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    pub rate: f64,
    pub next_rate: Option<f64>,
    pub next_time: i64,
    pub last_updated: i64,
}

/// A maximal half-open sub-range `[start, end)` missing bars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub start: i64,
    pub end: i64,
    pub missing_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub symbol: String,
    pub interval: Interval,
    pub start: i64,
    pub end: i64,
    pub expected_count: i64,
    pub actual_count: i64,
    pub completeness: f64,
    pub gaps: Vec<Gap>,
}

impl IntegrityReport {
    pub fn has_gaps(&self) -> bool {
        !self.gaps.is_empty()
    }
}

/// Immutable audit row appended by the watcher on every backfill attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRecord {
    pub timestamp: i64,
    pub symbol: String,
    pub interval: Interval,
    pub start: i64,
    pub end: i64,
    pub success: bool,
    pub record_count: i64,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Bounded ring buffer of `BackfillRecord`, capacity 1000 by default (§3).
#[derive(Debug, Clone)]
pub struct BackfillHistory {
    capacity: usize,
    records: VecDeque<BackfillRecord>,
}

impl BackfillHistory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, records: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, record: BackfillRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackfillRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for BackfillHistory {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    OrderBook,
    Trade,
    Kline,
    Ticker,
    FundingRate,
    OpenInterest,
    /// Pseudo-channel used by C3 to count persistence failures (§4.3).
    Ingest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetric {
    pub symbol: String,
    pub data_type: DataType,
    pub update_frequency: f64,
    pub last_update: i64,
    pub missing_count: u64,
    pub error_count: u64,
    pub latency_s: f64,
    pub staleness_s: f64,
    pub completeness: f64,
    pub accuracy: f64,
}

impl QualityMetric {
    pub fn new(symbol: impl Into<String>, data_type: DataType) -> Self {
        Self {
            symbol: symbol.into(),
            data_type,
            update_frequency: 0.0,
            last_update: 0,
            missing_count: 0,
            error_count: 0,
            latency_s: 0.0,
            staleness_s: 0.0,
            completeness: 1.0,
            accuracy: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub symbol: String,
    pub data_type: DataType,
    pub level: AlertLevel,
    pub message: String,
    pub timestamp: i64,
    pub metric_value: f64,
    pub threshold: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_duration_treats_month_as_thirty_days() {
        assert_eq!(Interval::Mo1.duration_ms(), 30 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn candle_open_aligns_to_bucket_boundary() {
        let c = Candle::open("BTCUSDT", Interval::M1, 90_123, 100.0, 1.0);
        assert_eq!(c.open_time, 60_000);
        assert_eq!(c.close_time, 120_000);
    }

    #[test]
    fn candle_apply_trade_expands_high_low_and_accumulates_volume() {
        let mut c = Candle::open("BTCUSDT", Interval::M1, 5_000, 100.0, 1.0);
        c.apply_trade(101.0, 2.0);
        c.apply_trade(99.0, 1.0);
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 101.0);
        assert_eq!(c.low, 99.0);
        assert_eq!(c.close, 99.0);
        assert_eq!(c.volume, 4.0);
        assert!(c.is_arithmetically_valid());
    }

    #[test]
    fn backfill_history_drops_oldest_past_capacity() {
        let mut history = BackfillHistory::new(2);
        for i in 0..3 {
            history.push(BackfillRecord {
                timestamp: i,
                symbol: "BTCUSDT".into(),
                interval: Interval::H1,
                start: 0,
                end: 0,
                success: true,
                record_count: 0,
                error: None,
                duration: Duration::from_millis(0),
            });
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().next().unwrap().timestamp, 1);
    }
}
