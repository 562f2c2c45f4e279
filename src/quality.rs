//! Quality monitor (C4, §4.4).
//!
//! Per-(symbol, data_type) metrics behind `dashmap`'s per-key locking, matching
//! §5's "quality metrics use per-(symbol, data_type) lock granularity" directly
//! instead of emulating it with one coarse `RwLock<HashMap<..>>>` the way the
//! teacher's `RealtimeManager` cache does for its own (symbol, timeframe) map.

use crate::model::{Alert, AlertLevel, DataType, OrderBookSnapshot, QualityMetric, Trade};
use crate::stream_client::StreamEvent;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

const ALERT_CHANNEL_CAPACITY: usize = 1000;
const ALERT_HISTORY_CAPACITY: usize = 1000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    max_missing: u64,
    max_errors: u64,
    max_latency_s: f64,
    max_staleness_s: f64,
    min_completeness: f64,
    min_accuracy: f64,
}

fn thresholds_for(data_type: DataType) -> Thresholds {
    match data_type {
        DataType::Ticker => Thresholds { max_missing: 5, max_errors: 5, max_latency_s: 1.0, max_staleness_s: 30.0, min_completeness: 0.99, min_accuracy: 0.99 },
        DataType::OrderBook => Thresholds { max_missing: 2, max_errors: 2, max_latency_s: 0.5, max_staleness_s: 10.0, min_completeness: 0.995, min_accuracy: 0.995 },
        DataType::Trade => Thresholds { max_missing: 5, max_errors: 5, max_latency_s: 1.0, max_staleness_s: 30.0, min_completeness: 0.99, min_accuracy: 0.99 },
        DataType::Kline => Thresholds { max_missing: 10, max_errors: 10, max_latency_s: 5.0, max_staleness_s: 120.0, min_completeness: 0.95, min_accuracy: 0.95 },
        DataType::FundingRate => Thresholds { max_missing: 5, max_errors: 5, max_latency_s: 5.0, max_staleness_s: 600.0, min_completeness: 0.95, min_accuracy: 0.95 },
        DataType::OpenInterest => Thresholds { max_missing: 5, max_errors: 5, max_latency_s: 5.0, max_staleness_s: 600.0, min_completeness: 0.95, min_accuracy: 0.95 },
        DataType::Ingest => Thresholds { max_missing: u64::MAX, max_errors: 1, max_latency_s: f64::MAX, max_staleness_s: f64::MAX, min_completeness: 0.0, min_accuracy: 0.0 },
    }
}

pub struct QualityMonitor {
    metrics: DashMap<(String, DataType), QualityMetric>,
    alert_tx: mpsc::Sender<Alert>,
    history: Mutex<VecDeque<Alert>>,
}

impl QualityMonitor {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::Receiver<Alert>) {
        let (alert_tx, alert_rx) = mpsc::channel(ALERT_CHANNEL_CAPACITY);
        let monitor = std::sync::Arc::new(Self {
            metrics: DashMap::new(),
            alert_tx,
            history: Mutex::new(VecDeque::with_capacity(ALERT_HISTORY_CAPACITY)),
        });

        let sweep_monitor = std::sync::Arc::clone(&monitor);
        tokio::spawn(async move { sweep_monitor.run_sweep().await });

        (monitor, alert_rx)
    }

    /// Runs the domain sanity check for one ingested event and updates the
    /// matching QualityMetric. Returns `false` if the event should be dropped.
    pub fn check(&self, symbol: &str, now_ms: i64, msg_timestamp_ms: i64, event: &StreamEvent) -> bool {
        let data_type = event.data_type();
        let sane = domain_sanity_check(event);

        let mut entry = self
            .metrics
            .entry((symbol.to_string(), data_type))
            .or_insert_with(|| QualityMetric::new(symbol, data_type));

        let prev_update = entry.last_update;
        entry.last_update = now_ms;
        entry.staleness_s = 0.0;
        entry.latency_s = ((now_ms - msg_timestamp_ms).max(0) as f64) / 1000.0;

        // §4.4 "increments message counts": update_frequency tracks the observed
        // arrival rate, and a gap wider than this channel's own staleness budget
        // both counts as a miss and drags completeness down, same EWMA shape as
        // accuracy below.
        if prev_update > 0 {
            let delta_s = ((now_ms - prev_update).max(0) as f64) / 1000.0;
            if delta_s > 0.0 {
                entry.update_frequency = ewma(entry.update_frequency, 1.0 / delta_s);
            }
            if delta_s > thresholds_for(data_type).max_staleness_s {
                entry.missing_count += 1;
                entry.completeness = ewma(entry.completeness, 0.0);
            } else {
                entry.completeness = ewma(entry.completeness, 1.0);
            }
        }

        if sane {
            entry.accuracy = ewma(entry.accuracy, 1.0);
        } else {
            entry.error_count += 1;
            entry.accuracy = ewma(entry.accuracy, 0.0);
        }

        self.check_thresholds(&entry, now_ms);
        sane
    }

    pub fn record_persistence_failure(&self, symbol: &str) {
        let mut entry = self
            .metrics
            .entry((symbol.to_string(), DataType::Ingest))
            .or_insert_with(|| QualityMetric::new(symbol, DataType::Ingest));
        entry.error_count += 1;
    }

    pub fn metric(&self, symbol: &str, data_type: DataType) -> Option<QualityMetric> {
        self.metrics.get(&(symbol.to_string(), data_type)).map(|e| e.clone())
    }

    pub fn all_metrics(&self) -> Vec<QualityMetric> {
        self.metrics.iter().map(|e| e.value().clone()).collect()
    }

    /// Pass-rate of domain sanity checks across every tracked channel — this
    /// crate's definition of "accuracy" (spec.md Open Questions #3, DESIGN.md).
    pub fn overall_quality_score(&self) -> f64 {
        if self.metrics.is_empty() {
            return 1.0;
        }
        let sum: f64 = self.metrics.iter().map(|e| e.value().accuracy).sum();
        sum / self.metrics.len() as f64
    }

    fn check_thresholds(&self, metric: &QualityMetric, now_ms: i64) {
        let t = thresholds_for(metric.data_type);
        let mut breach = None;

        if metric.missing_count > t.max_missing {
            breach = Some(("missing_count", metric.missing_count as f64, t.max_missing as f64));
        } else if metric.error_count > t.max_errors {
            breach = Some(("error_count", metric.error_count as f64, t.max_errors as f64));
        } else if metric.completeness < t.min_completeness {
            breach = Some(("completeness", metric.completeness, t.min_completeness));
        } else if metric.latency_s > t.max_latency_s {
            breach = Some(("latency_s", metric.latency_s, t.max_latency_s));
        } else if metric.accuracy < t.min_accuracy {
            breach = Some(("accuracy", metric.accuracy, t.min_accuracy));
        }

        if let Some((field, value, threshold)) = breach {
            self.emit_alert(Alert {
                symbol: metric.symbol.clone(),
                data_type: metric.data_type,
                level: AlertLevel::Warning,
                message: format!("{field} breached threshold"),
                timestamp: now_ms,
                metric_value: value,
                threshold,
            });
        }
    }

    fn emit_alert(&self, alert: Alert) {
        let mut history = self.history.lock().unwrap();
        if history.len() == ALERT_HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(alert.clone());
        drop(history);

        // Non-blocking send per §5: alerts never block a producer.
        let _ = self.alert_tx.try_send(alert);
    }

    /// Re-runs staleness checks on a fixed tick to catch channels that have gone
    /// silent and would otherwise never trigger `check` again (§4.4).
    async fn run_sweep(self: std::sync::Arc<Self>) {
        let mut tick = interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            for mut entry in self.metrics.iter_mut() {
                let t = thresholds_for(entry.data_type);
                entry.staleness_s = ((now_ms - entry.last_update).max(0) as f64) / 1000.0;
                if entry.staleness_s > t.max_staleness_s {
                    let alert = Alert {
                        symbol: entry.symbol.clone(),
                        data_type: entry.data_type,
                        level: AlertLevel::Error,
                        message: "channel went silent".to_string(),
                        timestamp: now_ms,
                        metric_value: entry.staleness_s,
                        threshold: t.max_staleness_s,
                    };
                    drop(entry);
                    self.emit_alert(alert);
                    break;
                }
            }
        }
    }
}

fn ewma(prev: f64, sample: f64) -> f64 {
    const ALPHA: f64 = 0.1;
    prev * (1.0 - ALPHA) + sample * ALPHA
}

fn domain_sanity_check(event: &StreamEvent) -> bool {
    match event {
        StreamEvent::OrderBook(book) => order_book_sane(book),
        StreamEvent::Trade(trade) => trade_sane(trade),
        StreamEvent::Kline { candle_open, candle_high, candle_low, candle_close, candle_volume, .. } => {
            *candle_high >= candle_open.max(*candle_close)
                && *candle_low <= candle_open.min(*candle_close)
                && candle_high >= candle_low
                && *candle_volume >= 0.0
        }
        StreamEvent::FundingRate(funding) => funding.rate.abs() < 1.0,
        StreamEvent::Ticker { price, .. } => *price > 0.0,
        StreamEvent::OpenInterest { value, .. } => *value >= 0.0,
    }
}

fn order_book_sane(book: &OrderBookSnapshot) -> bool {
    if book.bids.is_empty() || book.asks.is_empty() {
        return false;
    }
    if book.bids.iter().any(|l| l.quantity < 0.0) || book.asks.iter().any(|l| l.quantity < 0.0) {
        return false;
    }
    book.is_valid()
}

fn trade_sane(trade: &Trade) -> bool {
    trade.price > 0.0 && trade.quantity > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PriceLevel, Side};

    #[test]
    fn kline_sanity_check_catches_inverted_high_low() {
        let bad = StreamEvent::Kline {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            candle_open: 100.0,
            candle_high: 99.0,
            candle_low: 101.0,
            candle_close: 100.0,
            candle_volume: 1.0,
            is_closed: false,
            open_time: 0,
        };
        assert!(!domain_sanity_check(&bad));
    }

    #[test]
    fn order_book_sanity_rejects_crossed_book() {
        let book = OrderBookSnapshot {
            symbol: "BTCUSDT".into(),
            updated_at: 0,
            bids: vec![PriceLevel { price: 101.0, quantity: 1.0 }],
            asks: vec![PriceLevel { price: 100.0, quantity: 1.0 }],
        };
        assert!(!order_book_sane(&book));
    }

    #[test]
    fn trade_sanity_rejects_non_positive_price_or_quantity() {
        let trade = Trade { id: 1, symbol: "BTCUSDT".into(), price: 0.0, quantity: 1.0, side: Side::Buy, timestamp: 0 };
        assert!(!trade_sane(&trade));
    }

    #[tokio::test]
    async fn overall_quality_score_defaults_to_one_with_no_metrics() {
        let (monitor, _rx) = QualityMonitor::new();
        assert_eq!(monitor.overall_quality_score(), 1.0);
    }

    fn trade_at(ts: i64) -> StreamEvent {
        StreamEvent::Trade(Trade { id: 1, symbol: "BTCUSDT".into(), price: 100.0, quantity: 1.0, side: Side::Buy, timestamp: ts })
    }

    #[tokio::test]
    async fn a_gap_wider_than_the_staleness_budget_counts_as_missing() {
        let (monitor, _rx) = QualityMonitor::new();
        monitor.check("BTCUSDT", 0, 0, &trade_at(0));
        // Trade's max_staleness_s is 30s; a 40s gap should register as a miss.
        monitor.check("BTCUSDT", 40_000, 40_000, &trade_at(40_000));

        let metric = monitor.metric("BTCUSDT", DataType::Trade).unwrap();
        assert_eq!(metric.missing_count, 1);
        assert!(metric.completeness < 1.0);
        assert!(metric.update_frequency > 0.0);
    }

    #[tokio::test]
    async fn a_tight_run_of_updates_keeps_completeness_at_one() {
        let (monitor, _rx) = QualityMonitor::new();
        for ts in [0, 1_000, 2_000, 3_000] {
            monitor.check("BTCUSDT", ts, ts, &trade_at(ts));
        }

        let metric = monitor.metric("BTCUSDT", DataType::Trade).unwrap();
        assert_eq!(metric.missing_count, 0);
        assert_eq!(metric.completeness, 1.0);
    }

    #[tokio::test]
    async fn repeated_misses_past_max_missing_emit_a_missing_count_alert() {
        let (monitor, mut alerts) = QualityMonitor::new();
        // OrderBook allows at most 2 misses before breaching; feed 4 gaps well
        // past its 10s staleness budget.
        let book_at = |ts: i64| {
            StreamEvent::OrderBook(OrderBookSnapshot {
                symbol: "BTCUSDT".into(),
                updated_at: ts,
                bids: vec![PriceLevel { price: 99.0, quantity: 1.0 }],
                asks: vec![PriceLevel { price: 100.0, quantity: 1.0 }],
            })
        };
        for ts in [0, 20_000, 40_000, 60_000] {
            monitor.check("BTCUSDT", ts, ts, &book_at(ts));
        }

        let metric = monitor.metric("BTCUSDT", DataType::OrderBook).unwrap();
        assert!(metric.missing_count > 2);

        let alert = alerts.try_recv().expect("a threshold-breach alert should have been queued");
        assert_eq!(alert.message, "missing_count breached threshold");
    }
}
