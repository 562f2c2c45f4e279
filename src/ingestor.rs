//! Ingestor facade (C7, §4.7).
//!
//! Assembled from the teacher's `web_server.rs` `AppState` wiring (one shared
//! `RealtimeManager`, one cache, one DB handle) generalized into the stable
//! subscribe/read-through surface this crate exposes to everything outside the core.

use crate::candle_manager::CandleManager;
use crate::error::IngestError;
use crate::model::{Candle, FundingRate, Interval, OrderBookSnapshot, QualityMetric, Trade};
use crate::quality::QualityMonitor;
use crate::rest_client::RestClient;
use crate::store::CandleStore;
use crate::stream_client::{MarketType, StreamClient, StreamEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

const CONSUMER_CHANNEL_CAPACITY: usize = 1000;
const DEFAULT_WORKER_POOL_SIZE: usize = 10;

#[derive(Debug, Default)]
pub struct IngestorStats {
    pub frames_delivered: AtomicU64,
    pub frames_dropped_full: AtomicU64,
    pub frames_dropped_quality: AtomicU64,
}

/// Released on drop: unsubscribes from C2 and lets the consumer channel close.
pub struct SubscriptionHandle {
    symbol: String,
    market_type: MarketType,
    stream_client: Arc<StreamClient>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.stream_client.unsubscribe(&self.symbol, self.market_type);
    }
}

pub struct Ingestor {
    rest_client: Arc<RestClient>,
    stream_client: Arc<StreamClient>,
    store: Arc<CandleStore>,
    quality: Arc<QualityMonitor>,
    candle_manager: Arc<CandleManager>,
    worker_pool: Arc<Semaphore>,
    stats: Arc<IngestorStats>,
}

impl Ingestor {
    pub fn new(
        rest_client: Arc<RestClient>,
        stream_client: Arc<StreamClient>,
        store: Arc<CandleStore>,
        quality: Arc<QualityMonitor>,
        candle_manager: Arc<CandleManager>,
        worker_pool_size: usize,
    ) -> Self {
        let worker_pool_size = if worker_pool_size == 0 { DEFAULT_WORKER_POOL_SIZE } else { worker_pool_size };
        Self {
            rest_client,
            stream_client,
            store,
            quality,
            candle_manager,
            worker_pool: Arc::new(Semaphore::new(worker_pool_size)),
            stats: Arc::new(IngestorStats::default()),
        }
    }

    fn now_ms() -> i64 {
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
    }

    /// Runs the quality check, drops the message on failure, else dispatches
    /// persistence through the bounded worker pool and non-blockingly forwards
    /// to the consumer channel (drop + count on full) — §4.7 step 3.
    fn dispatch<T: Send + 'static>(
        &self,
        symbol: &str,
        event: &StreamEvent,
        tx: &mpsc::Sender<T>,
        payload: T,
        persist_candle: Option<Candle>,
    ) {
        let now_ms = Self::now_ms();
        let sane = self.quality.check(symbol, now_ms, now_ms, event);
        if !sane {
            self.stats.frames_dropped_quality.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Some(candle) = persist_candle {
            let store = Arc::clone(&self.store);
            let permit = Arc::clone(&self.worker_pool);
            tokio::spawn(async move {
                let _permit = permit.acquire().await;
                if let Err(e) = store.enqueue(candle).await {
                    tracing::error!(error = %e, "failed to enqueue kline-sourced candle");
                }
            });
        }

        if tx.try_send(payload).is_ok() {
            self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.frames_dropped_full.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe_order_book(self: &Arc<Self>, symbol: &str) -> (mpsc::Receiver<OrderBookSnapshot>, SubscriptionHandle) {
        let (tx, rx) = mpsc::channel(CONSUMER_CHANNEL_CAPACITY);
        let ingestor = Arc::clone(self);
        let sym = symbol.to_string();
        self.stream_client.subscribe(
            symbol,
            MarketType::Futures,
            vec![format!("{}@depth20@100ms", symbol.to_lowercase())],
            Arc::new(move |event| {
                if let StreamEvent::OrderBook(ref book) = event {
                    ingestor.dispatch(&sym, &event, &tx, book.clone(), None);
                }
            }),
        );
        (rx, SubscriptionHandle { symbol: symbol.to_string(), market_type: MarketType::Futures, stream_client: Arc::clone(&self.stream_client) })
    }

    pub fn subscribe_trades(self: &Arc<Self>, symbol: &str) -> (mpsc::Receiver<Trade>, SubscriptionHandle) {
        let (tx, rx) = mpsc::channel(CONSUMER_CHANNEL_CAPACITY);
        let ingestor = Arc::clone(self);
        let sym = symbol.to_string();
        self.stream_client.subscribe(
            symbol,
            MarketType::Futures,
            vec![format!("{}@trade", symbol.to_lowercase())],
            Arc::new(move |event| {
                if let StreamEvent::Trade(ref trade) = event {
                    ingestor.dispatch(&sym, &event, &tx, trade.clone(), None);
                }
            }),
        );
        (rx, SubscriptionHandle { symbol: symbol.to_string(), market_type: MarketType::Futures, stream_client: Arc::clone(&self.stream_client) })
    }

    pub fn subscribe_klines(self: &Arc<Self>, symbol: &str, interval: Interval) -> (mpsc::Receiver<Candle>, SubscriptionHandle) {
        let (tx, rx) = mpsc::channel(CONSUMER_CHANNEL_CAPACITY);
        let ingestor = Arc::clone(self);
        let sym = symbol.to_string();
        self.stream_client.subscribe(
            symbol,
            MarketType::Futures,
            vec![format!("{}@kline_{}", symbol.to_lowercase(), interval.as_str())],
            Arc::new(move |event| {
                if let StreamEvent::Kline { ref symbol, candle_open, candle_high, candle_low, candle_close, candle_volume, is_closed, open_time, .. } = event {
                    let candle = Candle {
                        symbol: symbol.clone(),
                        interval,
                        open_time,
                        close_time: open_time + interval.duration_ms(),
                        open: candle_open,
                        high: candle_high,
                        low: candle_low,
                        close: candle_close,
                        volume: candle_volume,
                        complete: is_closed,
                    };
                    let persist_candle = if is_closed { Some(candle.clone()) } else { None };
                    ingestor.dispatch(&sym, &event, &tx, candle, persist_candle);
                }
            }),
        );
        (rx, SubscriptionHandle { symbol: symbol.to_string(), market_type: MarketType::Futures, stream_client: Arc::clone(&self.stream_client) })
    }

    pub fn subscribe_funding_rates(self: &Arc<Self>, symbol: &str) -> (mpsc::Receiver<FundingRate>, SubscriptionHandle) {
        let (tx, rx) = mpsc::channel(CONSUMER_CHANNEL_CAPACITY);
        let ingestor = Arc::clone(self);
        let sym = symbol.to_string();
        self.stream_client.subscribe(
            symbol,
            MarketType::Futures,
            vec![format!("{}@markPrice@1s", symbol.to_lowercase())],
            Arc::new(move |event| {
                if let StreamEvent::FundingRate(ref rate) = event {
                    ingestor.dispatch(&sym, &event, &tx, rate.clone(), None);
                }
            }),
        );
        (rx, SubscriptionHandle { symbol: symbol.to_string(), market_type: MarketType::Futures, stream_client: Arc::clone(&self.stream_client) })
    }

    // Read-through REST helpers (§4.7): delegate directly to C1.

    pub async fn get_historical_klines(&self, symbol: &str, interval: Interval, start: i64, end: i64, limit: u16) -> Result<Vec<Candle>, IngestError> {
        self.rest_client.get_klines(symbol, interval, Some(start), Some(end), limit).await
    }

    pub async fn get_current_order_book(&self, symbol: &str, depth: u16) -> Result<OrderBookSnapshot, IngestError> {
        self.rest_client.get_order_book(symbol, depth).await
    }

    pub async fn get_current_funding_rate(&self, symbol: &str) -> Result<FundingRate, IngestError> {
        self.rest_client.get_funding_rate(symbol).await
    }

    // Auto-backfill decorator surface, delegated straight to C5.

    pub async fn get_with_backfill(&self, symbol: &str, interval: Interval, start: i64, end: i64) -> Result<Vec<Candle>, IngestError> {
        self.candle_manager.get_with_backfill(symbol, interval, start, end).await
    }

    // Aggregate reporters.

    pub fn get_stats(&self) -> Arc<IngestorStats> {
        Arc::clone(&self.stats)
    }

    pub fn get_quality_metrics(&self) -> Vec<QualityMetric> {
        self.quality.all_metrics()
    }

    pub fn get_overall_quality_score(&self) -> f64 {
        self.quality.overall_quality_score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoBackfillConfig;
    use std::sync::Mutex;

    fn build_ingestor() -> (tempfile::TempDir, Arc<Ingestor>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CandleStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let (quality, _alerts) = QualityMonitor::new();
        let candle_manager = Arc::new(CandleManager::new(Arc::clone(&store), None, Arc::new(Mutex::new(AutoBackfillConfig::default()))));
        let stream_client = StreamClient::new("wss://example.invalid/ws");
        let config = crate::config::Config {
            api_key: None,
            api_secret: None,
            testnet: true,
            db_path: ":memory:".into(),
            worker_pool_size: 10,
            watcher_check_interval: std::time::Duration::from_secs(3600),
            quality_sweep_interval: std::time::Duration::from_secs(60),
            auto_backfill: AutoBackfillConfig::default(),
        };
        let rest_client = Arc::new(RestClient::new(&config).unwrap());
        let ingestor = Arc::new(Ingestor::new(rest_client, stream_client, store, quality, candle_manager, 10));
        (dir, ingestor)
    }

    #[tokio::test]
    async fn new_ingestor_starts_with_zero_stats() {
        let (_dir, ingestor) = build_ingestor();
        let stats = ingestor.get_stats();
        assert_eq!(stats.frames_delivered.load(Ordering::Relaxed), 0);
        assert_eq!(stats.frames_dropped_full.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn overall_quality_score_is_one_before_any_traffic() {
        let (_dir, ingestor) = build_ingestor();
        assert_eq!(ingestor.get_overall_quality_score(), 1.0);
    }

    #[tokio::test]
    async fn subscription_handle_drop_sends_unsubscribe_without_panicking() {
        let (_dir, ingestor) = build_ingestor();
        let (_rx, handle) = ingestor.subscribe_trades("BTCUSDT");
        drop(handle);
    }
}
