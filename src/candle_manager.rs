//! Candle manager (C5, §4.5) — the heart of the core.
//!
//! Live-bar aggregation is new (the teacher only reshapes Binance's own kline
//! payloads, it never aggregates trades); `backfill` is grounded on
//! `retriever.rs::fetch_one_batch`'s one-batch-at-a-time shape, and
//! `check_integrity`'s gap scan is grounded on `gap_filler.rs`'s pairwise window,
//! repurposed for detection rather than linear-interpolation synthesis.

use crate::config::AutoBackfillConfig;
use crate::error::IngestError;
use crate::model::{Candle, Gap, Interval, IntegrityReport};
use crate::rest_client::RestClient;
use crate::store::CandleStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

const BACKFILL_PAGE_SIZE: u16 = 1000;
const INTER_BATCH_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

type LiveBarKey = (String, Interval);

struct Subscriber {
    tx: mpsc::Sender<Candle>,
}

pub struct CandleManager {
    store: Arc<CandleStore>,
    rest_client: Option<Arc<RestClient>>,
    live_bars: RwLock<HashMap<LiveBarKey, Candle>>,
    subscribers: RwLock<HashMap<LiveBarKey, Vec<Subscriber>>>,
    auto_backfill: Arc<std::sync::Mutex<AutoBackfillConfig>>,
}

impl CandleManager {
    pub fn new(
        store: Arc<CandleStore>,
        rest_client: Option<Arc<RestClient>>,
        auto_backfill: Arc<std::sync::Mutex<AutoBackfillConfig>>,
    ) -> Self {
        Self {
            store,
            rest_client,
            live_bars: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            auto_backfill,
        }
    }

    /// Folds one trade into the live bar for (symbol, interval). Closes and
    /// persists the current bar once a trade arrives at or past its close_time,
    /// opening a fresh bar aligned to the trade's own bucket (§4.5, invariant 2).
    pub async fn update_trade(&self, symbol: &str, interval: Interval, price: f64, volume: f64, ts: i64) {
        let key = (symbol.to_string(), interval);
        let mut live_bars = self.live_bars.write().await;

        let (closed, live_bar) = match live_bars.get_mut(&key) {
            Some(bar) if ts < bar.close_time => {
                bar.apply_trade(price, volume);
                (None, Some(bar.clone()))
            }
            Some(bar) => {
                bar.complete = true;
                let closed = bar.clone();
                let new_bar = Candle::open(symbol, interval, ts, price, volume);
                live_bars.insert(key.clone(), new_bar);
                (Some(closed), None)
            }
            None => {
                live_bars.insert(key.clone(), Candle::open(symbol, interval, ts, price, volume));
                (None, None)
            }
        };
        drop(live_bars);

        // Fan-out happens after the live-bar lock is released: no component takes
        // more than one lock at a time (§5).
        if let Some(bar) = live_bar {
            self.fan_out(&key, bar).await;
        }
        if let Some(bar) = closed {
            self.fan_out(&key, bar.clone()).await;
            if let Err(e) = self.store.enqueue(bar).await {
                tracing::error!(error = %e, "failed to enqueue completed candle");
            }
        }
    }

    async fn fan_out(&self, key: &LiveBarKey, bar: Candle) {
        let subscribers = self.subscribers.read().await;
        if let Some(subs) = subscribers.get(key) {
            for sub in subs {
                // Non-blocking send: a slow consumer never stalls aggregation (§5).
                let _ = sub.tx.try_send(bar.clone());
            }
        }
    }

    pub async fn subscribe(&self, symbol: &str, interval: Interval) -> mpsc::Receiver<Candle> {
        let (tx, rx) = mpsc::channel(1000);
        let key = (symbol.to_string(), interval);
        self.subscribers.write().await.entry(key).or_default().push(Subscriber { tx });
        rx
    }

    pub async fn unsubscribe_all(&self, symbol: &str, interval: Interval) {
        self.subscribers.write().await.remove(&(symbol.to_string(), interval));
    }

    /// Shares this manager's `AutoBackfillConfig` handle with C6 (§9: "C6 ...
    /// its AutoBackfillConfig accessor"), so a runtime edit to either `enabled` or
    /// `min_completeness_percent` is observed by both without duplicating state.
    pub fn auto_backfill_config(&self) -> Arc<std::sync::Mutex<AutoBackfillConfig>> {
        Arc::clone(&self.auto_backfill)
    }

    pub fn load_historical(&self, symbol: &str, interval: Interval, start: i64, end: i64) -> Result<Vec<Candle>, IngestError> {
        self.store.load_range(symbol, interval, start, end)
    }

    /// Scans `[start, end)` for gaps against the *intended* boundary, not just
    /// against loaded content — leading/trailing missing bars count too (§4.5).
    pub fn check_integrity(&self, symbol: &str, interval: Interval, start: i64, end: i64) -> Result<IntegrityReport, IngestError> {
        let loaded = self.store.load_range(symbol, interval, start, end)?;
        let duration = interval.duration_ms();
        let expected_count = ((end - start) / duration).max(0);

        let mut gaps = Vec::new();
        let mut cursor = start;
        for candle in &loaded {
            if candle.open_time > cursor {
                let missing = (candle.open_time - cursor) / duration;
                gaps.push(Gap { start: cursor, end: candle.open_time, missing_count: missing });
            }
            cursor = candle.open_time + duration;
        }
        if cursor < end {
            let missing = (end - cursor) / duration;
            if missing > 0 {
                gaps.push(Gap { start: cursor, end, missing_count: missing });
            }
        }

        let actual_count = loaded.len() as i64;
        let completeness = if expected_count == 0 { 0.0 } else { 100.0 * actual_count as f64 / expected_count as f64 };

        Ok(IntegrityReport {
            symbol: symbol.to_string(),
            interval,
            start,
            end,
            expected_count,
            actual_count,
            completeness,
            gaps,
        })
    }

    /// Fetches pages of `BACKFILL_PAGE_SIZE` bars from C1 starting at `start`,
    /// upserting only missing bars. Best-effort: a failed page is recorded and
    /// skipped rather than aborting the whole range (§4.5).
    pub async fn backfill(&self, symbol: &str, interval: Interval, start: i64, end: i64) -> Result<i64, IngestError> {
        let rest_client = self.rest_client.as_ref().ok_or_else(|| {
            IngestError::ParameterInvalid("no REST client configured, cannot backfill".into())
        })?;

        let duration = interval.duration_ms();
        let mut cursor = start;
        let mut total_inserted = 0i64;

        while cursor < end {
            let page_end = (cursor + duration * BACKFILL_PAGE_SIZE as i64).min(end);

            match rest_client.get_klines(symbol, interval, Some(cursor), Some(page_end), BACKFILL_PAGE_SIZE).await {
                Ok(candles) if !candles.is_empty() => {
                    let inserted = self.store.upsert_batch_sync(&candles)?;
                    total_inserted += inserted;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, symbol, cursor, "backfill page failed, advancing anyway");
                }
            }

            cursor = page_end;
            tokio::time::sleep(INTER_BATCH_DELAY).await;
        }

        Ok(total_inserted)
    }

    /// The decorator: `EnsureAvailable(range)` then `Load`, retrying backfill up to
    /// `config.retry_attempts` times when coverage falls short (§4.5, §1). The query
    /// form tolerates whatever `ensure_available` reports — best-effort loaded data
    /// plus a log warning, never a propagated error (§8: "otherwise the best-effort
    /// loaded data and a log warning (the query form)").
    pub async fn get_with_backfill(&self, symbol: &str, interval: Interval, start: i64, end: i64) -> Result<Vec<Candle>, IngestError> {
        if let Err(e) = self.ensure_available(symbol, interval, start, end).await {
            tracing::warn!(error = %e, symbol, interval = interval.as_str(), "serving best-effort data after ensure_available failed");
        }
        self.load_historical(symbol, interval, start, end)
    }

    /// The void form of `get_with_backfill`. Returns `BackfillOutOfRange` without
    /// any exchange calls when `start` predates `max_backfill_days` (§4.5, S4), and
    /// `BackfillIncomplete` when the retry loop exhausts without reaching
    /// `min_completeness_percent` (§4.5, §7: "a typed error (the ensure form)").
    pub async fn ensure_available(&self, symbol: &str, interval: Interval, start: i64, end: i64) -> Result<(), IngestError> {
        let config = self.auto_backfill.lock().unwrap().clone();

        let report = self.check_integrity(symbol, interval, start, end)?;
        if report.completeness >= config.min_completeness_percent {
            return Ok(());
        }

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let oldest_allowed = now_ms - config.max_backfill_days * 86_400_000;
        if start < oldest_allowed {
            return Err(IngestError::BackfillOutOfRange);
        }

        if self.rest_client.is_none() {
            return Ok(());
        }

        let mut last_completeness = report.completeness;
        for attempt in 0..config.retry_attempts {
            if let Err(e) = self.backfill(symbol, interval, start, end).await {
                tracing::warn!(error = %e, attempt, "backfill attempt failed");
            }
            let report = self.check_integrity(symbol, interval, start, end)?;
            last_completeness = report.completeness;
            if report.completeness >= config.min_completeness_percent {
                return Ok(());
            }
            if attempt + 1 < config.retry_attempts {
                tokio::time::sleep(config.retry_delay).await;
            }
        }

        tracing::warn!(symbol, interval = interval.as_str(), "backfill exhausted retries below completeness threshold");
        Err(IngestError::BackfillIncomplete { completeness: last_completeness, threshold: config.min_completeness_percent })
    }

    /// Ensures coverage, loads the range, then applies `op` to the result — a
    /// single call that wraps ad-hoc analytics (§4.5).
    pub async fn with_auto_backfill<T>(
        &self,
        symbol: &str,
        interval: Interval,
        start: i64,
        end: i64,
        op: impl FnOnce(&[Candle]) -> T,
    ) -> Result<T, IngestError> {
        self.ensure_available(symbol, interval, start, end).await?;
        let bars = self.load_historical(symbol, interval, start, end)?;
        Ok(op(&bars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn manager_without_rest() -> (tempfile::TempDir, CandleManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CandleStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let manager = CandleManager::new(store, None, Arc::new(Mutex::new(AutoBackfillConfig::default())));
        (dir, manager)
    }

    #[tokio::test]
    async fn update_trade_closes_bar_and_opens_next_on_boundary_cross() {
        let (_dir, manager) = manager_without_rest();
        let d = Interval::M1.duration_ms();

        manager.update_trade("XUSDT", Interval::M1, 100.0, 1.0, 5_000).await;
        manager.update_trade("XUSDT", Interval::M1, 101.0, 2.0, 30_000).await;
        manager.update_trade("XUSDT", Interval::M1, 99.0, 1.0, 59_000).await;

        {
            let live = manager.live_bars.read().await;
            let bar = live.get(&("XUSDT".to_string(), Interval::M1)).unwrap();
            assert_eq!(bar.open, 100.0);
            assert_eq!(bar.high, 101.0);
            assert_eq!(bar.low, 99.0);
            assert_eq!(bar.close, 99.0);
            assert_eq!(bar.volume, 4.0);
            assert!(!bar.complete);
        }

        manager.update_trade("XUSDT", Interval::M1, 98.0, 1.0, d).await;
        let live = manager.live_bars.read().await;
        let new_bar = live.get(&("XUSDT".to_string(), Interval::M1)).unwrap();
        assert_eq!(new_bar.open_time, d);
        assert_eq!(new_bar.open, 98.0);
    }

    #[tokio::test]
    async fn check_integrity_reports_leading_and_trailing_gaps() {
        let (_dir, manager) = manager_without_rest();
        let d = Interval::H1.duration_ms();

        // Only the middle bar is present in [0, 3d) — both ends are gaps.
        manager.store.upsert_batch_sync(&[Candle {
            symbol: "BTCUSDT".into(),
            interval: Interval::H1,
            open_time: d,
            close_time: 2 * d,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            complete: true,
        }]).unwrap();

        let report = manager.check_integrity("BTCUSDT", Interval::H1, 0, 3 * d).unwrap();
        assert_eq!(report.expected_count, 3);
        assert_eq!(report.actual_count, 1);
        assert!(report.has_gaps());
        assert_eq!(report.gaps.len(), 2);
    }

    #[tokio::test]
    async fn ensure_available_rejects_out_of_range_before_any_exchange_calls() {
        let (_dir, manager) = manager_without_rest();
        // The out-of-range check fires before the "no REST client" fallback, so this
        // is BackfillOutOfRange even though there is no client to call in the first
        // place (§4.5 S4: "EnsureAvailable returns BackfillOutOfRange without any
        // exchange calls").
        let now_ms = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_millis() as i64;
        let far_past = now_ms - 400 * 86_400_000;
        let result = manager.ensure_available("BTCUSDT", Interval::H1, far_past, far_past + Interval::H1.duration_ms()).await;
        assert!(matches!(result, Err(IngestError::BackfillOutOfRange)));
    }

    #[tokio::test]
    async fn ensure_available_with_no_rest_client_resolves_ok_when_in_range() {
        let (_dir, manager) = manager_without_rest();
        let d = Interval::H1.duration_ms();
        // In-range but incomplete, and no REST client to attempt a backfill with —
        // resolves Ok per §4.5 step 3 ("if C1 is absent, return the loaded data").
        let result = manager.ensure_available("BTCUSDT", Interval::H1, 0, 5 * d).await;
        assert!(result.is_ok());
    }
}
