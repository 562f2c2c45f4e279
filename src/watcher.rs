//! Auto-backfill watcher (C6, §4.6).
//!
//! Grounded on the teacher's `backfill.rs` driving loop (iterate watched entries,
//! spawn work, collect results, sleep, repeat), turned into a fixed-tick sweep over
//! an explicitly registered watch-list instead of a fixed timeframe set for one symbol.

use crate::candle_manager::CandleManager;
use crate::config::AutoBackfillConfig;
use crate::model::{BackfillHistory, BackfillRecord, Interval};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{interval, Duration, Instant};

const ROLLING_LOOKBACK: Duration = Duration::from_secs(7 * 86_400);

pub struct AutoBackfillWatcher {
    candle_manager: Arc<CandleManager>,
    auto_backfill: Arc<Mutex<AutoBackfillConfig>>,
    watch_list: Mutex<HashMap<String, HashSet<Interval>>>,
    check_interval: Duration,
    running: Arc<AtomicBool>,
    history: Mutex<BackfillHistory>,
}

impl AutoBackfillWatcher {
    /// Shares `candle_manager`'s own `AutoBackfillConfig` handle (§9's "C6 ... its
    /// AutoBackfillConfig accessor") rather than snapshotting `enabled` once at
    /// startup, so a runtime edit made through either component is observed by both.
    pub fn new(candle_manager: Arc<CandleManager>, check_interval: Duration) -> Arc<Self> {
        let auto_backfill = candle_manager.auto_backfill_config();
        Arc::new(Self {
            candle_manager,
            auto_backfill,
            watch_list: Mutex::new(HashMap::new()),
            check_interval,
            running: Arc::new(AtomicBool::new(false)),
            history: Mutex::new(BackfillHistory::default()),
        })
    }

    pub fn watch(&self, symbol: &str, interval: Interval) {
        self.watch_list.lock().unwrap().entry(symbol.to_string()).or_default().insert(interval);
    }

    pub fn unwatch(&self, symbol: &str, interval: Interval) {
        if let Some(set) = self.watch_list.lock().unwrap().get_mut(symbol) {
            set.remove(&interval);
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.auto_backfill.lock().unwrap().enabled = enabled;
    }

    pub fn history(&self) -> Vec<BackfillRecord> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    /// Signals the running sweep loop to stop after its current (symbol, interval)
    /// finishes. Idempotent; safe to call from any task.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Spawns the background sweep loop: an immediate first pass, then one pass per
    /// `check_interval` tick, until `stop()` is called.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // already running
        }
        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.run().await });
    }

    async fn run(self: Arc<Self>) {
        let mut tick = interval(self.check_interval);
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            tick.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            if self.auto_backfill.lock().unwrap().enabled {
                self.sweep().await;
            }
        }
    }

    async fn sweep(&self) {
        let targets: Vec<(String, Interval)> = {
            let watch_list = self.watch_list.lock().unwrap();
            watch_list
                .iter()
                .flat_map(|(symbol, intervals)| intervals.iter().map(move |i| (symbol.clone(), *i)))
                .collect()
        };

        let min_completeness_percent = self.auto_backfill.lock().unwrap().min_completeness_percent;

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let start = now_ms - ROLLING_LOOKBACK.as_millis() as i64;

        for (symbol, interval) in targets {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            let begin = Instant::now();
            let report = self.candle_manager.check_integrity(&symbol, interval, start, now_ms);

            // §4.6: "if completeness < config.min_completeness_percent, it calls
            // C5.Backfill" — not a bare has_gaps() check.
            let record = match report {
                Ok(report) if report.completeness >= min_completeness_percent => BackfillRecord {
                    timestamp: now_ms,
                    symbol: symbol.clone(),
                    interval,
                    start,
                    end: now_ms,
                    success: true,
                    record_count: 0,
                    error: None,
                    duration: begin.elapsed(),
                },
                Ok(_) => match self.candle_manager.backfill(&symbol, interval, start, now_ms).await {
                    Ok(count) => BackfillRecord {
                        timestamp: now_ms,
                        symbol: symbol.clone(),
                        interval,
                        start,
                        end: now_ms,
                        success: true,
                        record_count: count,
                        error: None,
                        duration: begin.elapsed(),
                    },
                    Err(e) => BackfillRecord {
                        timestamp: now_ms,
                        symbol: symbol.clone(),
                        interval,
                        start,
                        end: now_ms,
                        success: false,
                        record_count: 0,
                        error: Some(e.to_string()),
                        duration: begin.elapsed(),
                    },
                },
                Err(e) => BackfillRecord {
                    timestamp: now_ms,
                    symbol: symbol.clone(),
                    interval,
                    start,
                    end: now_ms,
                    success: false,
                    record_count: 0,
                    error: Some(e.to_string()),
                    duration: begin.elapsed(),
                },
            };

            if !record.success {
                tracing::warn!(symbol = %record.symbol, interval = interval.as_str(), error = ?record.error, "watcher pass failed");
            }
            self.history.lock().unwrap().push(record);
        }
    }
}
