//! Candle store (C3, §4.3).
//!
//! Generalizes the teacher's `DatabaseManager`/`TimeframeStatus` pair into one
//! upsert-idempotent `market_data` table plus a background flusher that drains a
//! bounded write queue, the way `retriever.rs::insert_batch` prepares one statement
//! and executes it per row inside a single transaction.

use crate::error::IngestError;
use crate::model::{Candle, Interval};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

const WRITE_QUEUE_CAPACITY: usize = 100;
const FLUSH_TICK: Duration = Duration::from_secs(5);

pub struct CandleStore {
    conn: Arc<Mutex<Connection>>,
    write_tx: mpsc::Sender<Candle>,
}

impl CandleStore {
    pub fn open(db_path: &str) -> Result<Self, IngestError> {
        let conn = Connection::open(db_path).map_err(|e| IngestError::PersistenceFailed(e.to_string()))?;
        Self::init_schema(&conn).map_err(|e| IngestError::PersistenceFailed(e.to_string()))?;

        let conn = Arc::new(Mutex::new(conn));
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);

        let flusher_conn = Arc::clone(&conn);
        tokio::spawn(async move { Self::run_flusher(flusher_conn, write_rx).await });

        Ok(Self { conn, write_tx })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS market_data (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                complete INTEGER NOT NULL,
                PRIMARY KEY (symbol, interval, open_time)
            )",
            [],
        )?;
        Ok(())
    }

    /// Enqueues a completed or updated bar for asynchronous persistence. Blocks
    /// briefly if the bounded buffer is full (§5: "blocking sends are only used on
    /// the internal batch buffer, short, bounded").
    pub async fn enqueue(&self, candle: Candle) -> Result<(), IngestError> {
        self.write_tx
            .send(candle)
            .await
            .map_err(|_| IngestError::PersistenceFailed("write queue closed".into()))
    }

    async fn run_flusher(conn: Arc<Mutex<Connection>>, mut write_rx: mpsc::Receiver<Candle>) {
        let mut tick = interval(FLUSH_TICK);
        let mut pending = Vec::with_capacity(WRITE_QUEUE_CAPACITY);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    Self::flush(&conn, &mut pending);
                }
                maybe_candle = write_rx.recv() => {
                    match maybe_candle {
                        Some(candle) => {
                            pending.push(candle);
                            if pending.len() >= WRITE_QUEUE_CAPACITY {
                                Self::flush(&conn, &mut pending);
                            }
                        }
                        None => {
                            Self::flush(&conn, &mut pending);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// On commit failure the batch is dropped and logged; re-ingest via reconnect
    /// is the recovery path (§4.3, §7).
    fn flush(conn: &Arc<Mutex<Connection>>, pending: &mut Vec<Candle>) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        let mut conn = conn.lock().unwrap();
        if let Err(e) = Self::write_batch(&mut conn, &batch) {
            tracing::error!(error = %e, count = batch.len(), "candle batch flush failed, dropping buffer");
        }
    }

    fn write_batch(conn: &mut Connection, batch: &[Candle]) -> rusqlite::Result<()> {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO market_data
                    (symbol, interval, open_time, close_time, open, high, low, close, volume, complete)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(symbol, interval, open_time) DO UPDATE SET
                    close_time = excluded.close_time,
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    complete = excluded.complete",
            )?;
            for c in batch {
                stmt.execute(params![
                    c.symbol,
                    c.interval.as_str(),
                    c.open_time,
                    c.close_time,
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    c.volume,
                    c.complete as i64,
                ])?;
            }
        }
        tx.commit()
    }

    /// Synchronous upsert used by the backfill path (C5), which needs to know
    /// exactly how many *new* rows landed to decide whether a page made progress.
    pub fn upsert_batch_sync(&self, batch: &[Candle]) -> Result<i64, IngestError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| IngestError::PersistenceFailed(e.to_string()))?;
        let mut inserted = 0i64;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO market_data
                        (symbol, interval, open_time, close_time, open, high, low, close, volume, complete)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .map_err(|e| IngestError::PersistenceFailed(e.to_string()))?;
            for c in batch {
                let changes = stmt
                    .execute(params![
                        c.symbol,
                        c.interval.as_str(),
                        c.open_time,
                        c.close_time,
                        c.open,
                        c.high,
                        c.low,
                        c.close,
                        c.volume,
                        c.complete as i64,
                    ])
                    .map_err(|e| IngestError::PersistenceFailed(e.to_string()))?;
                if changes > 0 {
                    inserted += 1;
                }
            }
        }
        tx.commit().map_err(|e| IngestError::PersistenceFailed(e.to_string()))?;
        Ok(inserted)
    }

    pub fn load_range(&self, symbol: &str, interval: Interval, start: i64, end: i64) -> Result<Vec<Candle>, IngestError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT open_time, close_time, open, high, low, close, volume, complete
                 FROM market_data
                 WHERE symbol = ?1 AND interval = ?2 AND open_time >= ?3 AND open_time < ?4
                 ORDER BY open_time ASC",
            )
            .map_err(|e| IngestError::PersistenceFailed(e.to_string()))?;

        let rows = stmt
            .query_map(params![symbol, interval.as_str(), start, end], |row| {
                Ok(Candle {
                    symbol: symbol.to_string(),
                    interval,
                    open_time: row.get(0)?,
                    close_time: row.get(1)?,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                    complete: row.get::<_, i64>(7)? != 0,
                })
            })
            .map_err(|e| IngestError::PersistenceFailed(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>().map_err(|e| IngestError::PersistenceFailed(e.to_string()))
    }

    /// Deletes rows older than `retention_days`, in day-sized chunks to bound lock
    /// hold time on a large table.
    pub fn cleanup_older(&self, cutoff_ms: i64) -> Result<u64, IngestError> {
        let conn = self.conn.lock().unwrap();
        let mut total = 0u64;
        loop {
            let deleted = conn
                .execute(
                    "DELETE FROM market_data WHERE open_time < ?1 AND rowid IN
                        (SELECT rowid FROM market_data WHERE open_time < ?1 LIMIT 5000)",
                    params![cutoff_ms],
                )
                .map_err(|e| IngestError::PersistenceFailed(e.to_string()))?;
            total += deleted as u64;
            if deleted == 0 {
                break;
            }
        }
        Ok(total)
    }
}
