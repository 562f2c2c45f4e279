//! Market data pipeline: streaming ingestion with auto-backfill and
//! data-integrity guarantees for crypto futures candles.

pub mod candle_manager;
pub mod config;
pub mod error;
pub mod ingestor;
pub mod model;
pub mod quality;
pub mod rate_limiter;
pub mod rest_client;
pub mod store;
pub mod stream_client;
pub mod watcher;
