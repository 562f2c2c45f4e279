//! Example service entrypoint: wires C1–C7 together and streams live candles
//! for one symbol to stdout.

use anyhow::Result;
use clap::Parser;
use market_data_pipeline::candle_manager::CandleManager;
use market_data_pipeline::config::Config;
use market_data_pipeline::ingestor::Ingestor;
use market_data_pipeline::model::Interval;
use market_data_pipeline::quality::QualityMonitor;
use market_data_pipeline::rest_client::RestClient;
use market_data_pipeline::store::CandleStore;
use market_data_pipeline::stream_client::StreamClient;
use market_data_pipeline::watcher::AutoBackfillWatcher;
use std::sync::{Arc, Mutex};

const STREAM_URL: &str = "wss://fstream.binance.com/ws";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Trading pair to ingest, e.g. BTCUSDT.
    #[arg(short, long)]
    symbol: String,

    /// Candle width for the live kline subscription and watcher sweep.
    #[arg(short, long, default_value = "1m")]
    interval: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let symbol = args.symbol.to_uppercase();
    let interval = Interval::parse(&args.interval)
        .ok_or_else(|| anyhow::anyhow!("unrecognized interval: {}", args.interval))?;

    let config = Config::load()?;
    tracing::info!(symbol, interval = interval.as_str(), "starting ingestor service");

    let rest_client = Arc::new(RestClient::new(&config)?);
    let store = Arc::new(CandleStore::open(&config.db_path)?);
    let (quality, mut alerts) = QualityMonitor::new();
    let auto_backfill = Arc::new(Mutex::new(config.auto_backfill.clone()));
    let candle_manager = Arc::new(CandleManager::new(Arc::clone(&store), Some(Arc::clone(&rest_client)), auto_backfill));
    let stream_client = StreamClient::new(STREAM_URL);

    let watcher = AutoBackfillWatcher::new(Arc::clone(&candle_manager), config.watcher_check_interval);
    watcher.watch(&symbol, interval);
    watcher.start();

    let ingestor = Arc::new(Ingestor::new(
        rest_client,
        stream_client,
        store,
        quality,
        candle_manager,
        config.worker_pool_size,
    ));

    tokio::spawn(async move {
        while let Some(alert) = alerts.recv().await {
            tracing::warn!(symbol = %alert.symbol, message = %alert.message, "quality alert");
        }
    });

    let (mut klines, _handle) = ingestor.subscribe_klines(&symbol, interval);
    while let Some(candle) = klines.recv().await {
        tracing::info!(
            open_time = candle.open_time,
            close = candle.close,
            volume = candle.volume,
            complete = candle.complete,
            "candle update"
        );
    }

    Ok(())
}
