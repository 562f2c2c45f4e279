//! Exchange stream client (C2, §4.2).
//!
//! Generalizes the teacher's per-stream WebSocket task into the single shared
//! duplex connection spec.md §3/§9 describes ("the socket is ephemeral, the
//! subscription table is the source of truth"): one connection multiplexes every
//! subscribed channel, replaying the whole subscription table as SUBSCRIBE frames
//! on every successful (re)connect.

use crate::error::IngestError;
use crate::model::{DataType, FundingRate, OrderBookSnapshot, PriceLevel, Side, Trade};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketType {
    Spot,
    Futures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    OrderBook(OrderBookSnapshot),
    Trade(Trade),
    Kline { symbol: String, interval: String, candle_open: f64, candle_high: f64, candle_low: f64, candle_close: f64, candle_volume: f64, is_closed: bool, open_time: i64 },
    Ticker { symbol: String, price: f64 },
    FundingRate(FundingRate),
    OpenInterest { symbol: String, value: f64 },
}

impl StreamEvent {
    pub fn data_type(&self) -> DataType {
        match self {
            StreamEvent::OrderBook(_) => DataType::OrderBook,
            StreamEvent::Trade(_) => DataType::Trade,
            StreamEvent::Kline { .. } => DataType::Kline,
            StreamEvent::Ticker { .. } => DataType::Ticker,
            StreamEvent::FundingRate(_) => DataType::FundingRate,
            StreamEvent::OpenInterest { .. } => DataType::OpenInterest,
        }
    }
}

type Handler = Arc<dyn Fn(StreamEvent) + Send + Sync>;

struct SubscriptionEntry {
    channels: Vec<String>,
    handler: Handler,
}

struct SubscriptionTable {
    entries: RwLock<HashMap<(String, MarketType), SubscriptionEntry>>,
}

impl SubscriptionTable {
    fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    fn insert(&self, symbol: String, market_type: MarketType, channels: Vec<String>, handler: Handler) {
        self.entries.write().unwrap().insert((symbol, market_type), SubscriptionEntry { channels, handler });
    }

    fn remove(&self, symbol: &str, market_type: MarketType) {
        self.entries.write().unwrap().remove(&(symbol.to_string(), market_type));
    }

    /// Snapshot of every channel currently registered, replayed as SUBSCRIBE frames.
    fn all_channels(&self) -> Vec<String> {
        self.entries.read().unwrap().values().flat_map(|e| e.channels.clone()).collect()
    }

    fn handler_for(&self, symbol: &str) -> Option<Handler> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .find(|((sym, _), _)| sym == symbol)
            .map(|(_, entry)| Arc::clone(&entry.handler))
    }
}

enum Command {
    Subscribe { symbol: String, market_type: MarketType, channels: Vec<String>, handler: Handler },
    Unsubscribe { symbol: String, market_type: MarketType },
}

/// A long-lived duplex connection to the exchange's stream endpoint, shared by
/// every subscription (§3: "Stream connection is shared by all subscriptions for
/// one exchange; it is owned by C2").
pub struct StreamClient {
    url: String,
    table: Arc<SubscriptionTable>,
    command_tx: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<ConnectionState>>,
    warned_unknown: AtomicBool,
}

impl StreamClient {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        let table = Arc::new(SubscriptionTable::new());
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let client = Arc::new(Self {
            url: url.into(),
            table: Arc::clone(&table),
            command_tx,
            state: Arc::clone(&state),
            warned_unknown: AtomicBool::new(false),
        });

        let run_client = Arc::clone(&client);
        tokio::spawn(async move { run_client.run(command_rx).await });

        client
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn subscribe(&self, symbol: &str, market_type: MarketType, channels: Vec<String>, handler: Handler) {
        let _ = self.command_tx.send(Command::Subscribe {
            symbol: symbol.to_string(),
            market_type,
            channels,
            handler,
        });
    }

    pub fn unsubscribe(&self, symbol: &str, market_type: MarketType) {
        let _ = self.command_tx.send(Command::Unsubscribe { symbol: symbol.to_string(), market_type });
    }

    async fn run(self: Arc<Self>, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        let mut attempt = 0u32;

        loop {
            *self.state.write().unwrap() = ConnectionState::Connecting;
            let connect_result =
                tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(&self.url)).await;

            let ws_stream = match connect_result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "stream handshake failed");
                    if !self.reconnect_or_give_up(&mut attempt).await {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    tracing::warn!("stream handshake timed out after {:?}", HANDSHAKE_TIMEOUT);
                    if !self.reconnect_or_give_up(&mut attempt).await {
                        return;
                    }
                    continue;
                }
            };

            attempt = 0;
            *self.state.write().unwrap() = ConnectionState::Connected;
            tracing::info!("stream connected");

            let (mut write, mut read) = ws_stream.split();

            for channel in self.table.all_channels() {
                let frame = serde_json::json!({
                    "method": "SUBSCRIBE",
                    "params": [channel],
                    "id": 1,
                });
                if write.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }

            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = keepalive.tick() => {
                        if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                            tracing::warn!("keepalive ping failed, reconnecting");
                            break;
                        }
                    }
                    cmd = command_rx.recv() => {
                        match cmd {
                            Some(Command::Subscribe { symbol, market_type, channels, handler }) => {
                                self.table.insert(symbol, market_type, channels.clone(), handler);
                                for channel in channels {
                                    let frame = serde_json::json!({"method": "SUBSCRIBE", "params": [channel], "id": 1});
                                    let _ = write.send(Message::Text(frame.to_string().into())).await;
                                }
                            }
                            Some(Command::Unsubscribe { symbol, market_type }) => {
                                self.table.remove(&symbol, market_type);
                                let frame = serde_json::json!({"method": "UNSUBSCRIBE", "params": [], "id": 1});
                                let _ = write.send(Message::Text(frame.to_string().into())).await;
                            }
                            None => {
                                *self.state.write().unwrap() = ConnectionState::Closing;
                                let _ = write.send(Message::Close(None)).await;
                                *self.state.write().unwrap() = ConnectionState::Closed;
                                return;
                            }
                        }
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => self.dispatch(&text),
                            Some(Ok(Message::Ping(payload))) => { let _ = write.send(Message::Pong(payload)).await; }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::warn!("stream closed by peer, reconnecting");
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "stream read error, reconnecting");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }

            *self.state.write().unwrap() = ConnectionState::Reconnecting;
            if !self.reconnect_or_give_up(&mut attempt).await {
                return;
            }
        }
    }

    async fn reconnect_or_give_up(&self, attempt: &mut u32) -> bool {
        if *attempt >= MAX_RECONNECT_ATTEMPTS {
            tracing::error!("exhausted {} reconnect attempts, giving up", MAX_RECONNECT_ATTEMPTS);
            *self.state.write().unwrap() = ConnectionState::Disconnected;
            return false;
        }
        *attempt += 1;
        tokio::time::sleep(RECONNECT_DELAY).await;
        true
    }

    /// Decodes one text frame and dispatches it to the handler registered for its
    /// symbol. Unknown discriminators are logged once then dropped (§4.2).
    fn dispatch(&self, text: &str) {
        let raw: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "failed to parse stream frame as JSON");
                return;
            }
        };

        let event_type = raw.get("e").and_then(Value::as_str).unwrap_or_default();
        let symbol = raw.get("s").and_then(Value::as_str).unwrap_or_default().to_string();

        let event = match decode_event(event_type, &raw) {
            Ok(Some(e)) => e,
            Ok(None) => {
                if !self.warned_unknown.swap(true, Ordering::Relaxed) {
                    tracing::warn!(event_type, "dropping frame with unknown event type");
                }
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to decode stream frame");
                return;
            }
        };

        if let Some(handler) = self.table.handler_for(&symbol) {
            handler(event);
        }
    }
}

fn decode_event(event_type: &str, raw: &Value) -> Result<Option<StreamEvent>, IngestError> {
    match event_type {
        "depthUpdate" => Ok(Some(StreamEvent::OrderBook(decode_order_book(raw)?))),
        "trade" => Ok(Some(StreamEvent::Trade(decode_trade(raw)?))),
        "kline" => Ok(Some(decode_kline(raw)?)),
        "24hrTicker" => Ok(Some(decode_ticker(raw)?)),
        "markPriceUpdate" => Ok(Some(decode_funding(raw)?)),
        _ => Ok(None),
    }
}

fn field_str<'a>(raw: &'a Value, key: &str) -> Result<&'a str, IngestError> {
    raw.get(key).and_then(Value::as_str).ok_or_else(|| IngestError::DecodeFailed(format!("missing field {key}")))
}

fn field_i64(raw: &Value, key: &str) -> Result<i64, IngestError> {
    raw.get(key).and_then(Value::as_i64).ok_or_else(|| IngestError::DecodeFailed(format!("missing field {key}")))
}

fn parse_f64(s: &str) -> Result<f64, IngestError> {
    s.parse().map_err(|_| IngestError::DecodeFailed(format!("not a float: {s}")))
}

fn decode_order_book(raw: &Value) -> Result<OrderBookSnapshot, IngestError> {
    #[derive(Deserialize)]
    struct Level(String, String);

    let symbol = field_str(raw, "s")?.to_string();
    let bids: Vec<Level> = serde_json::from_value(raw.get("b").cloned().unwrap_or_default())
        .map_err(|e| IngestError::DecodeFailed(e.to_string()))?;
    let asks: Vec<Level> = serde_json::from_value(raw.get("a").cloned().unwrap_or_default())
        .map_err(|e| IngestError::DecodeFailed(e.to_string()))?;

    let to_levels = |levels: Vec<Level>| -> Result<Vec<PriceLevel>, IngestError> {
        levels
            .into_iter()
            .map(|Level(p, q)| Ok(PriceLevel { price: parse_f64(&p)?, quantity: parse_f64(&q)? }))
            .collect()
    };

    Ok(OrderBookSnapshot {
        symbol,
        updated_at: field_i64(raw, "E").unwrap_or(0),
        bids: to_levels(bids)?,
        asks: to_levels(asks)?,
    })
}

fn decode_trade(raw: &Value) -> Result<Trade, IngestError> {
    Ok(Trade {
        id: field_i64(raw, "t")? as u64,
        symbol: field_str(raw, "s")?.to_string(),
        price: parse_f64(field_str(raw, "p")?)?,
        quantity: parse_f64(field_str(raw, "q")?)?,
        side: if raw.get("m").and_then(Value::as_bool).unwrap_or(false) { Side::Sell } else { Side::Buy },
        timestamp: field_i64(raw, "T")?,
    })
}

fn decode_kline(raw: &Value) -> Result<StreamEvent, IngestError> {
    let k = raw.get("k").ok_or_else(|| IngestError::DecodeFailed("missing k field".into()))?;
    Ok(StreamEvent::Kline {
        symbol: field_str(raw, "s")?.to_string(),
        interval: field_str(k, "i")?.to_string(),
        candle_open: parse_f64(field_str(k, "o")?)?,
        candle_high: parse_f64(field_str(k, "h")?)?,
        candle_low: parse_f64(field_str(k, "l")?)?,
        candle_close: parse_f64(field_str(k, "c")?)?,
        candle_volume: parse_f64(field_str(k, "v")?)?,
        is_closed: k.get("x").and_then(Value::as_bool).unwrap_or(false),
        open_time: field_i64(k, "t")?,
    })
}

fn decode_ticker(raw: &Value) -> Result<StreamEvent, IngestError> {
    Ok(StreamEvent::Ticker {
        symbol: field_str(raw, "s")?.to_string(),
        price: parse_f64(field_str(raw, "c")?)?,
    })
}

/// Funding rate is treated as an independent channel type rather than reusing
/// the depth handler (open question #2 in spec.md, resolved in DESIGN.md).
fn decode_funding(raw: &Value) -> Result<StreamEvent, IngestError> {
    Ok(StreamEvent::FundingRate(FundingRate {
        symbol: field_str(raw, "s")?.to_string(),
        rate: parse_f64(field_str(raw, "r")?)?,
        next_rate: None,
        next_time: field_i64(raw, "T")?,
        last_updated: field_i64(raw, "E")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_type_decodes_to_none() {
        let raw = serde_json::json!({"e": "somethingNew", "s": "BTCUSDT"});
        assert!(decode_event("somethingNew", &raw).unwrap().is_none());
    }

    #[test]
    fn decode_trade_maps_maker_flag_to_side() {
        let raw = serde_json::json!({"t": 1, "s": "BTCUSDT", "p": "100.0", "q": "1.0", "m": true, "T": 123});
        let trade = decode_trade(&raw).unwrap();
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.price, 100.0);
    }

    #[test]
    fn decode_kline_reads_nested_k_object() {
        let raw = serde_json::json!({
            "e": "kline", "s": "BTCUSDT",
            "k": {"i": "1m", "o": "100", "h": "101", "l": "99", "c": "100.5", "v": "10", "x": true, "t": 60000}
        });
        let event = decode_event("kline", &raw).unwrap().unwrap();
        match event {
            StreamEvent::Kline { is_closed, open_time, .. } => {
                assert!(is_closed);
                assert_eq!(open_time, 60000);
            }
            _ => panic!("expected Kline"),
        }
    }
}
