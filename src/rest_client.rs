//! Exchange REST client (C1, §4.1).
//!
//! Signed and unsigned HTTPS calls against the exchange's `/fapi/v1` (futures) or
//! `/api/v3` (spot) surface, fronted by a per-endpoint `RateLimiter` and a bounded
//! retry loop that classifies failures via `IngestError::is_retryable`.

use crate::config::Config;
use crate::error::IngestError;
use crate::model::{Candle, FundingRate, Interval, OrderBookSnapshot, PriceLevel};
use crate::rate_limiter::RateLimiter;
use hmac::{Hmac, Mac};
use moka::future::Cache;
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAINNET_HOST: &str = "https://fapi.binance.com";
const TESTNET_HOST: &str = "https://testnet.binancefuture.com";

/// Funding settles every 8h on Binance futures; a fresh rate is pointless to
/// re-fetch more often than that window, so reads are cached for it.
const FUNDING_RATE_TTL: Duration = Duration::from_secs(8 * 60 * 60);

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    rate_limiter: RateLimiter,
    retry_attempts: u32,
    funding_rate_cache: Cache<String, FundingRate>,
}

#[derive(Debug, Deserialize)]
struct ExchangeErrorBody {
    code: i64,
    msg: String,
}

/// The exchange returns each kline as a 12-element JSON array; only the first
/// seven fields (open time .. close time) matter to this crate's Candle model.
type RawKline = Vec<serde_json::Value>;

fn kline_field_str(raw: &RawKline, idx: usize) -> Result<String, IngestError> {
    raw.get(idx)
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_f64().map(|f| f.to_string())))
        .ok_or_else(|| IngestError::DecodeFailed(format!("kline field {idx} missing or wrong type")))
}

fn kline_field_i64(raw: &RawKline, idx: usize) -> Result<i64, IngestError> {
    raw.get(idx)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| IngestError::DecodeFailed(format!("kline field {idx} missing or wrong type")))
}

impl RestClient {
    pub fn new(config: &Config) -> Result<Self, IngestError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IngestError::ConfigInvalid(e.to_string()))?;

        Ok(Self {
            http,
            base_url: if config.testnet { TESTNET_HOST.to_string() } else { MAINNET_HOST.to_string() },
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            rate_limiter: RateLimiter::new(),
            retry_attempts: 3,
            funding_rate_cache: Cache::builder().time_to_live(FUNDING_RATE_TTL).build(),
        })
    }

    fn sign(&self, query: &str) -> Result<String, IngestError> {
        let secret = self
            .api_secret
            .as_ref()
            .ok_or_else(|| IngestError::AuthInvalid("no API secret configured".into()))?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| IngestError::SignatureInvalid)?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn now_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }

    async fn get_unsigned<T: serde::de::DeserializeOwned>(
        &self,
        endpoint_class: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, IngestError> {
        self.with_retry(endpoint_class, || async {
            self.rate_limiter.acquire(endpoint_class).await;
            let url = format!("{}{}", self.base_url, path);
            let resp = self
                .http
                .get(&url)
                .query(query)
                .send()
                .await
                .map_err(classify_transport_error)?;
            Self::decode(resp).await
        })
        .await
    }

    async fn get_signed<T: serde::de::DeserializeOwned>(
        &self,
        endpoint_class: &str,
        path: &str,
        query: Vec<(&str, String)>,
    ) -> Result<T, IngestError> {
        self.with_retry(endpoint_class, || {
            let mut query = query.clone();
            async move {
                self.rate_limiter.acquire(endpoint_class).await;
                query.push(("timestamp", Self::now_ms().to_string()));
                let canonical = canonical_query(&query);
                let signature = self.sign(&canonical)?;
                let url = format!("{}{}?{}&signature={}", self.base_url, path, canonical, signature);

                let api_key = self
                    .api_key
                    .as_ref()
                    .ok_or_else(|| IngestError::AuthInvalid("no API key configured".into()))?;

                let resp = self
                    .http
                    .get(&url)
                    .header("X-MBX-APIKEY", api_key)
                    .send()
                    .await
                    .map_err(classify_transport_error)?;
                Self::decode(resp).await
            }
        })
        .await
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, IngestError> {
        let status = resp.status();
        let body = resp.text().await.map_err(classify_transport_error)?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| IngestError::DecodeFailed(e.to_string()))
        } else if let Ok(err) = serde_json::from_str::<ExchangeErrorBody>(&body) {
            Err(classify_exchange_error(status.as_u16(), err.code, err.msg))
        } else if status.is_server_error() {
            Err(IngestError::ExchangeServerError { status: status.as_u16(), body })
        } else {
            Err(IngestError::ParameterInvalid(body))
        }
    }

    /// Retries up to `self.retry_attempts` times for retryable kinds, backing off
    /// per `RateLimiter::backoff_delay`. Non-retryable kinds surface immediately.
    async fn with_retry<T, F, Fut>(&self, endpoint_class: &str, call: F) -> Result<T, IngestError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, IngestError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.retry_attempts => {
                    let is_rate_limit = matches!(e, IngestError::RateLimited { .. });
                    tracing::warn!(endpoint = endpoint_class, attempt, error = %e, "retrying request");
                    tokio::time::sleep(RateLimiter::backoff_delay(attempt, is_rate_limit)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start: Option<i64>,
        end: Option<i64>,
        limit: u16,
    ) -> Result<Vec<Candle>, IngestError> {
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(s) = start {
            query.push(("startTime", s.to_string()));
        }
        if let Some(e) = end {
            query.push(("endTime", e.to_string()));
        }

        let raw: Vec<RawKline> = self.get_unsigned("ticker-price", "/fapi/v1/klines", &query).await?;

        raw.into_iter()
            .map(|k| {
                Ok(Candle {
                    symbol: symbol.to_string(),
                    interval,
                    open_time: kline_field_i64(&k, 0)?,
                    close_time: kline_field_i64(&k, 6)?,
                    open: parse_f64(&kline_field_str(&k, 1)?)?,
                    high: parse_f64(&kline_field_str(&k, 2)?)?,
                    low: parse_f64(&kline_field_str(&k, 3)?)?,
                    close: parse_f64(&kline_field_str(&k, 4)?)?,
                    volume: parse_f64(&kline_field_str(&k, 5)?)?,
                    complete: true,
                })
            })
            .collect()
    }

    pub async fn get_trades(&self, symbol: &str, limit: u16) -> Result<Vec<serde_json::Value>, IngestError> {
        self.get_unsigned(
            "ticker-price",
            "/fapi/v1/trades",
            &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    pub async fn get_order_book(&self, symbol: &str, depth: u16) -> Result<OrderBookSnapshot, IngestError> {
        #[derive(Deserialize)]
        struct RawDepth {
            #[serde(rename = "lastUpdateId")]
            #[allow(dead_code)]
            last_update_id: i64,
            bids: Vec<(String, String)>,
            asks: Vec<(String, String)>,
        }

        let raw: RawDepth = self
            .get_unsigned(
                "ticker-price",
                "/fapi/v1/depth",
                &[("symbol", symbol.to_string()), ("limit", depth.to_string())],
            )
            .await?;

        let to_levels = |raw: Vec<(String, String)>| -> Result<Vec<PriceLevel>, IngestError> {
            raw.into_iter()
                .map(|(p, q)| Ok(PriceLevel { price: parse_f64(&p)?, quantity: parse_f64(&q)? }))
                .collect()
        };

        Ok(OrderBookSnapshot {
            symbol: symbol.to_string(),
            updated_at: Self::now_ms(),
            bids: to_levels(raw.bids)?,
            asks: to_levels(raw.asks)?,
        })
    }

    /// Cached for `FUNDING_RATE_TTL` (one funding period) since the exchange settles
    /// funding only every 8h — repeated callers within that window never hit the wire.
    pub async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate, IngestError> {
        if let Some(cached) = self.funding_rate_cache.get(symbol).await {
            return Ok(cached);
        }

        #[derive(Deserialize)]
        struct RawFunding {
            symbol: String,
            #[serde(rename = "lastFundingRate")]
            last_funding_rate: String,
            #[serde(rename = "nextFundingTime")]
            next_funding_time: i64,
            time: i64,
        }

        let raw: RawFunding = self
            .get_unsigned(
                "ticker-price",
                "/fapi/v1/premiumIndex",
                &[("symbol", symbol.to_string())],
            )
            .await?;

        let rate = FundingRate {
            symbol: raw.symbol,
            rate: parse_f64(&raw.last_funding_rate)?,
            next_rate: None,
            next_time: raw.next_funding_time,
            last_updated: raw.time,
        };
        self.funding_rate_cache.insert(symbol.to_string(), rate.clone()).await;
        Ok(rate)
    }

    pub async fn get_open_interest(&self, symbol: &str) -> Result<f64, IngestError> {
        #[derive(Deserialize)]
        struct RawOpenInterest {
            #[serde(rename = "openInterest")]
            open_interest: String,
        }
        let raw: RawOpenInterest = self
            .get_unsigned("ticker-price", "/fapi/v1/openInterest", &[("symbol", symbol.to_string())])
            .await?;
        parse_f64(&raw.open_interest)
    }

    pub async fn get_server_time(&self) -> Result<i64, IngestError> {
        #[derive(Deserialize)]
        struct RawTime {
            #[serde(rename = "serverTime")]
            server_time: i64,
        }
        let raw: RawTime = self.get_unsigned("ticker-price", "/fapi/v1/time", &[]).await?;
        Ok(raw.server_time)
    }

    // Account-scoped calls. Used only outside the core (e.g. by the execution
    // collaborator); business semantics of orders are explicitly out of scope (§1).

    pub async fn get_position_risk(&self, symbol: &str) -> Result<serde_json::Value, IngestError> {
        self.get_signed("positions", "/fapi/v2/positionRisk", vec![("symbol", symbol.to_string())])
            .await
    }

    pub async fn place_order(&self, params: Vec<(&str, String)>) -> Result<serde_json::Value, IngestError> {
        self.get_signed("order", "/fapi/v1/order", params).await
    }

    pub async fn cancel_all_open_orders(&self, symbol: &str) -> Result<serde_json::Value, IngestError> {
        self.get_signed("order", "/fapi/v1/allOpenOrders", vec![("symbol", symbol.to_string())])
            .await
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<serde_json::Value, IngestError> {
        self.get_signed(
            "account",
            "/fapi/v1/leverage",
            vec![("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
        )
        .await
    }

    pub async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<serde_json::Value, IngestError> {
        self.get_signed(
            "account",
            "/fapi/v1/marginType",
            vec![("symbol", symbol.to_string()), ("marginType", margin_type.to_string())],
        )
        .await
    }
}

fn canonical_query(params: &[(&str, String)]) -> String {
    params.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&")
}

fn parse_f64(s: &str) -> Result<f64, IngestError> {
    s.parse().map_err(|_| IngestError::DecodeFailed(format!("not a float: {s}")))
}

fn classify_transport_error(e: reqwest::Error) -> IngestError {
    if e.is_timeout() {
        IngestError::Timeout(REQUEST_TIMEOUT.as_millis() as u64)
    } else {
        IngestError::NetworkTransient(e.to_string())
    }
}

fn classify_exchange_error(status: u16, code: i64, msg: String) -> IngestError {
    match code {
        -1021 => IngestError::TimestampDrift(0),
        -1022 | -2015 => IngestError::SignatureInvalid,
        -2014 => IngestError::AuthInvalid(msg),
        -1003 => IngestError::RateLimited { endpoint: "unknown".into(), retry_after_ms: 1000 },
        -1121 => IngestError::SymbolNotFound(msg),
        -2010 | -2011 => IngestError::PermissionDenied(msg),
        _ if status >= 500 => IngestError::ExchangeServerError { status, body: msg },
        _ => IngestError::ParameterInvalid(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_query_joins_params_in_order() {
        let q = canonical_query(&[("symbol", "BTCUSDT".into()), ("limit", "10".into())]);
        assert_eq!(q, "symbol=BTCUSDT&limit=10");
    }

    #[test]
    fn rate_limit_code_classified_as_retryable() {
        let err = classify_exchange_error(429, -1003, "too many requests".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn signature_error_code_classified_as_non_retryable() {
        let err = classify_exchange_error(400, -1022, "bad signature".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn parse_f64_rejects_garbage() {
        assert!(parse_f64("not-a-number").is_err());
        assert_eq!(parse_f64("1.5").unwrap(), 1.5);
    }

    #[tokio::test]
    async fn funding_rate_cache_returns_inserted_value_without_a_request() {
        let config = Config {
            api_key: None,
            api_secret: None,
            testnet: true,
            db_path: ":memory:".into(),
            worker_pool_size: 10,
            watcher_check_interval: Duration::from_secs(3600),
            quality_sweep_interval: Duration::from_secs(60),
            auto_backfill: crate::config::AutoBackfillConfig::default(),
        };
        let client = RestClient::new(&config).unwrap();
        let rate = FundingRate { symbol: "BTCUSDT".into(), rate: 0.0001, next_rate: None, next_time: 0, last_updated: 0 };
        client.funding_rate_cache.insert("BTCUSDT".to_string(), rate.clone()).await;

        let cached = client.funding_rate_cache.get("BTCUSDT").await.unwrap();
        assert_eq!(cached.rate, rate.rate);
    }
}
