//! Process configuration, loaded once at startup from the environment.
//!
//! `.env` is loaded first via `dotenvy` if present, then every value is read from
//! `std::env`. Nothing in this crate re-reads the environment after `Config::load`.

use crate::error::IngestError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub testnet: bool,
    pub db_path: String,
    pub worker_pool_size: usize,
    pub watcher_check_interval: Duration,
    pub quality_sweep_interval: Duration,
    pub auto_backfill: AutoBackfillConfig,
}

/// §3 AutoBackfillConfig. Process-wide, shared under a lock so the watcher and
/// manager observe edits made at runtime (e.g. by an admin endpoint outside the core).
#[derive(Debug, Clone)]
pub struct AutoBackfillConfig {
    pub enabled: bool,
    pub min_completeness_percent: f64,
    pub max_backfill_days: i64,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for AutoBackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_completeness_percent: 80.0,
            max_backfill_days: 90,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Loads configuration from the environment. Call once at process start.
    pub fn load() -> Result<Self, IngestError> {
        let _ = dotenvy::dotenv();

        let testnet = env_flag("EXCHANGE_TESTNET", false);
        let db_path = std::env::var("MARKET_DATA_DB_PATH").unwrap_or_else(|_| "market_data.db".to_string());

        let worker_pool_size = env_parsed("INGESTOR_WORKER_POOL_SIZE", 10usize)?;
        let watcher_check_interval =
            Duration::from_secs(env_parsed("WATCHER_CHECK_INTERVAL_SECS", 3600u64)?);
        let quality_sweep_interval =
            Duration::from_secs(env_parsed("QUALITY_SWEEP_INTERVAL_SECS", 60u64)?);

        let auto_backfill = AutoBackfillConfig {
            enabled: env_flag("AUTO_BACKFILL_ENABLED", true),
            min_completeness_percent: env_parsed("AUTO_BACKFILL_MIN_COMPLETENESS_PERCENT", 80.0f64)?,
            max_backfill_days: env_parsed("AUTO_BACKFILL_MAX_DAYS", 90i64)?,
            retry_attempts: env_parsed("AUTO_BACKFILL_RETRY_ATTEMPTS", 3u32)?,
            retry_delay: Duration::from_secs(env_parsed("AUTO_BACKFILL_RETRY_DELAY_SECS", 5u64)?),
        };

        Ok(Self {
            api_key: std::env::var("EXCHANGE_API_KEY").ok(),
            api_secret: std::env::var("EXCHANGE_API_SECRET").ok(),
            testnet,
            db_path,
            worker_pool_size,
            watcher_check_interval,
            quality_sweep_interval,
            auto_backfill,
        })
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, IngestError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| IngestError::ConfigInvalid(format!("{key} is not a valid value: {v}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_auto_backfill_matches_spec_defaults() {
        let cfg = AutoBackfillConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.min_completeness_percent, 80.0);
        assert_eq!(cfg.max_backfill_days, 90);
        assert_eq!(cfg.retry_attempts, 3);
        assert_eq!(cfg.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn env_flag_falls_back_to_default_when_unset() {
        assert!(env_flag("MDP_TEST_NONEXISTENT_FLAG_XYZ", true));
        assert!(!env_flag("MDP_TEST_NONEXISTENT_FLAG_XYZ", false));
    }
}
