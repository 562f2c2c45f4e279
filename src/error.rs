//! Crate-wide tagged error kinds.
//!
//! Every fallible boundary in this crate returns `IngestError` rather than a bare
//! string so that retry loops, reconnect policies, and the facade's drop-counters
//! can dispatch on the kind instead of matching message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("authentication rejected: {0}")]
    AuthInvalid(String),

    #[error("request signature invalid")]
    SignatureInvalid,

    #[error("server clock drift exceeds tolerance: {0}ms")]
    TimestampDrift(i64),

    #[error("rate limited on endpoint {endpoint}, retry after {retry_after_ms}ms")]
    RateLimited { endpoint: String, retry_after_ms: u64 },

    #[error("transient network error: {0}")]
    NetworkTransient(String),

    #[error("exchange server error (HTTP {status}): {body}")]
    ExchangeServerError { status: u16, body: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unknown symbol: {0}")]
    SymbolNotFound(String),

    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),

    #[error("failed to decode payload: {0}")]
    DecodeFailed(String),

    #[error("message rejected by quality monitor: {0}")]
    QualityRejected(String),

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("backlog full, dropping message for {0}")]
    BacklogFull(String),

    #[error("backfill range predates max_backfill_days window")]
    BackfillOutOfRange,

    #[error("backfill exhausted retries at {completeness:.1}% completeness, below the {threshold:.1}% threshold")]
    BackfillIncomplete { completeness: f64, threshold: f64 },

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("operation cancelled")]
    Cancelled,
}

impl IngestError {
    /// Whether C1's retry loop (§4.1) should retry a call that failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::NetworkTransient(_)
                | IngestError::RateLimited { .. }
                | IngestError::TimestampDrift(_)
                | IngestError::ExchangeServerError { .. }
        )
    }
}
