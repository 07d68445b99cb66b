//! State-sync error types.

use keel_core::ErrorClass;
use thiserror::Error;

/// Errors from the REST client, caches, and the sync service.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("venue error {code}: {message}")]
    Api { code: String, message: String },

    #[error("invalid nonce rejected by venue")]
    InvalidNonce,

    #[error("rate limited by venue")]
    RateLimited,

    #[error("request timed out")]
    Timeout,

    #[error("signing error: {0}")]
    Signing(String),

    #[error("missing field in venue response: {0}")]
    MissingField(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stream/poll mismatch for {symbol}: {detail}")]
    Mismatch { symbol: String, detail: String },
}

impl SyncError {
    /// Map this error onto the shared retry classification.
    pub fn classify(&self) -> ErrorClass {
        match self {
            // A repaired nonce sequence makes the retry succeed.
            Self::InvalidNonce | Self::RateLimited | Self::Timeout => ErrorClass::Transient,
            Self::Http(e) if e.is_timeout() || e.is_connect() => ErrorClass::Transient,
            Self::Mismatch { .. } => ErrorClass::Consistency,
            Self::Api { code, .. } => classify_api_code(code),
            _ => ErrorClass::Permanent,
        }
    }
}

fn classify_api_code(code: &str) -> ErrorClass {
    match code {
        "EAPI:Rate limit exceeded" | "EService:Unavailable" | "EService:Busy" => {
            ErrorClass::Transient
        }
        _ => ErrorClass::Permanent,
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
