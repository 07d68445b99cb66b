//! Signed REST client for the venue's authenticated API.
//!
//! Every private call acquires a nonce ticket immediately before signing,
//! canonicalizes `nonce` plus the form body, and signs the result with
//! HMAC-SHA256 over the base64-decoded API secret. Venue "invalid nonce"
//! rejections trigger a sequence repair via
//! [`NonceSequencer::advance_past_replay_window`].

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use futures_util::future::BoxFuture;
use hmac::{Hmac, Mac};
use keel_core::{
    AccountBalance, DataSource, MarketTick, OrderRequest, OrderSide, OrderType, Price, Size,
};
use keel_nonce::{NonceSequencer, SystemClock};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use keel_ws::{SessionToken, SessionTokenProvider, WsError, WsResult};

type HmacSha256 = Hmac<Sha256>;

/// REST client configuration.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// API base URL, no trailing slash.
    pub base_url: String,
    /// API key, sent in the `API-Key` header.
    pub api_key: String,
    /// Base64-encoded API secret.
    pub api_secret: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Minimum spacing between private calls (rate-limit budget).
    pub min_call_interval: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            request_timeout: Duration::from_secs(10),
            min_call_interval: Duration::from_millis(200),
        }
    }
}

/// Venue response envelope: errors as a list of code strings, payload
/// under `result`.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct WireRestBalance {
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
struct WireRestTicker {
    symbol: String,
    bid: String,
    ask: String,
    last: String,
}

#[derive(Debug, Deserialize)]
struct WireOrderAck {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct WireSessionToken {
    token: String,
    lifetime_secs: i64,
}

/// Signed REST client. Cheap to clone behind an `Arc`.
pub struct RestClient {
    config: RestConfig,
    http: reqwest::Client,
    nonces: Arc<NonceSequencer<SystemClock>>,
    /// Instant of the last private call, for rate-limit spacing.
    last_call: Mutex<Option<Instant>>,
}

impl RestClient {
    pub fn new(config: RestConfig, nonces: Arc<NonceSequencer<SystemClock>>) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            nonces,
            last_call: Mutex::new(None),
        })
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    /// Fetch all account balances. Records are stamped `Poll`.
    pub async fn get_balances(&self) -> SyncResult<Vec<AccountBalance>> {
        let raw: HashMap<String, WireRestBalance> =
            self.private_post("/private/balances", &[]).await?;

        raw.into_iter()
            .map(|(asset, w)| {
                Ok(AccountBalance::new(
                    asset,
                    parse_size(&w.free, "free")?,
                    parse_size(&w.locked, "locked")?,
                    DataSource::Poll,
                ))
            })
            .collect()
    }

    /// Fetch a ticker over REST (fallback path when the stream is stale).
    pub async fn get_ticker(&self, symbol: &str) -> SyncResult<MarketTick> {
        let url = format!("{}/public/ticker?symbol={symbol}", self.config.base_url);
        let resp: ApiResponse<WireRestTicker> =
            self.http.get(&url).send().await?.json().await?;
        let wire = self.unwrap_result(resp)?;

        Ok(MarketTick::new(
            wire.symbol,
            parse_price(&wire.bid, "bid")?,
            parse_price(&wire.ask, "ask")?,
            parse_price(&wire.last, "last")?,
            DataSource::Poll,
        ))
    }

    /// Place an order; returns the venue order id.
    pub async fn place_order(&self, order: &OrderRequest) -> SyncResult<String> {
        let side = match order.side {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        };
        let order_type = match order.order_type {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        };

        let mut params = vec![
            ("client_id".to_string(), order.id.as_str().to_string()),
            ("symbol".to_string(), order.symbol.clone()),
            ("side".to_string(), side.to_string()),
            ("ordertype".to_string(), order_type.to_string()),
            ("volume".to_string(), order.size.inner().to_string()),
        ];
        if order.reduce_only {
            params.push(("reduce_only".to_string(), "true".to_string()));
        }

        let ack: WireOrderAck = self.private_post("/private/order", &params).await?;
        debug!(order_id = %ack.order_id, client_id = %order.id, "order accepted by venue");
        Ok(ack.order_id)
    }

    /// Cancel a resting order by venue order id.
    pub async fn cancel_order(&self, order_id: &str) -> SyncResult<()> {
        let params = vec![("order_id".to_string(), order_id.to_string())];
        let _: serde_json::Value = self.private_post("/private/cancel", &params).await?;
        Ok(())
    }

    /// Fetch a streaming session token for private channel auth.
    pub async fn get_session_token(&self) -> SyncResult<SessionToken> {
        let wire: WireSessionToken = self.private_post("/private/ws_token", &[]).await?;
        Ok(SessionToken::new(wire.token, wire.lifetime_secs))
    }

    // ========================================================================
    // Signed transport
    // ========================================================================

    async fn private_post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> SyncResult<T> {
        self.respect_rate_budget().await;

        // Nonce acquired immediately before signing; never reordered
        // relative to other signed calls on this client.
        let ticket = self.nonces.acquire();
        let body = canonical_body(ticket.value, params);
        let signature = self.sign(path, &body)?;

        let url = format!("{}{path}", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .header("API-Key", &self.config.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout
                } else {
                    SyncError::Http(e)
                }
            })?;

        if response.status().as_u16() == 429 {
            return Err(SyncError::RateLimited);
        }

        let envelope: ApiResponse<T> = response.json().await?;
        self.unwrap_result(envelope)
    }

    fn unwrap_result<T>(&self, resp: ApiResponse<T>) -> SyncResult<T> {
        if let Some(code) = resp.error.first() {
            if code.contains("Invalid nonce") {
                // The venue saw a nonce at or below its high-water mark.
                // Jump the sequence past the replay window so the retry
                // lands above it.
                let repaired = self.nonces.advance_past_replay_window();
                warn!(repaired_to = repaired, "venue rejected nonce, sequence advanced");
                return Err(SyncError::InvalidNonce);
            }
            if code.contains("Rate limit") {
                return Err(SyncError::RateLimited);
            }
            return Err(SyncError::Api {
                code: code.clone(),
                message: resp.error.join("; "),
            });
        }
        resp.result
            .ok_or_else(|| SyncError::MissingField("result".to_string()))
    }

    /// HMAC-SHA256 over `path + body`, keyed with the decoded secret.
    fn sign(&self, path: &str, body: &str) -> SyncResult<String> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(&self.config.api_secret)
            .map_err(|e| SyncError::Signing(format!("secret decode: {e}")))?;

        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| SyncError::Signing(e.to_string()))?;
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Space private calls at least `min_call_interval` apart.
    async fn respect_rate_budget(&self) {
        let wait = {
            let mut last = self.last_call.lock();
            let now = Instant::now();
            let wait = last
                .map(|t| {
                    self.config
                        .min_call_interval
                        .saturating_sub(now.duration_since(t))
                })
                .unwrap_or(Duration::ZERO);
            *last = Some(now + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// `nonce=N&k1=v1&...` with the nonce always first.
fn canonical_body(nonce: u64, params: &[(String, String)]) -> String {
    let mut body = format!("nonce={nonce}");
    for (k, v) in params {
        body.push('&');
        body.push_str(k);
        body.push('=');
        body.push_str(v);
    }
    body
}

fn parse_price(s: &str, field: &str) -> SyncResult<Price> {
    Price::from_str(s).map_err(|e| SyncError::MissingField(format!("{field} '{s}': {e}")))
}

fn parse_size(s: &str, field: &str) -> SyncResult<Size> {
    Size::from_str(s).map_err(|e| SyncError::MissingField(format!("{field} '{s}': {e}")))
}

impl SessionTokenProvider for RestClient {
    fn fetch_token(&self) -> BoxFuture<'_, WsResult<SessionToken>> {
        Box::pin(async move {
            self.get_session_token()
                .await
                .map_err(|e| WsError::AuthFailed(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_nonce::MemoryCheckpointStore;

    fn client() -> RestClient {
        let nonces = Arc::new(
            NonceSequencer::with_system_clock(Box::new(MemoryCheckpointStore::new())).unwrap(),
        );
        RestClient::new(
            RestConfig {
                base_url: "https://api.example.test".to_string(),
                api_key: "key".to_string(),
                api_secret: base64::engine::general_purpose::STANDARD.encode(b"secret"),
                ..Default::default()
            },
            nonces,
        )
        .unwrap()
    }

    #[test]
    fn test_canonical_body_nonce_first() {
        let body = canonical_body(
            42,
            &[
                ("symbol".to_string(), "BTC/USD".to_string()),
                ("side".to_string(), "buy".to_string()),
            ],
        );
        assert_eq!(body, "nonce=42&symbol=BTC/USD&side=buy");
    }

    #[test]
    fn test_canonical_body_no_params() {
        assert_eq!(canonical_body(7, &[]), "nonce=7");
    }

    #[test]
    fn test_sign_deterministic() {
        let c = client();
        let a = c.sign("/private/order", "nonce=1&symbol=BTC/USD").unwrap();
        let b = c.sign("/private/order", "nonce=1&symbol=BTC/USD").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA-256 output

        // Different nonce yields a different signature.
        let d = c.sign("/private/order", "nonce=2&symbol=BTC/USD").unwrap();
        assert_ne!(a, d);
    }

    #[test]
    fn test_sign_rejects_bad_secret() {
        let nonces = Arc::new(
            NonceSequencer::with_system_clock(Box::new(MemoryCheckpointStore::new())).unwrap(),
        );
        let c = RestClient::new(
            RestConfig {
                api_secret: "not base64 !!!".to_string(),
                ..Default::default()
            },
            nonces,
        )
        .unwrap();
        assert!(c.sign("/x", "nonce=1").is_err());
    }

    #[test]
    fn test_invalid_nonce_advances_sequence() {
        let c = client();
        let before = c.nonces.acquire().value;

        let resp: ApiResponse<serde_json::Value> = ApiResponse {
            error: vec!["EAPI:Invalid nonce".to_string()],
            result: None,
        };
        let err = c.unwrap_result(resp).unwrap_err();
        assert!(matches!(err, SyncError::InvalidNonce));

        // Sequence jumped past the replay window.
        let after = c.nonces.acquire().value;
        assert!(after > before + 30_000);
    }

    #[test]
    fn test_api_error_surfaced() {
        let c = client();
        let resp: ApiResponse<serde_json::Value> = ApiResponse {
            error: vec!["EGeneral:Permission denied".to_string()],
            result: None,
        };
        assert!(matches!(
            c.unwrap_result(resp).unwrap_err(),
            SyncError::Api { .. }
        ));
    }
}
