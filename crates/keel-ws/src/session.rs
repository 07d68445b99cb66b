//! Session tokens for private channels.
//!
//! Private channels require a short-lived token obtained via a signed
//! request. The token is refreshed proactively at two-thirds of its
//! lifetime so a forced re-authentication gap never interrupts streaming.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::BoxFuture;

use crate::error::WsResult;

/// Minimum refresh lead time before expiry.
const MIN_REFRESH_LEAD_SECS: i64 = 10;

/// A session token for private channel subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    /// Opaque token string.
    pub token: String,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
    /// Venue-reported lifetime in seconds.
    pub lifetime_secs: i64,
}

impl SessionToken {
    /// Create a token issued now.
    pub fn new(token: impl Into<String>, lifetime_secs: i64) -> Self {
        Self {
            token: token.into(),
            issued_at: Utc::now(),
            lifetime_secs,
        }
    }

    /// Expiry instant.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + ChronoDuration::seconds(self.lifetime_secs)
    }

    /// Instant at which a proactive refresh is due: two-thirds of the
    /// lifetime, but never later than `MIN_REFRESH_LEAD_SECS` before expiry.
    pub fn refresh_due_at(&self) -> DateTime<Utc> {
        let two_thirds = self.issued_at + ChronoDuration::seconds(self.lifetime_secs * 2 / 3);
        let latest = self.expires_at() - ChronoDuration::seconds(MIN_REFRESH_LEAD_SECS);
        two_thirds.min(latest)
    }

    /// True once the refresh point has passed.
    pub fn needs_refresh(&self) -> bool {
        Utc::now() >= self.refresh_due_at()
    }

    /// True once the token is no longer usable.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at()
    }
}

/// Source of session tokens, implemented by the signed REST client.
///
/// Held as an optional reference by the connection manager: a connection
/// without a provider simply never subscribes to private channels.
pub trait SessionTokenProvider: Send + Sync {
    /// Fetch a fresh session token from the venue.
    fn fetch_token(&self) -> BoxFuture<'_, WsResult<SessionToken>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_not_due() {
        let token = SessionToken::new("tok", 900);
        assert!(!token.needs_refresh());
        assert!(!token.is_expired());
    }

    #[test]
    fn test_refresh_due_at_two_thirds() {
        let token = SessionToken::new("tok", 900);
        let expected = token.issued_at + ChronoDuration::seconds(600);
        assert_eq!(token.refresh_due_at(), expected);
    }

    #[test]
    fn test_short_lifetime_uses_min_lead() {
        // 15s lifetime: two-thirds would be 10s in, but the minimum lead
        // forces refresh at 5s in (15 - 10).
        let token = SessionToken::new("tok", 15);
        let expected = token.expires_at() - ChronoDuration::seconds(MIN_REFRESH_LEAD_SECS);
        assert_eq!(token.refresh_due_at(), expected);
    }

    #[test]
    fn test_expired_token() {
        let mut token = SessionToken::new("tok", 900);
        token.issued_at = Utc::now() - ChronoDuration::seconds(901);
        assert!(token.is_expired());
        assert!(token.needs_refresh());
    }
}
