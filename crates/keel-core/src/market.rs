//! Dual-source market and account state records.
//!
//! Every record carries its origin (`Stream` or `Poll`) and timestamp so
//! that the reconciliation routine in keel-sync can choose the
//! authoritative source by freshness.

use crate::{Price, Size};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin of a state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Streaming subscription.
    Stream,
    /// Periodic authenticated poll.
    Poll,
}

impl DataSource {
    /// The other source.
    pub fn other(&self) -> Self {
        match self {
            Self::Stream => Self::Poll,
            Self::Poll => Self::Stream,
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

/// A market price update. Ephemeral, replaced on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    /// Venue symbol.
    pub symbol: String,
    /// Best bid.
    pub bid: Price,
    /// Best ask.
    pub ask: Price,
    /// Last trade price.
    pub last: Price,
    /// Update timestamp.
    pub timestamp: DateTime<Utc>,
    /// Where this tick came from.
    pub source: DataSource,
}

impl MarketTick {
    /// Create a tick stamped now.
    pub fn new(
        symbol: impl Into<String>,
        bid: Price,
        ask: Price,
        last: Price,
        source: DataSource,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            bid,
            ask,
            last,
            timestamp: Utc::now(),
            source,
        }
    }

    /// Mid price: (bid + ask) / 2. None when either side is missing.
    pub fn mid(&self) -> Option<Price> {
        if !self.bid.is_positive() || !self.ask.is_positive() {
            return None;
        }
        Some(Price::new(
            (self.bid.inner() + self.ask.inner()) / rust_decimal::Decimal::TWO,
        ))
    }

    /// Age of this tick in milliseconds.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp).num_milliseconds()
    }

    /// True when older than the given threshold.
    pub fn is_stale(&self, threshold_ms: i64) -> bool {
        self.age_ms() > threshold_ms
    }
}

/// Account balance for one asset.
///
/// One authoritative record per asset; mutated only by the reconciliation
/// routine inside StateSync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Asset code (e.g., "USD", "BTC").
    pub asset: String,
    /// Freely available amount.
    pub free: Size,
    /// Amount locked in open orders.
    pub locked: Size,
    /// Update timestamp.
    pub timestamp: DateTime<Utc>,
    /// Where this record came from.
    pub source: DataSource,
}

impl AccountBalance {
    /// Create a balance record stamped now.
    pub fn new(asset: impl Into<String>, free: Size, locked: Size, source: DataSource) -> Self {
        Self {
            asset: asset.into(),
            free,
            locked,
            timestamp: Utc::now(),
            source,
        }
    }

    /// Total balance (free + locked).
    pub fn total(&self) -> Size {
        self.free + self.locked
    }

    /// Age of this record in milliseconds.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp).num_milliseconds()
    }

    /// True when older than the given threshold.
    pub fn is_stale(&self, threshold_ms: i64) -> bool {
        self.age_ms() > threshold_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tick_mid() {
        let tick = MarketTick::new(
            "BTC/USD",
            Price::new(dec!(100)),
            Price::new(dec!(102)),
            Price::new(dec!(101)),
            DataSource::Stream,
        );
        assert_eq!(tick.mid().unwrap(), Price::new(dec!(101)));
    }

    #[test]
    fn test_tick_mid_missing_side() {
        let tick = MarketTick::new(
            "BTC/USD",
            Price::ZERO,
            Price::new(dec!(102)),
            Price::new(dec!(101)),
            DataSource::Stream,
        );
        assert!(tick.mid().is_none());
    }

    #[test]
    fn test_balance_total() {
        let bal = AccountBalance::new(
            "USD",
            Size::new(dec!(75)),
            Size::new(dec!(25)),
            DataSource::Poll,
        );
        assert_eq!(bal.total(), Size::new(dec!(100)));
    }

    #[test]
    fn test_fresh_record_not_stale() {
        let bal = AccountBalance::new("USD", Size::ZERO, Size::ZERO, DataSource::Stream);
        assert!(!bal.is_stale(5000));
    }

    #[test]
    fn test_source_other() {
        assert_eq!(DataSource::Stream.other(), DataSource::Poll);
        assert_eq!(DataSource::Poll.other(), DataSource::Stream);
    }
}
