//! Candidate trading signals.
//!
//! Signals are produced by collaborators outside the core (momentum,
//! oversold, volume-spike detectors) and by the position ledger's exit
//! monitor. The pipeline consumes them in one pass: dedup, batch, gate.

use crate::{OrderSide, Size};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a signal was emitted.
///
/// External detectors tag their candidates; `ExitTrigger` is reserved for
/// the ledger's exit path and bypasses the confidence floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    Momentum,
    Oversold,
    VolumeSpike,
    /// Exit of an open position (profit target, stop loss, time stop, ...).
    ExitTrigger,
    /// Forced liquidation requested by the failure governor.
    EmergencyLiquidation,
    /// Anything else a collaborator tags.
    Other,
}

impl fmt::Display for SignalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Momentum => write!(f, "momentum"),
            Self::Oversold => write!(f, "oversold"),
            Self::VolumeSpike => write!(f, "volume_spike"),
            Self::ExitTrigger => write!(f, "exit_trigger"),
            Self::EmergencyLiquidation => write!(f, "emergency_liquidation"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Priority tiers for pipeline ordering. Higher value runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignalPriority {
    Low,
    Normal,
    High,
    /// Exit and liquidation signals. Never queued behind entries.
    Critical,
}

impl SignalPriority {
    /// Numeric score used for order-request priority.
    pub fn score(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 10,
            Self::High => 50,
            Self::Critical => 100,
        }
    }
}

/// A candidate trading decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Venue symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Detector confidence in [0, 1].
    pub confidence: Decimal,
    /// Suggested size.
    pub suggested_size: Size,
    /// Why this signal exists.
    pub reason: SignalReason,
    /// Priority tier.
    pub priority: SignalPriority,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// Create a signal with normal priority.
    pub fn new(
        symbol: impl Into<String>,
        side: OrderSide,
        confidence: Decimal,
        suggested_size: Size,
        reason: SignalReason,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            confidence,
            suggested_size,
            reason,
            priority: SignalPriority::Normal,
            created_at: Utc::now(),
        }
    }

    /// Create an exit signal. Critical priority, sell-side by convention
    /// for long exits; the caller passes the closing side.
    pub fn exit(symbol: impl Into<String>, side: OrderSide, suggested_size: Size) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            confidence: Decimal::ONE,
            suggested_size,
            reason: SignalReason::ExitTrigger,
            priority: SignalPriority::Critical,
            created_at: Utc::now(),
        }
    }

    /// True for signals that bypass the confidence floor (exit paths).
    pub fn bypasses_confidence_floor(&self) -> bool {
        matches!(
            self.reason,
            SignalReason::ExitTrigger | SignalReason::EmergencyLiquidation
        )
    }

    /// Dedup identity of this signal.
    pub fn identity(&self) -> SignalIdentity {
        SignalIdentity {
            symbol: self.symbol.clone(),
            side: self.side,
            reason: self.reason,
            confidence_bucket: Self::confidence_bucket(self.confidence),
        }
    }

    /// Bucket confidence into tenths so near-identical signals collide.
    fn confidence_bucket(confidence: Decimal) -> u8 {
        let bucket = (confidence * Decimal::from(10)).floor();
        bucket.try_into().unwrap_or(0).min(10)
    }

    /// Age of this signal in milliseconds.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds()
    }
}

/// Identity used for deduplication: (symbol, side, reason, confidence bucket).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalIdentity {
    pub symbol: String,
    pub side: OrderSide,
    pub reason: SignalReason,
    pub confidence_bucket: u8,
}

impl fmt::Display for SignalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.symbol, self.side, self.reason, self.confidence_bucket
        )
    }
}
