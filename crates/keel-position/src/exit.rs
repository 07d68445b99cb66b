//! Exit condition evaluation.
//!
//! `evaluate_exit` is a pure first-match check over an open position and
//! the current tick. Conditions are ordered: profit target, stop loss,
//! forced max-hold, flat-and-stale, reallocation of losers.

use chrono::{DateTime, Utc};
use keel_core::{OrderSide, Price};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ledger::Position;

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// The profit target was reached.
    ProfitTarget,
    /// The stop loss was breached.
    StopLoss,
    /// Held past the maximum hold time; forced out regardless of P&L.
    MaxHoldTime,
    /// Went nowhere for too long; capital is better deployed elsewhere.
    FlatAndStale,
    /// Losing and not recovering past the recovery window.
    Reallocation,
    /// Governor-requested liquidation.
    Emergency,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProfitTarget => "profit_target",
            Self::StopLoss => "stop_loss",
            Self::MaxHoldTime => "max_hold_time",
            Self::FlatAndStale => "flat_and_stale",
            Self::Reallocation => "reallocation",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit policy thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Minimum holding time before non-forced exits are considered (ms).
    /// Prevents exits on entry noise.
    #[serde(default = "default_min_hold_ms")]
    pub min_hold_ms: i64,

    /// Forced exit after this hold time regardless of P&L (ms).
    #[serde(default = "default_max_hold_ms")]
    pub max_hold_ms: i64,

    /// P&L band (bps of entry notional) inside which the position counts
    /// as flat.
    #[serde(default = "default_flat_band_bps")]
    pub flat_band_bps: u32,

    /// Hold time after which a flat position is released (ms).
    #[serde(default = "default_flat_after_ms")]
    pub flat_after_ms: i64,

    /// How long a position may stay underwater without recovering before
    /// its capital is reallocated (ms).
    #[serde(default = "default_losing_recovery_ms")]
    pub losing_recovery_ms: i64,
}

fn default_min_hold_ms() -> i64 {
    1_000
}

fn default_max_hold_ms() -> i64 {
    4 * 60 * 60 * 1_000 // 4 hours
}

fn default_flat_band_bps() -> u32 {
    10
}

fn default_flat_after_ms() -> i64 {
    30 * 60 * 1_000 // 30 minutes
}

fn default_losing_recovery_ms() -> i64 {
    15 * 60 * 1_000 // 15 minutes
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            min_hold_ms: default_min_hold_ms(),
            max_hold_ms: default_max_hold_ms(),
            flat_band_bps: default_flat_band_bps(),
            flat_after_ms: default_flat_after_ms(),
            losing_recovery_ms: default_losing_recovery_ms(),
        }
    }
}

/// Evaluate exit conditions for an open position. First match fires.
pub fn evaluate_exit(
    config: &ExitConfig,
    position: &Position,
    price: Price,
    now: DateTime<Utc>,
) -> Option<ExitReason> {
    let hold_ms = position.hold_time_ms(now);

    // Forced exit applies regardless of the min-hold guard.
    if hold_ms >= config.max_hold_ms {
        return Some(ExitReason::MaxHoldTime);
    }
    if hold_ms < config.min_hold_ms {
        return None;
    }

    if target_reached(position, price) {
        return Some(ExitReason::ProfitTarget);
    }
    if stop_breached(position, price) {
        return Some(ExitReason::StopLoss);
    }

    if let Some(pnl_bps) = position.unrealized_pnl_bps(price) {
        if pnl_bps.abs() < Decimal::from(config.flat_band_bps) && hold_ms >= config.flat_after_ms {
            return Some(ExitReason::FlatAndStale);
        }
    }

    if let Some(losing_since) = position.losing_since {
        if (now - losing_since).num_milliseconds() >= config.losing_recovery_ms {
            return Some(ExitReason::Reallocation);
        }
    }

    None
}

fn target_reached(position: &Position, price: Price) -> bool {
    match position.side {
        OrderSide::Buy => price >= position.profit_target,
        OrderSide::Sell => price <= position.profit_target,
    }
}

fn stop_breached(position: &Position, price: Price) -> bool {
    match position.side {
        OrderSide::Buy => price <= position.stop_loss,
        OrderSide::Sell => price >= position.stop_loss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PositionStatus;
    use chrono::Duration;
    use keel_core::Size;
    use rust_decimal_macros::dec;

    fn long_position(entered_ago: Duration) -> Position {
        Position {
            symbol: "BTC/USD".to_string(),
            side: OrderSide::Buy,
            size: Size::new(dec!(1)),
            entry_price: Price::new(dec!(100)),
            entry_time: Utc::now() - entered_ago,
            profit_target: Price::new(dec!(103)),
            stop_loss: Price::new(dec!(98)),
            status: PositionStatus::Open,
            exit_reason: None,
            losing_since: None,
            entry_fees: Price::ZERO,
        }
    }

    #[test]
    fn test_min_hold_suppresses_exits() {
        let config = ExitConfig::default();
        let p = long_position(Duration::milliseconds(100));
        // Target reached but position is seconds old.
        assert_eq!(
            evaluate_exit(&config, &p, Price::new(dec!(105)), Utc::now()),
            None
        );
    }

    #[test]
    fn test_profit_target_long() {
        let config = ExitConfig::default();
        let p = long_position(Duration::seconds(10));
        assert_eq!(
            evaluate_exit(&config, &p, Price::new(dec!(103)), Utc::now()),
            Some(ExitReason::ProfitTarget)
        );
    }

    #[test]
    fn test_stop_loss_long() {
        let config = ExitConfig::default();
        let p = long_position(Duration::seconds(10));
        assert_eq!(
            evaluate_exit(&config, &p, Price::new(dec!(97.5)), Utc::now()),
            Some(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_short_directions_flip() {
        let config = ExitConfig::default();
        let mut p = long_position(Duration::seconds(10));
        p.side = OrderSide::Sell;
        p.profit_target = Price::new(dec!(97));
        p.stop_loss = Price::new(dec!(102));

        assert_eq!(
            evaluate_exit(&config, &p, Price::new(dec!(96)), Utc::now()),
            Some(ExitReason::ProfitTarget)
        );
        assert_eq!(
            evaluate_exit(&config, &p, Price::new(dec!(103)), Utc::now()),
            Some(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_max_hold_forced_even_in_band() {
        let config = ExitConfig::default();
        let p = long_position(Duration::hours(5));
        // Price between stop and target; only the hold clock matters.
        assert_eq!(
            evaluate_exit(&config, &p, Price::new(dec!(100.5)), Utc::now()),
            Some(ExitReason::MaxHoldTime)
        );
    }

    #[test]
    fn test_flat_and_stale() {
        let config = ExitConfig::default();
        let p = long_position(Duration::minutes(35));
        // Within 10 bps of entry after 35 minutes.
        assert_eq!(
            evaluate_exit(&config, &p, Price::new(dec!(100.05)), Utc::now()),
            Some(ExitReason::FlatAndStale)
        );
    }

    #[test]
    fn test_reallocation_after_recovery_window() {
        let config = ExitConfig::default();
        let mut p = long_position(Duration::minutes(20));
        p.losing_since = Some(Utc::now() - Duration::minutes(16));

        // Underwater but above the stop, past the recovery window.
        assert_eq!(
            evaluate_exit(&config, &p, Price::new(dec!(99)), Utc::now()),
            Some(ExitReason::Reallocation)
        );
    }

    #[test]
    fn test_losing_within_window_holds() {
        let config = ExitConfig::default();
        let mut p = long_position(Duration::minutes(20));
        p.losing_since = Some(Utc::now() - Duration::minutes(5));

        assert_eq!(
            evaluate_exit(&config, &p, Price::new(dec!(99)), Utc::now()),
            None
        );
    }
}
