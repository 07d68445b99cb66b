//! Risk gate over an immutable per-cycle capital snapshot.
//!
//! The snapshot is computed once per flush cycle and every signal in the
//! batch is judged against the same numbers; there is no shared mutable
//! "fully deployed" flag to race on. Exit-path signals (exit trigger,
//! emergency liquidation) bypass the entry checks entirely: they reduce
//! exposure and must never be blocked by the rules that limit it.

use chrono::{DateTime, Utc};
use keel_core::{Price, Signal};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// Immutable capital state for one gate cycle.
#[derive(Debug, Clone)]
pub struct CapitalSnapshot {
    /// Capital not currently deployed in open positions.
    pub available_capital: Decimal,
    /// Notional currently deployed.
    pub deployed_capital: Decimal,
    /// Open position count.
    pub open_positions: usize,
    /// Consecutive losing closed positions.
    pub consecutive_losses: u32,
    pub taken_at: DateTime<Utc>,
}

impl CapitalSnapshot {
    pub fn new(
        available_capital: Decimal,
        deployed_capital: Decimal,
        open_positions: usize,
        consecutive_losses: u32,
    ) -> Self {
        Self {
            available_capital,
            deployed_capital,
            open_positions,
            consecutive_losses,
            taken_at: Utc::now(),
        }
    }
}

/// Provider of capital snapshots, implemented over the position ledger.
pub trait CapitalProvider: Send + Sync {
    fn capital_snapshot(&self) -> CapitalSnapshot;
}

/// Machine-readable rejection reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateReject {
    SymbolNotTradable { symbol: String },
    BelowConfidenceFloor { confidence: Decimal, floor: Decimal },
    MaxPositionsReached { open: usize, max: usize },
    InsufficientCapital { required: Decimal, available: Decimal },
    NoPrice { symbol: String },
    ZeroSize,
}

impl GateReject {
    /// Stable label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::SymbolNotTradable { .. } => "symbol_not_tradable",
            Self::BelowConfidenceFloor { .. } => "below_confidence_floor",
            Self::MaxPositionsReached { .. } => "max_positions",
            Self::InsufficientCapital { .. } => "insufficient_capital",
            Self::NoPrice { .. } => "no_price",
            Self::ZeroSize => "zero_size",
        }
    }
}

impl fmt::Display for GateReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SymbolNotTradable { symbol } => write!(f, "symbol {symbol} not tradable"),
            Self::BelowConfidenceFloor { confidence, floor } => {
                write!(f, "confidence {confidence} below floor {floor}")
            }
            Self::MaxPositionsReached { open, max } => {
                write!(f, "{open} positions open, max {max}")
            }
            Self::InsufficientCapital {
                required,
                available,
            } => write!(f, "requires {required}, {available} available"),
            Self::NoPrice { symbol } => write!(f, "no price for {symbol}"),
            Self::ZeroSize => write!(f, "zero size"),
        }
    }
}

/// Gate parameters.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub max_concurrent_positions: usize,
    /// Base confidence floor for entries.
    pub base_confidence_floor: Decimal,
    /// Added to the floor per consecutive loss.
    pub floor_step_per_loss: Decimal,
    /// The floor never tightens past this.
    pub max_confidence_floor: Decimal,
    /// Symbols the gate lets through.
    pub tradable_symbols: HashSet<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_positions: 5,
            base_confidence_floor: Decimal::new(6, 1),      // 0.6
            floor_step_per_loss: Decimal::new(5, 2),        // 0.05
            max_confidence_floor: Decimal::new(9, 1),       // 0.9
            tradable_symbols: HashSet::new(),
        }
    }
}

pub struct RiskGate {
    config: GateConfig,
}

impl RiskGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Effective confidence floor after loss-streak tightening.
    pub fn effective_floor(&self, snapshot: &CapitalSnapshot) -> Decimal {
        let tightened = self.config.base_confidence_floor
            + self.config.floor_step_per_loss * Decimal::from(snapshot.consecutive_losses);
        tightened.min(self.config.max_confidence_floor)
    }

    /// Judge one signal against the cycle snapshot.
    ///
    /// `price` is the current authoritative price, used to compute the
    /// required notional for entries.
    pub fn evaluate(
        &self,
        signal: &Signal,
        snapshot: &CapitalSnapshot,
        price: Option<Price>,
    ) -> Result<(), GateReject> {
        if !signal.suggested_size.is_positive() {
            return Err(GateReject::ZeroSize);
        }

        // Exit paths reduce exposure; only the sanity checks above apply.
        if signal.bypasses_confidence_floor() {
            return Ok(());
        }

        if !self.config.tradable_symbols.contains(&signal.symbol) {
            return Err(GateReject::SymbolNotTradable {
                symbol: signal.symbol.clone(),
            });
        }

        let floor = self.effective_floor(snapshot);
        if signal.confidence < floor {
            return Err(GateReject::BelowConfidenceFloor {
                confidence: signal.confidence,
                floor,
            });
        }

        if snapshot.open_positions >= self.config.max_concurrent_positions {
            return Err(GateReject::MaxPositionsReached {
                open: snapshot.open_positions,
                max: self.config.max_concurrent_positions,
            });
        }

        let Some(price) = price else {
            return Err(GateReject::NoPrice {
                symbol: signal.symbol.clone(),
            });
        };
        let required = signal.suggested_size.notional(price);
        if required > snapshot.available_capital {
            return Err(GateReject::InsufficientCapital {
                required,
                available: snapshot.available_capital,
            });
        }

        debug!(symbol = %signal.symbol, %required, "signal passed gate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{OrderSide, SignalReason, Size};
    use rust_decimal_macros::dec;

    fn gate() -> RiskGate {
        let mut tradable = HashSet::new();
        tradable.insert("BTC/USD".to_string());
        RiskGate::new(GateConfig {
            max_concurrent_positions: 2,
            base_confidence_floor: dec!(0.6),
            floor_step_per_loss: dec!(0.05),
            max_confidence_floor: dec!(0.9),
            tradable_symbols: tradable,
        })
    }

    fn entry(confidence: Decimal, size: Decimal) -> Signal {
        Signal::new(
            "BTC/USD",
            OrderSide::Buy,
            confidence,
            Size::new(size),
            SignalReason::Momentum,
        )
    }

    fn snapshot(available: Decimal, open: usize, losses: u32) -> CapitalSnapshot {
        CapitalSnapshot::new(available, dec!(0), open, losses)
    }

    #[test]
    fn test_passes_all_checks() {
        let g = gate();
        let result = g.evaluate(
            &entry(dec!(0.8), dec!(0.01)),
            &snapshot(dec!(1000), 0, 0),
            Some(Price::new(dec!(50000))),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_untradable_symbol() {
        let g = gate();
        let sig = Signal::new(
            "DOGE/USD",
            OrderSide::Buy,
            dec!(0.9),
            Size::new(dec!(1)),
            SignalReason::Momentum,
        );
        assert_eq!(
            g.evaluate(&sig, &snapshot(dec!(1000), 0, 0), Some(Price::new(dec!(1))))
                .unwrap_err()
                .label(),
            "symbol_not_tradable"
        );
    }

    #[test]
    fn test_confidence_floor() {
        let g = gate();
        let err = g
            .evaluate(
                &entry(dec!(0.5), dec!(0.01)),
                &snapshot(dec!(1000), 0, 0),
                Some(Price::new(dec!(50000))),
            )
            .unwrap_err();
        assert!(matches!(err, GateReject::BelowConfidenceFloor { .. }));
    }

    #[test]
    fn test_floor_tightens_with_losses() {
        let g = gate();
        // 0.6 + 3 * 0.05 = 0.75
        assert_eq!(g.effective_floor(&snapshot(dec!(1000), 0, 3)), dec!(0.75));
        // Capped at 0.9
        assert_eq!(g.effective_floor(&snapshot(dec!(1000), 0, 20)), dec!(0.9));

        // 0.7 passes with no losses, fails after 3.
        assert!(g
            .evaluate(
                &entry(dec!(0.7), dec!(0.01)),
                &snapshot(dec!(1000), 0, 0),
                Some(Price::new(dec!(50000))),
            )
            .is_ok());
        assert!(g
            .evaluate(
                &entry(dec!(0.7), dec!(0.01)),
                &snapshot(dec!(1000), 0, 3),
                Some(Price::new(dec!(50000))),
            )
            .is_err());
    }

    #[test]
    fn test_max_positions() {
        let g = gate();
        let err = g
            .evaluate(
                &entry(dec!(0.8), dec!(0.01)),
                &snapshot(dec!(1000), 2, 0),
                Some(Price::new(dec!(50000))),
            )
            .unwrap_err();
        assert_eq!(err.label(), "max_positions");
    }

    #[test]
    fn test_insufficient_capital() {
        let g = gate();
        let err = g
            .evaluate(
                &entry(dec!(0.8), dec!(1)),
                &snapshot(dec!(1000), 0, 0),
                Some(Price::new(dec!(50000))),
            )
            .unwrap_err();
        assert_eq!(err.label(), "insufficient_capital");
    }

    #[test]
    fn test_exit_bypasses_entry_checks() {
        let g = gate();
        // Untradable symbol, no capital, positions full: exit still passes.
        let sig = Signal::exit("DOGE/USD", OrderSide::Sell, Size::new(dec!(1)));
        assert!(g.evaluate(&sig, &snapshot(dec!(0), 2, 10), None).is_ok());
    }

    #[test]
    fn test_zero_size_rejected_even_for_exit() {
        let g = gate();
        let sig = Signal::exit("BTC/USD", OrderSide::Sell, Size::ZERO);
        assert_eq!(
            g.evaluate(&sig, &snapshot(dec!(1000), 0, 0), None)
                .unwrap_err(),
            GateReject::ZeroSize
        );
    }
}
