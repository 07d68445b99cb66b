//! The position ledger.
//!
//! One position per symbol, keyed by venue symbol. Status transitions are
//! monotonic (`Open -> ExitTriggered -> Exiting -> Closed`, forward jumps
//! allowed, never backward), sizes never go negative, and a closed
//! position leaves the ledger as an archived [`ClosedPosition`] record.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_core::{OrderFill, OrderSide, Price, Size};
use keel_persistence::{PositionSnapshot, PositionSnapshotStore, SnapshotEntry};
use rust_decimal::Decimal;
use std::fmt;
use tracing::{info, warn};

use crate::error::{PositionError, PositionResult};
use crate::exit::ExitReason;

/// Position lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionStatus {
    /// Holding; monitored for exit conditions.
    Open,
    /// An exit condition fired; exit signal emitted.
    ExitTriggered,
    /// The exit order was submitted to the venue.
    Exiting,
    /// Exit fill confirmed.
    Closed,
}

impl PositionStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Open => 0,
            Self::ExitTriggered => 1,
            Self::Exiting => 2,
            Self::Closed => 3,
        }
    }

    /// Forward-only transitions; equal status is not a transition.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        next.rank() > self.rank()
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ExitTriggered => "exit_triggered",
            Self::Exiting => "exiting",
            Self::Closed => "closed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "exit_triggered" => Some(Self::ExitTriggered),
            "exiting" => Some(Self::Exiting),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open (or exiting) position.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub side: OrderSide,
    pub size: Size,
    pub entry_price: Price,
    pub entry_time: DateTime<Utc>,
    pub profit_target: Price,
    pub stop_loss: Price,
    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    /// When the position first went into loss without recovering; cleared
    /// whenever it comes back above water.
    pub losing_since: Option<DateTime<Utc>>,
    /// Fees accumulated on entry fills.
    pub entry_fees: Price,
}

impl Position {
    /// Unrealized P&L at the given price.
    pub fn unrealized_pnl(&self, current: Price) -> Decimal {
        let diff = current.inner() - self.entry_price.inner();
        diff * self.size.inner() * Decimal::from(self.side.sign())
    }

    /// Unrealized P&L in basis points of entry notional.
    pub fn unrealized_pnl_bps(&self, current: Price) -> Option<Decimal> {
        let notional = self.size.notional(self.entry_price);
        if notional.is_zero() {
            return None;
        }
        Some(self.unrealized_pnl(current) / notional * Decimal::from(10_000))
    }

    pub fn hold_time_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_milliseconds()
    }

    pub fn notional(&self) -> Decimal {
        self.size.notional(self.entry_price)
    }
}

/// A fully closed position, archived out of the ledger.
#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub symbol: String,
    pub side: OrderSide,
    pub size: Size,
    pub entry_price: Price,
    pub exit_price: Price,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub exit_reason: Option<ExitReason>,
    pub entry_time: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedPosition {
    pub fn hold_time_ms(&self) -> i64 {
        (self.closed_at - self.entry_time).num_milliseconds()
    }
}

/// Outcome of applying a closing fill.
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    /// Fill covered part of the position; remaining size stays.
    Partial { remaining: Size },
    /// Position fully closed and archived.
    Closed(ClosedPosition),
}

/// Positions keyed by symbol.
#[derive(Default)]
pub struct PositionLedger {
    positions: DashMap<String, Position>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a position from a confirmed entry fill.
    pub fn open(
        &self,
        fill: &OrderFill,
        profit_target: Price,
        stop_loss: Price,
    ) -> PositionResult<()> {
        if self.positions.contains_key(&fill.symbol) {
            return Err(PositionError::AlreadyOpen(fill.symbol.clone()));
        }

        let position = Position {
            symbol: fill.symbol.clone(),
            side: fill.side,
            size: fill.size,
            entry_price: fill.price,
            entry_time: fill.filled_at,
            profit_target,
            stop_loss,
            status: PositionStatus::Open,
            exit_reason: None,
            losing_since: None,
            entry_fees: fill.fee,
        };
        info!(
            symbol = %position.symbol,
            side = %position.side,
            size = %position.size,
            entry = %position.entry_price,
            "position opened"
        );
        self.positions.insert(fill.symbol.clone(), position);
        Ok(())
    }

    /// Record that an exit condition fired. `Open -> ExitTriggered`.
    pub fn mark_exit_triggered(&self, symbol: &str, reason: ExitReason) -> PositionResult<()> {
        self.transition(symbol, PositionStatus::ExitTriggered, |p| {
            p.exit_reason = Some(reason);
        })
    }

    /// Record that the exit order was submitted. `-> Exiting`.
    pub fn mark_exiting(&self, symbol: &str) -> PositionResult<()> {
        self.transition(symbol, PositionStatus::Exiting, |_| {})
    }

    /// Apply a fill on the closing side.
    ///
    /// A partial fill reduces size; a fill covering the remainder closes
    /// and archives the position. Sizes never go negative: overfills clamp
    /// to the position size.
    pub fn apply_close_fill(&self, fill: &OrderFill) -> PositionResult<CloseOutcome> {
        let mut entry = self
            .positions
            .get_mut(&fill.symbol)
            .ok_or_else(|| PositionError::NotFound(fill.symbol.clone()))?;

        let position = entry.value_mut();
        if position.status == PositionStatus::Closed {
            return Err(PositionError::InvalidTransition {
                symbol: fill.symbol.clone(),
                from: PositionStatus::Closed,
                to: PositionStatus::Closed,
            });
        }
        if fill.side == position.side {
            warn!(symbol = %fill.symbol, "same-side fill ignored by close path");
            return Ok(CloseOutcome::Partial {
                remaining: position.size,
            });
        }

        if fill.size < position.size {
            position.size = position.size - fill.size;
            info!(
                symbol = %fill.symbol,
                remaining = %position.size,
                "partial close"
            );
            return Ok(CloseOutcome::Partial {
                remaining: position.size,
            });
        }

        // Full close.
        let closed_size = position.size;
        let diff = fill.price.inner() - position.entry_price.inner();
        let realized =
            diff * closed_size.inner() * Decimal::from(position.side.sign());
        let fees = position.entry_fees.inner() + fill.fee.inner();

        let closed = ClosedPosition {
            symbol: position.symbol.clone(),
            side: position.side,
            size: closed_size,
            entry_price: position.entry_price,
            exit_price: fill.price,
            realized_pnl: realized - fees,
            fees,
            exit_reason: position.exit_reason,
            entry_time: position.entry_time,
            closed_at: fill.filled_at,
        };
        drop(entry);
        self.positions.remove(&fill.symbol);

        info!(
            symbol = %closed.symbol,
            pnl = %closed.realized_pnl,
            hold_ms = closed.hold_time_ms(),
            "position closed"
        );
        Ok(CloseOutcome::Closed(closed))
    }

    /// Update the losing-streak marker from the monitor's tick pass.
    pub fn update_loss_state(&self, symbol: &str, losing: bool, now: DateTime<Utc>) {
        if let Some(mut entry) = self.positions.get_mut(symbol) {
            let p = entry.value_mut();
            match (losing, p.losing_since) {
                (true, None) => p.losing_since = Some(now),
                (false, Some(_)) => p.losing_since = None,
                _ => {}
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<Position> {
        self.positions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Total entry notional across open positions.
    pub fn deployed_capital(&self) -> Decimal {
        self.positions
            .iter()
            .map(|e| e.value().notional())
            .sum()
    }

    fn transition<F>(&self, symbol: &str, to: PositionStatus, apply: F) -> PositionResult<()>
    where
        F: FnOnce(&mut Position),
    {
        let mut entry = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.to_string()))?;
        let position = entry.value_mut();

        if !position.status.can_transition_to(to) {
            return Err(PositionError::InvalidTransition {
                symbol: symbol.to_string(),
                from: position.status,
                to,
            });
        }
        info!(symbol, from = %position.status, %to, "position transition");
        position.status = to;
        apply(position);
        Ok(())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write all open positions to the snapshot store.
    pub fn save_snapshot(&self, store: &PositionSnapshotStore) -> PositionResult<()> {
        let positions = self
            .positions
            .iter()
            .map(|e| {
                let p = e.value();
                SnapshotEntry {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    size: p.size,
                    entry_price: p.entry_price,
                    entry_time: p.entry_time,
                    profit_target: p.profit_target,
                    stop_loss: p.stop_loss,
                    status: p.status.as_str().to_string(),
                }
            })
            .collect();
        store.save(PositionSnapshot {
            written_at: None,
            positions,
        })?;
        Ok(())
    }

    /// Restore positions from the snapshot store. Closed entries and
    /// unknown statuses are skipped.
    pub fn restore_snapshot(&self, store: &PositionSnapshotStore) -> usize {
        let snapshot = store.load();
        let mut restored = 0;
        for entry in snapshot.positions {
            let Some(status) = PositionStatus::parse(&entry.status) else {
                warn!(symbol = %entry.symbol, status = %entry.status, "unknown status in snapshot");
                continue;
            };
            if status == PositionStatus::Closed {
                continue;
            }
            self.positions.insert(
                entry.symbol.clone(),
                Position {
                    symbol: entry.symbol,
                    side: entry.side,
                    size: entry.size,
                    entry_price: entry.entry_price,
                    entry_time: entry.entry_time,
                    profit_target: entry.profit_target,
                    stop_loss: entry.stop_loss,
                    status,
                    exit_reason: None,
                    losing_since: None,
                    entry_fees: Price::ZERO,
                },
            );
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "positions restored from snapshot");
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ClientOrderId;
    use rust_decimal_macros::dec;

    fn entry_fill(symbol: &str, side: OrderSide, size: Decimal, price: Decimal) -> OrderFill {
        OrderFill {
            order_id: ClientOrderId::new(),
            symbol: symbol.to_string(),
            side,
            size: Size::new(size),
            price: Price::new(price),
            fee: Price::new(dec!(0.1)),
            filled_at: Utc::now(),
        }
    }

    fn open_long(ledger: &PositionLedger) {
        ledger
            .open(
                &entry_fill("BTC/USD", OrderSide::Buy, dec!(1), dec!(100)),
                Price::new(dec!(103)),
                Price::new(dec!(98)),
            )
            .unwrap();
    }

    #[test]
    fn test_open_and_get() {
        let ledger = PositionLedger::new();
        open_long(&ledger);

        let p = ledger.get("BTC/USD").unwrap();
        assert_eq!(p.status, PositionStatus::Open);
        assert_eq!(p.size, Size::new(dec!(1)));
        assert_eq!(ledger.open_count(), 1);
        assert_eq!(ledger.deployed_capital(), dec!(100));
    }

    #[test]
    fn test_duplicate_open_rejected() {
        let ledger = PositionLedger::new();
        open_long(&ledger);
        let err = ledger
            .open(
                &entry_fill("BTC/USD", OrderSide::Buy, dec!(1), dec!(100)),
                Price::new(dec!(103)),
                Price::new(dec!(98)),
            )
            .unwrap_err();
        assert!(matches!(err, PositionError::AlreadyOpen(_)));
    }

    #[test]
    fn test_monotonic_transitions() {
        let ledger = PositionLedger::new();
        open_long(&ledger);

        ledger
            .mark_exit_triggered("BTC/USD", ExitReason::ProfitTarget)
            .unwrap();
        ledger.mark_exiting("BTC/USD").unwrap();

        // No going back.
        let err = ledger
            .mark_exit_triggered("BTC/USD", ExitReason::StopLoss)
            .unwrap_err();
        assert!(matches!(err, PositionError::InvalidTransition { .. }));
    }

    #[test]
    fn test_exit_triggered_fires_once() {
        let ledger = PositionLedger::new();
        open_long(&ledger);

        ledger
            .mark_exit_triggered("BTC/USD", ExitReason::StopLoss)
            .unwrap();
        assert!(ledger
            .mark_exit_triggered("BTC/USD", ExitReason::StopLoss)
            .is_err());
    }

    #[test]
    fn test_full_close_realizes_pnl() {
        let ledger = PositionLedger::new();
        open_long(&ledger);
        ledger
            .mark_exit_triggered("BTC/USD", ExitReason::ProfitTarget)
            .unwrap();

        let fill = entry_fill("BTC/USD", OrderSide::Sell, dec!(1), dec!(103));
        let outcome = ledger.apply_close_fill(&fill).unwrap();

        let CloseOutcome::Closed(closed) = outcome else {
            panic!("expected full close");
        };
        // (103 - 100) * 1 - 0.2 fees
        assert_eq!(closed.realized_pnl, dec!(2.8));
        assert_eq!(closed.exit_reason, Some(ExitReason::ProfitTarget));
        assert_eq!(ledger.open_count(), 0);
    }

    #[test]
    fn test_short_position_pnl() {
        let ledger = PositionLedger::new();
        ledger
            .open(
                &entry_fill("ETH/USD", OrderSide::Sell, dec!(2), dec!(50)),
                Price::new(dec!(48)),
                Price::new(dec!(52)),
            )
            .unwrap();

        let p = ledger.get("ETH/USD").unwrap();
        // Short profits when price falls.
        assert_eq!(p.unrealized_pnl(Price::new(dec!(45))), dec!(10));
        assert_eq!(p.unrealized_pnl(Price::new(dec!(55))), dec!(-10));
    }

    #[test]
    fn test_partial_close_reduces_size() {
        let ledger = PositionLedger::new();
        open_long(&ledger);

        let fill = entry_fill("BTC/USD", OrderSide::Sell, dec!(0.4), dec!(101));
        let outcome = ledger.apply_close_fill(&fill).unwrap();

        let CloseOutcome::Partial { remaining } = outcome else {
            panic!("expected partial close");
        };
        assert_eq!(remaining, Size::new(dec!(0.6)));
        assert_eq!(ledger.get("BTC/USD").unwrap().size, Size::new(dec!(0.6)));
    }

    #[test]
    fn test_no_resurrection_after_close() {
        let ledger = PositionLedger::new();
        open_long(&ledger);
        let fill = entry_fill("BTC/USD", OrderSide::Sell, dec!(1), dec!(103));
        ledger.apply_close_fill(&fill).unwrap();

        // The symbol is gone; nothing to transition.
        assert!(matches!(
            ledger.mark_exiting("BTC/USD").unwrap_err(),
            PositionError::NotFound(_)
        ));
    }

    #[test]
    fn test_losing_since_tracking() {
        let ledger = PositionLedger::new();
        open_long(&ledger);
        let now = Utc::now();

        ledger.update_loss_state("BTC/USD", true, now);
        assert_eq!(ledger.get("BTC/USD").unwrap().losing_since, Some(now));

        // Recovery clears the marker.
        ledger.update_loss_state("BTC/USD", false, now);
        assert!(ledger.get("BTC/USD").unwrap().losing_since.is_none());
    }
}
