//! Tick-driven position monitoring.
//!
//! The monitor recomputes unrealized P&L and hold time on every pass,
//! fires each exit condition at most once, and routes exits back through
//! the signal pipeline as critical-priority closing signals. It never
//! talks to the venue directly.

use chrono::Utc;
use keel_core::{OrderFill, Price, Signal, SignalPriority, SignalReason};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capital::CapitalTracker;
use crate::error::PositionResult;
use crate::exit::{evaluate_exit, ExitConfig, ExitReason};
use crate::ledger::{CloseOutcome, ClosedPosition, Position, PositionLedger, PositionStatus};

/// Read access to current prices. Implemented by the state cache in the
/// composition root.
pub trait PriceSource: Send + Sync {
    /// Best available price for a symbol, or None when nothing fresh
    /// enough exists.
    fn price(&self, symbol: &str) -> Option<Price>;
}

/// Monitor pacing and entry bracket sizing.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Scan interval.
    pub tick_interval: Duration,
    /// Profit target distance from entry, in bps.
    pub profit_target_bps: u32,
    /// Stop loss distance from entry, in bps.
    pub stop_loss_bps: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            profit_target_bps: 300,
            stop_loss_bps: 200,
        }
    }
}

/// Watches open positions and drives their lifecycle.
pub struct PositionMonitor {
    config: MonitorConfig,
    exit_config: ExitConfig,
    ledger: Arc<PositionLedger>,
    prices: Arc<dyn PriceSource>,
    capital: Arc<CapitalTracker>,
    signal_tx: mpsc::Sender<Signal>,
}

impl PositionMonitor {
    pub fn new(
        config: MonitorConfig,
        exit_config: ExitConfig,
        ledger: Arc<PositionLedger>,
        prices: Arc<dyn PriceSource>,
        capital: Arc<CapitalTracker>,
        signal_tx: mpsc::Sender<Signal>,
    ) -> Self {
        Self {
            config,
            exit_config,
            ledger,
            prices,
            capital,
            signal_tx,
        }
    }

    /// Scan loop. Runs until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        info!(
            interval_ms = self.config.tick_interval.as_millis() as u64,
            "position monitor started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => self.scan().await,
                _ = shutdown.cancelled() => {
                    info!("position monitor stopping");
                    return;
                }
            }
        }
    }

    /// One pass over all open positions.
    pub async fn scan(&self) {
        let now = Utc::now();
        for position in self.ledger.all() {
            if position.status != PositionStatus::Open {
                continue;
            }
            let Some(price) = self.prices.price(&position.symbol) else {
                debug!(symbol = %position.symbol, "no usable price, skipping scan");
                continue;
            };

            let pnl = position.unrealized_pnl(price);
            self.ledger
                .update_loss_state(&position.symbol, pnl < Decimal::ZERO, now);

            // Re-read so the loss marker just written is visible to the
            // reallocation check.
            let Some(position) = self.ledger.get(&position.symbol) else {
                continue;
            };
            if let Some(reason) = evaluate_exit(&self.exit_config, &position, price, now) {
                self.trigger_exit(&position, reason, price).await;
            }
        }
    }

    async fn trigger_exit(&self, position: &Position, reason: ExitReason, price: Price) {
        // The transition guard makes this fire at most once per position.
        if let Err(err) = self.ledger.mark_exit_triggered(&position.symbol, reason) {
            debug!(symbol = %position.symbol, %err, "exit already in progress");
            return;
        }

        info!(
            symbol = %position.symbol,
            %reason,
            %price,
            pnl = %position.unrealized_pnl(price),
            hold_ms = position.hold_time_ms(Utc::now()),
            "exit triggered"
        );
        let signal = Signal::exit(
            position.symbol.clone(),
            position.side.opposite(),
            position.size,
        );
        if let Err(err) = self.signal_tx.send(signal).await {
            warn!(symbol = %position.symbol, %err, "exit signal channel closed");
        }
    }

    /// Emergency path: push liquidation signals for every open position.
    /// Invoked by the failure governor; flows through the same pipeline
    /// and router as any other exit.
    pub async fn request_liquidation(&self) {
        let positions = self.ledger.all();
        if positions.is_empty() {
            info!("liquidation requested with no open positions");
            return;
        }
        warn!(count = positions.len(), "liquidating all open positions");
        for position in positions {
            if position.status != PositionStatus::Open {
                continue;
            }
            if self
                .ledger
                .mark_exit_triggered(&position.symbol, ExitReason::Emergency)
                .is_err()
            {
                continue;
            }
            let signal = Signal {
                symbol: position.symbol.clone(),
                side: position.side.opposite(),
                confidence: Decimal::ONE,
                suggested_size: position.size,
                reason: SignalReason::EmergencyLiquidation,
                priority: SignalPriority::Critical,
                created_at: Utc::now(),
            };
            if let Err(err) = self.signal_tx.send(signal).await {
                warn!(symbol = %position.symbol, %err, "liquidation signal channel closed");
            }
        }
    }

    /// Apply a confirmed fill. Opens a position on an entry fill, reduces
    /// or closes on an opposite-side fill. Returns the archived record on
    /// a full close.
    pub fn apply_fill(&self, fill: &OrderFill) -> PositionResult<Option<ClosedPosition>> {
        match self.ledger.get(&fill.symbol) {
            None => {
                let (target, stop) = self.bracket(fill);
                self.ledger.open(fill, target, stop)?;
                Ok(None)
            }
            Some(position) if fill.side == position.side => {
                // One position per symbol; the gate blocks duplicate
                // entries, so a same-side fill here is unexpected.
                warn!(symbol = %fill.symbol, side = %fill.side, "unexpected same-side fill");
                Ok(None)
            }
            Some(_) => match self.ledger.apply_close_fill(fill)? {
                CloseOutcome::Partial { remaining } => {
                    debug!(symbol = %fill.symbol, %remaining, "partial exit fill");
                    Ok(None)
                }
                CloseOutcome::Closed(closed) => {
                    self.capital.record_close(&closed)?;
                    Ok(Some(closed))
                }
            },
        }
    }

    /// Record that the exit order for a symbol reached the router.
    pub fn mark_exit_submitted(&self, symbol: &str) -> PositionResult<()> {
        self.ledger.mark_exiting(symbol)
    }

    fn bracket(&self, fill: &OrderFill) -> (Price, Price) {
        let entry = fill.price.inner();
        let target_off = entry * Decimal::from(self.config.profit_target_bps) / Decimal::from(10_000);
        let stop_off = entry * Decimal::from(self.config.stop_loss_bps) / Decimal::from(10_000);
        let sign = Decimal::from(fill.side.sign());
        (
            Price::new(entry + target_off * sign),
            Price::new(entry - stop_off * sign),
        )
    }
}
