//! The signal pipeline: dedup, batch, gate, dispatch.
//!
//! `submit` is the single intake for detector signals, ledger exit
//! triggers, and governor liquidation requests. Entry signals are rejected
//! at this boundary while the circuit is open or intake is halted; exit
//! paths are always admitted because they reduce exposure. Validated
//! signals become market orders pushed to the router channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use keel_core::{OrderRequest, Signal};
use keel_governor::{CircuitBreaker, CircuitState};
use keel_sync::StateCache;
use keel_telemetry::Metrics;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::SignalBatcher;
use crate::dedup::{DedupOutcome, SignalDeduper};
use crate::error::{PipelineError, PipelineResult};
use crate::gate::{CapitalProvider, RiskGate};

/// What happened to a submitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Admitted to the current batch.
    Accepted,
    /// Dropped by the cooldown window.
    Deduplicated,
}

/// Intake and dispatch counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub accepted: AtomicU64,
    pub deduplicated: AtomicU64,
    pub gate_rejected: AtomicU64,
    pub dispatched: AtomicU64,
}

pub struct SignalPipeline {
    deduper: SignalDeduper,
    batcher: SignalBatcher,
    gate: RiskGate,
    capital: Arc<dyn CapitalProvider>,
    cache: Arc<StateCache>,
    breaker: Arc<CircuitBreaker>,
    halted: Arc<AtomicBool>,
    order_tx: mpsc::Sender<OrderRequest>,
    stats: PipelineStats,
}

impl SignalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deduper: SignalDeduper,
        batcher: SignalBatcher,
        gate: RiskGate,
        capital: Arc<dyn CapitalProvider>,
        cache: Arc<StateCache>,
        breaker: Arc<CircuitBreaker>,
        halted: Arc<AtomicBool>,
        order_tx: mpsc::Sender<OrderRequest>,
    ) -> Self {
        Self {
            deduper,
            batcher,
            gate,
            capital,
            cache,
            breaker,
            halted,
            order_tx,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Submit one signal.
    ///
    /// Exit-path signals bypass the circuit and halt checks; with the
    /// circuit open they are the only orders that should still flow.
    pub async fn submit(&self, signal: Signal) -> PipelineResult<SubmitOutcome> {
        if signal.confidence < Decimal::ZERO || signal.confidence > Decimal::ONE {
            return Err(PipelineError::InvalidSignal(format!(
                "confidence {} outside [0, 1]",
                signal.confidence
            )));
        }

        if !signal.bypasses_confidence_floor() {
            if self.halted.load(Ordering::Acquire) {
                return Err(PipelineError::IntakeHalted);
            }
            let circuit = self.breaker.circuit_state();
            if circuit.state == CircuitState::Open && circuit.reopen_in.is_some() {
                return Err(PipelineError::CircuitOpen);
            }
        }

        if self.deduper.check(&signal) == DedupOutcome::Duplicate {
            self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
            Metrics::signal_deduped(&signal.symbol);
            return Ok(SubmitOutcome::Deduplicated);
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        Metrics::signal_accepted(&signal.symbol, &signal.reason.to_string());

        if let Some(batch) = self.batcher.push(signal) {
            self.dispatch_batch(batch).await?;
        }
        Ok(SubmitOutcome::Accepted)
    }

    /// Run the batch-window timer until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            window_ms = self.batcher.window().as_millis() as u64,
            "signal pipeline started"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("signal pipeline stopping");
                    return;
                }
                () = tokio::time::sleep(self.batcher.window()) => {}
            }

            let batch = self.batcher.flush();
            if !batch.is_empty() {
                if let Err(e) = self.dispatch_batch(batch).await {
                    warn!(?e, "batch dispatch failed");
                    return;
                }
            }
            self.deduper.prune();
        }
    }

    /// Gate a sorted batch against one capital snapshot and dispatch the
    /// survivors.
    async fn dispatch_batch(&self, batch: Vec<Signal>) -> PipelineResult<()> {
        // Recomputed once per cycle; every signal in the batch sees the
        // same numbers.
        let snapshot = self.capital.capital_snapshot();
        debug!(
            batch = batch.len(),
            available = %snapshot.available_capital,
            open = snapshot.open_positions,
            "gating batch"
        );

        for signal in batch {
            let price = self
                .cache
                .get_ticker(&signal.symbol)
                .filter(|read| !read.stale)
                .and_then(|read| read.value.mid().or(Some(read.value.last)));

            match self.gate.evaluate(&signal, &snapshot, price) {
                Ok(()) => {
                    let mut order = OrderRequest::market(
                        signal.symbol.clone(),
                        signal.side,
                        signal.suggested_size,
                        signal.priority.score(),
                    );
                    if signal.bypasses_confidence_floor() {
                        order = order.reduce_only();
                    }

                    self.order_tx
                        .send(order)
                        .await
                        .map_err(|_| PipelineError::ChannelClosed)?;
                    self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Err(reject) => {
                    self.stats.gate_rejected.fetch_add(1, Ordering::Relaxed);
                    Metrics::gate_rejected(reject.label(), &signal.symbol);
                    debug!(
                        symbol = %signal.symbol,
                        reason = reject.label(),
                        %reject,
                        "signal rejected at gate"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::gate::{CapitalSnapshot, GateConfig};
    use keel_core::{DataSource, MarketTick, OrderSide, Price, SignalReason, Size};
    use keel_sync::CachePolicy;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;
    use std::time::Duration;

    struct FixedCapital;
    impl CapitalProvider for FixedCapital {
        fn capital_snapshot(&self) -> CapitalSnapshot {
            CapitalSnapshot::new(dec!(100000), dec!(0), 0, 0)
        }
    }

    fn pipeline(
        batch_size: usize,
        breaker: Arc<CircuitBreaker>,
    ) -> (SignalPipeline, mpsc::Receiver<OrderRequest>) {
        let cache = Arc::new(StateCache::new(CachePolicy::default()));
        cache.update_tick(MarketTick::new(
            "BTC/USD",
            Price::new(dec!(50000)),
            Price::new(dec!(50010)),
            Price::new(dec!(50005)),
            DataSource::Stream,
        ));

        let mut tradable = HashSet::new();
        tradable.insert("BTC/USD".to_string());

        let (tx, rx) = mpsc::channel(32);
        let pipeline = SignalPipeline::new(
            SignalDeduper::new(3_000),
            SignalBatcher::new(BatchConfig {
                window: Duration::from_secs(60),
                max_size: batch_size,
            }),
            RiskGate::new(GateConfig {
                tradable_symbols: tradable,
                ..Default::default()
            }),
            Arc::new(FixedCapital),
            cache,
            breaker,
            Arc::new(AtomicBool::new(false)),
            tx,
        );
        (pipeline, rx)
    }

    fn entry_signal() -> Signal {
        Signal::new(
            "BTC/USD",
            OrderSide::Buy,
            dec!(0.8),
            Size::new(dec!(0.01)),
            SignalReason::Momentum,
        )
    }

    #[tokio::test]
    async fn test_duplicate_never_reaches_gate() {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
        let (pipeline, _rx) = pipeline(16, breaker);

        assert_eq!(
            pipeline.submit(entry_signal()).await.unwrap(),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            pipeline.submit(entry_signal()).await.unwrap(),
            SubmitOutcome::Deduplicated
        );
        assert_eq!(pipeline.stats().accepted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_size_trigger_dispatches_order() {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
        let (pipeline, mut rx) = pipeline(1, breaker);

        pipeline.submit(entry_signal()).await.unwrap();

        let order = rx.recv().await.unwrap();
        assert_eq!(order.symbol, "BTC/USD");
        assert_eq!(order.side, OrderSide::Buy);
        assert!(!order.reduce_only);
    }

    #[tokio::test]
    async fn test_circuit_open_rejects_entries() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        breaker.record_failure();
        let (pipeline, _rx) = pipeline(16, breaker);

        assert!(matches!(
            pipeline.submit(entry_signal()).await,
            Err(PipelineError::CircuitOpen)
        ));
    }

    #[tokio::test]
    async fn test_exit_admitted_while_circuit_open() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        breaker.record_failure();
        let (pipeline, mut rx) = pipeline(1, breaker);

        let exit = Signal::exit("BTC/USD", OrderSide::Sell, Size::new(dec!(0.01)));
        assert_eq!(pipeline.submit(exit).await.unwrap(), SubmitOutcome::Accepted);

        let order = rx.recv().await.unwrap();
        assert!(order.reduce_only);
        assert_eq!(order.priority, 100);
    }

    #[tokio::test]
    async fn test_halted_rejects_entries() {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
        let (mut pipeline, _rx) = pipeline(16, breaker);
        pipeline.halted = Arc::new(AtomicBool::new(true));

        assert!(matches!(
            pipeline.submit(entry_signal()).await,
            Err(PipelineError::IntakeHalted)
        ));
    }

    #[tokio::test]
    async fn test_gate_rejection_not_dispatched() {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
        let (pipeline, mut rx) = pipeline(1, breaker);

        // Below the 0.6 default floor.
        let weak = Signal::new(
            "BTC/USD",
            OrderSide::Buy,
            dec!(0.3),
            Size::new(dec!(0.01)),
            SignalReason::Momentum,
        );
        pipeline.submit(weak).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(pipeline.stats().gate_rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_invalid_confidence_rejected() {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
        let (pipeline, _rx) = pipeline(16, breaker);

        let mut bad = entry_signal();
        bad.confidence = dec!(1.5);
        assert!(matches!(
            pipeline.submit(bad).await,
            Err(PipelineError::InvalidSignal(_))
        ));
    }
}
