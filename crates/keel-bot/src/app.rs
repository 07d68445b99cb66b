//! Application composition root.
//!
//! Every long-lived component is constructed exactly once here and
//! injected into its collaborators; nothing reaches for a global. The
//! wiring follows the data path: stream events feed state sync, exit
//! signals feed the pipeline, orders feed the router, and execution
//! updates close the loop back into the position ledger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use keel_core::{
    AccountBalance, ClientOrderId, OrderFill, OrderRequest, Price, RetryPolicy, Signal,
};
use keel_governor::{
    CircuitBreaker, CircuitSnapshot, CircuitState, EmergencyActions, GovernorBus, GovernorEvent,
    GovernorService, HealthMonitor, HealthProbe, HealthSnapshot,
};
use keel_nonce::{NonceSequencer, SystemClock};
use keel_persistence::{FileCheckpointStore, PositionSnapshotStore};
use keel_pipeline::{
    CapitalProvider, CapitalSnapshot, RiskGate, SignalBatcher, SignalDeduper, SignalPipeline,
    SubmitOutcome,
};
use keel_position::{
    CapitalConfig, CapitalTracker, Position, PositionLedger, PositionMonitor, PriceSource,
};
use keel_router::{ExecutionOutcome, OrderRouter, VenueTransport};
use keel_sync::{PollService, RestClient, StateCache, StateSyncService, SyncHealth};
use keel_telemetry::Metrics;
use keel_ws::{
    ConnectionManager, ExecutionUpdate, SessionTokenProvider, StreamEvent, StreamHealth,
};

use crate::config::AppConfig;
use crate::error::AppResult;

/// Position monitor price feed, read from the fresher cache plane.
struct CachePrices {
    cache: Arc<StateCache>,
}

impl PriceSource for CachePrices {
    fn price(&self, symbol: &str) -> Option<Price> {
        let read = self.cache.get_ticker(symbol)?;
        if read.stale {
            return None;
        }
        read.value.mid().or(Some(read.value.last))
    }
}

/// Capital view for the risk gate: free balance from the cache, deployed
/// capital and loss streak from position accounting.
struct AppCapital {
    cache: Arc<StateCache>,
    ledger: Arc<PositionLedger>,
    capital: Arc<CapitalTracker>,
    quote_asset: String,
}

impl CapitalProvider for AppCapital {
    fn capital_snapshot(&self) -> CapitalSnapshot {
        let available = self
            .cache
            .get_balance(&self.quote_asset)
            .map(|read| read.value.free.inner())
            .unwrap_or(Decimal::ZERO);
        CapitalSnapshot::new(
            available,
            self.ledger.deployed_capital(),
            self.ledger.open_count(),
            self.capital.consecutive_losses(),
        )
    }
}

/// Emergency liquidation goes through the monitor so exit orders take the
/// normal signal and router paths.
struct LiquidationActions {
    monitor: Arc<PositionMonitor>,
}

impl EmergencyActions for LiquidationActions {
    fn request_liquidation(&self) {
        let monitor = Arc::clone(&self.monitor);
        tokio::spawn(async move {
            monitor.request_liquidation().await;
        });
    }
}

/// Health probe over the live components.
struct AppProbe {
    cache: Arc<StateCache>,
    capital: Arc<CapitalTracker>,
    router: Arc<OrderRouter>,
    stream_health: watch::Receiver<StreamHealth>,
}

impl HealthProbe for AppProbe {
    fn data_age_ms(&self) -> Option<i64> {
        self.cache.freshest_ticker_age_ms()
    }

    fn daily_realized_loss(&self) -> Decimal {
        self.capital.daily_realized_loss()
    }

    fn queue_depth(&self) -> usize {
        self.router.queue_depth()
    }

    fn router_consecutive_failures(&self) -> u32 {
        self.router.stats().consecutive_failures()
    }

    fn reconnect_exhausted(&self) -> bool {
        *self.stream_health.borrow() == StreamHealth::Disconnected
    }
}

/// The assembled application.
pub struct Application {
    config: AppConfig,
    shutdown: CancellationToken,

    cache: Arc<StateCache>,
    ledger: Arc<PositionLedger>,
    capital: Arc<CapitalTracker>,
    nonces: Arc<NonceSequencer<SystemClock>>,
    snapshot_store: PositionSnapshotStore,

    breaker: Arc<CircuitBreaker>,
    halted: Arc<AtomicBool>,
    bus: GovernorBus,
    governor: GovernorService,
    health: Arc<HealthMonitor>,

    ws: Arc<ConnectionManager>,
    sync: Arc<StateSyncService>,
    poll: Arc<PollService>,
    pipeline: Arc<SignalPipeline>,
    router: Arc<OrderRouter>,
    monitor: Arc<PositionMonitor>,

    event_rx: mpsc::Receiver<StreamEvent>,
    execution_rx: mpsc::Receiver<ExecutionUpdate>,
    signal_rx: mpsc::Receiver<Signal>,
    order_rx: mpsc::Receiver<OrderRequest>,
    outcome_rx: mpsc::Receiver<ExecutionOutcome>,
}

impl Application {
    /// Construct every component and wire the channels.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        let data_dir = std::path::PathBuf::from(&config.persistence.data_dir);
        std::fs::create_dir_all(&data_dir)?;

        // Durable state first: nonce checkpoint and position snapshot.
        let checkpoint = FileCheckpointStore::new(data_dir.join("nonce_checkpoint.json"))?;
        let nonces = Arc::new(NonceSequencer::with_system_clock(Box::new(checkpoint))?);
        let snapshot_store = PositionSnapshotStore::new(data_dir.join("positions.json"))?;

        let retry = RetryPolicy::from(&config.retry);

        // Sync plane: REST client, dual-plane cache, poll loop.
        let rest = Arc::new(RestClient::new(config.rest_config(), Arc::clone(&nonces))?);
        let cache = Arc::new(StateCache::new(config.cache.clone().into()));
        let poll = Arc::new(PollService::new(
            config.poll_config(),
            Arc::clone(&rest),
            Arc::clone(&cache),
            retry.clone(),
        ));
        let (execution_tx, execution_rx) = mpsc::channel(256);
        let sync = Arc::new(StateSyncService::new(
            Arc::clone(&cache),
            execution_tx,
            poll.force_handle(),
        ));

        // Stream plane.
        let (event_tx, event_rx) = mpsc::channel(1024);
        let token_provider = if config.has_credentials() {
            Some(Arc::clone(&rest) as Arc<dyn SessionTokenProvider>)
        } else {
            None
        };
        let (ws, stream_health) =
            ConnectionManager::new(config.connection_config(), event_tx, token_provider)?;
        let ws = Arc::new(ws);

        // Positions and capital.
        let ledger = Arc::new(PositionLedger::new());
        let restored = ledger.restore_snapshot(&snapshot_store);
        if restored > 0 {
            info!(count = restored, "restored open positions from snapshot");
        }
        let capital = Arc::new(CapitalTracker::new(
            CapitalConfig {
                journal_buffer_size: config.persistence.journal_buffer_size,
            },
            data_dir.join("journal"),
        ));
        let (signal_tx, signal_rx) = mpsc::channel(256);
        let prices: Arc<dyn PriceSource> = Arc::new(CachePrices {
            cache: Arc::clone(&cache),
        });
        let monitor = Arc::new(PositionMonitor::new(
            (&config.monitor).into(),
            config.exit.clone(),
            Arc::clone(&ledger),
            prices,
            Arc::clone(&capital),
            signal_tx,
        ));

        // Governor: breaker, event dispatch, halt flag.
        let breaker = Arc::new(CircuitBreaker::new(
            config.governor.failure_threshold,
            Duration::from_secs(config.governor.cooldown_secs),
        ));
        let actions: Arc<dyn EmergencyActions> = Arc::new(LiquidationActions {
            monitor: Arc::clone(&monitor),
        });
        let (governor, bus, halted) = GovernorService::new(Arc::clone(&breaker), actions);

        // Intake and execution.
        let (order_tx, order_rx) = mpsc::channel(128);
        let capital_provider: Arc<dyn CapitalProvider> = Arc::new(AppCapital {
            cache: Arc::clone(&cache),
            ledger: Arc::clone(&ledger),
            capital: Arc::clone(&capital),
            quote_asset: config.venue.quote_asset.clone(),
        });
        let pipeline = Arc::new(SignalPipeline::new(
            SignalDeduper::new(config.pipeline.dedup_cooldown_ms),
            SignalBatcher::new((&config.pipeline).into()),
            RiskGate::new(config.gate.to_gate_config(&config.venue.symbols)),
            capital_provider,
            Arc::clone(&cache),
            Arc::clone(&breaker),
            Arc::clone(&halted),
            order_tx,
        ));

        let (outcome_tx, outcome_rx) = mpsc::channel(128);
        let router = Arc::new(OrderRouter::new(
            config.router.to_router_config(&config.venue.symbols),
            Arc::clone(&rest) as Arc<dyn VenueTransport>,
            Arc::clone(&breaker),
            bus.clone(),
            retry,
            outcome_tx,
        ));

        let probe: Arc<dyn HealthProbe> = Arc::new(AppProbe {
            cache: Arc::clone(&cache),
            capital: Arc::clone(&capital),
            router: Arc::clone(&router),
            stream_health,
        });
        let health = Arc::new(HealthMonitor::new(
            (&config.governor).into(),
            probe,
            Arc::clone(&breaker),
            bus.clone(),
        ));

        Ok(Self {
            config,
            shutdown: CancellationToken::new(),
            cache,
            ledger,
            capital,
            nonces,
            snapshot_store,
            breaker,
            halted,
            bus,
            governor,
            health,
            ws,
            sync,
            poll,
            pipeline,
            router,
            monitor,
            event_rx,
            execution_rx,
            signal_rx,
            order_rx,
            outcome_rx,
        })
    }

    /// Submit an external signal into the pipeline.
    pub async fn submit_signal(&self, signal: Signal) -> AppResult<SubmitOutcome> {
        Ok(self.pipeline.submit(signal).await?)
    }

    /// Freshest balance for an asset, if either plane has one.
    pub fn get_balance(&self, asset: &str) -> Option<AccountBalance> {
        self.cache.get_balance(asset).map(|read| read.value)
    }

    /// Current position for a symbol.
    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.ledger.get(symbol)
    }

    /// Circuit breaker snapshot.
    pub fn get_circuit_state(&self) -> CircuitSnapshot {
        self.breaker.circuit_state()
    }

    /// Point-in-time health across components.
    pub fn get_health_snapshot(&self) -> HealthSnapshot {
        self.health.health_snapshot()
    }

    /// Stream-versus-poll data health.
    pub fn get_sync_health(&self) -> SyncHealth {
        self.sync.health()
    }

    /// Run until a shutdown signal, then persist state and exit.
    pub async fn run(self) -> AppResult<()> {
        let Self {
            config,
            shutdown,
            cache: _cache,
            ledger,
            capital,
            nonces,
            snapshot_store,
            breaker,
            halted,
            bus,
            governor,
            health,
            ws,
            sync,
            poll,
            pipeline,
            router,
            monitor,
            event_rx,
            mut execution_rx,
            mut signal_rx,
            order_rx,
            mut outcome_rx,
        } = self;

        info!(
            symbols = ?config.venue.symbols,
            credentials = config.has_credentials(),
            "starting keel"
        );

        // Stream connection. Budget exhaustion is catastrophic: the
        // governor halts intake and liquidates.
        {
            let ws = Arc::clone(&ws);
            let bus = bus.clone();
            tokio::spawn(async move {
                if let Err(e) = ws.run().await {
                    error!(error = %e, "stream connection ended");
                    bus.emit(GovernorEvent::ReconnectBudgetExhausted);
                }
            });
        }

        {
            let sync = Arc::clone(&sync);
            let token = shutdown.clone();
            tokio::spawn(async move { sync.run(event_rx, token).await });
        }
        {
            let poll = Arc::clone(&poll);
            let token = shutdown.clone();
            tokio::spawn(async move { poll.run(token).await });
        }
        {
            let token = shutdown.clone();
            tokio::spawn(governor.run(token));
        }
        {
            let health = Arc::clone(&health);
            let token = shutdown.clone();
            tokio::spawn(async move { health.run(token).await });
        }
        {
            let pipeline = Arc::clone(&pipeline);
            let token = shutdown.clone();
            tokio::spawn(async move { pipeline.run(token).await });
        }
        {
            let token = shutdown.clone();
            tokio::spawn(Arc::clone(&router).run(order_rx, token));
        }
        {
            let monitor = Arc::clone(&monitor);
            let token = shutdown.clone();
            tokio::spawn(async move { monitor.run(token).await });
        }

        // Execution updates become fills against the ledger.
        {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move {
                while let Some(update) = execution_rx.recv().await {
                    handle_execution_update(&monitor, update);
                }
            });
        }

        // Monitor-generated exit signals re-enter through the pipeline.
        {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                while let Some(signal) = signal_rx.recv().await {
                    let symbol = signal.symbol.clone();
                    if let Err(e) = pipeline.submit(signal).await {
                        warn!(%symbol, error = %e, "exit signal rejected");
                    }
                }
            });
        }

        // Terminal router outcomes.
        {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move {
                while let Some(outcome) = outcome_rx.recv().await {
                    handle_execution_outcome(&monitor, outcome);
                }
            });
        }

        let mut housekeeping = tokio::time::interval(Duration::from_secs(
            config.persistence.snapshot_interval_secs.max(1),
        ));
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("shutdown signal received"),
                        Err(e) => error!(error = %e, "signal handler failed"),
                    }
                    break;
                }
                _ = housekeeping.tick() => {
                    if let Err(e) = ledger.save_snapshot(&snapshot_store) {
                        warn!(error = %e, "position snapshot failed");
                    }
                    if let Err(e) = nonces.maybe_checkpoint() {
                        warn!(error = %e, "nonce checkpoint failed");
                    }
                    publish_gauges(&breaker, &ledger, &capital);
                }
            }
        }

        // Shutdown ordering: stop intake, stop tasks, then persist.
        halted.store(true, Ordering::Release);
        ws.shutdown();
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;

        nonces.checkpoint()?;
        ledger.save_snapshot(&snapshot_store)?;
        capital.flush()?;
        info!("shutdown complete");
        Ok(())
    }

    /// Cancellation handle, for embedding and tests.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Convert a filled execution update into a ledger fill.
fn handle_execution_update(monitor: &PositionMonitor, update: ExecutionUpdate) {
    if update.status != "filled" {
        Metrics::order_outcome(&update.status);
        return;
    }
    let fill = OrderFill {
        order_id: ClientOrderId::from_string(update.order_id),
        symbol: update.symbol,
        side: update.side,
        size: update.filled_size,
        price: update.avg_price,
        fee: update.fee,
        filled_at: update.received_at,
    };
    match monitor.apply_fill(&fill) {
        Ok(Some(closed)) => {
            info!(
                symbol = %closed.symbol,
                pnl = %closed.realized_pnl,
                reason = %closed.exit_reason.map(|r| r.to_string()).unwrap_or_else(|| "unspecified".to_string()),
                "position closed"
            );
        }
        Ok(None) => {}
        Err(e) => warn!(symbol = %fill.symbol, error = %e, "fill not applied"),
    }
}

/// Record a terminal router outcome against positions and metrics.
fn handle_execution_outcome(monitor: &PositionMonitor, outcome: ExecutionOutcome) {
    match outcome.result {
        Ok(result) => {
            Metrics::order_outcome("success");
            Metrics::order_latency(result.latency_ms as f64);
            if outcome.order.reduce_only {
                if let Err(e) = monitor.mark_exit_submitted(&outcome.order.symbol) {
                    warn!(symbol = %outcome.order.symbol, error = %e, "exit submission not recorded");
                }
            }
        }
        Err(e) => {
            Metrics::order_outcome("failure");
            warn!(order_id = %outcome.order.id, error = %e, "order failed terminally");
        }
    }
}

fn publish_gauges(breaker: &CircuitBreaker, ledger: &PositionLedger, capital: &CapitalTracker) {
    let state = match breaker.circuit_state().state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    };
    Metrics::circuit_state(state);
    Metrics::open_positions(ledger.open_count() as i64);
    Metrics::realized_pnl(capital.daily_realized_pnl().to_f64().unwrap_or(0.0));
}
