//! Intake-to-venue flow integration tests.
//!
//! Wires the pipeline, governor, and router against a mock venue and
//! verifies the circuit protects order entry while exits keep flowing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use keel_core::{
    DataSource, MarketTick, OrderRequest, OrderSide, Price, RetryPolicy, Signal, SignalReason,
    Size,
};
use keel_governor::{
    CircuitBreaker, CircuitState, EmergencyActions, GovernorEvent, GovernorService,
};
use keel_pipeline::{
    BatchConfig, CapitalProvider, CapitalSnapshot, GateConfig, PipelineError, RiskGate,
    SignalBatcher, SignalDeduper, SignalPipeline, SubmitOutcome,
};
use keel_router::{ExecutionOutcome, OrderRouter, RouterConfig, VenueTransport};
use keel_sync::{CachePolicy, StateCache, SyncError};

/// Venue that counts calls and fails on demand.
struct MockVenue {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl MockVenue {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VenueTransport for MockVenue {
    fn place_order(&self, order: &OrderRequest) -> BoxFuture<'_, Result<String, SyncError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = order.id.to_string();
        let fail = self.fail.load(Ordering::SeqCst);
        Box::pin(async move {
            if fail {
                Err(SyncError::Timeout)
            } else {
                Ok(format!("V-{id}"))
            }
        })
    }

    fn cancel_order(&self, _venue_order_id: &str) -> BoxFuture<'_, Result<(), SyncError>> {
        Box::pin(async move { Ok(()) })
    }
}

struct RichCapital;

impl CapitalProvider for RichCapital {
    fn capital_snapshot(&self) -> CapitalSnapshot {
        CapitalSnapshot::new(Decimal::from(100_000), Decimal::ZERO, 0, 0)
    }
}

struct NoopActions;

impl EmergencyActions for NoopActions {
    fn request_liquidation(&self) {}
}

struct Harness {
    pipeline: Arc<SignalPipeline>,
    router: Arc<OrderRouter>,
    venue: Arc<MockVenue>,
    governor: GovernorService,
    breaker: Arc<CircuitBreaker>,
    order_rx: mpsc::Receiver<OrderRequest>,
    outcome_rx: mpsc::Receiver<ExecutionOutcome>,
}

fn harness() -> Harness {
    harness_with_cooldown(30_000)
}

fn harness_with_cooldown(cooldown_ms: i64) -> Harness {
    let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
    let (governor, bus, halted) =
        GovernorService::new(Arc::clone(&breaker), Arc::new(NoopActions));

    let cache = Arc::new(StateCache::new(CachePolicy::default()));
    // Entries are priced from the cache at gate time.
    cache.update_tick(MarketTick::new(
        "BTC/USD",
        Price::new(dec!(50000)),
        Price::new(dec!(50010)),
        Price::new(dec!(50005)),
        DataSource::Stream,
    ));
    let (order_tx, order_rx) = mpsc::channel(32);
    let pipeline = Arc::new(SignalPipeline::new(
        SignalDeduper::new(cooldown_ms),
        // Size trigger of one flushes on every submit.
        SignalBatcher::new(BatchConfig {
            window: Duration::from_millis(50),
            max_size: 1,
        }),
        RiskGate::new(GateConfig {
            tradable_symbols: ["BTC/USD".to_string()].into_iter().collect(),
            ..GateConfig::default()
        }),
        Arc::new(RichCapital),
        cache,
        Arc::clone(&breaker),
        halted,
        order_tx,
    ));

    let venue = Arc::new(MockVenue::new());
    let (outcome_tx, outcome_rx) = mpsc::channel(32);
    let router = Arc::new(OrderRouter::new(
        RouterConfig {
            tradable_symbols: ["BTC/USD".to_string()].into_iter().collect(),
            ..RouterConfig::default()
        },
        Arc::clone(&venue) as Arc<dyn VenueTransport>,
        Arc::clone(&breaker),
        bus,
        RetryPolicy::fixed(1, Duration::from_millis(10), Duration::from_millis(10)),
        outcome_tx,
    ));

    Harness {
        pipeline,
        router,
        venue,
        governor,
        breaker,
        order_rx,
        outcome_rx,
    }
}

fn entry_signal() -> Signal {
    Signal::new(
        "BTC/USD",
        OrderSide::Buy,
        dec!(0.8),
        Size::new(dec!(0.5)),
        SignalReason::Momentum,
    )
}

#[tokio::test]
async fn test_signal_reaches_venue_and_reports_outcome() {
    let mut h = harness();
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&h.router).run(h.order_rx, shutdown.clone()));

    let outcome = h.pipeline.submit(entry_signal()).await.unwrap();
    assert_eq!(outcome, SubmitOutcome::Accepted);

    let outcome = timeout(Duration::from_secs(2), h.outcome_rx.recv())
        .await
        .expect("outcome within timeout")
        .expect("channel open");
    let result = outcome.result.expect("order placed");
    assert!(result.venue_order_id.starts_with("V-"));
    assert_eq!(h.venue.calls(), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_duplicate_signal_is_dropped_in_cooldown() {
    let h = harness();
    assert_eq!(
        h.pipeline.submit(entry_signal()).await.unwrap(),
        SubmitOutcome::Accepted
    );
    assert_eq!(
        h.pipeline.submit(entry_signal()).await.unwrap(),
        SubmitOutcome::Deduplicated
    );
}

#[tokio::test]
async fn test_open_circuit_rejects_entries_without_venue_contact() {
    let h = harness();

    // Five venue failures through the governor's single dispatch path.
    for _ in 0..5 {
        h.governor.dispatch(GovernorEvent::VenueFailure {
            context: "order".to_string(),
        });
    }
    assert_eq!(h.breaker.circuit_state().state, CircuitState::Open);

    // The sixth submission dies at intake; the venue is never touched.
    let err = h.pipeline.submit(entry_signal()).await.unwrap_err();
    assert!(matches!(err, PipelineError::CircuitOpen));
    assert_eq!(h.venue.calls(), 0);
}

#[tokio::test]
async fn test_exit_signal_bypasses_open_circuit() {
    let h = harness();
    for _ in 0..5 {
        h.governor.dispatch(GovernorEvent::VenueFailure {
            context: "order".to_string(),
        });
    }
    assert_eq!(h.breaker.circuit_state().state, CircuitState::Open);

    let exit = Signal::exit("BTC/USD", OrderSide::Sell, Size::new(dec!(0.5)));
    assert_eq!(
        h.pipeline.submit(exit).await.unwrap(),
        SubmitOutcome::Accepted
    );
}

#[tokio::test]
async fn test_venue_failures_open_circuit_through_router() {
    let mut h = harness_with_cooldown(0);
    h.venue.fail.store(true, Ordering::SeqCst);

    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&h.router).run(h.order_rx, shutdown.clone()));
    let governor_shutdown = shutdown.clone();
    tokio::spawn(h.governor.run(governor_shutdown));

    for _ in 0..5 {
        let exit = Signal::exit("BTC/USD", OrderSide::Sell, Size::new(dec!(0.5)));
        h.pipeline.submit(exit).await.unwrap();
        // Wait for the terminal failure before the next submission so
        // consecutive failures accumulate deterministically.
        timeout(Duration::from_secs(2), h.outcome_rx.recv())
            .await
            .expect("outcome within timeout")
            .expect("channel open")
            .result
            .unwrap_err();
    }

    timeout(Duration::from_secs(2), async {
        loop {
            if h.breaker.circuit_state().state == CircuitState::Open {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("circuit opens after repeated venue failures");

    shutdown.cancel();
}
