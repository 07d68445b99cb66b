//! Order execution with a bounded worker pool.
//!
//! Orders queue by priority, execute through a venue transport under a
//! tokio `Semaphore` (never more than `max_concurrency` in flight), with
//! a per-call timeout and the shared retry policy. Transient failures
//! retry with backoff; permanent ones surface immediately. Every terminal
//! outcome is reported to the governor bus and the outcome channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use keel_core::{ClientOrderId, OrderRequest, RetryPolicy, Size};
use keel_governor::{CircuitBreaker, CircuitState, GovernorBus, GovernorEvent};
use keel_sync::{RestClient, SyncResult};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RouterError, RouterResult};
use crate::queue::OrderQueue;
use crate::stats::RouterStats;

/// Venue order entry, abstracted for tests.
pub trait VenueTransport: Send + Sync {
    fn place_order(&self, order: &OrderRequest) -> BoxFuture<'_, SyncResult<String>>;
    fn cancel_order(&self, venue_order_id: &str) -> BoxFuture<'_, SyncResult<()>>;
}

impl VenueTransport for RestClient {
    fn place_order(&self, order: &OrderRequest) -> BoxFuture<'_, SyncResult<String>> {
        let order = order.clone();
        Box::pin(async move { RestClient::place_order(self, &order).await })
    }

    fn cancel_order(&self, venue_order_id: &str) -> BoxFuture<'_, SyncResult<()>> {
        let id = venue_order_id.to_string();
        Box::pin(async move { RestClient::cancel_order(self, &id).await })
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum concurrent venue submissions.
    pub max_concurrency: usize,
    /// Per-call timeout.
    pub call_timeout: Duration,
    /// Minimum acceptable order size.
    pub min_order_size: Size,
    /// Maximum acceptable order size.
    pub max_order_size: Size,
    /// Symbols the venue currently accepts orders for. Checked here as
    /// well as in the risk gate, since exit orders skip the gate.
    pub tradable_symbols: HashSet<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            call_timeout: Duration::from_secs(10),
            min_order_size: Size::ZERO,
            max_order_size: Size::new(rust_decimal::Decimal::from(1_000_000)),
            tradable_symbols: HashSet::new(),
        }
    }
}

/// Successful execution summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub client_id: ClientOrderId,
    pub venue_order_id: String,
    pub attempts: u32,
    pub latency_ms: u64,
}

/// Terminal outcome of one order, delivered on the outcome channel.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub order: OrderRequest,
    pub result: RouterResult<ExecutionResult>,
}

pub struct OrderRouter {
    config: RouterConfig,
    transport: Arc<dyn VenueTransport>,
    breaker: Arc<CircuitBreaker>,
    bus: GovernorBus,
    retry: RetryPolicy,
    queue: OrderQueue,
    stats: Arc<RouterStats>,
    semaphore: Arc<Semaphore>,
    /// Wakes the drain loop when a worker slot frees up.
    slot_freed: Arc<Notify>,
    outcome_tx: mpsc::Sender<ExecutionOutcome>,
}

impl OrderRouter {
    pub fn new(
        config: RouterConfig,
        transport: Arc<dyn VenueTransport>,
        breaker: Arc<CircuitBreaker>,
        bus: GovernorBus,
        retry: RetryPolicy,
        outcome_tx: mpsc::Sender<ExecutionOutcome>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            config,
            transport,
            breaker,
            bus,
            retry,
            queue: OrderQueue::new(),
            stats: Arc::new(RouterStats::new()),
            semaphore,
            slot_freed: Arc::new(Notify::new()),
            outcome_tx,
        }
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        Arc::clone(&self.stats)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Cancel a queued order. In-flight orders complete; returns false
    /// for those and for unknown ids.
    pub fn cancel(&self, id: &ClientOrderId) -> bool {
        self.queue.cancel(id)
    }

    /// Execute one order end to end, waiting for a worker slot.
    pub async fn execute(&self, order: OrderRequest) -> RouterResult<ExecutionResult> {
        self.validate(&order)?;

        if !self.breaker.allow_request() {
            return Err(RouterError::CircuitOpen);
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RouterError::Cancelled)?;
        self.execute_with_permit(order, permit).await
    }

    /// Consume the inbound order channel, queueing and draining under the
    /// concurrency bound, until cancelled.
    pub async fn run(self: Arc<Self>, mut orders: mpsc::Receiver<OrderRequest>, shutdown: CancellationToken) {
        info!(
            max_concurrency = self.config.max_concurrency,
            "order router started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(pending = self.queue.len(), "order router stopping");
                    return;
                }
                order = orders.recv() => {
                    match order {
                        Some(order) => self.queue.push(order),
                        None => {
                            info!(pending = self.queue.len(), "order channel closed");
                            return;
                        }
                    }
                }
                () = self.slot_freed.notified() => {}
            }

            self.drain();
        }
    }

    /// Spawn executions for queued orders while worker slots are free.
    fn drain(self: &Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                return;
            };
            let Some(order) = self.queue.pop() else {
                return;
            };

            let this = Arc::clone(self);
            tokio::spawn(async move {
                let result = if this.breaker.allow_request() {
                    match this.validate(&order) {
                        Ok(()) => this.execute_with_permit(order.clone(), permit).await,
                        Err(e) => Err(e),
                    }
                } else {
                    Err(RouterError::CircuitOpen)
                };

                this.slot_freed.notify_one();
                let outcome = ExecutionOutcome { order, result };
                if this.outcome_tx.send(outcome).await.is_err() {
                    warn!("outcome receiver dropped");
                }
            });
        }
    }

    async fn execute_with_permit(
        &self,
        order: OrderRequest,
        _permit: OwnedSemaphorePermit,
    ) -> RouterResult<ExecutionResult> {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);

        let result = self
            .retry
            .run(
                || {
                    let order = &order;
                    let attempts = &attempts;
                    async move {
                        // In-flight orders finish their current attempt,
                        // but a retry is a new submission: once the
                        // circuit opens, stop here.
                        if attempts.load(Ordering::Relaxed) > 0
                            && self.breaker.circuit_state().state == CircuitState::Open
                        {
                            return Err(RouterError::CircuitOpen);
                        }
                        let n = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                        if n > 1 {
                            self.stats.record_retry();
                        }
                        // The transport acquires its nonce immediately
                        // before signing, inside this call.
                        match tokio::time::timeout(
                            self.config.call_timeout,
                            self.transport.place_order(order),
                        )
                        .await
                        {
                            Ok(Ok(venue_id)) => Ok(venue_id),
                            Ok(Err(e)) => Err(RouterError::Venue(e)),
                            Err(_) => Err(RouterError::Timeout),
                        }
                    }
                },
                RouterError::classify,
            )
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let attempts = attempts.load(Ordering::Relaxed);

        match result {
            Ok(venue_order_id) => {
                self.stats.record_success(latency_ms);
                self.bus.emit(GovernorEvent::VenueSuccess);
                debug!(
                    client_id = %order.id,
                    venue_order_id = %venue_order_id,
                    attempts,
                    latency_ms,
                    "order executed"
                );
                Ok(ExecutionResult {
                    client_id: order.id,
                    venue_order_id,
                    attempts,
                    latency_ms,
                })
            }
            Err(e) => {
                self.stats
                    .record_failure(matches!(e, RouterError::Timeout));
                self.bus.emit(GovernorEvent::VenueFailure {
                    context: format!("order {}: {e}", order.id),
                });
                warn!(client_id = %order.id, attempts, ?e, "order failed");
                Err(e)
            }
        }
    }

    fn validate(&self, order: &OrderRequest) -> RouterResult<()> {
        if !self.config.tradable_symbols.contains(&order.symbol) {
            return Err(RouterError::Validation(format!(
                "symbol {} not tradable",
                order.symbol
            )));
        }
        if !order.size.is_positive() {
            return Err(RouterError::Validation("non-positive size".to_string()));
        }
        if order.size < self.config.min_order_size {
            return Err(RouterError::Validation(format!(
                "size {} below minimum {}",
                order.size, self.config.min_order_size
            )));
        }
        if order.size > self.config.max_order_size {
            return Err(RouterError::Validation(format!(
                "size {} above maximum {}",
                order.size, self.config.max_order_size
            )));
        }
        Ok(())
    }
}
