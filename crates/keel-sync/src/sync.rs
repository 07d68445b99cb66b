//! The StateSync service: stream-event consumer and health reporting.
//!
//! Consumes parsed [`StreamEvent`]s in arrival order, applies ticks and
//! balances to the caches, forwards execution updates to the order router,
//! and answers freshness queries from the failure governor. A stream/poll
//! mismatch triggers an immediate out-of-band poll via the poll service's
//! force handle.

use std::sync::Arc;

use keel_ws::{ExecutionUpdate, StreamEvent};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::StateCache;

/// Data-layer health, derived from cache freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHealth {
    /// Fresh data within thresholds.
    Fresh,
    /// Data present but past its threshold; trading should be cautious.
    Degraded,
    /// No usable data at all.
    Disconnected,
}

/// Stream-event consumer and cache owner.
pub struct StateSyncService {
    cache: Arc<StateCache>,
    /// Forwarded private execution updates (consumed by the router).
    execution_tx: mpsc::Sender<ExecutionUpdate>,
    /// Poll service wake handle for mismatch repair.
    force_poll: Arc<Notify>,
}

impl StateSyncService {
    pub fn new(
        cache: Arc<StateCache>,
        execution_tx: mpsc::Sender<ExecutionUpdate>,
        force_poll: Arc<Notify>,
    ) -> Self {
        Self {
            cache,
            execution_tx,
            force_poll,
        }
    }

    pub fn cache(&self) -> Arc<StateCache> {
        Arc::clone(&self.cache)
    }

    /// Current health from the freshest ticker age.
    ///
    /// Fresh below the ticker threshold, degraded up to three times it,
    /// disconnected beyond that or with no data.
    pub fn health(&self) -> SyncHealth {
        let threshold = self.cache.policy().ticker_stale_ms;
        match self.cache.freshest_ticker_age_ms() {
            Some(age) if age <= threshold => SyncHealth::Fresh,
            Some(age) if age <= threshold * 3 => SyncHealth::Degraded,
            Some(_) => SyncHealth::Disconnected,
            None => SyncHealth::Disconnected,
        }
    }

    /// Consume stream events until the channel closes or shutdown.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<StreamEvent>,
        shutdown: CancellationToken,
    ) {
        info!("state sync started");

        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("state sync stopping");
                    return;
                }
                event = events.recv() => match event {
                    Some(e) => e,
                    None => {
                        warn!("stream event channel closed");
                        return;
                    }
                },
            };

            self.apply(event).await;
        }
    }

    /// Apply one event. Events are applied strictly in arrival order.
    pub async fn apply(&self, event: StreamEvent) {
        match event {
            StreamEvent::Tick(tick) => {
                if let Some(mismatch) = self.cache.update_tick(tick) {
                    warn!(
                        symbol = %mismatch.key,
                        divergence_bps = mismatch.divergence_bps,
                        "forcing out-of-band poll after mismatch"
                    );
                    self.force_poll.notify_one();
                }
            }
            StreamEvent::Balance(balance) => {
                self.cache.update_balance(balance);
            }
            StreamEvent::Execution(update) => {
                if self.execution_tx.send(update).await.is_err() {
                    warn!("execution receiver dropped");
                }
            }
            StreamEvent::Heartbeat => {}
            StreamEvent::SubscriptionAck {
                channel,
                success,
                error,
            } => {
                if success {
                    debug!(%channel, "subscription confirmed");
                } else {
                    warn!(%channel, ?error, "subscription failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use chrono::{Duration as ChronoDuration, Utc};
    use keel_core::{DataSource, MarketTick, Price};
    use rust_decimal_macros::dec;

    fn service() -> (StateSyncService, mpsc::Receiver<ExecutionUpdate>, Arc<Notify>) {
        let cache = Arc::new(StateCache::new(CachePolicy::default()));
        let (tx, rx) = mpsc::channel(16);
        let force = Arc::new(Notify::new());
        (
            StateSyncService::new(cache, tx, Arc::clone(&force)),
            rx,
            force,
        )
    }

    fn tick(last: Price, source: DataSource, age_ms: i64) -> MarketTick {
        let mut t = MarketTick::new("BTC/USD", last, last, last, source);
        t.timestamp = Utc::now() - ChronoDuration::milliseconds(age_ms);
        t
    }

    #[tokio::test]
    async fn test_tick_applied_to_cache() {
        let (svc, _rx, _force) = service();
        svc.apply(StreamEvent::Tick(tick(
            Price::new(dec!(100)),
            DataSource::Stream,
            0,
        )))
        .await;

        let read = svc.cache().get_ticker("BTC/USD").unwrap();
        assert_eq!(read.value.last, Price::new(dec!(100)));
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let (svc, _rx, _force) = service();
        assert_eq!(svc.health(), SyncHealth::Disconnected);

        svc.apply(StreamEvent::Tick(tick(
            Price::new(dec!(100)),
            DataSource::Stream,
            0,
        )))
        .await;
        assert_eq!(svc.health(), SyncHealth::Fresh);

        // 10s-old data with a 5s threshold: degraded, not disconnected.
        let cache = Arc::new(StateCache::new(CachePolicy::default()));
        cache.update_tick(tick(Price::new(dec!(100)), DataSource::Stream, 10_000));
        let (tx, _rx2) = mpsc::channel(16);
        let svc2 = StateSyncService::new(cache, tx, Arc::new(Notify::new()));
        assert_eq!(svc2.health(), SyncHealth::Degraded);
    }

    #[tokio::test]
    async fn test_mismatch_forces_poll() {
        let (svc, _rx, force) = service();

        svc.apply(StreamEvent::Tick(tick(
            Price::new(dec!(100)),
            DataSource::Stream,
            0,
        )))
        .await;
        svc.apply(StreamEvent::Tick(tick(
            Price::new(dec!(110)),
            DataSource::Poll,
            0,
        )))
        .await;

        // notify_one stored a permit; this completes immediately.
        tokio::time::timeout(std::time::Duration::from_secs(1), force.notified())
            .await
            .expect("forced poll was not requested");
    }

    #[tokio::test]
    async fn test_execution_forwarded() {
        let (svc, mut rx, _force) = service();

        let update = ExecutionUpdate {
            order_id: "V123".to_string(),
            symbol: "BTC/USD".to_string(),
            side: keel_core::OrderSide::Buy,
            status: "filled".to_string(),
            filled_size: keel_core::Size::new(dec!(1)),
            avg_price: Price::new(dec!(100)),
            fee: Price::new(dec!(0.1)),
            received_at: Utc::now(),
        };
        svc.apply(StreamEvent::Execution(update.clone())).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received, update);
    }
}
