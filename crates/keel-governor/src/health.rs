//! Periodic health sampling and catastrophic-threshold detection.
//!
//! The monitor owns no component state; it samples collaborators through
//! [`HealthProbe`] and emits [`GovernorEvent`]s on threshold crossings.
//! Emissions are edge-triggered so a persistent condition produces one
//! event, not one per sample.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::breaker::{CircuitBreaker, CircuitSnapshot};
use crate::events::{GovernorBus, GovernorEvent};

/// Read-only view over the components the monitor samples, implemented by
/// the composition root.
pub trait HealthProbe: Send + Sync {
    /// Age of the freshest market data, `None` when nothing was received.
    fn data_age_ms(&self) -> Option<i64>;
    /// Realized loss today as a non-negative magnitude.
    fn daily_realized_loss(&self) -> Decimal;
    /// Orders waiting in the router queue.
    fn queue_depth(&self) -> usize;
    /// Router failures since the last success.
    fn router_consecutive_failures(&self) -> u32;
    /// The streaming client exhausted its reconnect budget.
    fn reconnect_exhausted(&self) -> bool;
}

/// Sampling cadence and catastrophic thresholds.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub sample_interval: Duration,
    /// Data older than this is degraded.
    pub data_stale_ms: i64,
    /// Data older than this (or absent for this long) is catastrophic.
    pub data_dead_ms: i64,
    /// Daily realized loss magnitude that triggers emergency shutdown.
    pub daily_loss_limit: Decimal,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            data_stale_ms: 10_000,
            data_dead_ms: 120_000,
            daily_loss_limit: Decimal::from(500),
        }
    }
}

/// Point-in-time system health, exposed to collaborators.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub data_age_ms: Option<i64>,
    pub daily_realized_loss: Decimal,
    pub queue_depth: usize,
    pub router_consecutive_failures: u32,
    pub circuit: CircuitSnapshot,
}

/// The sampling loop.
pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn HealthProbe>,
    breaker: Arc<CircuitBreaker>,
    bus: GovernorBus,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        probe: Arc<dyn HealthProbe>,
        breaker: Arc<CircuitBreaker>,
        bus: GovernorBus,
    ) -> Self {
        Self {
            config,
            probe,
            breaker,
            bus,
        }
    }

    /// Current snapshot (also usable outside the loop).
    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            data_age_ms: self.probe.data_age_ms(),
            daily_realized_loss: self.probe.daily_realized_loss(),
            queue_depth: self.probe.queue_depth(),
            router_consecutive_failures: self.probe.router_consecutive_failures(),
            circuit: self.breaker.circuit_state(),
        }
    }

    /// Run the sampling loop until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.sample_interval.as_millis() as u64,
            "health monitor started"
        );

        let mut was_stale = false;
        let mut loss_reported = false;
        let mut exhaustion_reported = false;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("health monitor stopping");
                    return;
                }
                () = tokio::time::sleep(self.config.sample_interval) => {}
            }

            self.sample(&mut was_stale, &mut loss_reported, &mut exhaustion_reported);
        }
    }

    /// One sampling pass with edge-triggered emission.
    fn sample(
        &self,
        was_stale: &mut bool,
        loss_reported: &mut bool,
        exhaustion_reported: &mut bool,
    ) {
        let snapshot = self.health_snapshot();
        debug!(?snapshot, "health sample");

        // Staleness edges.
        let age = snapshot.data_age_ms;
        let stale = age.map(|a| a > self.config.data_stale_ms).unwrap_or(true);
        if stale && !*was_stale {
            self.bus.emit(GovernorEvent::DataStale {
                age_ms: age.unwrap_or(i64::MAX),
            });
        } else if !stale && *was_stale {
            self.bus.emit(GovernorEvent::DataRecovered);
        }
        *was_stale = stale;

        // Sustained zero fresh data is catastrophic.
        if age.map(|a| a > self.config.data_dead_ms).unwrap_or(false) {
            self.bus.emit(GovernorEvent::EmergencyShutdown {
                reason: format!("no fresh data for {}ms", age.unwrap_or(0)),
            });
        }

        if !*loss_reported && snapshot.daily_realized_loss >= self.config.daily_loss_limit {
            self.bus.emit(GovernorEvent::DailyLossLimitBreached {
                loss: snapshot.daily_realized_loss,
            });
            *loss_reported = true;
        }

        if !*exhaustion_reported && self.probe.reconnect_exhausted() {
            self.bus.emit(GovernorEvent::ReconnectBudgetExhausted);
            *exhaustion_reported = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EmergencyActions, GovernorService};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct FakeProbe {
        data_age_ms: Mutex<Option<i64>>,
        loss: Mutex<Decimal>,
        exhausted: Mutex<bool>,
    }

    impl HealthProbe for FakeProbe {
        fn data_age_ms(&self) -> Option<i64> {
            *self.data_age_ms.lock()
        }
        fn daily_realized_loss(&self) -> Decimal {
            *self.loss.lock()
        }
        fn queue_depth(&self) -> usize {
            0
        }
        fn router_consecutive_failures(&self) -> u32 {
            0
        }
        fn reconnect_exhausted(&self) -> bool {
            *self.exhausted.lock()
        }
    }

    struct NoopActions;
    impl EmergencyActions for NoopActions {
        fn request_liquidation(&self) {}
    }

    fn monitor(probe: Arc<FakeProbe>) -> (HealthMonitor, GovernorService) {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
        let (svc, bus, _halted) = GovernorService::new(Arc::clone(&breaker), Arc::new(NoopActions));
        (
            HealthMonitor::new(HealthConfig::default(), probe, breaker, bus),
            svc,
        )
    }

    fn run_sample(mon: &HealthMonitor, state: &mut (bool, bool, bool)) {
        mon.sample(&mut state.0, &mut state.1, &mut state.2);
    }

    #[tokio::test]
    async fn test_staleness_edge_triggered() {
        let probe = Arc::new(FakeProbe::default());
        *probe.data_age_ms.lock() = Some(50_000);
        let (mon, mut svc) = monitor(Arc::clone(&probe));
        let mut state = (false, false, false);

        run_sample(&mon, &mut state);
        run_sample(&mon, &mut state);

        // One DataStale despite two stale samples.
        let first = svc.rx.recv().await.unwrap();
        assert!(matches!(first, GovernorEvent::DataStale { .. }));
        assert!(svc.rx.try_recv().is_err());

        // Recovery emits once.
        *probe.data_age_ms.lock() = Some(100);
        run_sample(&mon, &mut state);
        assert_eq!(svc.rx.recv().await.unwrap(), GovernorEvent::DataRecovered);
    }

    #[tokio::test]
    async fn test_loss_limit_emitted_once() {
        let probe = Arc::new(FakeProbe::default());
        *probe.data_age_ms.lock() = Some(100);
        *probe.loss.lock() = dec!(600);
        let (mon, mut svc) = monitor(Arc::clone(&probe));
        let mut state = (false, false, false);

        run_sample(&mon, &mut state);
        run_sample(&mon, &mut state);

        assert!(matches!(
            svc.rx.recv().await.unwrap(),
            GovernorEvent::DailyLossLimitBreached { .. }
        ));
        assert!(svc.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sustained_dead_data_is_catastrophic() {
        let probe = Arc::new(FakeProbe::default());
        *probe.data_age_ms.lock() = Some(400_000);
        let (mon, mut svc) = monitor(Arc::clone(&probe));
        let mut state = (false, false, false);

        run_sample(&mon, &mut state);

        // DataStale edge first, then the emergency.
        assert!(matches!(
            svc.rx.recv().await.unwrap(),
            GovernorEvent::DataStale { .. }
        ));
        assert!(matches!(
            svc.rx.recv().await.unwrap(),
            GovernorEvent::EmergencyShutdown { .. }
        ));
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_emitted_once() {
        let probe = Arc::new(FakeProbe::default());
        *probe.data_age_ms.lock() = Some(100);
        *probe.exhausted.lock() = true;
        let (mon, mut svc) = monitor(Arc::clone(&probe));
        let mut state = (false, false, false);

        run_sample(&mon, &mut state);
        run_sample(&mon, &mut state);

        assert_eq!(
            svc.rx.recv().await.unwrap(),
            GovernorEvent::ReconnectBudgetExhausted
        );
        assert!(svc.rx.try_recv().is_err());
    }
}
