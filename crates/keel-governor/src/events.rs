//! Governor events and their single dispatch path.
//!
//! Every failure-handling action in the system flows through one typed
//! event enum consumed by one match in [`GovernorService::run`]. Emitters
//! hold a [`GovernorBus`]; nothing else mutates the breaker or the intake
//! halt flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::breaker::{CircuitBreaker, CircuitSnapshot};

/// Everything the governor reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorEvent {
    /// A venue-facing operation failed (router or sync poll).
    VenueFailure { context: String },
    /// A venue-facing operation succeeded.
    VenueSuccess,
    /// Stream data has been stale past its threshold.
    DataStale { age_ms: i64 },
    /// Fresh data is flowing again.
    DataRecovered,
    /// The streaming client gave up reconnecting.
    ReconnectBudgetExhausted,
    /// Daily realized loss crossed the configured limit.
    DailyLossLimitBreached { loss: Decimal },
    /// Manual or catastrophic shutdown request.
    EmergencyShutdown { reason: String },
}

/// Actions the governor takes on catastrophic conditions, implemented by
/// the composition root so liquidation goes through the normal signal and
/// order paths.
pub trait EmergencyActions: Send + Sync {
    /// Inject liquidation signals for all open positions.
    fn request_liquidation(&self);
}

/// Cloneable emitter handle.
#[derive(Clone)]
pub struct GovernorBus {
    tx: mpsc::UnboundedSender<GovernorEvent>,
}

impl GovernorBus {
    pub fn emit(&self, event: GovernorEvent) {
        if self.tx.send(event).is_err() {
            warn!("governor service stopped, event dropped");
        }
    }
}

/// Consumes governor events and drives the breaker and halt flag.
pub struct GovernorService {
    breaker: Arc<CircuitBreaker>,
    /// Set on catastrophic conditions; pipeline rejects intake while set.
    halted: Arc<AtomicBool>,
    actions: Arc<dyn EmergencyActions>,
    pub(crate) rx: mpsc::UnboundedReceiver<GovernorEvent>,
}

impl GovernorService {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        actions: Arc<dyn EmergencyActions>,
    ) -> (Self, GovernorBus, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let halted = Arc::new(AtomicBool::new(false));
        (
            Self {
                breaker,
                halted: Arc::clone(&halted),
                actions,
                rx,
            },
            GovernorBus { tx },
            halted,
        )
    }

    /// Breaker snapshot for collaborators.
    pub fn circuit_state(&self) -> CircuitSnapshot {
        self.breaker.circuit_state()
    }

    /// Run the dispatch loop until cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("governor dispatch started");
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("governor dispatch stopping");
                    return;
                }
                event = self.rx.recv() => match event {
                    Some(e) => e,
                    None => return,
                },
            };
            self.dispatch(event);
        }
    }

    /// The single place governor events are handled.
    pub fn dispatch(&self, event: GovernorEvent) {
        match event {
            GovernorEvent::VenueFailure { context } => {
                if let Some(transition) = self.breaker.record_failure() {
                    warn!(%context, ?transition, "circuit transition on failure");
                }
            }
            GovernorEvent::VenueSuccess => {
                if let Some(transition) = self.breaker.record_success() {
                    info!(?transition, "circuit transition on success");
                }
            }
            GovernorEvent::DataStale { age_ms } => {
                warn!(age_ms, "market data stale");
            }
            GovernorEvent::DataRecovered => {
                info!("market data recovered");
            }
            GovernorEvent::ReconnectBudgetExhausted => {
                self.emergency("stream reconnect budget exhausted");
            }
            GovernorEvent::DailyLossLimitBreached { loss } => {
                self.emergency(&format!("daily loss limit breached: {loss}"));
            }
            GovernorEvent::EmergencyShutdown { reason } => {
                self.emergency(&reason);
            }
        }
    }

    /// Halt intake and liquidate through the normal order paths.
    fn emergency(&self, reason: &str) {
        if self.halted.swap(true, Ordering::AcqRel) {
            // Already halted; liquidation is in progress.
            return;
        }
        error!(%reason, "EMERGENCY: halting intake and liquidating");
        self.actions.request_liquidation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingActions {
        liquidations: AtomicUsize,
    }

    impl EmergencyActions for CountingActions {
        fn request_liquidation(&self) {
            self.liquidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service() -> (GovernorService, GovernorBus, Arc<AtomicBool>, Arc<CountingActions>) {
        let actions = Arc::new(CountingActions {
            liquidations: AtomicUsize::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(60)));
        let (svc, bus, halted) =
            GovernorService::new(breaker, Arc::clone(&actions) as Arc<dyn EmergencyActions>);
        (svc, bus, halted, actions)
    }

    #[test]
    fn test_failures_feed_breaker() {
        let (svc, _bus, _halted, _actions) = service();
        for _ in 0..3 {
            svc.dispatch(GovernorEvent::VenueFailure {
                context: "order".to_string(),
            });
        }
        assert_eq!(
            svc.circuit_state().state,
            crate::breaker::CircuitState::Open
        );
    }

    #[test]
    fn test_loss_limit_triggers_single_liquidation() {
        let (svc, _bus, halted, actions) = service();

        svc.dispatch(GovernorEvent::DailyLossLimitBreached { loss: dec!(-500) });
        assert!(halted.load(Ordering::SeqCst));
        assert_eq!(actions.liquidations.load(Ordering::SeqCst), 1);

        // A second catastrophic event does not liquidate twice.
        svc.dispatch(GovernorEvent::ReconnectBudgetExhausted);
        assert_eq!(actions.liquidations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_data_does_not_halt() {
        let (svc, _bus, halted, _actions) = service();
        svc.dispatch(GovernorEvent::DataStale { age_ms: 20_000 });
        assert!(!halted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bus_delivers_to_run_loop() {
        let (svc, bus, halted, _actions) = service();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(svc.run(shutdown.clone()));

        bus.emit(GovernorEvent::EmergencyShutdown {
            reason: "test".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(halted.load(Ordering::SeqCst));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
