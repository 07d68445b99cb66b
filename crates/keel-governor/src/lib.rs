//! Failure governance: circuit breaking, event dispatch, health sampling.
//!
//! One circuit breaker instance guards all venue-facing traffic. All
//! failure handling flows through the single [`GovernorEvent`] dispatch in
//! [`GovernorService`]; emergency liquidation is requested through the
//! normal signal and order paths, never a side channel.

pub mod breaker;
pub mod events;
pub mod health;

pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, CircuitTransition};
pub use events::{EmergencyActions, GovernorBus, GovernorEvent, GovernorService};
pub use health::{HealthConfig, HealthMonitor, HealthProbe, HealthSnapshot};
