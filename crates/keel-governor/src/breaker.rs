//! Shared circuit breaker over venue-facing failures.
//!
//! Router and sync failures feed one consecutive-failure counter. At the
//! threshold the circuit opens for a cooldown; after the cooldown exactly
//! one half-open trial request is allowed through. A successful trial
//! closes the circuit and resets the counter; a failed trial reopens it
//! immediately for another full cooldown.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Tripped; submissions rejected until `reopen_at`.
    Open,
    /// Cooldown elapsed; one trial request probing the venue.
    HalfOpen,
}

/// Point-in-time view for collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Remaining cooldown when open.
    pub reopen_in: Option<Duration>,
}

/// State transition produced by a record call, for event emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    HalfOpened,
    Closed,
    Reopened,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    reopen_at: Option<Instant>,
    /// The single half-open trial has been handed out.
    trial_in_flight: bool,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                reopen_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Whether a new venue submission may proceed.
    ///
    /// Open circuits transition to half-open once the cooldown has
    /// elapsed; the first caller after that gets the single trial slot.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .reopen_at
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(false);
                if !elapsed {
                    return false;
                }
                info!("circuit cooldown elapsed, half-open trial allowed");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a venue-facing failure. Returns a transition when the
    /// circuit changed state.
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.reopen_at = Some(Instant::now() + self.cooldown);
                    inner.trial_in_flight = false;
                    Some(CircuitTransition::Opened)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                warn!("half-open trial failed, circuit reopened");
                inner.state = CircuitState::Open;
                inner.reopen_at = Some(Instant::now() + self.cooldown);
                inner.trial_in_flight = false;
                Some(CircuitTransition::Reopened)
            }
            CircuitState::Open => None,
        }
    }

    /// Record a venue-facing success. Closes a half-open circuit and
    /// resets the failure counter.
    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            info!("half-open trial succeeded, circuit closed");
            inner.state = CircuitState::Closed;
            inner.reopen_at = None;
            inner.trial_in_flight = false;
            Some(CircuitTransition::Closed)
        } else {
            None
        }
    }

    /// Snapshot for collaborators and the health loop.
    pub fn circuit_state(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            reopen_in: inner
                .reopen_at
                .and_then(|t| t.checked_duration_since(Instant::now())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_allows_requests() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        assert!(breaker.allow_request());
        assert_eq!(breaker.circuit_state().state, CircuitState::Closed);
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));

        for _ in 0..4 {
            assert!(breaker.record_failure().is_none());
        }
        assert_eq!(breaker.record_failure(), Some(CircuitTransition::Opened));

        // 6th submission rejected without any venue contact.
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        // Never reached 3 consecutively.
        assert_eq!(breaker.circuit_state().state, CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_trial() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        assert!(!breaker.allow_request());

        std::thread::sleep(Duration::from_millis(20));

        // First caller after cooldown gets the trial slot; second does not.
        assert!(breaker.allow_request());
        assert_eq!(breaker.circuit_state().state, CircuitState::HalfOpen);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());

        assert_eq!(breaker.record_success(), Some(CircuitTransition::Closed));
        assert_eq!(breaker.circuit_state().state, CircuitState::Closed);
        assert_eq!(breaker.circuit_state().consecutive_failures, 0);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow_request());

        assert_eq!(breaker.record_failure(), Some(CircuitTransition::Reopened));
        assert_eq!(breaker.circuit_state().state, CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_snapshot_reports_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();

        let snap = breaker.circuit_state();
        assert_eq!(snap.state, CircuitState::Open);
        assert!(snap.reopen_in.unwrap() <= Duration::from_secs(60));
        assert!(snap.reopen_in.unwrap() > Duration::from_secs(58));
    }
}
