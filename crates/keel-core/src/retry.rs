//! Shared retry policy and error classification.
//!
//! One policy object (max attempts, backoff curve, classification) is
//! applied uniformly by the order router and the state-sync poll path,
//! instead of per-call-site retry blocks.

use std::time::Duration;

/// Classification of a failure, driving propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeout, rate limit, disconnect. Retried locally with backoff.
    Transient,
    /// Invalid symbol, insufficient funds, bad credentials. Never retried.
    Permanent,
    /// Stream/poll disagreement beyond epsilon. Triggers forced
    /// reconciliation, not a user-visible error.
    Consistency,
    /// Breached loss limit, exhausted budgets. Escalated to the governor.
    Catastrophic,
}

impl ErrorClass {
    /// Whether this class is retried by the shared policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Decision produced for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then retry.
    RetryAfter(Duration),
    /// Stop retrying; surface the error upward.
    GiveUp,
}

/// Bounded exponential backoff policy.
///
/// Delay for attempt `n` (1-based) is `base * 2^(n-1)` capped at `max`,
/// plus sub-second jitter derived from the clock to avoid thundering herds.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay for the exponential curve.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Maximum additive jitter in milliseconds (0 disables jitter).
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Policy with no jitter, for deterministic tests.
    pub fn fixed(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter_ms: 0,
        }
    }

    /// Backoff delay for a failed attempt (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Decide what to do after attempt `attempt` failed with `class`.
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        if !class.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = self.delay_for(attempt) + Duration::from_millis(self.jitter());
        RetryDecision::RetryAfter(delay)
    }

    /// Run a fallible async operation under this policy.
    ///
    /// `classify` maps the operation's error to an [`ErrorClass`]; only
    /// `Transient` errors are retried. The last error is returned when the
    /// attempt budget is exhausted.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.decide(attempt, classify(&err)) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => return Err(err),
                },
            }
        }
    }

    /// Sub-second jitter from the clock's nanosecond remainder.
    fn jitter(&self) -> u64 {
        if self.jitter_ms == 0 {
            return 0;
        }
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        u64::from(nanos) % self.jitter_ms
    }
}
