//! Nonce sequencer with monotonic and durability guarantees.
//!
//! Issues strictly increasing tokens for authenticated requests. The counter
//! tracks wall-clock milliseconds (so nonces stay near venue time) but
//! uniqueness comes from the CAS loop, never from the clock itself.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::NonceResult;
use crate::store::CheckpointStore;

/// Trait for obtaining current time, enabling testability.
pub trait Clock: Send + Sync {
    /// Returns current time in milliseconds since Unix epoch.
    fn now_ms(&self) -> u64;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before Unix epoch")
            .as_millis() as u64
    }
}

/// A single issued nonce. Issued once, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NonceTicket {
    /// The nonce value, strictly greater than every previously issued one.
    pub value: u64,
    /// Local time at issuance (informational, not the uniqueness source).
    pub issued_at_ms: u64,
}

/// Issues strictly increasing nonce tickets.
///
/// # Guarantees
/// - Values are strictly increasing across all concurrent callers
/// - A process restart cannot regress the counter (checkpoint + margin)
/// - The critical section never suspends on I/O; checkpointing is a
///   separate explicit call driven by the composition root's cadence task
pub struct NonceSequencer<C: Clock> {
    /// Last issued nonce value.
    counter: AtomicU64,
    /// Issuances since the last checkpoint.
    since_checkpoint: AtomicU64,
    /// Checkpoint every this many issuances (also checkpointed on shutdown).
    checkpoint_every: u64,
    /// Forward jump applied on a venue invalid-nonce rejection, sized to
    /// clear the venue's replay window (60s at ~1 issuance/ms).
    replay_buffer_ms: u64,
    store: Box<dyn CheckpointStore>,
    clock: C,
}

impl<C: Clock> NonceSequencer<C> {
    /// Margin added above a loaded checkpoint so values issued after the
    /// last checkpoint but before the crash cannot be reissued.
    const RESTART_MARGIN: u64 = 10_000;

    /// Default checkpoint cadence in issuances.
    pub const DEFAULT_CHECKPOINT_EVERY: u64 = 1_000;

    /// Default replay-window buffer in milliseconds.
    pub const DEFAULT_REPLAY_BUFFER_MS: u64 = 60_000;

    /// Create a sequencer, loading the durable checkpoint if present.
    ///
    /// The counter starts at `max(checkpoint + margin, now_ms)` so a restart
    /// can never reissue a value the venue may already have seen.
    pub fn new(clock: C, store: Box<dyn CheckpointStore>) -> NonceResult<Self> {
        Self::with_options(
            clock,
            store,
            Self::DEFAULT_CHECKPOINT_EVERY,
            Self::DEFAULT_REPLAY_BUFFER_MS,
        )
    }

    /// Create a sequencer with explicit cadence and replay buffer.
    pub fn with_options(
        clock: C,
        store: Box<dyn CheckpointStore>,
        checkpoint_every: u64,
        replay_buffer_ms: u64,
    ) -> NonceResult<Self> {
        let now = clock.now_ms();
        let floor = match store.load()? {
            Some(checkpoint) => checkpoint.saturating_add(Self::RESTART_MARGIN).max(now),
            None => now,
        };

        tracing::info!(start = floor, "nonce sequencer initialized");

        Ok(Self {
            counter: AtomicU64::new(floor),
            since_checkpoint: AtomicU64::new(0),
            checkpoint_every,
            replay_buffer_ms,
            store,
            clock,
        })
    }

    /// Acquire the next nonce ticket.
    ///
    /// Returns `max(last + 1, now_ms)`: monotonic under any caller
    /// interleaving, and tracking wall time when the clock runs ahead.
    /// Thread-safe via CAS loop; never blocks on I/O.
    pub fn acquire(&self) -> NonceTicket {
        let now = self.clock.now_ms();

        loop {
            let current = self.counter.load(Ordering::Acquire);
            let next = current.saturating_add(1).max(now);

            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.since_checkpoint.fetch_add(1, Ordering::AcqRel);
                    return NonceTicket {
                        value: next,
                        issued_at_ms: now,
                    };
                }
                Err(_) => continue,
            }
        }
    }

    /// Jump the counter forward past the venue's replay window.
    ///
    /// Called when the venue rejects a request with an invalid-nonce error:
    /// some nonce the venue saw is ahead of our counter (another session,
    /// a clock skew episode), so the next issued value must clear it.
    /// Returns the new counter floor.
    pub fn advance_past_replay_window(&self) -> u64 {
        let now = self.clock.now_ms();
        let target = now.saturating_add(self.replay_buffer_ms);

        let floor = self.fast_forward(target);
        tracing::warn!(
            floor,
            buffer_ms = self.replay_buffer_ms,
            "nonce counter advanced past replay window"
        );
        floor
    }

    /// Persist the current counter if the issuance cadence has been reached.
    ///
    /// Intended to be driven by a periodic task; cheap no-op between
    /// cadence boundaries.
    pub fn maybe_checkpoint(&self) -> NonceResult<bool> {
        if self.since_checkpoint.load(Ordering::Acquire) < self.checkpoint_every {
            return Ok(false);
        }
        self.checkpoint()?;
        Ok(true)
    }

    /// Persist the current counter unconditionally (shutdown path).
    pub fn checkpoint(&self) -> NonceResult<()> {
        let value = self.counter.load(Ordering::Acquire);
        self.store.store(value)?;
        self.since_checkpoint.store(0, Ordering::Release);
        tracing::debug!(value, "nonce checkpoint written");
        Ok(())
    }

    /// Current counter value (the last issued nonce).
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Fast-forward the counter to at least `min_value`; returns the
    /// resulting counter value.
    fn fast_forward(&self, min_value: u64) -> u64 {
        loop {
            let current = self.counter.load(Ordering::Acquire);
            if current >= min_value {
                return current;
            }

            match self.counter.compare_exchange_weak(
                current,
                min_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return min_value,
                Err(_) => continue,
            }
        }
    }
}

impl NonceSequencer<SystemClock> {
    /// Create a sequencer with the system clock.
    pub fn with_system_clock(store: Box<dyn CheckpointStore>) -> NonceResult<Self> {
        Self::new(SystemClock, store)
    }
}

impl std::fmt::Debug for NonceSequencer<SystemClock> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceSequencer")
            .field("counter", &self.current())
            .finish()
    }
}
