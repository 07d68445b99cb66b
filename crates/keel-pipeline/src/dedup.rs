//! Signal deduplication over a cooldown window.
//!
//! Identity is `(symbol, side, reason, confidence bucket)`; a signal whose
//! identity was accepted within the cooldown is dropped. The window is
//! measured from the most recent acceptance, so a steady trickle of
//! duplicates keeps extending the suppression.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use keel_core::{Signal, SignalIdentity};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

const DEFAULT_COOLDOWN_MS: i64 = 3_000;

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First of its identity in the window; accepted and recorded.
    Accepted,
    /// Identity seen within the cooldown; dropped.
    Duplicate,
}

pub struct SignalDeduper {
    cooldown_ms: i64,
    last_accepted: Mutex<HashMap<SignalIdentity, DateTime<Utc>>>,
}

impl SignalDeduper {
    pub fn new(cooldown_ms: i64) -> Self {
        Self {
            cooldown_ms,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    /// Check a signal against the window, recording it on acceptance.
    pub fn check(&self, signal: &Signal) -> DedupOutcome {
        self.check_at(signal, Utc::now())
    }

    fn check_at(&self, signal: &Signal, now: DateTime<Utc>) -> DedupOutcome {
        let identity = signal.identity();
        let mut map = self.last_accepted.lock();

        if let Some(last) = map.get(&identity) {
            let elapsed = (now - *last).num_milliseconds();
            if elapsed < self.cooldown_ms {
                debug!(%identity, elapsed_ms = elapsed, "duplicate signal dropped");
                return DedupOutcome::Duplicate;
            }
        }

        map.insert(identity, now);
        DedupOutcome::Accepted
    }

    /// Drop entries older than the cooldown. Called opportunistically by
    /// the batch timer to bound the map.
    pub fn prune(&self) {
        let cutoff = Utc::now() - ChronoDuration::milliseconds(self.cooldown_ms);
        self.last_accepted.lock().retain(|_, t| *t >= cutoff);
    }

    pub fn tracked(&self) -> usize {
        self.last_accepted.lock().len()
    }
}

impl Default for SignalDeduper {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN_MS)
    }
}
