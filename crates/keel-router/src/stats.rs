//! Router execution statistics.
//!
//! Counters and a bounded latency window, sampled by the failure governor
//! and exported via telemetry.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const LATENCY_WINDOW: usize = 256;

#[derive(Debug, Default)]
pub struct RouterStats {
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    consecutive_failures: AtomicU32,
    latencies_ms: Mutex<VecDeque<u64>>,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency_ms: u64) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Release);

        let mut window = self.latencies_ms.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency_ms);
    }

    pub fn record_failure(&self, timed_out: bool) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Success fraction over everything recorded; 1.0 when idle.
    pub fn success_rate(&self) -> f64 {
        let ok = self.successes() as f64;
        let total = ok + self.failures() as f64;
        if total == 0.0 {
            1.0
        } else {
            ok / total
        }
    }

    /// Latency percentile over the recent window.
    pub fn latency_percentile_ms(&self, pct: f64) -> Option<u64> {
        let window = self.latencies_ms.lock();
        if window.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = window.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * pct.clamp(0.0, 1.0)).round() as usize;
        Some(sorted[idx])
    }
}
