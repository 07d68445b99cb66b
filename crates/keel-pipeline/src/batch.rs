//! Signal batching.
//!
//! Deduplicated signals accumulate until the batch window elapses or the
//! batch reaches its maximum size. Flushes are sorted by priority
//! descending, then confidence descending, then recency ascending (older
//! first at equal priority and confidence).

use keel_core::Signal;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::time::Duration;

/// Batching parameters.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush cadence when the size trigger does not fire first.
    pub window: Duration,
    /// Size trigger: flushing happens as soon as this many accumulate.
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(500),
            max_size: 16,
        }
    }
}

pub struct SignalBatcher {
    config: BatchConfig,
    buffer: Mutex<Vec<Signal>>,
}

impl SignalBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Add a signal. Returns a full sorted batch when the size trigger
    /// fires, `None` otherwise.
    pub fn push(&self, signal: Signal) -> Option<Vec<Signal>> {
        let mut buffer = self.buffer.lock();
        buffer.push(signal);
        if buffer.len() >= self.config.max_size {
            let mut batch = std::mem::take(&mut *buffer);
            drop(buffer);
            sort_batch(&mut batch);
            return Some(batch);
        }
        None
    }

    /// Drain whatever has accumulated, sorted. Called on the window timer.
    pub fn flush(&self) -> Vec<Signal> {
        let mut batch = std::mem::take(&mut *self.buffer.lock());
        sort_batch(&mut batch);
        batch
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }
}

fn sort_batch(batch: &mut [Signal]) {
    batch.sort_by(compare);
}

/// Priority desc, confidence desc, created_at asc.
fn compare(a: &Signal, b: &Signal) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.confidence.cmp(&a.confidence))
        .then_with(|| a.created_at.cmp(&b.created_at))
}
