//! Periodic authenticated poll of balances and tickers.
//!
//! The poll path is the slow, authoritative complement to the stream: it
//! refreshes every tracked symbol and all balances on an interval, and can
//! be triggered out-of-band when the caches report a stream/poll mismatch.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keel_core::RetryPolicy;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::StateCache;
use crate::error::{SyncError, SyncResult};
use crate::rest::RestClient;

/// Poll loop configuration.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Interval between full polls.
    pub interval: Duration,
    /// Symbols to refresh each cycle.
    pub symbols: Vec<String>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            symbols: Vec::new(),
        }
    }
}

/// Periodic poll service feeding the state caches.
pub struct PollService {
    config: PollConfig,
    rest: Arc<RestClient>,
    cache: Arc<StateCache>,
    retry: RetryPolicy,
    /// Wakes the loop for an immediate out-of-band poll.
    force: Arc<Notify>,
    /// Consecutive full-cycle failures, sampled by the governor.
    consecutive_failures: AtomicU32,
}

impl PollService {
    pub fn new(
        config: PollConfig,
        rest: Arc<RestClient>,
        cache: Arc<StateCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            rest,
            cache,
            retry,
            force: Arc::new(Notify::new()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Handle for requesting an immediate poll (mismatch repair).
    pub fn force_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.force)
    }

    /// Consecutive full-cycle failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Run the poll loop until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            symbols = self.config.symbols.len(),
            "poll service started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("poll service stopping");
                    return;
                }
                () = tokio::time::sleep(self.config.interval) => {}
                () = self.force.notified() => {
                    debug!("out-of-band poll requested");
                }
            }

            match self.poll_once().await {
                Ok(()) => {
                    self.consecutive_failures.store(0, Ordering::Release);
                }
                Err(e) => {
                    let n = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(?e, consecutive = n, "poll cycle failed");
                }
            }
        }
    }

    /// One full poll cycle: balances first, then every tracked ticker.
    pub async fn poll_once(&self) -> SyncResult<()> {
        let balances = self
            .retry
            .run(|| self.rest.get_balances(), SyncError::classify)
            .await?;
        let count = balances.len();
        for balance in balances {
            self.cache.update_balance(balance);
        }
        debug!(count, "balances refreshed");

        for symbol in &self.config.symbols {
            let tick = self
                .retry
                .run(|| self.rest.get_ticker(symbol), SyncError::classify)
                .await?;
            // A mismatch here resolves itself: the poll value just became
            // the fresher record.
            let _ = self.cache.update_tick(tick);
        }

        Ok(())
    }
}
