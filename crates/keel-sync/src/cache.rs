//! Dual-source state caches with freshness-based reconciliation.
//!
//! Each symbol/asset keeps the latest record from each source (stream and
//! poll) side by side. Reads resolve to the freshest record unless its age
//! exceeds the per-kind staleness threshold, in which case the other
//! source wins until a fresher update arrives. Fresh-fresh disagreement
//! beyond an epsilon is reported so the sync service can force an
//! out-of-band poll.

use dashmap::DashMap;
use keel_core::{AccountBalance, DataSource, MarketTick};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tracing::warn;

/// Staleness thresholds and the mismatch epsilon.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Prices go stale quickly.
    pub ticker_stale_ms: i64,
    /// Balances change only on fills and transfers.
    pub balance_stale_ms: i64,
    /// Fresh-fresh divergence (basis points of mid) that counts as a
    /// mismatch.
    pub mismatch_epsilon_bps: i64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ticker_stale_ms: 5_000,
            balance_stale_ms: 30_000,
            mismatch_epsilon_bps: 50,
        }
    }
}

/// A resolved cache read: the chosen record plus its age and origin.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    pub value: T,
    pub age_ms: i64,
    pub source: DataSource,
    /// True when the chosen record itself exceeds its staleness threshold
    /// (both sources were stale; freshest returned anyway).
    pub stale: bool,
}

/// A fresh-fresh disagreement between sources.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub key: String,
    pub divergence_bps: i64,
}

#[derive(Debug)]
struct DualEntry<T> {
    stream: Option<T>,
    poll: Option<T>,
}

// Derived Default would require `T: Default`; the slots start empty for any T.
impl<T> Default for DualEntry<T> {
    fn default() -> Self {
        Self {
            stream: None,
            poll: None,
        }
    }
}

type Entry<T> = Arc<RwLock<DualEntry<T>>>;

/// Single-writer caches for tickers and balances.
///
/// "Single-writer" is a discipline, not a type constraint: only the sync
/// service and the poll loop call the update methods.
pub struct StateCache {
    policy: CachePolicy,
    tickers: DashMap<String, Entry<MarketTick>>,
    balances: DashMap<String, Entry<AccountBalance>>,
}

impl StateCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            tickers: DashMap::new(),
            balances: DashMap::new(),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a tick under its source slot. Returns a [`Mismatch`] when both
    /// sources are fresh and their mids diverge beyond epsilon.
    pub fn update_tick(&self, tick: MarketTick) -> Option<Mismatch> {
        let entry = self
            .tickers
            .entry(tick.symbol.clone())
            .or_insert_with(|| Arc::new(RwLock::new(DualEntry::default())))
            .clone();

        let mut guard = entry.write();
        let symbol = tick.symbol.clone();
        match tick.source {
            DataSource::Stream => guard.stream = Some(tick),
            DataSource::Poll => guard.poll = Some(tick),
        }

        let mismatch = match (&guard.stream, &guard.poll) {
            (Some(s), Some(p))
                if !s.is_stale(self.policy.ticker_stale_ms)
                    && !p.is_stale(self.policy.ticker_stale_ms) =>
            {
                let (Some(sm), Some(pm)) = (s.mid(), p.mid()) else {
                    return None;
                };
                let Some(bps) = sm.bps_from(pm) else {
                    return None;
                };
                let bps = bps.abs().to_i64().unwrap_or(i64::MAX);
                (bps > self.policy.mismatch_epsilon_bps).then(|| Mismatch {
                    key: symbol.clone(),
                    divergence_bps: bps,
                })
            }
            _ => None,
        };

        if let Some(m) = &mismatch {
            warn!(
                symbol = %m.key,
                divergence_bps = m.divergence_bps,
                "fresh stream/poll tickers disagree"
            );
        }
        mismatch
    }

    /// Store a balance record under its source slot.
    pub fn update_balance(&self, balance: AccountBalance) {
        let entry = self
            .balances
            .entry(balance.asset.clone())
            .or_insert_with(|| Arc::new(RwLock::new(DualEntry::default())))
            .clone();

        let mut guard = entry.write();
        match balance.source {
            DataSource::Stream => guard.stream = Some(balance),
            DataSource::Poll => guard.poll = Some(balance),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Resolve the authoritative ticker for a symbol.
    pub fn get_ticker(&self, symbol: &str) -> Option<CacheRead<MarketTick>> {
        let entry = self.tickers.get(symbol)?.clone();
        let guard = entry.read();
        resolve(
            guard.stream.as_ref().map(|t| (t.clone(), t.age_ms())),
            guard.poll.as_ref().map(|t| (t.clone(), t.age_ms())),
            self.policy.ticker_stale_ms,
        )
        .map(|(value, age_ms, stale)| CacheRead {
            source: value.source,
            value,
            age_ms,
            stale,
        })
    }

    /// Resolve the authoritative balance for an asset.
    pub fn get_balance(&self, asset: &str) -> Option<CacheRead<AccountBalance>> {
        let entry = self.balances.get(asset)?.clone();
        let guard = entry.read();
        resolve(
            guard.stream.as_ref().map(|b| (b.clone(), b.age_ms())),
            guard.poll.as_ref().map(|b| (b.clone(), b.age_ms())),
            self.policy.balance_stale_ms,
        )
        .map(|(value, age_ms, stale)| CacheRead {
            source: value.source,
            value,
            age_ms,
            stale,
        })
    }

    /// All symbols currently tracked.
    pub fn symbols(&self) -> Vec<String> {
        self.tickers.iter().map(|e| e.key().clone()).collect()
    }

    /// Age of the freshest ticker across all symbols, if any.
    pub fn freshest_ticker_age_ms(&self) -> Option<i64> {
        self.tickers
            .iter()
            .filter_map(|e| {
                let guard = e.read();
                let s = guard.stream.as_ref().map(|t| t.age_ms());
                let p = guard.poll.as_ref().map(|t| t.age_ms());
                match (s, p) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) | (None, Some(a)) => Some(a),
                    (None, None) => None,
                }
            })
            .min()
    }

    /// Age of the freshest balance record across all assets, if any.
    pub fn freshest_balance_age_ms(&self) -> Option<i64> {
        self.balances
            .iter()
            .filter_map(|e| {
                let guard = e.read();
                let s = guard.stream.as_ref().map(|b| b.age_ms());
                let p = guard.poll.as_ref().map(|b| b.age_ms());
                match (s, p) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) | (None, Some(a)) => Some(a),
                    (None, None) => None,
                }
            })
            .min()
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

/// Pick between two sourced records by freshness, honoring the threshold.
///
/// Freshest wins; a stale freshest loses to a fresh other; when both are
/// stale the freshest is returned flagged stale.
fn resolve<T>(
    a: Option<(T, i64)>,
    b: Option<(T, i64)>,
    threshold_ms: i64,
) -> Option<(T, i64, bool)> {
    match (a, b) {
        (None, None) => None,
        (Some((v, age)), None) | (None, Some((v, age))) => Some((v, age, age > threshold_ms)),
        (Some((va, aa)), Some((vb, ab))) => {
            let (fresh, fresh_age, other, other_age) = if aa <= ab {
                (va, aa, vb, ab)
            } else {
                (vb, ab, va, aa)
            };
            if fresh_age <= threshold_ms {
                Some((fresh, fresh_age, false))
            } else if other_age <= threshold_ms {
                Some((other, other_age, false))
            } else {
                Some((fresh, fresh_age, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use keel_core::{Price, Size};
    use rust_decimal_macros::dec;

    fn tick_aged(symbol: &str, last: Price, source: DataSource, age_ms: i64) -> MarketTick {
        let mut t = MarketTick::new(symbol, last, last, last, source);
        t.timestamp = Utc::now() - ChronoDuration::milliseconds(age_ms);
        t
    }

    fn balance_aged(asset: &str, free: Size, source: DataSource, age_ms: i64) -> AccountBalance {
        let mut b = AccountBalance::new(asset, free, Size::ZERO, source);
        b.timestamp = Utc::now() - ChronoDuration::milliseconds(age_ms);
        b
    }

    #[test]
    fn test_fresh_stream_is_authoritative() {
        let cache = StateCache::new(CachePolicy {
            ticker_stale_ms: 5_000,
            ..Default::default()
        });

        // Stream tick 3s old, inside the threshold.
        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(100)), DataSource::Stream, 3_000));

        let read = cache.get_ticker("BTC/USD").unwrap();
        assert_eq!(read.source, DataSource::Stream);
        assert_eq!(read.value.last, Price::new(dec!(100)));
        assert!(!read.stale);
    }

    #[test]
    fn test_stale_stream_yields_to_fresh_poll() {
        let cache = StateCache::new(CachePolicy {
            ticker_stale_ms: 5_000,
            ..Default::default()
        });

        // Stream tick 6s old (past threshold), poll tick fresh at 97.
        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(100)), DataSource::Stream, 6_000));
        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(97)), DataSource::Poll, 500));

        let read = cache.get_ticker("BTC/USD").unwrap();
        assert_eq!(read.source, DataSource::Poll);
        assert_eq!(read.value.last, Price::new(dec!(97)));
        assert!(!read.stale);
    }

    #[test]
    fn test_fresher_stream_update_retakes_authority() {
        let cache = StateCache::new(CachePolicy {
            ticker_stale_ms: 5_000,
            mismatch_epsilon_bps: 10_000,
            ..Default::default()
        });

        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(97)), DataSource::Poll, 2_000));
        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(101)), DataSource::Stream, 10));

        let read = cache.get_ticker("BTC/USD").unwrap();
        assert_eq!(read.source, DataSource::Stream);
        assert_eq!(read.value.last, Price::new(dec!(101)));
    }

    #[test]
    fn test_both_stale_returns_freshest_flagged() {
        let cache = StateCache::new(CachePolicy {
            ticker_stale_ms: 5_000,
            ..Default::default()
        });

        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(100)), DataSource::Stream, 20_000));
        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(99)), DataSource::Poll, 10_000));

        let read = cache.get_ticker("BTC/USD").unwrap();
        assert_eq!(read.source, DataSource::Poll);
        assert!(read.stale);
    }

    #[test]
    fn test_mismatch_detected_within_fresh_window() {
        let cache = StateCache::new(CachePolicy {
            ticker_stale_ms: 5_000,
            mismatch_epsilon_bps: 50,
            ..Default::default()
        });

        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(100)), DataSource::Stream, 100));
        // 3% divergence, well beyond 50 bps.
        let mismatch =
            cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(103)), DataSource::Poll, 100));

        let m = mismatch.unwrap();
        assert_eq!(m.key, "BTC/USD");
        assert!(m.divergence_bps >= 290);
    }

    #[test]
    fn test_no_mismatch_when_one_source_stale() {
        let cache = StateCache::new(CachePolicy {
            ticker_stale_ms: 5_000,
            mismatch_epsilon_bps: 50,
            ..Default::default()
        });

        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(100)), DataSource::Stream, 20_000));
        let mismatch =
            cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(103)), DataSource::Poll, 100));
        assert!(mismatch.is_none());
    }

    #[test]
    fn test_balance_longer_threshold() {
        let cache = StateCache::new(CachePolicy {
            ticker_stale_ms: 5_000,
            balance_stale_ms: 30_000,
            ..Default::default()
        });

        // 10s-old balance would be stale as a ticker but is fine here.
        cache.update_balance(balance_aged("USD", Size::new(dec!(1000)), DataSource::Poll, 10_000));

        let read = cache.get_balance("USD").unwrap();
        assert!(!read.stale);
        assert_eq!(read.value.free, Size::new(dec!(1000)));
    }

    #[test]
    fn test_missing_key() {
        let cache = StateCache::default();
        assert!(cache.get_ticker("ETH/USD").is_none());
        assert!(cache.get_balance("ETH").is_none());
    }

    #[test]
    fn test_freshest_ages() {
        let cache = StateCache::default();
        assert!(cache.freshest_ticker_age_ms().is_none());

        cache.update_tick(tick_aged("BTC/USD", Price::new(dec!(100)), DataSource::Stream, 4_000));
        cache.update_tick(tick_aged("ETH/USD", Price::new(dec!(10)), DataSource::Stream, 1_000));

        let age = cache.freshest_ticker_age_ms().unwrap();
        assert!((900..2_000).contains(&age));
    }
}
