//! State synchronization between the venue and local caches.
//!
//! Two independent data paths feed the caches: the streaming client
//! (fast, may drop) and a periodic authenticated poll (slow, authoritative).
//! Reconciliation picks the authoritative record by freshness. All signed
//! REST traffic, including order placement for the router, goes through
//! [`RestClient`], which owns nonce acquisition and request signing.

pub mod cache;
pub mod error;
pub mod poll;
pub mod rest;
pub mod sync;

pub use cache::{CachePolicy, CacheRead, Mismatch, StateCache};
pub use error::{SyncError, SyncResult};
pub use poll::{PollConfig, PollService};
pub use rest::{RestClient, RestConfig};
pub use sync::{StateSyncService, SyncHealth};
