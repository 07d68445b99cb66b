//! Subscription tracking and restore-after-reconnect.

use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::debug;

use crate::message::Channel;

/// Readiness of the subscription set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadyState {
    /// All requested public channels acked.
    pub public_ready: bool,
    /// All requested private channels acked.
    pub private_ready: bool,
}

impl ReadyState {
    /// Ready for trading requires both.
    pub fn is_ready(&self, wants_private: bool) -> bool {
        self.public_ready && (!wants_private || self.private_ready)
    }
}

/// Tracks requested and acked subscriptions across reconnects.
pub struct SubscriptionManager {
    /// Channels requested (restored after each reconnect).
    requested: RwLock<HashSet<Channel>>,
    /// Channels acked by the venue on the current connection.
    acked: RwLock<HashSet<Channel>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            requested: RwLock::new(HashSet::new()),
            acked: RwLock::new(HashSet::new()),
        }
    }

    /// Record that a channel was requested.
    pub fn add_requested(&self, channel: Channel) {
        self.requested.write().insert(channel);
    }

    /// The set of channels to (re)subscribe on connect.
    pub fn requested(&self) -> Vec<Channel> {
        self.requested.read().iter().copied().collect()
    }

    /// Whether any private channel was requested.
    pub fn wants_private(&self) -> bool {
        self.requested.read().iter().any(Channel::is_private)
    }

    /// Record a subscription ack from the venue.
    pub fn mark_acked(&self, channel: Channel) {
        debug!(%channel, "subscription acked");
        self.acked.write().insert(channel);
    }

    /// Clear acked state (called on reconnect; requests are kept).
    pub fn reset_acked(&self) {
        self.acked.write().clear();
    }

    /// Current readiness.
    pub fn ready_state(&self) -> ReadyState {
        let requested = self.requested.read();
        let acked = self.acked.read();

        let (public_req, private_req): (Vec<_>, Vec<_>) = {
            let mut public = Vec::new();
            let mut private = Vec::new();
            for ch in requested.iter() {
                if ch.is_private() {
                    private.push(*ch);
                } else {
                    public.push(*ch);
                }
            }
            (public, private)
        };

        ReadyState {
            public_ready: public_req.iter().all(|ch| acked.contains(ch)),
            private_ready: private_req.iter().all(|ch| acked.contains(ch)),
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
