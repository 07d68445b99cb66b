//! Streaming client for the trading venue.
//!
//! Owns the connection lifecycle (connect, authenticate, subscribe,
//! stream, reconnect with a capped budget), heartbeat supervision, and
//! session-token refresh for private channels. Parsed events are forwarded
//! to keel-sync over a channel; this crate never mutates state caches.

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod session;
pub mod subscription;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, StreamHealth};
pub use error::{WsError, WsResult};
pub use heartbeat::HeartbeatManager;
pub use message::{Channel, ExecutionUpdate, StreamEvent, WsMessage, WsRequest};
pub use session::{SessionToken, SessionTokenProvider};
pub use subscription::SubscriptionManager;
