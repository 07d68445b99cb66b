//! Streaming connection manager.
//!
//! Handles the connection lifecycle, automatic reconnection with
//! exponential backoff inside a capped rolling-window budget, session
//! authentication for private channels, and subscription restoration
//! after reconnection.
//!
//! State machine per connection:
//!
//! ```text
//! Disconnected → Connecting → Authenticating (private only) → Subscribed
//!      ↑                                                         ↓
//!      └──────── Reconnecting ← error/heartbeat timeout ← Streaming
//! ```
//!
//! Exhausting the reconnect budget reports `Disconnected` health and stops
//! auto-reconnecting; the caller decides whether to restart.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keel_telemetry::Metrics;

use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatManager;
use crate::message::{Channel, StreamEvent, WsMessage, WsRequest};
use crate::session::{SessionToken, SessionTokenProvider};
use crate::subscription::SubscriptionManager;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Streaming endpoint URL.
    pub url: String,
    /// Maximum reconnection attempts within the rolling window.
    pub max_reconnect_attempts: u32,
    /// Rolling window over which attempts are counted.
    pub reconnect_window: Duration,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Heartbeat interval.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat timeout (pong must arrive within this).
    pub heartbeat_timeout_ms: u64,
    /// Symbols for public market-data subscriptions.
    pub symbols: Vec<String>,
    /// Public channels to subscribe.
    pub public_channels: Vec<Channel>,
    /// Private channels to subscribe (requires a token provider).
    pub private_channels: Vec<Channel>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_reconnect_attempts: 10,
            reconnect_window: Duration::from_secs(600),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
            heartbeat_interval_ms: 30000,
            heartbeat_timeout_ms: 10000,
            symbols: Vec::new(),
            public_channels: vec![Channel::Ticker],
            private_channels: Vec::new(),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Fetching/refreshing the session token for private channels.
    Authenticating,
    /// Subscriptions sent, waiting for first data.
    Subscribed,
    /// Receiving data.
    Streaming,
    Reconnecting,
}

impl ConnectionState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribed => "subscribed",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Health reported to the failure governor via a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    /// Connected and receiving.
    Streaming,
    /// Temporarily down, reconnect in progress.
    Reconnecting,
    /// Reconnect budget exhausted; manual restart required.
    Disconnected,
}

/// Streaming connection manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    subscriptions: Arc<SubscriptionManager>,
    heartbeat: Arc<HeartbeatManager>,
    event_tx: mpsc::Sender<StreamEvent>,
    /// Session token provider; `None` means no private channels.
    token_provider: Option<Arc<dyn SessionTokenProvider>>,
    /// Current session token, shared with the refresh check.
    session: Arc<RwLock<Option<SessionToken>>>,
    health_tx: watch::Sender<StreamHealth>,
    /// Reconnect attempt timestamps inside the rolling window.
    attempt_log: Arc<RwLock<VecDeque<Instant>>>,
    shutdown_token: CancellationToken,
}

impl ConnectionManager {
    /// Create a new connection manager.
    ///
    /// `token_provider` is required when `config.private_channels` is
    /// non-empty; this is checked once at wiring time, not per call.
    pub fn new(
        config: ConnectionConfig,
        event_tx: mpsc::Sender<StreamEvent>,
        token_provider: Option<Arc<dyn SessionTokenProvider>>,
    ) -> WsResult<(Self, watch::Receiver<StreamHealth>)> {
        if !config.private_channels.is_empty() && token_provider.is_none() {
            return Err(WsError::AuthFailed(
                "private channels configured without a token provider".to_string(),
            ));
        }

        let subscriptions = Arc::new(SubscriptionManager::new());
        for ch in &config.public_channels {
            subscriptions.add_requested(*ch);
        }
        for ch in &config.private_channels {
            subscriptions.add_requested(*ch);
        }

        let heartbeat = Arc::new(HeartbeatManager::new(
            config.heartbeat_interval_ms,
            config.heartbeat_timeout_ms,
        ));

        let (health_tx, health_rx) = watch::channel(StreamHealth::Reconnecting);

        Ok((
            Self {
                config,
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                subscriptions,
                heartbeat,
                event_tx,
                token_provider,
                session: Arc::new(RwLock::new(None)),
                health_tx,
                attempt_log: Arc::new(RwLock::new(VecDeque::new())),
                shutdown_token: CancellationToken::new(),
            },
            health_rx,
        ))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the connection is streaming and fully subscribed.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Streaming
            && self
                .subscriptions
                .ready_state()
                .is_ready(self.subscriptions.wants_private())
    }

    /// Signal graceful shutdown; the connect loop exits promptly.
    pub fn shutdown(&self) {
        info!("connection manager shutdown requested");
        self.shutdown_token.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Connect and run the stream loop until shutdown or budget exhaustion.
    pub async fn run(&self) -> WsResult<()> {
        loop {
            if self.is_shutdown() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);

            match self.try_connect().await {
                Ok(()) => info!("stream connection closed"),
                Err(e) => error!(?e, "stream connection error"),
            }

            if self.is_shutdown() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            // Count this attempt against the rolling-window budget.
            let attempts = self.record_attempt();
            if attempts >= self.config.max_reconnect_attempts {
                error!(attempts, "reconnect budget exhausted");
                self.set_state(ConnectionState::Disconnected);
                let _ = self.health_tx.send(StreamHealth::Disconnected);
                return Err(WsError::ReconnectBudgetExhausted { attempts });
            }

            self.set_state(ConnectionState::Reconnecting);
            let _ = self.health_tx.send(StreamHealth::Reconnecting);

            let delay = self.backoff_delay(attempts);
            warn!(attempts, delay_ms = delay.as_millis() as u64, "reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }

            self.subscriptions.reset_acked();
        }
    }

    /// Restart after budget exhaustion: clears the attempt log so `run`
    /// can be called again.
    pub fn reset_reconnect_budget(&self) {
        self.attempt_log.write().clear();
    }

    async fn try_connect(&self) -> WsResult<()> {
        info!(url = %self.config.url, "connecting to stream");

        let (ws_stream, _response) =
            connect_async_tls_with_config(&self.config.url, None, true, None).await?;
        let (mut write, mut read) = ws_stream.split();

        info!("stream connected");

        // Private channels need a fresh session token before subscribing.
        if self.subscriptions.wants_private() {
            self.set_state(ConnectionState::Authenticating);
            self.ensure_session_token().await?;
        }

        self.send_subscriptions(&mut write).await?;
        self.set_state(ConnectionState::Subscribed);
        self.heartbeat.reset();

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    info!("shutdown signal received in stream loop");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(?e, "failed to send close frame during shutdown");
                    }
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text_message(&text).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.heartbeat.record_pong();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "normal close".to_string()));
                            warn!(code, %reason, "stream closed by venue");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => {
                            error!(?e, "stream read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("stream ended");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                _ = self.heartbeat.wait_for_check() => {
                    if self.heartbeat.is_timed_out() {
                        error!("heartbeat timeout");
                        return Err(WsError::HeartbeatTimeout);
                    }

                    if self.heartbeat.should_send_heartbeat() {
                        let ping = serde_json::to_string(&WsRequest::ping())?;
                        write.send(Message::Text(ping)).await?;
                        self.heartbeat.record_ping();
                        debug!("sent heartbeat ping");
                    }

                    // Proactive session refresh; the next reconnect (and
                    // any token-bearing resubscribe) uses the new token.
                    if let Err(e) = self.refresh_session_if_due().await {
                        warn!(?e, "session token refresh failed");
                    }
                }
            }
        }
    }

    async fn handle_text_message(&self, text: &str) -> WsResult<()> {
        self.heartbeat.record_message();

        let msg: WsMessage = serde_json::from_str(text)
            .map_err(|e| WsError::ParseError(format!("frame: {e}")))?;

        match msg {
            WsMessage::MethodReply(reply) => {
                if reply.method == "pong" {
                    self.heartbeat.record_pong();
                    return Ok(());
                }

                if reply.method == "subscribe" {
                    let channel = reply.channel.as_deref().and_then(Channel::from_wire);
                    if reply.success {
                        if let Some(ch) = channel {
                            self.subscriptions.mark_acked(ch);
                        }
                    } else {
                        warn!(
                            channel = ?reply.channel,
                            error = ?reply.error,
                            "subscription rejected"
                        );
                    }
                    // Forward the ack so sync/governor can observe it.
                    let event = StreamEvent::SubscriptionAck {
                        channel: reply.channel.unwrap_or_default(),
                        success: reply.success,
                        error: reply.error,
                    };
                    if self.event_tx.send(event).await.is_err() {
                        warn!("event receiver dropped");
                    }
                }
                Ok(())
            }
            WsMessage::ChannelData(data) => {
                // First data frame marks the connection as streaming.
                if self.state() == ConnectionState::Subscribed {
                    self.set_state(ConnectionState::Streaming);
                    let _ = self.health_tx.send(StreamHealth::Streaming);
                }

                for event in data.into_events()? {
                    match &event {
                        StreamEvent::Heartbeat => {
                            // Liveness only; already recorded above.
                            continue;
                        }
                        StreamEvent::Tick(tick) => {
                            Metrics::stream_latency("ticker", tick.age_ms() as f64);
                        }
                        _ => {}
                    }
                    if self.event_tx.send(event).await.is_err() {
                        warn!("event receiver dropped");
                    }
                }
                Ok(())
            }
        }
    }

    async fn send_subscriptions(
        &self,
        write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> WsResult<()> {
        let channels = self.subscriptions.requested();
        info!(count = channels.len(), "sending subscriptions");

        for channel in channels {
            let request = if channel.is_private() {
                let token = self
                    .session
                    .read()
                    .as_ref()
                    .map(|s| s.token.clone())
                    .ok_or(WsError::TokenExpired)?;
                WsRequest::subscribe_private(channel, token)
            } else {
                WsRequest::subscribe(channel, self.config.symbols.clone())
            };

            let msg = serde_json::to_string(&request)?;
            write.send(Message::Text(msg)).await?;
            debug!(%channel, "subscription sent");
        }

        Ok(())
    }

    /// Fetch a session token if none is held or the held one is unusable.
    async fn ensure_session_token(&self) -> WsResult<()> {
        let usable = self
            .session
            .read()
            .as_ref()
            .map(|t| !t.is_expired())
            .unwrap_or(false);
        if usable {
            return Ok(());
        }

        let provider = self
            .token_provider
            .as_ref()
            .ok_or_else(|| WsError::AuthFailed("no token provider".to_string()))?;

        let token = provider.fetch_token().await?;
        info!(lifetime_secs = token.lifetime_secs, "session token obtained");
        *self.session.write() = Some(token);
        Ok(())
    }

    /// Refresh the session token when the proactive deadline has passed.
    async fn refresh_session_if_due(&self) -> WsResult<()> {
        let due = self
            .session
            .read()
            .as_ref()
            .map(SessionToken::needs_refresh)
            .unwrap_or(false);
        if !due {
            return Ok(());
        }

        let provider = match &self.token_provider {
            Some(p) => Arc::clone(p),
            None => return Ok(()),
        };

        let token = provider.fetch_token().await?;
        info!(lifetime_secs = token.lifetime_secs, "session token refreshed");
        *self.session.write() = Some(token);
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        Metrics::ws_state_set(state.as_str());
        match state {
            ConnectionState::Streaming => Metrics::ws_connected(),
            ConnectionState::Disconnected => Metrics::ws_disconnected(),
            _ => {}
        }
    }

    /// Record a reconnect attempt; returns attempts inside the window.
    fn record_attempt(&self) -> u32 {
        Metrics::ws_reconnect();
        let now = Instant::now();
        let mut log = self.attempt_log.write();
        log.push_back(now);
        while let Some(front) = log.front() {
            if now.duration_since(*front) > self.config.reconnect_window {
                log.pop_front();
            } else {
                break;
            }
        }
        log.len() as u32
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_base_delay_ms;
        let max = self.config.reconnect_max_delay_ms;

        // attempt=1 -> base, attempt=2 -> 2*base, attempt=3 -> 4*base ...
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = base.saturating_mul(1u64 << exponent).min(max);

        Duration::from_millis(delay + rand_jitter())
    }
}

/// Random jitter (0-1000ms) from the clock's nanosecond remainder.
fn rand_jitter() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    u64::from(nanos) % 1000
}
