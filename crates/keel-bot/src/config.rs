//! Application configuration.
//!
//! One TOML file with a section per component. Every section has defaults
//! so a partial file (or no file at all) still produces a runnable
//! configuration, and each section converts into the component's own
//! config type at wiring time.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use keel_governor::HealthConfig;
use keel_pipeline::{BatchConfig, GateConfig};
use keel_position::{CapitalConfig, ExitConfig, MonitorConfig};
use keel_router::RouterConfig;
use keel_sync::{CachePolicy, PollConfig, RestConfig};
use keel_ws::ConnectionConfig;

use crate::error::{AppError, AppResult};

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub venue: VenueConfig,
    #[serde(default)]
    pub websocket: WsSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub poll: PollSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub governor: GovernorSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Venue endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// Streaming endpoint URL.
    pub ws_url: String,
    /// REST API base URL, no trailing slash.
    pub rest_url: String,
    /// API key. Empty disables private channels and order entry.
    #[serde(default)]
    pub api_key: String,
    /// Base64-encoded API secret.
    #[serde(default)]
    pub api_secret: String,
    /// Symbols to stream and trade.
    pub symbols: Vec<String>,
    /// Asset the gate reads available capital from.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
}

fn default_quote_asset() -> String {
    "USD".to_string()
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws.kraken.com/v2".to_string(),
            rest_url: "https://api.kraken.com".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            symbols: vec!["BTC/USD".to_string()],
            quote_asset: default_quote_asset(),
        }
    }
}

/// Streaming connection subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsSection {
    /// Maximum reconnection attempts within the rolling window.
    pub max_reconnect_attempts: u32,
    /// Rolling window over which attempts are counted (seconds).
    pub reconnect_window_secs: u64,
    /// Base delay for reconnection backoff (ms).
    pub reconnect_base_delay_ms: u64,
    /// Maximum backoff delay (ms).
    pub reconnect_max_delay_ms: u64,
    /// Heartbeat interval (ms).
    pub heartbeat_interval_ms: u64,
    /// Pong deadline after a heartbeat (ms).
    pub heartbeat_timeout_ms: u64,
}

impl Default for WsSection {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            reconnect_window_secs: 600,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
            heartbeat_interval_ms: 30000,
            heartbeat_timeout_ms: 10000,
        }
    }
}

impl From<WsSection> for ConnectionConfig {
    fn from(cfg: WsSection) -> Self {
        Self {
            url: String::new(), // Set separately from venue config
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_window: Duration::from_secs(cfg.reconnect_window_secs),
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            heartbeat_interval_ms: cfg.heartbeat_interval_ms,
            heartbeat_timeout_ms: cfg.heartbeat_timeout_ms,
            symbols: Vec::new(), // Set separately from venue config
            ..ConnectionConfig::default()
        }
    }
}

/// Staleness thresholds for the dual-plane cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    pub ticker_stale_ms: i64,
    pub balance_stale_ms: i64,
    /// Fresh-fresh divergence (bps of mid) that forces a poll.
    pub mismatch_epsilon_bps: i64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let p = CachePolicy::default();
        Self {
            ticker_stale_ms: p.ticker_stale_ms,
            balance_stale_ms: p.balance_stale_ms,
            mismatch_epsilon_bps: p.mismatch_epsilon_bps,
        }
    }
}

impl From<CacheSection> for CachePolicy {
    fn from(cfg: CacheSection) -> Self {
        Self {
            ticker_stale_ms: cfg.ticker_stale_ms,
            balance_stale_ms: cfg.balance_stale_ms,
            mismatch_epsilon_bps: cfg.mismatch_epsilon_bps,
        }
    }
}

/// REST poll plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSection {
    /// Interval between full polls (seconds).
    pub interval_secs: u64,
    /// Per-request timeout (seconds).
    pub request_timeout_secs: u64,
    /// Minimum spacing between private calls (ms).
    pub min_call_interval_ms: u64,
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            request_timeout_secs: 10,
            min_call_interval_ms: 200,
        }
    }
}

/// Signal intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Duplicate-signal cooldown (ms).
    pub dedup_cooldown_ms: i64,
    /// Batch flush window (ms).
    pub batch_window_ms: u64,
    /// Batch size trigger.
    pub batch_max_size: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            dedup_cooldown_ms: 30_000,
            batch_window_ms: 500,
            batch_max_size: 10,
        }
    }
}

impl From<&PipelineSection> for BatchConfig {
    fn from(cfg: &PipelineSection) -> Self {
        Self {
            window: Duration::from_millis(cfg.batch_window_ms),
            max_size: cfg.batch_max_size,
        }
    }
}

/// Risk gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSection {
    pub max_concurrent_positions: usize,
    /// Base confidence floor for entries, in [0, 1].
    pub base_confidence_floor: Decimal,
    /// Added to the floor per consecutive loss.
    pub floor_step_per_loss: Decimal,
    /// The floor never tightens past this.
    pub max_confidence_floor: Decimal,
}

impl Default for GateSection {
    fn default() -> Self {
        let g = GateConfig::default();
        Self {
            max_concurrent_positions: g.max_concurrent_positions,
            base_confidence_floor: g.base_confidence_floor,
            floor_step_per_loss: g.floor_step_per_loss,
            max_confidence_floor: g.max_confidence_floor,
        }
    }
}

impl GateSection {
    /// Build the gate config; tradable symbols come from venue config.
    pub fn to_gate_config(&self, symbols: &[String]) -> GateConfig {
        GateConfig {
            max_concurrent_positions: self.max_concurrent_positions,
            base_confidence_floor: self.base_confidence_floor,
            floor_step_per_loss: self.floor_step_per_loss,
            max_confidence_floor: self.max_confidence_floor,
            tradable_symbols: symbols.iter().cloned().collect::<HashSet<_>>(),
        }
    }
}

/// Order router limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    /// Maximum concurrent venue submissions.
    pub max_concurrency: usize,
    /// Per-call timeout (seconds).
    pub call_timeout_secs: u64,
    /// Minimum acceptable order size.
    pub min_order_size: Decimal,
    /// Maximum acceptable order size.
    pub max_order_size: Decimal,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            call_timeout_secs: 10,
            min_order_size: Decimal::ZERO,
            max_order_size: Decimal::from(1_000_000),
        }
    }
}

impl RouterSection {
    /// Build the router config; tradable symbols come from venue config.
    pub fn to_router_config(&self, symbols: &[String]) -> RouterConfig {
        RouterConfig {
            max_concurrency: self.max_concurrency,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            min_order_size: keel_core::Size::new(self.min_order_size),
            max_order_size: keel_core::Size::new(self.max_order_size),
            tradable_symbols: symbols.iter().cloned().collect(),
        }
    }
}

/// The one retry policy shared by every venue-facing call path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ms: 250,
        }
    }
}

impl From<&RetrySection> for keel_core::RetryPolicy {
    fn from(cfg: &RetrySection) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter_ms: cfg.jitter_ms,
        }
    }
}

/// Position monitor cadence and bracket distances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSection {
    /// Scan interval (ms).
    pub tick_interval_ms: u64,
    /// Profit target distance from entry, in bps.
    pub profit_target_bps: u32,
    /// Stop loss distance from entry, in bps.
    pub stop_loss_bps: u32,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let m = MonitorConfig::default();
        Self {
            tick_interval_ms: m.tick_interval.as_millis() as u64,
            profit_target_bps: m.profit_target_bps,
            stop_loss_bps: m.stop_loss_bps,
        }
    }
}

impl From<&MonitorSection> for MonitorConfig {
    fn from(cfg: &MonitorSection) -> Self {
        Self {
            tick_interval: Duration::from_millis(cfg.tick_interval_ms),
            profit_target_bps: cfg.profit_target_bps,
            stop_loss_bps: cfg.stop_loss_bps,
        }
    }
}

/// Circuit breaker and health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSection {
    /// Consecutive venue failures that open the circuit.
    pub failure_threshold: u32,
    /// Open-state cooldown before half-open probing (seconds).
    pub cooldown_secs: u64,
    /// Health sampling interval (seconds).
    pub sample_interval_secs: u64,
    /// Data older than this is degraded (ms).
    pub data_stale_ms: i64,
    /// Data older than this is catastrophic (ms).
    pub data_dead_ms: i64,
    /// Daily realized loss magnitude that halts the system.
    pub daily_loss_limit: Decimal,
}

impl Default for GovernorSection {
    fn default() -> Self {
        let h = HealthConfig::default();
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            sample_interval_secs: h.sample_interval.as_secs(),
            data_stale_ms: h.data_stale_ms,
            data_dead_ms: h.data_dead_ms,
            daily_loss_limit: h.daily_loss_limit,
        }
    }
}

impl From<&GovernorSection> for HealthConfig {
    fn from(cfg: &GovernorSection) -> Self {
        Self {
            sample_interval: Duration::from_secs(cfg.sample_interval_secs),
            data_stale_ms: cfg.data_stale_ms,
            data_dead_ms: cfg.data_dead_ms,
            daily_loss_limit: cfg.daily_loss_limit,
        }
    }
}

/// Durable state locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSection {
    /// Base directory for checkpoints, snapshots, and the journal.
    pub data_dir: String,
    /// Journal records buffered before a disk flush.
    pub journal_buffer_size: usize,
    /// Seconds between periodic position snapshots.
    pub snapshot_interval_secs: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            journal_buffer_size: CapitalConfig::default().journal_buffer_size,
            snapshot_interval_secs: 30,
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySection {
    /// Default log filter when RUST_LOG is unset.
    pub log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the path in `KEEL_CONFIG`, falling back to
    /// defaults when no file exists.
    pub fn load() -> AppResult<Self> {
        let config_path =
            std::env::var("KEEL_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());

        if Path::new(&config_path).exists() {
            Self::from_file(&config_path)
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> AppResult<()> {
        if self.venue.symbols.is_empty() {
            return Err(AppError::Config("venue.symbols must not be empty".into()));
        }
        if self.venue.ws_url.is_empty() || self.venue.rest_url.is_empty() {
            return Err(AppError::Config("venue URLs must not be empty".into()));
        }
        if self.router.min_order_size > self.router.max_order_size {
            return Err(AppError::Config(
                "router.min_order_size exceeds max_order_size".into(),
            ));
        }
        if self.gate.base_confidence_floor > self.gate.max_confidence_floor {
            return Err(AppError::Config(
                "gate.base_confidence_floor exceeds max_confidence_floor".into(),
            ));
        }
        if self.governor.failure_threshold == 0 {
            return Err(AppError::Config(
                "governor.failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether credentials are configured for private channels and orders.
    pub fn has_credentials(&self) -> bool {
        !self.venue.api_key.is_empty() && !self.venue.api_secret.is_empty()
    }

    /// Connection config with the venue URL and symbols filled in.
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut cfg: ConnectionConfig = self.websocket.clone().into();
        cfg.url = self.venue.ws_url.clone();
        cfg.symbols = self.venue.symbols.clone();
        if self.has_credentials() {
            cfg.private_channels = vec![keel_ws::Channel::Balances, keel_ws::Channel::Executions];
        }
        cfg
    }

    /// REST config from venue credentials and poll timing.
    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            base_url: self.venue.rest_url.clone(),
            api_key: self.venue.api_key.clone(),
            api_secret: self.venue.api_secret.clone(),
            request_timeout: Duration::from_secs(self.poll.request_timeout_secs),
            min_call_interval: Duration::from_millis(self.poll.min_call_interval_ms),
        }
    }

    /// Poll config over the venue symbols.
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(self.poll.interval_secs),
            symbols: self.venue.symbols.clone(),
        }
    }
}
