//! Application-level error type.

use thiserror::Error;

/// Top-level application errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Nonce error: {0}")]
    Nonce(#[from] keel_nonce::NonceError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] keel_persistence::PersistenceError),

    #[error("Stream error: {0}")]
    Ws(#[from] keel_ws::WsError),

    #[error("State sync error: {0}")]
    Sync(#[from] keel_sync::SyncError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] keel_pipeline::PipelineError),

    #[error("Router error: {0}")]
    Router(#[from] keel_router::RouterError),

    #[error("Position error: {0}")]
    Position(#[from] keel_position::PositionError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] keel_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;
