//! Pipeline error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The circuit breaker is open; nothing reaches the venue.
    #[error("circuit open, submission rejected")]
    CircuitOpen,

    /// The governor halted intake (emergency shutdown in progress).
    #[error("intake halted by governor")]
    IntakeHalted,

    /// Confidence outside [0, 1] or non-positive size.
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    /// The router's inbound channel is gone; the system is shutting down.
    #[error("order channel closed")]
    ChannelClosed,
}

pub type PipelineResult<T> = Result<T, PipelineError>;
