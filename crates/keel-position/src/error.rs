//! Position ledger error types.

use keel_persistence::PersistenceError;
use thiserror::Error;

use crate::ledger::PositionStatus;

#[derive(Debug, Error)]
pub enum PositionError {
    /// Status transitions are monotonic; no resurrection of closed
    /// positions.
    #[error("invalid transition {from} -> {to} for {symbol}")]
    InvalidTransition {
        symbol: String,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("no open position for {0}")]
    NotFound(String),

    #[error("position already open for {0}")]
    AlreadyOpen(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type PositionResult<T> = Result<T, PositionError>;
