//! Nonce error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NonceError {
    #[error("Checkpoint store failure: {0}")]
    Checkpoint(String),
}

pub type NonceResult<T> = Result<T, NonceError>;
