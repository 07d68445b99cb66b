//! Router error types.

use keel_core::ErrorClass;
use keel_sync::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    /// Order failed validation before any venue contact.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The circuit breaker refused the submission.
    #[error("circuit open")]
    CircuitOpen,

    /// The per-call timeout elapsed.
    #[error("venue call timed out")]
    Timeout,

    /// The order was cancelled while queued.
    #[error("order cancelled before submission")]
    Cancelled,

    /// Venue call failed.
    #[error("venue error: {0}")]
    Venue(#[from] SyncError),
}

impl RouterError {
    /// Map onto the shared retry classification.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Timeout => ErrorClass::Transient,
            Self::Venue(e) => e.classify(),
            Self::Validation(_) | Self::CircuitOpen | Self::Cancelled => ErrorClass::Permanent,
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        assert_eq!(RouterError::Timeout.classify(), ErrorClass::Transient);
    }

    #[test]
    fn test_validation_is_permanent() {
        assert_eq!(
            RouterError::Validation("too big".to_string()).classify(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_venue_classification_passes_through() {
        assert_eq!(
            RouterError::Venue(SyncError::RateLimited).classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            RouterError::Venue(SyncError::Api {
                code: "EGeneral:Invalid arguments".to_string(),
                message: String::new(),
            })
            .classify(),
            ErrorClass::Permanent
        );
    }
}
