//! Tributary error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The target resource does not exist.
    #[error("the target resource was not found")]
    ResourceNotFound,
    /// The resource was modified concurrently and the write was rejected.
    #[error("the resource was modified concurrently, a fresh copy is required")]
    Conflict,
    /// A failure which is expected to clear on its own, such as a timeout or rate limiting.
    #[error("transient error: {0}")]
    Transient(String),
    /// A failure which will not clear until the request itself changes.
    #[error("permanent error: {0}")]
    Permanent(String),
    /// An internal error, but the process will remain online.
    #[error("internal error: {0}")]
    Ise(anyhow::Error),
}

impl AppError {
    /// Check if this error should be retried with a new reconcile pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict | Self::Ise(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AppError::Transient("timeout".into()).is_transient(), "expected Transient to be retried");
        assert!(AppError::Conflict.is_transient(), "expected Conflict to be retried");
        assert!(!AppError::Permanent("forbidden".into()).is_transient(), "expected Permanent to not be retried");
        assert!(!AppError::InvalidInput("bad".into()).is_transient(), "expected InvalidInput to not be retried");
    }
}
