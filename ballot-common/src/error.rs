//! Error types for the Ballots services.

use thiserror::Error;

/// Result type alias using the Ballots error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Ballots services.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authorization could not be produced for an outbound request
    #[error("Authorization error: {0}")]
    Auth(String),

    /// Poll store query failed
    #[error("Store error: {0}")]
    Store(String),

    /// Network transport failure (dial, connect, read)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message queue failure
    #[error("Queue error: {0}")]
    Queue(String),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<crate::queue::QueueError> for Error {
    fn from(err: crate::queue::QueueError) -> Self {
        Self::Queue(err.to_string())
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_with_context() {
        let err = Error::Transport("connection refused".into());
        let with_ctx = err.with_context("dialing feed");
        assert!(matches!(with_ctx, Error::WithContext { .. }));
        assert_eq!(
            with_ctx.to_string(),
            "dialing feed: Transport error: connection refused"
        );
    }

    #[test]
    fn test_result_ext_context() {
        let res: std::result::Result<(), crate::queue::QueueError> =
            Err(crate::queue::QueueError::Stopped);
        let err = res.context("publishing vote").unwrap_err();
        assert_eq!(err.to_string(), "publishing vote: Queue error: Queue stopped");
    }
}
