//! Error types for the reactor core.

use thiserror::Error;

/// Errors that can occur while running the reactor or reacting to events.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on a connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The readiness wait failed in a way that cannot be pinned on a single
    /// connection. Fatal to the reactor.
    #[error("event loop wait failed: {0}")]
    Wait(std::io::Error),

    /// A connection handler reported a failure. The reactor closes the
    /// offending connection and carries on.
    #[error("handler error: {0}")]
    Handler(String),
}

impl Error {
    /// Shorthand for a [`Error::Handler`] with the given message.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
