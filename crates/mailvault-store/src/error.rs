//! Store error types.

/// Errors from the storage layer.
///
/// Individual query failures are not errors in this sense: they are
/// recorded on the [`Query`](crate::Query) and propagate through the
/// continuation protocol. This enum covers setup and misuse.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The database driver reported an error outside query execution.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A query failed and the caller asked for the result as an error.
    #[error("query failed: {0}")]
    Query(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
