//! Error types for the row store and change feed.

use thiserror::Error;

/// Errors returned by row reads and writes.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A SQL statement failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No pooled connection could be checked out.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored JSON column could not be encoded or decoded.
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored timestamp could not be parsed.
    #[error("invalid stored timestamp {value:?}: {source}")]
    Timestamp {
        /// The raw column value.
        value: String,
        /// The parse failure.
        source: chrono::ParseError,
    },

    /// The request was rejected before reaching storage.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The blocking worker running the query panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Errors returned when opening a change-feed subscription.
#[derive(Debug, Error)]
pub enum FeedError {
    /// A subscription needs at least one binding.
    #[error("subscription has no bindings")]
    NoBindings,

    /// The feed is not accepting subscriptions.
    #[error("change feed unavailable: {0}")]
    Unavailable(String),
}
