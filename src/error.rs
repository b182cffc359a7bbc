//! Error types for dieah-recall

use thiserror::Error;

/// Result type alias for dieah-recall operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in dieah-recall
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector database error: {0}")]
    VectorDb(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("App {app} is currently paused. Cannot create new memories.")]
    AppPaused { app: String },

    #[error("Memory capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Search failed: {0}")]
    Search(Box<Error>),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    pub fn vector_db(msg: impl Into<String>) -> Self {
        Self::VectorDb(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::CapabilityUnavailable(msg.into())
    }

    /// Wrap an error as a typed search failure. Already-wrapped errors pass through.
    pub fn search(err: Error) -> Self {
        match err {
            Self::Search(_) => err,
            other => Self::Search(Box::new(other)),
        }
    }

    /// Whether this error came from the embedding or vector side rather than
    /// from relational state. Reads fall back to text search on these.
    pub fn is_capability_failure(&self) -> bool {
        matches!(
            self,
            Self::Embedding(_)
                | Self::VectorDb(_)
                | Self::CapabilityUnavailable(_)
                | Self::Timeout(_)
                | Self::Http(_)
        )
    }
}
