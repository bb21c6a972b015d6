//! Error types for lumen.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using lumen's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for lumen operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Image not found
    #[error("Image not found: {0}")]
    ImageNotFound(Uuid),

    /// Folder not found
    #[error("Folder not found: {0}")]
    FolderNotFound(Uuid),

    /// Queue item not found
    #[error("Queue item not found: {0}")]
    QueueItemNotFound(Uuid),

    /// A queue item was asked to make a transition its current status forbids
    #[error("Invalid transition for queue item {item_id}: {from} -> {to}")]
    InvalidTransition {
        item_id: Uuid,
        from: String,
        to: String,
    },

    /// Long-running operation observed its cancellation signal
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for store errors a caller may retry (connection loss, pool timeout).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            )
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
