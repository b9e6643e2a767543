//! Error types for the persistence layer.

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
