//! Error types

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Encryption error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored value failed to parse
    #[error("Validation error: {0}")]
    Validation(String),

    /// Write lost a compare-and-swap race
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for keybox_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Conflict(msg) => keybox_core::Error::StaleRotation(msg),
            Error::NotFound(msg) => keybox_core::Error::NotFound(msg),
            other => keybox_core::Error::Storage(other.to_string()),
        }
    }
}
