//! Error types for the fleet dispatcher

use thiserror::Error;

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the fleet dispatcher
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Command rejected at submission (bad target, unknown kind, duplicate id)
    #[error("command rejected: {0}")]
    Rejected(String),

    /// Command cannot be canceled in its current state
    #[error("cannot cancel command {id}: status is {status}")]
    NotCancelable { id: String, status: String },

    /// Transport failure on a live connection (write timeout, broken pipe)
    #[error("transport error: {0}")]
    Transport(String),

    /// Agent identity is not known to the inventory
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error means the live connection is unusable
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
