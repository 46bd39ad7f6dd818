//! Error types for the panel and runner control plane

use thiserror::Error;

/// Result type alias for lcsm operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on either side of the runner control protocol
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket open/read/write failure
    #[error("transport error: {0}")]
    Transport(String),

    /// WebSocket client error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Malformed or unexpected frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The runner rejected our token
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Handler-reported failure carried in a response's `error` field
    #[error("runner error: {0}")]
    Remote(String),

    /// No response within the call window
    #[error("runner call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Socket died while the call was in flight
    #[error("connection to runner lost")]
    ConnectionLost,

    /// Runner id has no registered endpoint
    #[error("runner not found: {0}")]
    RunnerNotFound(u64),

    /// Instance id has no stored record
    #[error("instance not found: {0}")]
    InstanceNotFound(i64),

    /// Child process management error
    #[error("process error: {0}")]
    Process(String),

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
    /// Whether this error means the socket is gone and the next call must reconnect
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::WebSocket(_) | Self::ConnectionLost
        )
    }
}
