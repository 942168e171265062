//! Error types for the ChatVerse client

use thiserror::Error;

/// ChatVerse client error
#[derive(Debug, Error)]
pub enum ClientError {
    /// An operation that requires a stored credential found none
    #[error("no stored access token")]
    CredentialMissing,

    /// Authentication is no longer valid and could not be refreshed.
    /// Stored credentials have already been cleared when this is returned.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// HTTP transport failure
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Server rejected the request; `message` is the server's own text
    #[error("server error {status}: {message}")]
    Api { status: u16, message: String },

    /// Wire-format violation (frame or payload decode)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller-supplied input rejected before any I/O
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation requires a live messaging connection
    #[error("not connected: {0}")]
    NotConnected(String),

    /// WebSocket connect or handshake failure
    #[error("connection error: {0}")]
    Connection(String),

    /// JSON encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Credential storage I/O failure
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
