//! Error types for authproxy

use thiserror::Error;

/// Main error type for authproxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed handshake bytes from a peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bad or missing credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Destination name could not be resolved
    #[error("Failed to resolve {0}")]
    Resolve(String),

    /// Destination unreachable
    #[error("Failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {0} timed out")]
    DialTimeout(String),

    /// Upstream proxy refused or failed the chained connect
    #[error("Upstream proxy error: {0}")]
    Upstream(String),

    /// I/O failure in the middle of a relayed session
    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// A read or write on a proxied exchange made no progress in time
    #[error("No progress within {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("Too many concurrent sessions (limit {0})")]
    ResourceExhausted(usize),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SSH key error: {0}")]
    SshKey(#[from] ssh_key::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error was caused by the remote peer rather than by us
    ///
    /// Used to pick the log level for per-connection failures.
    pub fn is_peer_error(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            Error::Protocol(_) | Error::Auth(_) | Error::HandshakeTimeout(_) => true,
            _ => false,
        }
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
