//! Error types for PgScale

use std::io;

/// Result type alias using PgScaleError
pub type Result<T> = std::result::Result<T, PgScaleError>;

/// Main error type for the PgScale proxy
#[derive(Debug, thiserror::Error)]
pub enum PgScaleError {
    /// Configuration error (fatal at startup only)
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown user in the credential table
    #[error("no such user: \"{0}\"")]
    NoSuchUser(String),

    /// Password check failed
    #[error("password authentication failed for user \"{0}\"")]
    AuthenticationFailed(String),

    /// Malformed frame or unexpected startup variant
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client closed its side of the connection; not an error condition
    #[error("client is gone")]
    ClientGone,

    /// Session requested a database the config does not know about
    #[error("unknown database: \"{0}\"")]
    UnknownDatabase(String),

    /// Key absent from a distributed map
    #[error("key not found")]
    KeyNotFound,

    /// Distributed map create/get/put failure; the request degrades to pass-through
    #[error("cache error: {0}")]
    Cache(String),

    /// Upstream pool failure; fatal for the affected client
    #[error("pool error: {0}")]
    Pool(String),

    /// Process-wide shutdown was requested while the operation was suspended
    #[error("shutting down")]
    ShuttingDown,

    /// Transport error
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PgScaleError {
    /// SQLSTATE code to attach when this error is reported to a client
    /// as an ErrorResponse.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            PgScaleError::NoSuchUser(_) => "28000",
            PgScaleError::AuthenticationFailed(_) => "28P01",
            PgScaleError::UnknownDatabase(_) => "3D000",
            PgScaleError::Protocol(_) => "08P01",
            _ => "XX000",
        }
    }

    /// Whether this error means the peer went away rather than a real fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            PgScaleError::ClientGone => true,
            PgScaleError::Io(e) => is_disconnect_io_error(e),
            _ => false,
        }
    }
}

/// Classify transport errors that mean "peer gone" so they can be logged
/// at debug instead of error.
pub fn is_disconnect_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
