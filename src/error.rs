use std::path::PathBuf;

use thiserror::Error;

/// Convenient result alias using the executor's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Executor library error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read instance spec at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Instance spec at {path} could not be parsed: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Instance spec at {path} is invalid: {message}")]
    InvalidConfig { path: PathBuf, message: String },

    #[error("Upstream service returned an error: {message}")]
    UpstreamError { message: String },

    #[error("Didn't receive a QMP greeting from the control socket")]
    HandshakeFailed,
    #[error("Control protocol error: {message}")]
    ProtocolError { message: String },
    #[error("Failed to connect to the control socket: {source}")]
    ConnectionRefused {
        #[source]
        source: std::io::Error,
    },

    #[error("Image `{name}` failed integrity verification: expected {expected}, got {actual}")]
    IntegrityError {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Preflight failed: {message}")]
    PreflightFailed { message: String },

    #[error("{message}")]
    InvariantViolation { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
