//! Error types for blocking-fcgi.

use thiserror::Error;

/// Main error type for all FastCGI operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unexpected wire data. The connection is poisoned:
    /// no further reads or writes are attempted on it.
    #[error("FastCGI protocol violation: {0}")]
    Protocol(String),

    /// A caller-supplied value is out of its documented domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The begin-request record named a role this library does not serve.
    #[error("unknown FastCGI role: {0}")]
    UnknownRole(u16),

    /// A Filter closed its output before reading all of stdin.
    #[error("not all FastCGI stdin has been read by Filter")]
    FilterInputPending,

    /// I/O error on the transport or the listening endpoint.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> std::io::Error {
        match e {
            Error::Io(io) => io,
            Error::Protocol(msg) => std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("FastCGI protocol violation: {}", msg),
            ),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;
