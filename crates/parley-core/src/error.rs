use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by constructors and other fallible plumbing.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// A request failure as surfaced on the session's reactive `error` field.
///
/// Cloneable so the same value reaches both the `on_error` callback and
/// every watcher of the error channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed stream: {0}")]
    Stream(String),
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(message) => SessionError::Transport(message),
            TransportError::Status { status, message } => SessionError::Status { status, message },
            TransportError::Malformed(message) => SessionError::Stream(message),
        }
    }
}
