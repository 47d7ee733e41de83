//! Error types for the framed IPC transport

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::RemoteError;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IPC endpoint not found: {}", .0.display())]
    EndpointNotFound(PathBuf),

    #[error("Timed out connecting to {} after {timeout:?}", path.display())]
    ConnectTimeout { path: PathBuf, timeout: Duration },

    #[error("Failed to connect to {}: {source}", path.display())]
    ConnectError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Failed to write frame: {0}")]
    SendError(#[source] std::io::Error),

    #[error("Timed out after {timeout:?} waiting for the socket to accept a frame")]
    WriteTimeout { timeout: Duration },

    #[error("Request '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(RemoteError),

    #[error("Connection closed")]
    Disconnected,

    /// A frame whose payload could not be decoded. The listener logs and
    /// discards these; they never reach callers.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error means the connection is gone rather than a single call failing
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::SendError(_) | Self::Disconnected | Self::Io(_)
        )
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}
