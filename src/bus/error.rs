//! Error types for the event bus client.

use std::io;

use thiserror::Error;

/// Event bus error types.
///
/// Errors from direct calls (`connect`, `send`, `register`, ...) are returned
/// to the caller. Errors discovered in the background (read loop, ping loop,
/// bridge error notices) go to the error handler installed with
/// [`EventBus::set_error_handler`](crate::bus::EventBus::set_error_handler).
#[derive(Debug, Error)]
pub enum BusError {
    /// Failed to open the TCP connection to the bridge.
    #[error("Connection failed: {0}")]
    Connection(#[source] io::Error),

    /// No live socket, or the socket failed.
    #[error("Disconnected from bridge{}", display_cause(.0))]
    Disconnected(#[source] Option<io::Error>),

    /// The bridge sent an explicit error notice.
    #[error("Bridge error: {0}")]
    ServerError(String),

    /// A body could not be converted to the wire format.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

fn display_cause(cause: &Option<io::Error>) -> String {
    match cause {
        Some(err) => format!(": {}", err),
        None => String::new(),
    }
}

impl BusError {
    /// Whether this error means the connection is (now) gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BusError::Disconnected(_) | BusError::Connection(_))
    }
}

impl From<io::Error> for BusError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::AddrNotAvailable => BusError::Connection(err),
            _ => BusError::Disconnected(Some(err)),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::InvalidData(err.to_string())
    }
}
