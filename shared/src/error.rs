//! Error types for Outpost.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The control channel could not be established.
    #[error("Connection error: {0}")]
    Connect(String),

    /// The broker refused the tunnel or sent something we cannot decode.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The control channel dropped while the session was running.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A single forwarded request failed. Never fatal to the session.
    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation was called in a session state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error ends the session rather than a single request.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::Protocol(_) | Error::ConnectionClosed(_) | Error::Config(_)
        )
    }
}
