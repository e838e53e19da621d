//! Error types for the tunnel and mux cores

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Errors surfaced by the tunnel server, agent and gateway client.
#[derive(Debug, Error)]
pub enum Error {
    /// The server pool holds no registered agent
    #[error("no available connection")]
    NoConnection,

    /// The peer rejected the dial handshake; carries the peer's error text
    #[error("{0}")]
    DialFailed(String),

    /// The dial handshake did not complete within the handshake window
    #[error("dial handshake timed out")]
    HandshakeTimeout,

    /// A control frame could not be encoded or decoded
    #[error("invalid control frame: {0}")]
    Protocol(#[from] serde_json::Error),

    /// WebSocket transport failure
    #[error("websocket error: {0}")]
    Ws(#[from] WsError),

    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`crate::mux::MuxClient`].
#[derive(Debug, Error)]
pub enum MuxError {
    /// Operation issued while the client is not running
    #[error("not connected")]
    NotConnected,

    /// The underlying connection closed while the operation was in flight
    #[error("connection closed")]
    ConnectionClosed,

    /// Reset was called while the client is still running
    #[error("already connected")]
    AlreadyConnected,

    /// Underlying connection failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
