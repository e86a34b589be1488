//! Error types for socket and transport operations.

use thiserror::Error;

/// Errors surfaced by [`Socket`](crate::socket::Socket) configuration and
/// connection setup.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The endpoint could not be parsed as a URL.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The endpoint parsed but cannot carry a path or query (e.g. `data:`).
    #[error("endpoint url cannot be a base: {0}")]
    UnsupportedEndpoint(String),
}

/// Errors reported by a [`Transport`](crate::transport::Transport).
///
/// Transport errors are surfaced once on the socket error stream and fanned
/// out as channel errors to every channel that is not already errored,
/// leaving or closed.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The underlying WebSocket failed.
    #[error("websocket failure: {0}")]
    Websocket(String),

    /// The connection dropped before or during the handshake.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}
