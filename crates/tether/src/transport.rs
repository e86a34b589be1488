//! Transport contract consumed by the socket.
//!
//! The socket never touches a WebSocket directly; it drives an
//! implementation of [`Transport`] and receives connection events through a
//! [`TransportDelegate`]. Transports are responsible for:
//!
//! - establishing and tearing down the underlying connection
//! - writing text frames
//! - upgrading the URL scheme (`http -> ws`, `https -> wss`)
//! - TLS configuration
//!
//! Transports do NOT handle:
//!
//! - frame encoding/decoding (the socket's serializer does)
//! - topic routing, heartbeats, reconnects (the socket does)
//!
//! The bundled [`websocket`] implementation (feature `websocket`) satisfies
//! this contract with `tokio-tungstenite`; any other implementation can be
//! supplied through the socket's transport factory.

use std::sync::Arc;

use url::Url;

use crate::error::TransportError;

#[cfg(feature = "websocket")]
pub mod websocket;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// The connection is being established.
    Connecting,
    /// The connection is open and writable.
    Open,
    /// A close has been requested but not yet acknowledged.
    Closing,
    /// The connection is closed (or was never opened).
    Closed,
}

impl ReadyState {
    /// Lowercase name, for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        }
    }
}

/// Receiver of transport connection events.
///
/// Implemented by the socket; a transport must deliver every event exactly
/// once per occurrence and never after `on_close`.
pub trait TransportDelegate: Send + Sync {
    /// The connection finished its handshake and is writable.
    fn on_open(&self);

    /// A complete text frame arrived.
    fn on_message(&self, text: String);

    /// The connection failed. A terminal failure is followed by `on_close`.
    fn on_error(&self, error: TransportError);

    /// The connection closed with the given close code.
    fn on_close(&self, code: u16);
}

/// A WebSocket-shaped connection the socket can drive.
pub trait Transport: Send + Sync {
    /// Current connection state.
    fn ready_state(&self) -> ReadyState;

    /// Begin connecting; events are delivered to `delegate`.
    fn connect(&self, delegate: Arc<dyn TransportDelegate>);

    /// Close the connection with a code and optional reason.
    fn disconnect(&self, code: u16, reason: Option<&str>);

    /// Write one text frame.
    fn send(&self, data: String);
}

/// Builds a fresh transport for each connection attempt.
pub type TransportFactory = Arc<dyn Fn(&Url) -> Arc<dyn Transport> + Send + Sync>;

/// Upgrade an endpoint scheme to its WebSocket equivalent.
///
/// `http` becomes `ws` and `https` becomes `wss`; `ws`/`wss` are left
/// untouched and unrecognized schemes are passed through.
pub fn upgrade_url_scheme(mut url: Url) -> Url {
    let upgraded = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = upgraded {
        // Cannot fail: ws/wss are special schemes like http/https.
        let _ = url.set_scheme(scheme);
    }
    url
}
