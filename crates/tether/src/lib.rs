//! # Tether - Phoenix Channels client
//!
//! Tether is a client for the Phoenix Channels protocol: a long-lived,
//! multiplexed realtime messaging layer carried over a single WebSocket
//! connection. Applications open topic-scoped channels through which they
//! exchange events with server-side handlers, receive asynchronous
//! broadcasts, and observe reply/error/timeout outcomes for each request.
//!
//! # Overview
//!
//! - **Socket**: connection lifecycle, stepped-back-off reconnects,
//!   heartbeat supervision, outbound buffering, inbound demultiplexing
//! - **Channel**: per-topic state machine with join/leave/rejoin and push
//!   buffering until joined
//! - **Push**: one request/reply exchange with per-push timeout
//! - **Transport**: the WebSocket contract the socket consumes; a bundled
//!   `tokio-tungstenite` implementation ships behind the `websocket` feature
//!
//! # Quick Start
//!
//! ```ignore
//! use serde_json::json;
//! use tether::{Socket, SocketOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tether::SocketError> {
//!     let socket = Socket::new(
//!         "https://example.com/socket",
//!         SocketOptions::new().params([("token", "abc123")]),
//!     );
//!     socket.connect()?;
//!
//!     let channel = socket.channel("rooms:lobby", json!({}));
//!     channel.on("new_msg", |message| {
//!         println!("new_msg: {}", message.response());
//!     });
//!
//!     channel
//!         .join()
//!         .receive("ok", |resp| println!("joined: {resp}"))
//!         .receive("error", |resp| println!("rejected: {resp}"))
//!         .receive("timeout", |_| println!("join timed out"));
//!
//!     channel
//!         .push("new_msg", json!({ "body": "hi" }))
//!         .receive("ok", |resp| println!("acked: {resp}"));
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

/// Per-topic channel state machine: join/leave/rejoin, push buffering.
pub mod channel;

/// Socket configuration options and back-off defaults.
pub mod config;

/// Error types for socket and transport operations.
pub mod error;

pub(crate) mod events;

/// The serializer-v2 5-tuple wire frame.
pub mod message;

/// A single request/reply exchange with timeout.
pub mod push;

/// Default encode/decode callables for the wire format.
pub mod serializer;

/// The socket: connection lifecycle, heartbeats, reconnects, multiplexing.
pub mod socket;

/// Timers: stepped back-off, heartbeat, and the injectable scheduler.
pub mod timer;

/// The transport contract and the bundled WebSocket implementation.
pub mod transport;

// =============================================================================
// Re-exports for convenient top-level access
// =============================================================================

pub use channel::{Channel, ChannelState};
pub use config::{Params, SocketOptions};
pub use error::{SocketError, TransportError};
pub use message::Message;
pub use push::Push;
pub use socket::{CloseStatus, Socket};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tether::prelude::*;
/// ```
pub mod prelude {
    pub use crate::channel::{Channel, ChannelState};
    pub use crate::config::{Params, SocketOptions};
    pub use crate::error::{SocketError, TransportError};
    pub use crate::message::Message;
    pub use crate::push::Push;
    pub use crate::socket::{CloseStatus, Socket};
    pub use crate::timer::{Scheduler, TaskHandle};
    pub use crate::transport::{ReadyState, Transport, TransportDelegate, TransportFactory};
}
