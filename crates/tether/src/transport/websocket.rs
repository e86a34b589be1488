//! Bundled WebSocket transport built on `tokio-tungstenite`.
//!
//! A reader task fans inbound text frames into the delegate; writes go
//! through an unbounded command queue so [`Transport::send`] never blocks.
//! Binary frames are ignored (the V2 protocol is text-only) and ping/pong is
//! handled by tungstenite itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use super::{ReadyState, Transport, TransportDelegate, TransportFactory, upgrade_url_scheme};
use crate::error::TransportError;

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

// Close code reported when the connection dropped without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

enum Command {
    Send(String),
    Close(u16, Option<String>),
}

/// A `tokio-tungstenite` client connection implementing the transport
/// contract. One instance serves one connection attempt; the socket's
/// transport factory builds a fresh one per connect.
pub struct WebSocketTransport {
    url: Url,
    state: Arc<AtomicU8>,
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl WebSocketTransport {
    /// Create a transport for the given endpoint. The scheme is upgraded to
    /// `ws`/`wss` here; TLS is negotiated by tungstenite based on the scheme.
    pub fn new(url: Url) -> Self {
        Self {
            url: upgrade_url_scheme(url),
            state: Arc::new(AtomicU8::new(STATE_CLOSED)),
            sender: Mutex::new(None),
        }
    }

    /// A transport factory producing one `WebSocketTransport` per attempt.
    pub fn factory() -> TransportFactory {
        Arc::new(|url| Arc::new(WebSocketTransport::new(url.clone())))
    }

    /// The (scheme-upgraded) endpoint this transport connects to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => ReadyState::Connecting,
            STATE_OPEN => ReadyState::Open,
            STATE_CLOSING => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    fn connect(&self, delegate: Arc<dyn TransportDelegate>) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::error!("websocket transport requires a tokio runtime");
                delegate.on_error(TransportError::ConnectionFailed(
                    "no tokio runtime available".to_string(),
                ));
                delegate.on_close(ABNORMAL_CLOSURE);
                return;
            }
        };

        self.state.store(STATE_CONNECTING, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);

        let url = self.url.clone();
        let state = self.state.clone();
        runtime.spawn(run_connection(url, state, rx, delegate));
    }

    fn disconnect(&self, code: u16, reason: Option<&str>) {
        self.state.store(STATE_CLOSING, Ordering::SeqCst);
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(Command::Close(code, reason.map(str::to_string)));
        }
    }

    fn send(&self, data: String) {
        let sent = self
            .sender
            .lock()
            .as_ref()
            .map(|sender| sender.send(Command::Send(data)).is_ok())
            .unwrap_or(false);
        if !sent {
            tracing::warn!("websocket send with no live connection, frame dropped");
        }
    }
}

async fn run_connection(
    url: Url,
    state: Arc<AtomicU8>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    delegate: Arc<dyn TransportDelegate>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(error) => {
            state.store(STATE_CLOSED, Ordering::SeqCst);
            delegate.on_error(TransportError::ConnectionFailed(error.to_string()));
            delegate.on_close(ABNORMAL_CLOSURE);
            return;
        }
    };

    state.store(STATE_OPEN, Ordering::SeqCst);
    delegate.on_open();

    let (mut sink, mut source) = stream.split();

    // Writer: drain the command queue into the sink.
    let writer = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Send(text) => {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Command::Close(code, reason) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.unwrap_or_default().into(),
                    };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    // Reader: fan frames into the delegate until the connection ends.
    let close_code = loop {
        match source.next().await {
            Some(Ok(WsMessage::Text(text))) => delegate.on_message(text.to_string()),
            Some(Ok(WsMessage::Close(frame))) => {
                break frame.map(|f| u16::from(f.code)).unwrap_or(1000);
            }
            // Binary frames are not part of the V2 JSON protocol; ping/pong
            // is answered by tungstenite internally.
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                delegate.on_error(TransportError::Websocket(error.to_string()));
                break ABNORMAL_CLOSURE;
            }
            None => break 1000,
        }
    };

    state.store(STATE_CLOSED, Ordering::SeqCst);
    writer.abort();
    delegate.on_close(close_code);
}
