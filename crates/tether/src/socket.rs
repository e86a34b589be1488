//! The socket: one WebSocket connection multiplexing many channels.
//!
//! The socket owns the transport handle, the channel registry, the outbound
//! send buffer and the ref allocator. It supervises the connection with
//! periodic heartbeats and schedules reconnects with stepped back-off when
//! the transport drops abnormally. Channels never touch the transport; all
//! traffic flows through [`SocketCore::push_message`] and inbound frames are
//! demultiplexed to every channel claiming membership.
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use tether::{Socket, SocketOptions};
//!
//! let socket = Socket::new("https://example.com/socket", SocketOptions::new());
//! socket.connect()?;
//!
//! let channel = socket.channel("rooms:lobby", json!({}));
//! channel.join().receive("ok", |resp| println!("joined: {resp}"));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use crate::channel::{Channel, ChannelCore, ChannelState};
use crate::config::{BackoffFn, LoggerFn, Params, SocketOptions};
use crate::error::{SocketError, TransportError};
use crate::events::CallbackList;
use crate::message::Message;
use crate::serializer::{DecodeFn, EncodeFn};
use crate::timer::{HeartbeatTimer, Scheduler, TimeoutTimer, TokioScheduler};
use crate::transport::{ReadyState, Transport, TransportDelegate, TransportFactory};

// ============================================================================
// Close status
// ============================================================================

/// Why (or whether) the connection closed, deciding reconnect behavior.
///
/// `Abnormal` can only be set by the client itself on heartbeat timeout and
/// is never overridden by the transport's subsequent close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    /// No close observed yet, or the cause is not known.
    Unknown,
    /// Clean close: user-initiated, or transport code 1000.
    Clean,
    /// Transport code 1001 (going away); no automatic reconnect.
    Temporary,
    /// Abnormal close; reconnect is warranted.
    Abnormal,
}

impl CloseStatus {
    /// Classify a transport close code.
    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => CloseStatus::Clean,
            1001 => CloseStatus::Temporary,
            _ => CloseStatus::Abnormal,
        }
    }

    /// Whether a reconnect should be scheduled when the transport closes
    /// with this status in effect.
    pub fn should_reconnect(&self) -> bool {
        matches!(self, CloseStatus::Unknown | CloseStatus::Abnormal)
    }
}

// ============================================================================
// Socket handle
// ============================================================================

/// Handle to a socket. Cloning shares the connection.
#[derive(Clone)]
pub struct Socket {
    core: Arc<SocketCore>,
}

impl Socket {
    /// Create a socket using the bundled WebSocket transport.
    #[cfg(feature = "websocket")]
    pub fn new(endpoint: impl Into<String>, options: SocketOptions) -> Self {
        Self::with_transport(
            endpoint,
            options,
            crate::transport::websocket::WebSocketTransport::factory(),
        )
    }

    /// Create a socket with a custom transport factory.
    ///
    /// The factory is invoked once per connection attempt with the assembled
    /// endpoint URL.
    pub fn with_transport(
        endpoint: impl Into<String>,
        options: SocketOptions,
        transport_factory: TransportFactory,
    ) -> Self {
        let scheduler = options
            .scheduler
            .clone()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()) as Arc<dyn Scheduler>);

        let core = Arc::new_cyclic(|weak: &std::sync::Weak<SocketCore>| {
            // The reconnect timer must not keep the socket alive.
            let reconnect_weak = weak.clone();
            let reconnect_timer = TimeoutTimer::new(
                scheduler.clone(),
                options.reconnect_after.clone(),
                Arc::new(move || {
                    if let Some(socket) = reconnect_weak.upgrade() {
                        socket.reconnect();
                    }
                }),
            );

            SocketCore {
                weak_self: weak.clone(),
                endpoint: endpoint.into(),
                vsn: options.vsn,
                params: options.params,
                timeout: options.timeout,
                skip_heartbeat: options.skip_heartbeat,
                logger: options.logger,
                encode: options.encode,
                decode: options.decode,
                rejoin_after: options.rejoin_after,
                heartbeat: HeartbeatTimer::new(options.heartbeat_interval, scheduler.clone()),
                scheduler,
                transport_factory,
                ref_counter: AtomicU64::new(0),
                callback_ref: AtomicU64::new(1),
                conn_id: AtomicU64::new(0),
                pending_heartbeat_ref: Mutex::new(None),
                close_status: Mutex::new(CloseStatus::Unknown),
                channels: Mutex::new(Vec::new()),
                send_buffer: Mutex::new(Vec::new()),
                transport: Mutex::new(None),
                reconnect_timer,
                open_callbacks: CallbackList::new(),
                close_callbacks: CallbackList::new(),
                error_callbacks: CallbackList::new(),
                message_callbacks: CallbackList::new(),
            }
        });

        Socket { core }
    }

    /// Open the connection. No-op when already connecting or open.
    ///
    /// The endpoint URL is rebuilt against the current params provider on
    /// every call, so dynamic params (tokens) are re-evaluated. An
    /// unparseable endpoint is a fatal configuration error.
    pub fn connect(&self) -> Result<(), SocketError> {
        self.core.connect()
    }

    /// Close the connection with code 1000 and stay closed.
    pub fn disconnect(&self) {
        self.core.disconnect(1000, None);
    }

    /// Close the connection with an explicit code and reason.
    pub fn disconnect_with(&self, code: u16, reason: Option<&str>) {
        self.core.disconnect(code, reason);
    }

    /// Create and register a channel for a topic.
    ///
    /// A second channel for the same topic may coexist transiently; the
    /// duplicate still in `joining`/`joined` is told to leave when the other
    /// one (re)joins.
    pub fn channel(&self, topic: impl Into<String>, params: Value) -> Channel {
        let core = ChannelCore::build(topic, params, &self.core);
        self.core.channels.lock().push(core.clone());
        Channel::from_core(core)
    }

    /// Remove a channel from the registry, matching on its `join_ref`.
    pub fn remove(&self, channel: &Channel) {
        self.core.remove_channel(channel.core());
    }

    /// Allocate the next message ref. Wraps to 0 on overflow.
    pub fn make_ref(&self) -> String {
        self.core.make_ref()
    }

    /// Write a raw frame to the transport.
    ///
    /// While the transport is closed the frame is enqueued and flushed, in
    /// FIFO order, on the next open. Channels route their traffic through
    /// this; it is exposed for protocol-level frames that bypass a channel.
    pub fn push(&self, message: Message) {
        self.core.push_message(message);
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// The transport ready-state as a string, for diagnostics.
    pub fn connection_state(&self) -> &'static str {
        self.core.connection_state()
    }

    /// The current close status.
    pub fn close_status(&self) -> CloseStatus {
        *self.core.close_status.lock()
    }

    /// The endpoint as configured.
    pub fn endpoint(&self) -> &str {
        &self.core.endpoint
    }

    /// The assembled endpoint URL: `/websocket` appended, `vsn` and the
    /// resolved params merged into the query string.
    pub fn endpoint_url(&self) -> Result<Url, SocketError> {
        self.core.endpoint_url()
    }

    /// Observe socket-opened events. Returns a ref for [`Socket::off`].
    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) -> u64 {
        let cb_ref = self.core.next_callback_ref();
        self.core
            .open_callbacks
            .add(cb_ref, Arc::new(move |_: &()| callback()));
        cb_ref
    }

    /// Observe socket-closed events with the close code.
    pub fn on_close(&self, callback: impl Fn(u16) + Send + Sync + 'static) -> u64 {
        let cb_ref = self.core.next_callback_ref();
        self.core
            .close_callbacks
            .add(cb_ref, Arc::new(move |code: &u16| callback(*code)));
        cb_ref
    }

    /// Observe socket-errored events.
    pub fn on_error(&self, callback: impl Fn(&TransportError) + Send + Sync + 'static) -> u64 {
        let cb_ref = self.core.next_callback_ref();
        self.core.error_callbacks.add(cb_ref, Arc::new(callback));
        cb_ref
    }

    /// Observe every decoded inbound frame.
    pub fn on_message(&self, callback: impl Fn(&Message) + Send + Sync + 'static) -> u64 {
        let cb_ref = self.core.next_callback_ref();
        self.core.message_callbacks.add(cb_ref, Arc::new(callback));
        cb_ref
    }

    /// Cancel an observer registered with any of the `on_*` methods.
    pub fn off(&self, cb_ref: u64) {
        self.core.open_callbacks.remove(cb_ref);
        self.core.close_callbacks.remove(cb_ref);
        self.core.error_callbacks.remove(cb_ref);
        self.core.message_callbacks.remove(cb_ref);
    }
}

// ============================================================================
// Socket core
// ============================================================================

pub(crate) struct SocketCore {
    weak_self: std::sync::Weak<SocketCore>,
    endpoint: String,
    vsn: String,
    params: Params,
    timeout: Duration,
    skip_heartbeat: bool,
    logger: Option<LoggerFn>,
    encode: EncodeFn,
    decode: DecodeFn,
    rejoin_after: BackoffFn,
    scheduler: Arc<dyn Scheduler>,
    transport_factory: TransportFactory,

    ref_counter: AtomicU64,
    callback_ref: AtomicU64,
    // Connection generation; late events from a torn-down transport carry a
    // stale id and are ignored.
    conn_id: AtomicU64,
    pending_heartbeat_ref: Mutex<Option<String>>,
    close_status: Mutex<CloseStatus>,
    channels: Mutex<Vec<Arc<ChannelCore>>>,
    send_buffer: Mutex<Vec<(Option<String>, Message)>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    reconnect_timer: TimeoutTimer,
    heartbeat: HeartbeatTimer,

    open_callbacks: CallbackList<()>,
    close_callbacks: CallbackList<u16>,
    error_callbacks: CallbackList<TransportError>,
    message_callbacks: CallbackList<Message>,
}

impl SocketCore {
    // ------------------------------------------------------------------
    // Accessors used by channels and pushes
    // ------------------------------------------------------------------

    pub(crate) fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    pub(crate) fn rejoin_after(&self) -> BackoffFn {
        self.rejoin_after.clone()
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected_transport().is_some()
    }

    fn connection_state(&self) -> &'static str {
        self.transport
            .lock()
            .as_ref()
            .map(|transport| transport.ready_state().as_str())
            .unwrap_or("closed")
    }

    pub(crate) fn make_ref(&self) -> String {
        let next = self.ref_counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        next.to_string()
    }

    fn next_callback_ref(&self) -> u64 {
        self.callback_ref.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn log(&self, line: &str) {
        tracing::debug!("{}", line);
        if let Some(logger) = &self.logger {
            logger(line);
        }
    }

    fn connected_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .lock()
            .clone()
            .filter(|transport| transport.ready_state() == ReadyState::Open)
    }

    fn channels_snapshot(&self) -> Vec<Arc<ChannelCore>> {
        self.channels.lock().clone()
    }

    fn is_current(&self, conn_id: u64) -> bool {
        self.conn_id.load(Ordering::SeqCst) == conn_id
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    fn connect(&self) -> Result<(), SocketError> {
        if let Some(transport) = self.transport.lock().as_ref() {
            if matches!(
                transport.ready_state(),
                ReadyState::Connecting | ReadyState::Open
            ) {
                return Ok(());
            }
        }

        *self.close_status.lock() = CloseStatus::Unknown;
        let url = self.endpoint_url()?;
        self.log(&format!("socket connecting to {}", url));

        let transport = (self.transport_factory)(&url);
        let conn_id = self.conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        *self.transport.lock() = Some(transport.clone());

        let delegate = Arc::new(SocketDelegate {
            socket: self.weak_self.clone(),
            conn_id,
        });
        transport.connect(delegate);
        Ok(())
    }

    fn disconnect(&self, code: u16, reason: Option<&str>) {
        *self.close_status.lock() = CloseStatus::Clean;
        self.reconnect_timer.reset();
        // Late events from the torn-down connection are ignored.
        self.conn_id.fetch_add(1, Ordering::SeqCst);
        self.heartbeat.stop();
        *self.pending_heartbeat_ref.lock() = None;

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            self.log(&format!("socket disconnect (code {})", code));
            transport.disconnect(code, reason);
            self.close_callbacks.emit(&code);
        }
    }

    /// Reconnect-timer expiry: tear down whatever is left and dial again.
    fn reconnect(&self) {
        self.conn_id.fetch_add(1, Ordering::SeqCst);
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.disconnect(1000, Some("reconnect"));
        }
        self.heartbeat.stop();

        if let Err(error) = self.connect() {
            tracing::error!(%error, "reconnect failed");
            self.log(&format!("socket reconnect failed: {}", error));
        }
    }

    pub(crate) fn endpoint_url(&self) -> Result<Url, SocketError> {
        let mut url = Url::parse(&self.endpoint)?;
        if url.cannot_be_a_base() {
            return Err(SocketError::UnsupportedEndpoint(self.endpoint.clone()));
        }

        if !url.path().contains("/websocket") {
            let path = url.path().to_string();
            let appended = if path.ends_with('/') {
                format!("{}websocket", path)
            } else {
                format!("{}/websocket", path)
            };
            url.set_path(&appended);
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("vsn", &self.vsn);
            for (key, value) in self.params.resolve() {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                query.append_pair(&key, &value);
            }
        }

        Ok(url)
    }

    // ------------------------------------------------------------------
    // Outbound traffic
    // ------------------------------------------------------------------

    /// Write a frame to the transport, or enqueue it FIFO while closed.
    pub(crate) fn push_message(&self, message: Message) {
        self.log(&format!(
            "push {} {} ({:?}, {:?})",
            message.topic, message.event, message.join_ref, message.msg_ref
        ));

        match self.connected_transport() {
            Some(transport) => {
                let text = (self.encode)(&message);
                transport.send(text);
            }
            None => {
                self.send_buffer
                    .lock()
                    .push((message.msg_ref.clone(), message));
            }
        }
    }

    /// Drop a buffered frame by its ref (stale join retransmissions).
    pub(crate) fn remove_from_send_buffer(&self, msg_ref: &str) {
        self.send_buffer
            .lock()
            .retain(|(buffered_ref, _)| buffered_ref.as_deref() != Some(msg_ref));
    }

    fn flush_send_buffer(&self) {
        let buffered: Vec<(Option<String>, Message)> =
            std::mem::take(&mut *self.send_buffer.lock());
        for (_, message) in buffered {
            self.push_message(message);
        }
    }

    // ------------------------------------------------------------------
    // Channel registry
    // ------------------------------------------------------------------

    pub(crate) fn remove_channel(&self, channel: &ChannelCore) {
        let join_ref = channel.join_ref();
        self.channels.lock().retain(|registered| {
            if std::ptr::eq(Arc::as_ptr(registered), channel as *const ChannelCore) {
                return false;
            }
            match (&join_ref, registered.join_ref()) {
                (Some(removed), Some(kept)) => removed != &kept,
                _ => true,
            }
        });
    }

    /// Tell any other channel still live on `topic` to leave, so the server
    /// never holds two joins for the same topic.
    pub(crate) fn leave_open_topic(&self, topic: &str, except: &ChannelCore) {
        let duplicate = self
            .channels
            .lock()
            .iter()
            .find(|registered| {
                registered.topic() == topic
                    && !std::ptr::eq(Arc::as_ptr(registered), except as *const ChannelCore)
                    && matches!(
                        registered.state(),
                        ChannelState::Joined | ChannelState::Joining
                    )
            })
            .cloned();

        if let Some(duplicate) = duplicate {
            tracing::warn!(topic = %topic, "leaving duplicate topic");
            self.log(&format!("socket leaving duplicate topic \"{}\"", topic));
            duplicate.leave(self.timeout);
        }
    }

    fn trigger_channel_errors(&self) {
        for channel in self.channels_snapshot() {
            if !matches!(
                channel.state(),
                ChannelState::Errored | ChannelState::Leaving | ChannelState::Closed
            ) {
                channel.trigger_error();
            }
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    fn reset_heartbeat(&self) {
        *self.pending_heartbeat_ref.lock() = None;
        self.heartbeat.stop();
        if self.skip_heartbeat {
            return;
        }

        let weak = self.weak_self.clone();
        self.heartbeat.start(Box::new(move || {
            if let Some(socket) = weak.upgrade() {
                socket.send_heartbeat();
            }
        }));
    }

    fn send_heartbeat(&self) {
        if !self.is_connected() {
            return;
        }

        let unacknowledged = {
            let mut pending = self.pending_heartbeat_ref.lock();
            if pending.is_some() {
                *pending = None;
                true
            } else {
                false
            }
        };

        if unacknowledged {
            tracing::warn!("heartbeat timeout, closing connection");
            self.log("socket heartbeat timeout; closing connection");
            // Abnormal is sticky: the transport's 1000 close code must not
            // downgrade it, so the reconnect still triggers.
            *self.close_status.lock() = CloseStatus::Abnormal;
            let transport = self.transport.lock().clone();
            if let Some(transport) = transport {
                transport.disconnect(1000, Some("heartbeat timeout"));
            }
            return;
        }

        let msg_ref = self.make_ref();
        *self.pending_heartbeat_ref.lock() = Some(msg_ref.clone());
        self.push_message(Message::heartbeat(msg_ref));
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    fn on_conn_open(&self, conn_id: u64) {
        if !self.is_current(conn_id) {
            return;
        }
        self.log(&format!("socket connected to {}", self.endpoint));

        *self.close_status.lock() = CloseStatus::Unknown;
        self.flush_send_buffer();
        self.reconnect_timer.reset();
        self.reset_heartbeat();

        for channel in self.channels_snapshot() {
            channel.handle_socket_open();
        }
        self.open_callbacks.emit(&());
    }

    fn on_conn_close(&self, conn_id: u64, code: u16) {
        if !self.is_current(conn_id) {
            return;
        }
        self.log(&format!("socket closed (code {})", code));

        {
            let mut status = self.close_status.lock();
            if *status != CloseStatus::Abnormal {
                *status = CloseStatus::from_code(code);
            }
        }

        // The connection is finished; nothing further may arrive on it.
        self.conn_id.fetch_add(1, Ordering::SeqCst);
        let _ = self.transport.lock().take();

        self.trigger_channel_errors();
        self.heartbeat.stop();
        *self.pending_heartbeat_ref.lock() = None;

        if self.close_status.lock().should_reconnect() {
            self.reconnect_timer.schedule();
        }
        self.close_callbacks.emit(&code);
    }

    fn on_conn_error(&self, conn_id: u64, error: TransportError) {
        if !self.is_current(conn_id) {
            return;
        }
        tracing::error!(%error, "socket transport error");
        self.log(&format!("socket error: {}", error));

        self.trigger_channel_errors();
        self.error_callbacks.emit(&error);
    }

    fn on_conn_message(&self, conn_id: u64, text: String) {
        if !self.is_current(conn_id) {
            return;
        }

        let Some(message) = (self.decode)(&text) else {
            self.log("socket dropping malformed frame");
            return;
        };

        {
            let mut pending = self.pending_heartbeat_ref.lock();
            if pending.is_some() && *pending == message.msg_ref {
                *pending = None;
            }
        }

        self.log(&format!(
            "receive {} {} ({:?}, {:?})",
            message.topic, message.event, message.join_ref, message.msg_ref
        ));

        for channel in self.channels_snapshot() {
            if channel.is_member(&message) {
                channel.trigger(&message);
            }
        }
        self.message_callbacks.emit(&message);
    }
}

/// Bridges transport events back into the socket, dropping events from
/// stale connection generations.
struct SocketDelegate {
    socket: std::sync::Weak<SocketCore>,
    conn_id: u64,
}

impl TransportDelegate for SocketDelegate {
    fn on_open(&self) {
        if let Some(socket) = self.socket.upgrade() {
            socket.on_conn_open(self.conn_id);
        }
    }

    fn on_message(&self, text: String) {
        if let Some(socket) = self.socket.upgrade() {
            socket.on_conn_message(self.conn_id, text);
        }
    }

    fn on_error(&self, error: TransportError) {
        if let Some(socket) = self.socket.upgrade() {
            socket.on_conn_error(self.conn_id, error);
        }
    }

    fn on_close(&self, code: u16) {
        if let Some(socket) = self.socket.upgrade() {
            socket.on_conn_close(self.conn_id, code);
        }
    }
}
