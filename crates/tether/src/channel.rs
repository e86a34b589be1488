//! Per-topic multiplex endpoint on a socket connection.
//!
//! A channel is a small state machine:
//!
//! ```text
//! closed   --join-->   joining
//! joining  --ok-->     joined
//! joining  --error-->  errored
//! joining  --timeout-> errored
//! joined   --error-->  errored
//! joined   --leave-->  leaving
//! leaving  --ok|close|timeout--> closed
//! errored  --rejoin--> joining
//! any      --phx_close--> closed
//! ```
//!
//! Pushes sent while not joined are buffered and flushed, in submission
//! order, when the join reply arrives. Every outbound frame is stamped with
//! the channel's `join_ref` (the ref of its current join push); inbound
//! lifecycle events carrying a stale `join_ref` belong to a previous
//! incarnation and are dropped.
//!
//! # Example
//!
//! ```ignore
//! let channel = socket.channel("rooms:lobby", json!({ "token": "abc" }));
//! channel.on("new_msg", |message| println!("{}", message.response()));
//!
//! channel
//!     .join()
//!     .receive("ok", |resp| println!("joined: {resp}"))
//!     .receive("error", |resp| println!("rejected: {resp}"));
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::message::{
    Message, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY, is_lifecycle_event,
    reply_event_name,
};
use crate::push::Push;
use crate::socket::SocketCore;
use crate::timer::TimeoutTimer;

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not joined; the initial state, and the terminal state after a leave
    /// or a server-side close.
    Closed,
    /// The join (or a push) failed, or the connection dropped; a rejoin is
    /// pending.
    Errored,
    /// The join reply arrived with status ok.
    Joined,
    /// A join push is in flight.
    Joining,
    /// A leave push is in flight.
    Leaving,
}

impl ChannelState {
    /// Lowercase name, for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
            ChannelState::Joined => "joined",
            ChannelState::Joining => "joining",
            ChannelState::Leaving => "leaving",
        }
    }
}

struct Binding {
    event: String,
    ref_id: u64,
    callback: Arc<dyn Fn(&Message) + Send + Sync>,
}

// ============================================================================
// Channel handle
// ============================================================================

/// Handle to a per-topic channel. Cloning shares the channel.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    /// The channel topic.
    pub fn topic(&self) -> &str {
        self.core.topic()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// The ref of the current join push, stamped on every outbound frame.
    pub fn join_ref(&self) -> Option<String> {
        self.core.join_ref()
    }

    /// Whether the channel is joined.
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// Whether a join is in flight.
    pub fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    /// Whether the channel errored and awaits a rejoin.
    pub fn is_errored(&self) -> bool {
        self.state() == ChannelState::Errored
    }

    /// Whether a push would go out immediately (socket open and joined).
    pub fn can_push(&self) -> bool {
        self.core.can_push()
    }

    /// Join the channel with the default timeout.
    ///
    /// Returns the join push so observers can attach before the reply
    /// arrives.
    ///
    /// # Panics
    ///
    /// Panics if called more than once on the same channel; rejoins are
    /// handled internally (or explicitly via [`Channel::rejoin`]).
    pub fn join(&self) -> Push {
        let timeout = self.core.default_timeout();
        self.join_with_timeout(timeout)
    }

    /// Join the channel, bounding the join reply wait to `timeout`.
    ///
    /// # Panics
    ///
    /// Panics if called more than once on the same channel.
    pub fn join_with_timeout(&self, timeout: Duration) -> Push {
        assert!(
            !self.core.joined_once.swap(true, Ordering::SeqCst),
            "tried to join channel \"{}\" multiple times; join() can only be called once",
            self.core.topic
        );
        self.core.set_default_timeout(timeout);
        self.core.rejoin(Some(timeout));
        self.core.join_push.clone()
    }

    /// Re-enter `joining` after an error, evicting any duplicate live
    /// channel for the same topic first. No-op while leaving.
    pub fn rejoin(&self) {
        self.core.rejoin(None);
    }

    /// Leave the channel with the default timeout.
    pub fn leave(&self) -> Push {
        let timeout = self.core.default_timeout();
        self.leave_with_timeout(timeout)
    }

    /// Leave the channel.
    ///
    /// Cancels any pending rejoin, sends `phx_leave` and closes the channel
    /// when its reply (or the timeout) arrives. When the channel cannot push
    /// (socket closed or not joined) the ok is synthesized locally so the
    /// caller still observes completion.
    pub fn leave_with_timeout(&self, timeout: Duration) -> Push {
        self.core.leave(timeout)
    }

    /// Push an event to the server with the default timeout.
    ///
    /// # Panics
    ///
    /// Panics if called before [`Channel::join`].
    pub fn push(&self, event: impl Into<String>, payload: Value) -> Push {
        let timeout = self.core.default_timeout();
        self.push_with_timeout(event, payload, timeout)
    }

    /// Push an event to the server, bounding the reply wait to `timeout`.
    ///
    /// While not joined the push is buffered (its timeout clock already
    /// running) and flushed on the next successful join.
    ///
    /// # Panics
    ///
    /// Panics if called before [`Channel::join`].
    pub fn push_with_timeout(
        &self,
        event: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Push {
        let event = event.into();
        assert!(
            self.core.joined_once.load(Ordering::SeqCst),
            "tried to push \"{}\" to \"{}\" before joining; call join() first",
            event,
            self.core.topic
        );

        let push = Push::new(Arc::downgrade(&self.core), event, payload, timeout);
        if self.core.can_push() {
            push.send();
        } else {
            push.start_timeout();
            self.core.push_buffer.lock().push(push.clone());
        }
        push
    }

    /// Subscribe to an event; the returned ref cancels via [`Channel::off_ref`].
    ///
    /// The callback receives the raw frame; for replies use
    /// [`Message::status`] and [`Message::response`].
    pub fn on(&self, event: impl Into<String>, callback: impl Fn(&Message) + Send + Sync + 'static) -> u64 {
        self.core.bind(event.into(), Arc::new(callback))
    }

    /// Remove every subscription for an event.
    pub fn off(&self, event: &str) {
        self.core
            .bindings
            .lock()
            .retain(|binding| binding.event != event);
    }

    /// Remove one subscription by the ref returned from [`Channel::on`].
    pub fn off_ref(&self, binding_ref: u64) {
        self.core.unbind_ref(binding_ref);
    }

    /// The params sent with the join push.
    pub fn params(&self) -> Value {
        self.core.params.lock().clone()
    }

    /// Replace the channel params; the new params are mirrored into the
    /// stored join push payload and used by the next (re)join.
    pub fn set_params(&self, params: Value) {
        *self.core.params.lock() = params.clone();
        self.core.join_push.set_payload(params);
    }

    pub(crate) fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }
}

// ============================================================================
// Channel core
// ============================================================================

pub(crate) struct ChannelCore {
    topic: String,
    weak_self: Weak<ChannelCore>,
    socket: Weak<SocketCore>,
    state: Mutex<ChannelState>,
    timeout: Mutex<Duration>,
    joined_once: AtomicBool,
    params: Mutex<Value>,
    join_push: Push,
    push_buffer: Mutex<Vec<Push>>,
    rejoin_timer: TimeoutTimer,
    bindings: Mutex<Vec<Binding>>,
    binding_ref: AtomicU64,
}

impl ChannelCore {
    pub(crate) fn build(
        topic: impl Into<String>,
        params: Value,
        socket: &Arc<SocketCore>,
    ) -> Arc<Self> {
        let topic = topic.into();
        let timeout = socket.default_timeout();

        let core = Arc::new_cyclic(|weak: &Weak<ChannelCore>| {
            let join_push = Push::new(weak.clone(), PHX_JOIN, params.clone(), timeout);

            // The rejoin timer must not keep the channel alive.
            let rejoin_weak = weak.clone();
            let rejoin_timer = TimeoutTimer::new(
                socket.scheduler(),
                socket.rejoin_after(),
                Arc::new(move || {
                    if let Some(channel) = rejoin_weak.upgrade() {
                        if channel.socket_connected() {
                            channel.rejoin(None);
                        }
                    }
                }),
            );

            ChannelCore {
                topic,
                weak_self: weak.clone(),
                socket: Arc::downgrade(socket),
                state: Mutex::new(ChannelState::Closed),
                timeout: Mutex::new(timeout),
                joined_once: AtomicBool::new(false),
                params: Mutex::new(params),
                join_push,
                push_buffer: Mutex::new(Vec::new()),
                rejoin_timer,
                bindings: Mutex::new(Vec::new()),
                binding_ref: AtomicU64::new(1),
            }
        });

        core.install_hooks();
        core
    }

    fn install_hooks(&self) {
        let weak = self.weak_self.clone();
        self.join_push.receive("ok", move |_response| {
            if let Some(channel) = weak.upgrade() {
                channel.handle_join_ok();
            }
        });

        let weak = self.weak_self.clone();
        self.join_push.receive("error", move |_response| {
            if let Some(channel) = weak.upgrade() {
                channel.handle_join_error();
            }
        });

        let weak = self.weak_self.clone();
        self.join_push.receive("timeout", move |_response| {
            if let Some(channel) = weak.upgrade() {
                channel.handle_join_timeout();
            }
        });

        let weak = self.weak_self.clone();
        self.bind(
            PHX_CLOSE.to_string(),
            Arc::new(move |_message| {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_close();
                }
            }),
        );

        let weak = self.weak_self.clone();
        self.bind(
            PHX_ERROR.to_string(),
            Arc::new(move |_message| {
                if let Some(channel) = weak.upgrade() {
                    channel.handle_error();
                }
            }),
        );
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_push.msg_ref()
    }

    pub(crate) fn socket(&self) -> Option<Arc<SocketCore>> {
        self.socket.upgrade()
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn set_default_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    fn socket_connected(&self) -> bool {
        self.socket()
            .map(|socket| socket.is_connected())
            .unwrap_or(false)
    }

    pub(crate) fn can_push(&self) -> bool {
        self.socket_connected() && self.state() == ChannelState::Joined
    }

    fn log(&self, line: String) {
        if let Some(socket) = self.socket() {
            socket.log(&line);
        }
    }

    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    pub(crate) fn bind(
        &self,
        event: String,
        callback: Arc<dyn Fn(&Message) + Send + Sync>,
    ) -> u64 {
        let ref_id = self.binding_ref.fetch_add(1, Ordering::Relaxed);
        self.bindings.lock().push(Binding {
            event,
            ref_id,
            callback,
        });
        ref_id
    }

    pub(crate) fn unbind_ref(&self, binding_ref: u64) {
        self.bindings
            .lock()
            .retain(|binding| binding.ref_id != binding_ref);
    }

    // ------------------------------------------------------------------
    // Message routing
    // ------------------------------------------------------------------

    /// Whether an inbound frame belongs to this channel.
    ///
    /// Lifecycle events stamped with a foreign `join_ref` come from a prior
    /// incarnation of the topic and are dropped with a log.
    pub(crate) fn is_member(&self, message: &Message) -> bool {
        if message.topic != self.topic {
            return false;
        }

        if let Some(join_ref) = &message.join_ref {
            if is_lifecycle_event(&message.event)
                && self.join_ref().as_deref() != Some(join_ref.as_str())
            {
                tracing::warn!(
                    topic = %self.topic,
                    event = %message.event,
                    stale_join_ref = %join_ref,
                    "dropping outdated lifecycle message"
                );
                self.log(format!(
                    "channel dropping outdated {} for \"{}\" (join_ref {})",
                    message.event, self.topic, join_ref
                ));
                return false;
            }
        }

        true
    }

    /// Dispatch an inbound (or synthesized) frame to the matching bindings.
    ///
    /// Replies are rerouted to the `chan_reply_<ref>` correlator their push
    /// registered.
    pub(crate) fn trigger(&self, message: &Message) {
        if message.event == PHX_REPLY {
            if let Some(msg_ref) = &message.msg_ref {
                let mut rewritten = message.clone();
                rewritten.event = reply_event_name(msg_ref);
                self.dispatch(&rewritten);
            }
            return;
        }
        self.dispatch(message);
    }

    fn dispatch(&self, message: &Message) {
        let callbacks: Vec<Arc<dyn Fn(&Message) + Send + Sync>> = self
            .bindings
            .lock()
            .iter()
            .filter(|binding| binding.event == message.event)
            .map(|binding| binding.callback.clone())
            .collect();
        for callback in callbacks {
            callback(message);
        }
    }

    // ------------------------------------------------------------------
    // Join / leave / rejoin
    // ------------------------------------------------------------------

    /// Re-enter `joining` and resend the join push with a fresh ref.
    ///
    /// Any other channel still live on the same topic is told to leave
    /// first, so the server never sees two live joins for one topic.
    pub(crate) fn rejoin(&self, timeout: Option<Duration>) {
        if self.state() == ChannelState::Leaving {
            return;
        }
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());

        if let Some(socket) = self.socket() {
            socket.leave_open_topic(&self.topic, self);
        }

        *self.state.lock() = ChannelState::Joining;
        self.join_push.resend(timeout);
    }

    pub(crate) fn leave(&self, timeout: Duration) -> Push {
        self.rejoin_timer.reset();
        self.join_push.cancel_timeout();
        *self.state.lock() = ChannelState::Leaving;

        let on_close = |weak: Weak<ChannelCore>| {
            move |_response: &Value| {
                if let Some(channel) = weak.upgrade() {
                    channel.log(format!("channel leave \"{}\"", channel.topic));
                    let close = Message::new(
                        channel.topic.clone(),
                        PHX_CLOSE,
                        json!({ "reason": "leave" }),
                    );
                    channel.trigger(&close);
                }
            }
        };

        let leave_push = Push::new(self.weak_self.clone(), PHX_LEAVE, json!({}), timeout);
        leave_push.receive("ok", on_close(self.weak_self.clone()));
        leave_push.receive("timeout", on_close(self.weak_self.clone()));
        leave_push.send();

        // Not pushable: the server will never reply, complete locally.
        if !self.can_push() {
            leave_push.trigger("ok", json!({}));
        }

        leave_push
    }

    // ------------------------------------------------------------------
    // Lifecycle reactions
    // ------------------------------------------------------------------

    fn handle_join_ok(&self) {
        *self.state.lock() = ChannelState::Joined;
        self.rejoin_timer.reset();
        self.log(format!("channel joined \"{}\"", self.topic));

        // Flush deferred pushes in submission order.
        let buffered: Vec<Push> = std::mem::take(&mut *self.push_buffer.lock());
        for push in buffered {
            push.send();
        }
    }

    fn handle_join_error(&self) {
        if self.state() == ChannelState::Leaving {
            return;
        }
        self.log(format!("channel join error \"{}\"", self.topic));
        *self.state.lock() = ChannelState::Errored;
        if self.socket_connected() {
            self.rejoin_timer.schedule();
        }
    }

    fn handle_join_timeout(&self) {
        if self.state() != ChannelState::Joining {
            return;
        }
        self.log(format!(
            "channel join timeout \"{}\" ({:?})",
            self.topic,
            self.default_timeout()
        ));

        // Tell the server to abandon the stale join attempt.
        let leave_push = Push::new(
            self.weak_self.clone(),
            PHX_LEAVE,
            json!({}),
            self.default_timeout(),
        );
        leave_push.send();

        *self.state.lock() = ChannelState::Errored;
        self.join_push.reset();
        if self.socket_connected() {
            self.rejoin_timer.schedule();
        }
    }

    fn handle_close(&self) {
        self.rejoin_timer.reset();
        self.log(format!("channel close \"{}\"", self.topic));
        *self.state.lock() = ChannelState::Closed;
        if let Some(socket) = self.socket() {
            socket.remove_channel(self);
        }
    }

    fn handle_error(&self) {
        let state = self.state();
        if state == ChannelState::Leaving || state == ChannelState::Closed {
            return;
        }
        self.log(format!("channel error \"{}\"", self.topic));

        if state == ChannelState::Joining {
            // The pending join must not be retransmitted verbatim when the
            // socket reopens; drop it from the send buffer and start over.
            if let (Some(socket), Some(join_ref)) = (self.socket(), self.join_ref()) {
                socket.remove_from_send_buffer(&join_ref);
            }
            self.join_push.reset();
        }

        *self.state.lock() = ChannelState::Errored;
        if self.socket_connected() {
            self.rejoin_timer.schedule();
        }
    }

    /// Socket-level error/close fan-out: transition to errored and fail
    /// every push that was awaiting a reply.
    pub(crate) fn trigger_error(&self) {
        let error = Message::new(self.topic.clone(), PHX_ERROR, json!({}));
        self.trigger(&error);
        self.fail_in_flight_pushes();
    }

    /// Socket reopened: rejoin if this channel errored while it was down.
    pub(crate) fn handle_socket_open(&self) {
        self.rejoin_timer.reset();
        if self.state() == ChannelState::Errored {
            self.rejoin(None);
        }
    }

    fn fail_in_flight_pushes(&self) {
        // Buffered pushes were never written to the transport; they stay
        // queued for the next join. Everything else with a live correlator
        // was awaiting a reply that can no longer arrive.
        let buffered: HashSet<String> = self
            .push_buffer
            .lock()
            .iter()
            .filter_map(|push| push.ref_event())
            .collect();

        let reply_prefix = reply_event_name("");
        let in_flight: Vec<String> = self
            .bindings
            .lock()
            .iter()
            .filter(|binding| {
                binding.event.starts_with(&reply_prefix) && !buffered.contains(&binding.event)
            })
            .map(|binding| binding.event.clone())
            .collect();

        for ref_event in in_flight {
            let failure = Message {
                join_ref: self.join_ref(),
                msg_ref: None,
                topic: self.topic.clone(),
                event: ref_event,
                payload: json!({ "status": "error", "response": { "reason": "push_failed" } }),
            };
            self.dispatch(&failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_state_names() {
        assert_eq!(ChannelState::Closed.as_str(), "closed");
        assert_eq!(ChannelState::Errored.as_str(), "errored");
        assert_eq!(ChannelState::Joined.as_str(), "joined");
        assert_eq!(ChannelState::Joining.as_str(), "joining");
        assert_eq!(ChannelState::Leaving.as_str(), "leaving");
    }
}
