//! A single request/response exchange over a channel.
//!
//! A `Push` is created by [`Channel::push`](crate::channel::Channel::push),
//! [`join`](crate::channel::Channel::join) and
//! [`leave`](crate::channel::Channel::leave). Sending allocates a `ref`,
//! registers a one-shot reply correlator on the channel and starts the
//! timeout clock; the push completes with the first matching reply, or with
//! status `"timeout"` when no reply arrives in time. Observers attach with
//! [`Push::receive`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::channel::ChannelCore;
use crate::message::{Message, reply_event_name};
use crate::timer::TaskHandle;

type ReplyHook = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle to one request/response exchange. Cloning shares the exchange.
#[derive(Clone)]
pub struct Push {
    core: Arc<PushCore>,
}

pub(crate) struct PushCore {
    channel: Weak<ChannelCore>,
    event: String,
    payload: Mutex<Value>,
    timeout: Mutex<Duration>,
    msg_ref: Mutex<Option<String>>,
    ref_event: Mutex<Option<String>>,
    binding_ref: Mutex<Option<u64>>,
    received: Mutex<Option<(String, Value)>>,
    hooks: Mutex<Vec<(String, ReplyHook)>>,
    sent: AtomicBool,
    timeout_handle: Mutex<Option<TaskHandle>>,
}

impl Push {
    pub(crate) fn new(
        channel: Weak<ChannelCore>,
        event: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Self {
        Self {
            core: Arc::new(PushCore {
                channel,
                event: event.into(),
                payload: Mutex::new(payload),
                timeout: Mutex::new(timeout),
                msg_ref: Mutex::new(None),
                ref_event: Mutex::new(None),
                binding_ref: Mutex::new(None),
                received: Mutex::new(None),
                hooks: Mutex::new(Vec::new()),
                sent: AtomicBool::new(false),
                timeout_handle: Mutex::new(None),
            }),
        }
    }

    /// The event this push sends.
    pub fn event(&self) -> &str {
        &self.core.event
    }

    /// The ref assigned at send time, if any.
    pub fn msg_ref(&self) -> Option<String> {
        self.core.msg_ref.lock().clone()
    }

    /// The payload that will be (or was) sent.
    pub fn payload(&self) -> Value {
        self.core.payload.lock().clone()
    }

    /// Whether the push has been written to (or enqueued on) the socket.
    pub fn is_sent(&self) -> bool {
        self.core.sent.load(Ordering::SeqCst)
    }

    /// Whether a reply with the given status has been recorded.
    pub fn has_received(&self, status: &str) -> bool {
        self.core
            .received
            .lock()
            .as_ref()
            .map(|(s, _)| s == status)
            .unwrap_or(false)
    }

    /// Attach an observer for replies with the given status (`"ok"`,
    /// `"error"`, `"timeout"`, or any server-defined status).
    ///
    /// If the push already completed with that status, the hook fires
    /// immediately with the recorded response; it stays attached and will
    /// fire again if the push is resent and completes again.
    pub fn receive(&self, status: &str, hook: impl Fn(&Value) + Send + Sync + 'static) -> Push {
        let hook: ReplyHook = Arc::new(hook);

        let already = self.core.received.lock().clone();
        if let Some((recorded, response)) = already {
            if recorded == status {
                hook(&response);
            }
        }

        self.core.hooks.lock().push((status.to_string(), hook));
        self.clone()
    }

    // ------------------------------------------------------------------
    // Crate-internal lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn set_payload(&self, payload: Value) {
        *self.core.payload.lock() = payload;
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        *self.core.timeout.lock() = timeout;
    }

    pub(crate) fn ref_event(&self) -> Option<String> {
        self.core.ref_event.lock().clone()
    }

    /// Send the push over the owning channel's socket.
    ///
    /// A push that already timed out stays dead until `reset`. When the
    /// owning channel (or its socket) is gone this is a no-op.
    pub(crate) fn send(&self) {
        if self.has_received("timeout") {
            return;
        }
        self.start_timeout();

        let Some(channel) = self.core.channel.upgrade() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };

        self.core.sent.store(true, Ordering::SeqCst);

        let message = Message {
            join_ref: channel.join_ref(),
            msg_ref: self.core.msg_ref.lock().clone(),
            topic: channel.topic().to_string(),
            event: self.core.event.clone(),
            payload: self.core.payload.lock().clone(),
        };
        socket.push_message(message);
    }

    /// Reset and send again with a new timeout; used by rejoin.
    pub(crate) fn resend(&self, timeout: Duration) {
        self.set_timeout(timeout);
        self.reset();
        self.send();
    }

    /// Clear the ref, correlator and recorded reply so the push can be sent
    /// as a fresh exchange. Attached hooks survive.
    pub(crate) fn reset(&self) {
        self.cancel_ref_event();
        *self.core.msg_ref.lock() = None;
        *self.core.ref_event.lock() = None;
        *self.core.received.lock() = None;
        self.core.sent.store(false, Ordering::SeqCst);
    }

    /// Allocate a ref, register the reply correlator on the channel and
    /// start the timeout clock. With `timeout == 0` the push never times
    /// out.
    pub(crate) fn start_timeout(&self) {
        self.cancel_ref_event();
        self.cancel_timeout();

        let Some(channel) = self.core.channel.upgrade() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };

        let msg_ref = socket.make_ref();
        let ref_event = reply_event_name(&msg_ref);
        *self.core.msg_ref.lock() = Some(msg_ref);
        *self.core.ref_event.lock() = Some(ref_event.clone());

        // One-shot correlator: the first completion tears it down, so a
        // later reply to the same ref finds no receiver.
        let core = self.core.clone();
        let binding_ref = channel.bind(
            ref_event,
            Arc::new(move |message: &Message| {
                let push = Push { core: core.clone() };
                push.cancel_ref_event();
                push.cancel_timeout();

                let Some(status) = message.payload.get("status").and_then(Value::as_str) else {
                    return;
                };
                let response = message
                    .payload
                    .get("response")
                    .cloned()
                    .unwrap_or(Value::Null);
                push.record_and_match(status, response);
            }),
        );
        *self.core.binding_ref.lock() = Some(binding_ref);

        let timeout = *self.core.timeout.lock();
        if timeout.is_zero() {
            return;
        }

        let event = self.core.event.clone();
        let payload = self.core.payload.lock().clone();
        let core = self.core.clone();
        let handle = socket.scheduler().schedule(
            timeout,
            Box::new(move || {
                let push = Push { core };
                let diagnostics = json!({ "event": event, "payload": payload });
                push.trigger("timeout", diagnostics);
            }),
        );
        *self.core.timeout_handle.lock() = Some(handle);
    }

    /// Synthesize a reply on the owning channel.
    ///
    /// Routes through the channel's correlator so completion bookkeeping is
    /// identical to a real reply. No-op when the push has no live correlator
    /// (never sent, already completed, or the channel is gone).
    pub(crate) fn trigger(&self, status: &str, response: Value) {
        let Some(ref_event) = self.core.ref_event.lock().clone() else {
            return;
        };
        let Some(channel) = self.core.channel.upgrade() else {
            return;
        };

        let message = Message {
            join_ref: channel.join_ref(),
            msg_ref: self.core.msg_ref.lock().clone(),
            topic: channel.topic().to_string(),
            event: ref_event,
            payload: json!({ "status": status, "response": response }),
        };
        channel.trigger(&message);
    }

    pub(crate) fn cancel_timeout(&self) {
        if let Some(handle) = self.core.timeout_handle.lock().take() {
            handle.cancel();
        }
    }

    pub(crate) fn cancel_ref_event(&self) {
        let binding_ref = self.core.binding_ref.lock().take();
        if let Some(binding_ref) = binding_ref {
            if let Some(channel) = self.core.channel.upgrade() {
                channel.unbind_ref(binding_ref);
            }
        }
    }

    fn record_and_match(&self, status: &str, response: Value) {
        *self.core.received.lock() = Some((status.to_string(), response.clone()));

        let hooks: Vec<ReplyHook> = self
            .core
            .hooks
            .lock()
            .iter()
            .filter(|(s, _)| s == status)
            .map(|(_, hook)| hook.clone())
            .collect();
        for hook in hooks {
            hook(&response);
        }
    }
}
