//! Phoenix Channels V2 wire format.
//!
//! Every WebSocket text frame is a JSON array of exactly five elements:
//!
//! ```text
//! [join_ref, ref, topic, event, payload]
//! ```
//!
//! `join_ref` and `ref` are opaque decimal strings or `null`. Reserved
//! lifecycle events:
//!
//! - `phx_join`: join a channel topic
//! - `phx_leave`: leave a channel topic
//! - `phx_reply`: server reply to a client request
//! - `phx_error`: the channel crashed or the connection dropped
//! - `phx_close`: the channel closed
//! - `heartbeat`: keep the connection alive (topic: "phoenix")
//!
//! A reply payload has the shape `{"status": "<ok|error|...>", "response": {...}}`.
//! [`Message::response`] flattens `response` into the user-visible payload while
//! [`Message::status`] preserves the status.

use serde::{Serialize, Serializer};
use serde_json::{Value, json};

/// Event sent to join a channel topic.
pub const PHX_JOIN: &str = "phx_join";
/// Event sent to leave a channel topic.
pub const PHX_LEAVE: &str = "phx_leave";
/// Server reply to a client request.
pub const PHX_REPLY: &str = "phx_reply";
/// The channel errored on the server or the connection dropped.
pub const PHX_ERROR: &str = "phx_error";
/// The channel was closed.
pub const PHX_CLOSE: &str = "phx_close";
/// Keep-alive event, exchanged on the `phoenix` topic.
pub const HEARTBEAT: &str = "heartbeat";
/// Reserved topic for connection-level messages.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Returns true for the reserved channel lifecycle events.
///
/// Lifecycle events bearing a stale `join_ref` belong to a previous channel
/// incarnation and must be dropped by the receiver.
pub fn is_lifecycle_event(event: &str) -> bool {
    matches!(
        event,
        PHX_JOIN | PHX_LEAVE | PHX_REPLY | PHX_ERROR | PHX_CLOSE
    )
}

/// The synthetic event name a reply with the given ref is routed to.
pub fn reply_event_name(msg_ref: &str) -> String {
    format!("chan_reply_{}", msg_ref)
}

static NULL: Value = Value::Null;

/// A single V2 protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Join reference correlating messages within a channel incarnation.
    pub join_ref: Option<String>,
    /// Message reference for request/reply correlation.
    pub msg_ref: Option<String>,
    /// The topic (e.g., "rooms:lobby").
    pub topic: String,
    /// The event name (e.g., "phx_join", "new_msg").
    pub event: String,
    /// The payload exactly as it appears on the wire.
    pub payload: Value,
}

impl Message {
    /// Create a new message with no references.
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Set the join reference.
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Set the message reference.
    pub fn with_msg_ref(mut self, msg_ref: impl Into<String>) -> Self {
        self.msg_ref = Some(msg_ref.into());
        self
    }

    /// Create a reply message with a `{status, response}` payload.
    pub fn reply(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        status: &str,
        response: Value,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.into(),
            event: PHX_REPLY.to_string(),
            payload: json!({ "status": status, "response": response }),
        }
    }

    /// Create a heartbeat frame for the `phoenix` topic.
    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Self {
            join_ref: None,
            msg_ref: Some(msg_ref.into()),
            topic: PHOENIX_TOPIC.to_string(),
            event: HEARTBEAT.to_string(),
            payload: json!({}),
        }
    }

    /// Parse a V2 protocol frame from a JSON array.
    ///
    /// Returns `None` when the value is not the 5-tuple shape, or when a
    /// `phx_reply` frame is missing its `ref` or `status` (invalid per
    /// protocol).
    pub fn from_json(value: &Value) -> Option<Self> {
        let arr = value.as_array()?;
        if arr.len() != 5 {
            return None;
        }

        let join_ref = match &arr[0] {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            _ => return None,
        };
        let msg_ref = match &arr[1] {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            _ => return None,
        };

        let message = Message {
            join_ref,
            msg_ref,
            topic: arr[2].as_str()?.to_string(),
            event: arr[3].as_str()?.to_string(),
            payload: arr[4].clone(),
        };

        // A reply must carry a ref and a status, otherwise it cannot be
        // correlated to anything.
        if message.event == PHX_REPLY && (message.msg_ref.is_none() || message.status().is_none()) {
            return None;
        }

        Some(message)
    }

    /// Serialize to the V2 protocol JSON array.
    pub fn to_json(&self) -> Value {
        json!([
            self.join_ref,
            self.msg_ref,
            self.topic,
            self.event,
            self.payload
        ])
    }

    /// Whether this frame is a `phx_reply`.
    pub fn is_reply(&self) -> bool {
        self.event == PHX_REPLY
    }

    /// The reply status, if this frame carries one.
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// The user-visible payload.
    ///
    /// For replies this is the flattened `response` object; for any other
    /// event it is the payload itself.
    pub fn response(&self) -> &Value {
        if self.is_reply() {
            self.payload.get("response").unwrap_or(&NULL)
        } else {
            &self.payload
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
