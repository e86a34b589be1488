//! Default serializer-v2 encode/decode callables.
//!
//! The [`Socket`](crate::socket::Socket) never serializes frames itself; it
//! goes through a pair of callables so applications can swap in a custom
//! codec. The defaults here speak the JSON array format of [`crate::message`].

use std::sync::Arc;

use serde_json::Value;

use crate::message::Message;

/// Encodes an outbound message into a text frame.
pub type EncodeFn = Arc<dyn Fn(&Message) -> String + Send + Sync>;

/// Decodes an inbound text frame, or `None` when the frame is malformed.
///
/// Decode failures are absorbed: the socket logs and drops the frame.
pub type DecodeFn = Arc<dyn Fn(&str) -> Option<Message> + Send + Sync>;

/// Encode a message as a serializer-v2 JSON array.
pub fn encode(message: &Message) -> String {
    message.to_json().to_string()
}

/// Decode a serializer-v2 JSON array into a message.
pub fn decode(text: &str) -> Option<Message> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, "dropping frame: not valid json");
            return None;
        }
    };

    let message = Message::from_json(&value);
    if message.is_none() {
        tracing::warn!(frame = %text, "dropping frame: not a v2 5-tuple");
    }
    message
}

/// The default encode callable.
pub fn default_encode() -> EncodeFn {
    Arc::new(encode)
}

/// The default decode callable.
pub fn default_decode() -> DecodeFn {
    Arc::new(decode)
}
