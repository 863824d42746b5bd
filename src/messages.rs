//! # Wire Protocol Events
//!
//! This module defines the serializable event types exchanged with clients.
//! Events travel as JSON text frames with the shape
//! `{"event": <name>, "data": <payload>}` and are size-checked before
//! parsing to prevent memory exhaustion from oversized frames.
//!
//! ## Event Types
//!
//! | Direction | Event | Payload |
//! |-----------|-------|---------|
//! | inbound | `broadcast-thought` | object with `text` plus arbitrary fields |
//! | outbound | `new-thought` | sender id merged into the original fields |
//! | outbound | `user-left` | departing connection id |
//! | outbound | `error-msg` | human-readable rejection notice |
//!
//! ## Validation Policy
//!
//! There is deliberately no schema validation of thought payloads: whatever
//! object a client sends under `broadcast-thought` is fanned out as-is with
//! the sender id merged in. The only hard checks are the frame size bound
//! and JSON well-formedness, both of which are framing concerns rather than
//! content policy.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::ConnId;

/// Maximum inbound frame size in bytes.
/// SECURITY: Checked against the raw text before any parsing happens.
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Rejection notice sent to a sender that exceeded the rate limit.
pub const RATE_LIMIT_NOTICE: &str = "Too many thoughts. Slow down and breathe.";

/// Rejection notice sent to a sender whose thought failed moderation.
pub const MODERATION_NOTICE: &str =
    "Blocked Toxic Content. Keep it low-key and friendly.";

/// Why an inbound thought was not forwarded to its world.
///
/// Both variants are recoverable for the client: the rejection is terminal
/// for that message only, nothing is queued or retried, and no other
/// connection observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The sender's sliding-window rate limit is full.
    RateLimited,
    /// The moderation guard classified the text as unsafe.
    ContentRejected,
}

impl RejectReason {
    /// The sender-facing notice carried by the `error-msg` event.
    pub fn notice(&self) -> &'static str {
        match self {
            Self::RateLimited => RATE_LIMIT_NOTICE,
            Self::ContentRejected => MODERATION_NOTICE,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "per-connection rate limit exceeded"),
            Self::ContentRejected => write!(f, "content rejected by moderation"),
        }
    }
}

impl std::error::Error for RejectReason {}

// ============================================================================
// Frame envelope
// ============================================================================

/// The JSON envelope shared by every frame in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

// ============================================================================
// Inbound events
// ============================================================================

/// An event received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A thought to fan out to the sender's world.
    /// The payload object is forwarded untouched apart from the merged id.
    BroadcastThought(Map<String, Value>),
}

impl ClientEvent {
    /// Decode a raw text frame.
    ///
    /// Returns `None` for frames the relay does not route: oversized text,
    /// malformed JSON, unknown event names, and non-object thought payloads.
    /// None of these are errors worth surfacing to the peer; the transport
    /// logs them at trace level and moves on.
    pub fn decode(raw: &str) -> Option<Self> {
        if raw.len() > MAX_FRAME_SIZE {
            return None;
        }

        let frame: Frame = serde_json::from_str(raw).ok()?;
        match frame.event.as_str() {
            "broadcast-thought" => match frame.data {
                Value::Object(fields) => Some(Self::BroadcastThought(fields)),
                _ => None,
            },
            _ => None,
        }
    }

    /// The `text` field of a thought payload, when present and a string.
    ///
    /// Moderation classifies this field only; payloads without it have
    /// nothing to classify and skip the guard.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::BroadcastThought(fields) => {
                fields.get("text").and_then(Value::as_str)
            }
        }
    }
}

// ============================================================================
// Outbound events
// ============================================================================

/// An event delivered to one or more clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A thought fanned out to every member of a world, sender included.
    NewThought {
        sender: ConnId,
        fields: Map<String, Value>,
    },
    /// Notice that a member's connection closed, fanned out to its world.
    UserLeft { sender: ConnId },
    /// Sender-only rejection notice.
    ErrorMsg { reason: RejectReason },
}

impl ServerEvent {
    /// The wire event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::NewThought { .. } => "new-thought",
            Self::UserLeft { .. } => "user-left",
            Self::ErrorMsg { .. } => "error-msg",
        }
    }

    /// Encode to a JSON text frame.
    ///
    /// `new-thought` merges the sender id into the original payload under
    /// the `id` key, overwriting any client-supplied `id` so a sender cannot
    /// impersonate another connection.
    pub fn encode(&self) -> String {
        let data = match self {
            Self::NewThought { sender, fields } => {
                let mut merged = fields.clone();
                merged.insert("id".to_string(), Value::String(sender.to_hex()));
                Value::Object(merged)
            }
            Self::UserLeft { sender } => Value::String(sender.to_hex()),
            Self::ErrorMsg { reason } => {
                Value::String(reason.notice().to_string())
            }
        };

        let frame = Frame {
            event: self.event_name().to_string(),
            data,
        };

        // Frame is two fields of already-valid JSON values, serialization
        // cannot fail.
        serde_json::to_string(&frame).expect("frame serialization")
    }
}
