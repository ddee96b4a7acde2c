//! Normalized channel messages: the sense/extremity boundary contract.
//!
//! Senses translate native payloads into [`InboundMessage`]; extremities
//! receive [`OutboundMessage`]. Unknown channel fields travel in `metadata`
//! and the kernel never branches on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who an outbound message is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceKind {
    User,
    Group,
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audience {
    pub kind: AudienceKind,
    pub id: String,
}

impl Audience {
    pub fn user(id: impl Into<String>) -> Self {
        Self { kind: AudienceKind::User, id: id.into() }
    }
}

/// Canonical inbound message produced by a sense.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub text: String,
    /// Channel kind: `"cli"`, `"telegram"`, `"api"`, ...
    pub channel_type: String,
    /// Reply container within the channel (chat id, terminal id, api client).
    pub channel_target: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InboundMessage {
    pub fn new(
        text: impl Into<String>,
        channel_type: impl Into<String>,
        channel_target: impl Into<String>,
        user_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            channel_type: channel_type.into(),
            channel_target: channel_target.into(),
            user_id: user_id.into(),
            user_name: None,
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Canonical outbound message handed to an extremity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message: String,
    pub channel_type: String,
    pub channel_target: String,
    pub audience: Audience,
    pub correlation_id: String,
    /// Delivery hints only (tone, locale, urgency). Never control flow.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl OutboundMessage {
    /// Build a reply addressed back to the sender of an inbound message,
    /// preserving the correlation id.
    pub fn reply_to(inbound: &InboundMessage, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            channel_type: inbound.channel_type.clone(),
            channel_target: inbound.channel_target.clone(),
            audience: Audience::user(inbound.user_id.clone()),
            correlation_id: inbound.correlation_id.clone(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Urgency hint from metadata, defaulting to `"normal"`.
    pub fn urgency(&self) -> &str {
        self.metadata.get("urgency").and_then(|v| v.as_str()).unwrap_or("normal")
    }
}
