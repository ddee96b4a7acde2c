//! Signals: the typed events the kernel consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical signal type keys. Senses may declare additional dotted keys;
/// these are the ones the default catalog knows about.
pub mod types {
    pub const TELEGRAM_MESSAGE_RECEIVED: &str = "telegram.message_received";
    pub const CLI_MESSAGE_RECEIVED: &str = "cli.message_received";
    pub const API_MESSAGE_RECEIVED: &str = "api.message_received";
    pub const API_STATUS_REQUESTED: &str = "api.status_requested";
    pub const API_TIMED_SIGNALS_REQUESTED: &str = "api.timed_signals_requested";
    pub const TIMER_FIRED: &str = "timer.fired";
    pub const TIMED_SIGNAL_FIRED: &str = "timed_signal.fired";
    pub const TERMINAL_COMMAND_UPDATED: &str = "terminal.command_updated";
    pub const TERMINAL_COMMAND_EXECUTED: &str = "terminal.command_executed";
    pub const TELEGRAM_INVITE_REQUESTED: &str = "telegram.invite_requested";
    pub const ACTION_SUCCEEDED: &str = "action.succeeded";
    pub const ACTION_FAILED: &str = "action.failed";
    pub const PDCA_RESUME_REQUESTED: &str = "pdca.resume_requested";
    pub const SHUTDOWN_REQUESTED: &str = "shutdown_requested";

    /// Every key the default catalog registers.
    pub const ALL: &[&str] = &[
        TELEGRAM_MESSAGE_RECEIVED,
        CLI_MESSAGE_RECEIVED,
        API_MESSAGE_RECEIVED,
        API_STATUS_REQUESTED,
        API_TIMED_SIGNALS_REQUESTED,
        TIMER_FIRED,
        TIMED_SIGNAL_FIRED,
        TERMINAL_COMMAND_UPDATED,
        TERMINAL_COMMAND_EXECUTED,
        TELEGRAM_INVITE_REQUESTED,
        ACTION_SUCCEEDED,
        ACTION_FAILED,
        PDCA_RESUME_REQUESTED,
        SHUTDOWN_REQUESTED,
    ];
}

/// Lifecycle of a durable signal in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl SignalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A typed event. Signals flow by value over the bus; durable ones are also
/// written to the signal queue so they survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub signal_type: String,
    /// Sense key that produced the signal.
    pub source: String,
    pub payload: serde_json::Value,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub durable: bool,
}

impl Signal {
    pub fn new(signal_type: impl Into<String>, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_type: signal_type.into(),
            source: source.into(),
            payload,
            correlation_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            durable: false,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Replace the random id with a caller-derived stable one. Replays of
    /// the same external event then collapse in the durable queue instead
    /// of becoming duplicate signals.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Mark the signal as at-least-once durable (queued before consumption).
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Payload `text` field, if present and non-empty.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(|v| v.as_str()).filter(|t| !t.trim().is_empty())
    }
}
