//! Structured observability events, keyed by correlation id.
//!
//! Every state-mutating operation in the kernel records one of these. Events
//! are logged through `tracing` immediately and persisted by the
//! observability repository for rollups and retention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical event names.
pub mod events {
    pub const FSM_TRANSITION: &str = "fsm.transition";
    pub const FSM_NO_TRANSITION: &str = "fsm.no_transition";
    pub const SIGNAL_FAILED: &str = "signal.failed";
    pub const SIGNAL_ENQUEUED: &str = "signal.enqueued";
    pub const DELIVERY_RECEIPT: &str = "delivery_receipt";
    pub const PLAN_STATE_CHANGED: &str = "plan.state_changed";
    pub const TIMED_DISPATCHED: &str = "timed.dispatched";
    pub const TIMED_MISSED: &str = "timed.missed";
    pub const TOOL_CALLED: &str = "tool.called";
    pub const SLICE_STARTED: &str = "slice.started";
    pub const SLICE_PERSISTED: &str = "slice.persisted";
    pub const SLICE_COMPLETED: &str = "slice.completed";
    pub const SLICE_FAILED: &str = "slice.failed";
    pub const SLICE_WAITING_USER: &str = "slice.waiting_user";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One observability record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsEvent {
    pub ts: DateTime<Utc>,
    pub level: Level,
    pub event: String,
    pub correlation_id: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub cycle: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<i64>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ObsEvent {
    pub fn new(event: impl Into<String>, level: Level, correlation_id: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level,
            event: event.into(),
            correlation_id: correlation_id.into(),
            channel: None,
            user_id: None,
            node: None,
            cycle: None,
            status: None,
            tool: None,
            error_code: None,
            latency_ms: None,
            detail: None,
        }
    }

    pub fn info(event: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::new(event, Level::Info, correlation_id)
    }

    pub fn error(event: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::new(event, Level::Error, correlation_id)
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_cycle(mut self, cycle: i64) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_latency_ms(mut self, ms: i64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Log the event through `tracing`. Persistence is the observability
    /// repository's job; this is the live view.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        match self.level {
            Level::Debug => tracing::debug!(obs_event = %json, "nerve_event"),
            Level::Info => tracing::info!(obs_event = %json, "nerve_event"),
            Level::Warn => tracing::warn!(obs_event = %json, "nerve_event"),
            Level::Error => tracing::error!(obs_event = %json, "nerve_event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_fields() {
        let ev = ObsEvent::info(events::FSM_TRANSITION, "C1")
            .with_channel("cli")
            .with_node("idle")
            .with_status("done")
            .with_latency_ms(12);
        assert_eq!(ev.event, "fsm.transition");
        assert_eq!(ev.correlation_id, "C1");
        assert_eq!(ev.channel.as_deref(), Some("cli"));
        assert_eq!(ev.node.as_deref(), Some("idle"));
        assert_eq!(ev.latency_ms, Some(12));
    }

    #[test]
    fn level_parse_roundtrip() {
        for l in [Level::Debug, Level::Info, Level::Warn, Level::Error] {
            assert_eq!(Level::parse(l.as_str()), Some(l));
        }
        assert_eq!(Level::parse("fatal"), None);
    }

    #[test]
    fn error_constructor_sets_level() {
        let ev = ObsEvent::error(events::SIGNAL_FAILED, "C2");
        assert_eq!(ev.level, Level::Error);
    }
}
