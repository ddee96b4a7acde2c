//! Action results: the declarative effects a handler returns.
//!
//! Handlers never touch the bus or the store. They describe what should
//! happen and the engine applies it inside the step transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::OutboundMessage;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Succeeded,
    Failed,
    WaitingUser,
}

/// Request to schedule a timed signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedSignalRequest {
    pub signal_type: String,
    pub trigger_at: DateTime<Utc>,
    #[serde(default)]
    pub rrule: Option<String>,
    pub timezone: String,
    pub payload: serde_json::Value,
    /// Delivery target hint (channel target) carried to the fired signal.
    #[serde(default)]
    pub target: Option<String>,
    /// Which component asked for the schedule.
    pub origin: String,
    pub correlation_id: String,
}

/// Request to create a typed plan instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub plan_kind: String,
    pub plan_version: u32,
    pub payload: serde_json::Value,
    pub actor: String,
    pub source_channel: String,
    pub intent_confidence: f64,
    pub correlation_id: String,
}

/// Request to enqueue a cooperative slice task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceEnqueue {
    pub owner_id: String,
    pub conversation_key: String,
    pub session_id: String,
    pub priority: i32,
    /// Initial task state handed to the slice program.
    pub task_state: serde_json::Value,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SliceRequest {
    Enqueue(SliceEnqueue),
    /// Wake a parked task. Ignored when a newer checkpoint already exists.
    Resume { task_id: Uuid, version: i64 },
}

/// Everything a handler wants the engine to do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    pub next_signals: Vec<Signal>,
    #[serde(default)]
    pub outbound_messages: Vec<OutboundMessage>,
    #[serde(default)]
    pub plans: Vec<PlanRequest>,
    #[serde(default)]
    pub timed_signals: Vec<TimedSignalRequest>,
    #[serde(default)]
    pub slice_requests: Vec<SliceRequest>,
    pub result_code: ResultCode,
    #[serde(default)]
    pub error_summary: Option<String>,
}

impl Default for ResultCode {
    fn default() -> Self {
        Self::Succeeded
    }
}

impl ActionResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            result_code: ResultCode::Failed,
            error_summary: Some(summary.into()),
            ..Self::default()
        }
    }

    pub fn waiting_user() -> Self {
        Self { result_code: ResultCode::WaitingUser, ..Self::default() }
    }

    pub fn with_outbound(mut self, msg: OutboundMessage) -> Self {
        self.outbound_messages.push(msg);
        self
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.next_signals.push(signal);
        self
    }

    pub fn with_timed(mut self, req: TimedSignalRequest) -> Self {
        self.timed_signals.push(req);
        self
    }

    pub fn with_plan(mut self, req: PlanRequest) -> Self {
        self.plans.push(req);
        self
    }

    pub fn with_slice(mut self, req: SliceRequest) -> Self {
        self.slice_requests.push(req);
        self
    }

    /// True when the result carries no effects at all.
    pub fn is_empty(&self) -> bool {
        self.next_signals.is_empty()
            && self.outbound_messages.is_empty()
            && self.plans.is_empty()
            && self.timed_signals.is_empty()
            && self.slice_requests.is_empty()
    }
}
