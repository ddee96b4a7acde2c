//! Typed plans: schema-versioned units of work dispatched to executors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Queued,
    Running,
    Done,
    Failed,
    AwaitingUser,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::AwaitingUser => "awaiting_user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "awaiting_user" => Some(Self::AwaitingUser),
            _ => None,
        }
    }
}

/// A persisted plan instance. `payload` must validate against the registry
/// schema for `(plan_kind, plan_version)` before acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanInstance {
    pub plan_id: Uuid,
    pub plan_kind: String,
    pub plan_version: u32,
    pub correlation_id: String,
    pub status: PlanStatus,
    pub payload: serde_json::Value,
    pub actor: String,
    pub source_channel: String,
    pub intent_confidence: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One execution attempt of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRun {
    pub run_id: Uuid,
    pub plan_id: Uuid,
    pub status: PlanStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state_json: serde_json::Value,
    #[serde(default)]
    pub scheduled_json: serde_json::Value,
    #[serde(default)]
    pub resolution: Option<String>,
}
