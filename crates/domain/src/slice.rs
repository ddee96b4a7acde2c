//! Cooperative slice tasks: resumable long-running work with leases and
//! versioned checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    Queued,
    Running,
    WaitingUser,
    Done,
    Failed,
    Paused,
}

impl SliceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingUser => "waiting_user",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "waiting_user" => Some(Self::WaitingUser),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

/// A persisted cooperative task. At most one lease (`worker_id`,
/// `lease_until`) is live at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceTask {
    pub task_id: Uuid,
    pub owner_id: String,
    pub conversation_key: String,
    pub session_id: String,
    pub status: SliceStatus,
    pub priority: i32,
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub lease_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Cycles allowed per slice.
    pub slice_cycles: u32,
    /// Lifetime cycle cap across all slices.
    pub max_cycles: u32,
    pub max_runtime_seconds: u64,
    pub token_budget_remaining: i64,
    pub failure_streak: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint of a slice task. `version` is strictly monotonic per task and
/// writes are compare-and-swap on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: Uuid,
    /// Executor bookkeeping (cycles used, progress marker).
    pub state_json: serde_json::Value,
    /// Program-owned task state.
    pub task_state_json: serde_json::Value,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_status_terminal() {
        assert!(SliceStatus::Done.is_terminal());
        assert!(SliceStatus::Failed.is_terminal());
        for s in [
            SliceStatus::Queued,
            SliceStatus::Running,
            SliceStatus::WaitingUser,
            SliceStatus::Paused,
        ] {
            assert!(!s.is_terminal(), "{s:?} should not be terminal");
        }
    }

    #[test]
    fn slice_status_parse_roundtrip() {
        for s in [
            SliceStatus::Queued,
            SliceStatus::Running,
            SliceStatus::WaitingUser,
            SliceStatus::Done,
            SliceStatus::Failed,
            SliceStatus::Paused,
        ] {
            assert_eq!(SliceStatus::parse(s.as_str()), Some(s));
        }
    }
}
