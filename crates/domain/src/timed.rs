//! Timed signals: one-shot and recurring scheduled emissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimedStatus {
    Pending,
    Processing,
    Fired,
    Failed,
    Cancelled,
    Skipped,
    Dispatched,
}

impl TimedStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Fired | Self::Failed | Self::Cancelled | Self::Skipped | Self::Dispatched)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Fired => "fired",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::Dispatched => "dispatched",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "fired" => Some(Self::Fired),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "skipped" => Some(Self::Skipped),
            "dispatched" => Some(Self::Dispatched),
            _ => None,
        }
    }
}

/// A persisted timed-signal row. Recurrence is an RRULE subset string;
/// `attempts` is the single attempt counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedSignal {
    pub id: i64,
    pub trigger_at: DateTime<Utc>,
    #[serde(default)]
    pub next_trigger_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rrule: Option<String>,
    pub timezone: String,
    pub status: TimedStatus,
    #[serde(default)]
    pub fired_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub signal_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub target: Option<String>,
    pub origin: String,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

impl TimedSignal {
    pub fn is_recurring(&self) -> bool {
        self.rrule.as_deref().map(|r| !r.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_status_terminal() {
        assert!(!TimedStatus::Pending.is_terminal());
        assert!(!TimedStatus::Processing.is_terminal());
        for s in [
            TimedStatus::Fired,
            TimedStatus::Failed,
            TimedStatus::Cancelled,
            TimedStatus::Skipped,
            TimedStatus::Dispatched,
        ] {
            assert!(s.is_terminal(), "{s:?} should be terminal");
        }
    }

    #[test]
    fn timed_status_parse_roundtrip() {
        for s in [
            TimedStatus::Pending,
            TimedStatus::Processing,
            TimedStatus::Fired,
            TimedStatus::Failed,
            TimedStatus::Cancelled,
            TimedStatus::Skipped,
            TimedStatus::Dispatched,
        ] {
            assert_eq!(TimedStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn recurring_requires_nonempty_rrule() {
        let mut ts = TimedSignal {
            id: 1,
            trigger_at: Utc::now(),
            next_trigger_at: None,
            rrule: None,
            timezone: "UTC".into(),
            status: TimedStatus::Pending,
            fired_at: None,
            attempts: 0,
            last_error: None,
            signal_type: "timer.fired".into(),
            payload: serde_json::json!({}),
            target: None,
            origin: "test".into(),
            correlation_id: "c".into(),
            created_at: Utc::now(),
        };
        assert!(!ts.is_recurring());
        ts.rrule = Some(String::new());
        assert!(!ts.is_recurring());
        ts.rrule = Some("FREQ=DAILY".into());
        assert!(ts.is_recurring());
    }
}
