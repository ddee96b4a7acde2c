use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Ticker wake interval.
    #[serde(default = "d_tick_seconds")]
    pub tick_seconds: u64,
    /// Stale `processing` rows older than this are reclaimed.
    #[serde(default = "d_lease_seconds")]
    pub lease_seconds: u64,
    /// Acceptable dispatch lag baseline, in minutes. The catch-up window for
    /// recurring signals is `max(this, 5% of the period)`.
    #[serde(default = "d_catchup_baseline_minutes")]
    pub catchup_baseline_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: d_tick_seconds(),
            lease_seconds: d_lease_seconds(),
            catchup_baseline_minutes: d_catchup_baseline_minutes(),
        }
    }
}

fn d_tick_seconds() -> u64 {
    1
}

fn d_lease_seconds() -> u64 {
    300
}

fn d_catchup_baseline_minutes() -> u64 {
    30
}
