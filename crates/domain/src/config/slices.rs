use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceConfig {
    /// Cycles allowed per slice.
    #[serde(default = "d_default_cycles")]
    pub default_cycles: u32,
    /// Wall-clock budget per slice, in seconds.
    #[serde(default = "d_max_runtime_seconds")]
    pub max_runtime_seconds: u64,
    /// Worker pool size. One lease per task regardless of pool size.
    #[serde(default = "d_workers")]
    pub workers: usize,
    /// Delay before a yielded task becomes runnable again.
    #[serde(default = "d_yield_delay_seconds")]
    pub yield_delay_seconds: u64,
    /// Lease TTL while a worker holds a task.
    #[serde(default = "d_lease_seconds")]
    pub lease_seconds: u64,
    /// Lifetime cycle cap per task.
    #[serde(default = "d_max_cycles")]
    pub max_cycles: u32,
    /// Cycles without net progress before the task is parked.
    #[serde(default = "d_no_progress_cycles")]
    pub no_progress_cycles: u32,
    /// Consecutive failures before the task is marked failed.
    #[serde(default = "d_failure_streak_limit")]
    pub failure_streak_limit: u32,
    /// Initial token budget per task.
    #[serde(default = "d_token_budget")]
    pub token_budget: i64,
    /// Poll interval when no task is runnable.
    #[serde(default = "d_poll_seconds")]
    pub poll_seconds: u64,
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            default_cycles: d_default_cycles(),
            max_runtime_seconds: d_max_runtime_seconds(),
            workers: d_workers(),
            yield_delay_seconds: d_yield_delay_seconds(),
            lease_seconds: d_lease_seconds(),
            max_cycles: d_max_cycles(),
            no_progress_cycles: d_no_progress_cycles(),
            failure_streak_limit: d_failure_streak_limit(),
            token_budget: d_token_budget(),
            poll_seconds: d_poll_seconds(),
        }
    }
}

fn d_default_cycles() -> u32 {
    3
}

fn d_max_runtime_seconds() -> u64 {
    120
}

fn d_workers() -> usize {
    2
}

fn d_yield_delay_seconds() -> u64 {
    2
}

fn d_lease_seconds() -> u64 {
    120
}

fn d_max_cycles() -> u32 {
    60
}

fn d_no_progress_cycles() -> u32 {
    6
}

fn d_failure_streak_limit() -> u32 {
    3
}

fn d_token_budget() -> i64 {
    50_000
}

fn d_poll_seconds() -> u64 {
    1
}
