use serde::{Deserialize, Serialize};

/// How publishers behave when the bus is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Block until the consumer drains a slot.
    Block,
    /// Fail fast with a bus-full error.
    FailFast,
}

impl Default for PublishMode {
    fn default() -> Self {
        Self::Block
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmConfig {
    /// Boot state key.
    #[serde(default = "d_initial_state")]
    pub initial_state: String,
    /// Per-signal handler deadline in seconds.
    #[serde(default = "d_signal_deadline_seconds")]
    pub signal_deadline_seconds: u64,
    /// Bounded bus queue capacity.
    #[serde(default = "d_bus_capacity")]
    pub bus_capacity: usize,
    #[serde(default)]
    pub publish_mode: PublishMode,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            initial_state: d_initial_state(),
            signal_deadline_seconds: d_signal_deadline_seconds(),
            bus_capacity: d_bus_capacity(),
            publish_mode: PublishMode::default(),
        }
    }
}

fn d_initial_state() -> String {
    "idle".into()
}

fn d_signal_deadline_seconds() -> u64 {
    60
}

fn d_bus_capacity() -> usize {
    256
}
