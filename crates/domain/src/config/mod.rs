mod api;
mod fsm;
mod llm;
mod observability;
mod scheduler;
mod slices;
mod store;

pub use api::*;
pub use fsm::*;
pub use llm::*;
pub use observability::*;
pub use scheduler::*;
pub use slices::*;
pub use store::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub fsm: FsmConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub slices: SliceConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides. A missing
    /// file yields defaults; a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", p.display())))?
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply the documented environment overrides. Takes a lookup closure so
    /// tests can drive it without touching the process environment.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("NERVE_DB_PATH") {
            self.store.db_path = v.into();
        }
        if let Some(v) = get("OBSERVABILITY_DB_PATH") {
            self.observability.db_path = Some(v.into());
        }
        if let Some(v) = get("OBSERVABILITY_NON_ERROR_TTL_DAYS").and_then(|v| v.parse().ok()) {
            self.observability.non_error_ttl_days = v;
        }
        if let Some(v) = get("OBSERVABILITY_ERROR_TTL_DAYS").and_then(|v| v.parse().ok()) {
            self.observability.error_ttl_days = v;
        }
        if let Some(v) = get("OBSERVABILITY_MAX_ROWS").and_then(|v| v.parse().ok()) {
            self.observability.max_rows = v;
        }
        if let Some(v) = get("OBSERVABILITY_MAINTENANCE_SECONDS").and_then(|v| v.parse().ok()) {
            self.observability.maintenance_seconds = v;
        }
        if let Some(v) = get("API_TOKEN") {
            self.api.token = Some(v);
        }
        if let Some(v) = get("API_MESSAGE_WAIT_SECONDS").and_then(|v| v.parse().ok()) {
            self.api.message_wait_seconds = v;
        }
        if let Some(v) = get("SCHEDULER_TICK_SECONDS").and_then(|v| v.parse().ok()) {
            self.scheduler.tick_seconds = v;
        }
        if let Some(v) = get("SCHEDULER_LEASE_SECONDS").and_then(|v| v.parse().ok()) {
            self.scheduler.lease_seconds = v;
        }
        if let Some(v) = get("SLICE_DEFAULT_CYCLES").and_then(|v| v.parse().ok()) {
            self.slices.default_cycles = v;
        }
        if let Some(v) = get("SLICE_MAX_RUNTIME_SECONDS").and_then(|v| v.parse().ok()) {
            self.slices.max_runtime_seconds = v;
        }
        if let Some(v) = get("FSM_INITIAL_STATE") {
            self.fsm.initial_state = v;
        }
        self.llm.apply_env(&get);
    }

    /// Validate the whole tree. Error-severity issues abort boot.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.store.db_path.as_os_str().is_empty() {
            issues.push(ConfigIssue::error("store.db_path", "must not be empty"));
        }
        if self.fsm.initial_state.trim().is_empty() {
            issues.push(ConfigIssue::error("fsm.initial_state", "must not be empty"));
        }
        if self.fsm.bus_capacity == 0 {
            issues.push(ConfigIssue::error("fsm.bus_capacity", "must be at least 1"));
        }
        if self.scheduler.tick_seconds == 0 {
            issues.push(ConfigIssue::error("scheduler.tick_seconds", "must be at least 1"));
        }
        if self.slices.default_cycles == 0 {
            issues.push(ConfigIssue::error("slices.default_cycles", "must be at least 1"));
        }
        if self.slices.workers == 0 {
            issues.push(ConfigIssue::error("slices.workers", "must be at least 1"));
        }
        if self.observability.max_rows < 1_000 {
            issues.push(ConfigIssue::warning(
                "observability.max_rows",
                "very low row cap; traces will be pruned aggressively",
            ));
        }
        if self.api.token.is_none() {
            issues.push(ConfigIssue::warning("api.token", "unset; gateway runs without auth"));
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: &str) -> Self {
        Self { severity: ConfigSeverity::Error, field: field.into(), message: message.into() }
    }

    fn warning(field: &str, message: &str) -> Self {
        Self { severity: ConfigSeverity::Warning, field: field.into(), message: message.into() }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}
