use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Separate trace store path. `None` = share the main store file.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Retention for non-error events, in days.
    #[serde(default = "d_non_error_ttl_days")]
    pub non_error_ttl_days: u32,
    /// Retention for error events, in days.
    #[serde(default = "d_error_ttl_days")]
    pub error_ttl_days: u32,
    /// Global row cap; oldest rows are pruned first.
    #[serde(default = "d_max_rows")]
    pub max_rows: u64,
    /// Prune interval.
    #[serde(default = "d_maintenance_seconds")]
    pub maintenance_seconds: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            non_error_ttl_days: d_non_error_ttl_days(),
            error_ttl_days: d_error_ttl_days(),
            max_rows: d_max_rows(),
            maintenance_seconds: d_maintenance_seconds(),
        }
    }
}

fn d_non_error_ttl_days() -> u32 {
    14
}

fn d_error_ttl_days() -> u32 {
    30
}

fn d_max_rows() -> u64 {
    1_000_000
}

fn d_maintenance_seconds() -> u64 {
    3_600
}
