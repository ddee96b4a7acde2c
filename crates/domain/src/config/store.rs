use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the embedded relational store.
    #[serde(default = "d_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: d_db_path() }
    }
}

fn d_db_path() -> PathBuf {
    PathBuf::from("nerve.db")
}
