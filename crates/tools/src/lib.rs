//! Tool registry.
//!
//! Tools are external capabilities (geocoder, TTS, terminal, ...) behind one
//! deterministic contract: `execute(args) -> {status, result, error,
//! metadata}`. Tools enforce their own authorization; the kernel never
//! encodes tool policy.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Failed,
}

/// Result envelope every tool returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ToolOutcome {
    pub fn ok(result: serde_json::Value) -> Self {
        Self { status: ToolStatus::Ok, result, error: None, metadata: serde_json::Value::Null }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Failed,
            result: serde_json::Value::Null,
            error: Some(error.into()),
            metadata: serde_json::Value::Null,
        }
    }
}

/// One callable tool. Implementations must be deterministic for a given
/// argument map or surface their nondeterminism in `metadata`.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, args: &serde_json::Value) -> ToolOutcome;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Execute by name. Unknown tools fail without panicking.
    pub fn execute(&self, name: &str, args: &serde_json::Value) -> ToolOutcome {
        match self.get(name) {
            Some(tool) => tool.execute(args),
            None => ToolOutcome::failed(format!("unknown tool: {name}")),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Built-in echo tool, mostly useful to exercise the registry from slice
/// programs and tests.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute(&self, args: &serde_json::Value) -> ToolOutcome {
        ToolOutcome::ok(args.clone())
    }
}
