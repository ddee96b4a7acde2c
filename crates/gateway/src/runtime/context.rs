//! The read-only runtime facade handed to action handlers and executors.
//!
//! Handlers never see the bus or a writable store; they read through this
//! facade and declare effects in their `ActionResult`.

use std::sync::Arc;

use nerve_domain::error::Result;
use nerve_domain::render::Renderer;
use nerve_domain::timed::TimedSignal;
use nerve_providers::LlmProvider;
use nerve_store::Store;
use nerve_tools::ToolRegistry;

/// Queue/timer/slice depths surfaced by `handle_status`.
#[derive(Debug, Clone, Copy)]
pub struct KernelCounts {
    pub queued_signals: i64,
    pub pending_timed: i64,
    pub active_slices: i64,
}

pub struct RuntimeContext {
    store: Arc<Store>,
    pub tools: Arc<ToolRegistry>,
    pub renderer: Arc<dyn Renderer>,
    pub llm: Option<Arc<dyn LlmProvider>>,
    /// Default timezone for schedules created without one.
    pub default_timezone: String,
}

impl RuntimeContext {
    pub fn new(
        store: Arc<Store>,
        tools: Arc<ToolRegistry>,
        renderer: Arc<dyn Renderer>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self { store, tools, renderer, llm, default_timezone: "UTC".into() }
    }

    // ── Read-only repository views ──────────────────────────────────

    pub fn user_name(&self, user_id: &str) -> Result<Option<String>> {
        self.store.principal_name(user_id)
    }

    pub fn preference(&self, user_id: &str, key: &str) -> Result<Option<String>> {
        self.store.get_preference(user_id, key)
    }

    /// Authoritative do-not-disturb flag (preference-side).
    pub fn dnd(&self, user_id: &str) -> Result<bool> {
        self.store.dnd(user_id)
    }

    pub fn current_state(&self) -> Result<String> {
        self.store.current_state()
    }

    pub fn pending_timed(&self, limit: usize) -> Result<Vec<TimedSignal>> {
        self.store.list_pending_timed(limit)
    }

    pub fn kernel_counts(&self) -> Result<KernelCounts> {
        Ok(KernelCounts {
            queued_signals: self.store.queue_depth()?,
            pending_timed: self.store.count_timed_by_status(nerve_domain::timed::TimedStatus::Pending)?,
            active_slices: self.store.count_slices_by_status(nerve_domain::slice::SliceStatus::Queued)?
                + self.store.count_slices_by_status(nerve_domain::slice::SliceStatus::Running)?,
        })
    }
}
