//! The cooperative slice executor.
//!
//! Long-running plans run as bounded slices so no conversation can starve
//! another. A worker leases one task, rehydrates its checkpoint, runs a few
//! plan/decide/act/check cycles under the safety gates, then either finishes,
//! parks, or persists a new checkpoint and requeues.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;

use nerve_domain::config::SliceConfig;
use nerve_domain::error::{Error, Result};
use nerve_domain::message::{Audience, OutboundMessage};
use nerve_domain::render::{keys, vars};
use nerve_domain::signal::{types, Signal};
use nerve_domain::slice::{SliceStatus, SliceTask};
use nerve_domain::trace::{events, ObsEvent};
use nerve_store::Store;

use super::context::RuntimeContext;
use crate::bus::Bus;

/// Final fuse on cycles per slice, regardless of configuration.
const HARD_CYCLE_FUSE: u32 = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Programs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum CycleControl {
    Continue,
    Done(String),
    WaitingUser(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub control: CycleControl,
    pub tokens_spent: i64,
    pub progressed: bool,
    /// Tool invoked this cycle, if any (for the trace).
    pub tool_used: Option<String>,
}

/// One plan/decide/act/check step. Programs own `task_state`; the executor
/// owns budgets, leases, and checkpoints.
pub trait SliceProgram: Send + Sync {
    fn name(&self) -> &str;
    fn run_cycle(&self, task_state: &mut serde_json::Value, ctx: &RuntimeContext) -> Result<CycleOutcome>;
}

#[derive(Default)]
pub struct ProgramRegistry {
    programs: HashMap<String, Arc<dyn SliceProgram>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, program: Arc<dyn SliceProgram>) {
        self.programs.insert(program.name().to_string(), program);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SliceProgram>> {
        self.programs.get(name).cloned()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ChecklistProgram));
        registry
    }
}

/// Works through `task_state.items` one entry per cycle. Entries are either
/// plain strings, `{"tool": name, "args": {...}}` invocations, or
/// `{"ask": question}` which parks the task for the user.
pub struct ChecklistProgram;

impl SliceProgram for ChecklistProgram {
    fn name(&self) -> &str {
        "checklist"
    }

    fn run_cycle(&self, task_state: &mut serde_json::Value, ctx: &RuntimeContext) -> Result<CycleOutcome> {
        let items = task_state
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        if items.is_empty() {
            let done = task_state.get("done").and_then(|v| v.as_array()).map(|d| d.len()).unwrap_or(0);
            return Ok(CycleOutcome {
                control: CycleControl::Done(format!("completed {done} steps")),
                tokens_spent: 0,
                progressed: false,
                tool_used: None,
            });
        }

        let item = items[0].clone();
        let mut tool_used = None;

        let completed: serde_json::Value = match &item {
            serde_json::Value::String(step) => serde_json::json!({"step": step, "ok": true}),
            serde_json::Value::Object(map) if map.contains_key("ask") => {
                let question = map.get("ask").and_then(|v| v.as_str()).unwrap_or("?").to_string();
                return Ok(CycleOutcome {
                    control: CycleControl::WaitingUser(question),
                    tokens_spent: 10,
                    progressed: true,
                    tool_used: None,
                });
            }
            serde_json::Value::Object(map) if map.contains_key("tool") => {
                let tool = map.get("tool").and_then(|v| v.as_str()).unwrap_or("");
                let args = map.get("args").cloned().unwrap_or(serde_json::Value::Null);
                let outcome = ctx.tools.execute(tool, &args);
                tool_used = Some(tool.to_string());
                if outcome.status == nerve_tools::ToolStatus::Failed {
                    return Ok(CycleOutcome {
                        control: CycleControl::Failed(
                            outcome.error.unwrap_or_else(|| format!("tool {tool} failed")),
                        ),
                        tokens_spent: 10,
                        progressed: false,
                        tool_used,
                    });
                }
                serde_json::json!({"tool": tool, "ok": true, "result": outcome.result})
            }
            other => serde_json::json!({"step": other, "ok": true}),
        };

        task_state["items"] = serde_json::Value::Array(items[1..].to_vec());
        let done = task_state.get("done").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut done = done;
        done.push(completed);
        task_state["done"] = serde_json::Value::Array(done);

        Ok(CycleOutcome { control: CycleControl::Continue, tokens_spent: 10, progressed: true, tool_used })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SliceWorker {
    store: Arc<Store>,
    obs: Arc<Store>,
    bus: Bus,
    ctx: Arc<RuntimeContext>,
    programs: Arc<ProgramRegistry>,
    config: SliceConfig,
    worker_id: String,
}

impl SliceWorker {
    pub fn new(
        store: Arc<Store>,
        obs: Arc<Store>,
        bus: Bus,
        ctx: Arc<RuntimeContext>,
        programs: Arc<ProgramRegistry>,
        config: SliceConfig,
        worker_id: String,
    ) -> Self {
        Self { store, obs, bus, ctx, programs, config, worker_id }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.worker_id, "slice worker running");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    tracing::info!(worker_id = %self.worker_id, "slice worker stopping");
                    break;
                }
                worked = self.work_once(Utc::now()) => {
                    match worked {
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::time::sleep(std::time::Duration::from_secs(self.config.poll_seconds.max(1))).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "slice pass failed");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    /// Claim and run at most one slice. Returns whether a task was worked.
    pub async fn work_once(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(task) = self.store.claim_next_slice(&self.worker_id, &now, self.config.lease_seconds)? else {
            return Ok(false);
        };
        self.run_slice(task, now).await?;
        Ok(true)
    }

    async fn run_slice(&self, task: SliceTask, now: DateTime<Utc>) -> Result<()> {
        self.trace_slice(&task, events::SLICE_STARTED, None);
        self.store.append_slice_event(&task.task_id, events::SLICE_STARTED, None)?;

        let checkpoint = self
            .store
            .get_checkpoint(&task.task_id)?
            .ok_or_else(|| Error::Storage(format!("task {} has no checkpoint", task.task_id)))?;
        let mut task_state = checkpoint.task_state_json.clone();
        let mut cycles_total =
            checkpoint.state_json.get("cycles_total").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let mut no_progress =
            checkpoint.state_json.get("no_progress").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

        let program_name = task_state.get("program").and_then(|v| v.as_str()).unwrap_or("checklist").to_string();
        let Some(program) = self.programs.get(&program_name) else {
            self.finish(&task, SliceStatus::Failed, 0, Some(&format!("unknown slice program: {program_name}")))?;
            return Ok(());
        };

        let started = Instant::now();
        let mut tokens_spent: i64 = 0;
        let mut failure_streak = task.failure_streak;
        let slice_budget = task.slice_cycles.min(HARD_CYCLE_FUSE);

        for _ in 0..slice_budget {
            // Safety gates, checked before every cycle.
            if cycles_total >= task.max_cycles {
                self.finish(&task, SliceStatus::Failed, tokens_spent, Some("cycle cap exhausted"))?;
                return Ok(());
            }
            if task.token_budget_remaining - tokens_spent <= 0 {
                self.finish(&task, SliceStatus::Paused, tokens_spent, Some("token budget exhausted"))?;
                return Ok(());
            }
            if no_progress >= self.config.no_progress_cycles {
                self.finish(&task, SliceStatus::Paused, tokens_spent, Some("no progress"))?;
                return Ok(());
            }
            if started.elapsed().as_secs() >= task.max_runtime_seconds {
                break; // wall budget: yield, do not park
            }

            let outcome = match program.run_cycle(&mut task_state, &self.ctx) {
                Ok(outcome) => outcome,
                Err(e) => {
                    failure_streak += 1;
                    if failure_streak >= self.config.failure_streak_limit {
                        self.finish(&task, SliceStatus::Failed, tokens_spent, Some(&e.to_string()))?;
                        return Ok(());
                    }
                    // Back off proportionally to the streak and retry later.
                    let delay = self.config.yield_delay_seconds.max(1) as i64 * failure_streak as i64;
                    self.store.requeue_slice(
                        &task.task_id,
                        &(now + Duration::seconds(delay)),
                        tokens_spent,
                        failure_streak,
                        Some(&e.to_string()),
                    )?;
                    self.trace_slice(&task, events::SLICE_PERSISTED, Some(&e.to_string()));
                    return Ok(());
                }
            };

            cycles_total += 1;
            tokens_spent += outcome.tokens_spent;
            if outcome.progressed {
                no_progress = 0;
                failure_streak = 0;
            } else {
                no_progress += 1;
            }
            if let Some(tool) = &outcome.tool_used {
                self.record(
                    ObsEvent::info(events::TOOL_CALLED, &task.correlation_id)
                        .with_tool(tool)
                        .with_cycle(cycles_total as i64),
                );
            }

            match outcome.control {
                CycleControl::Continue => {}
                CycleControl::Done(summary) => {
                    self.save(&task, &task_state, checkpoint.version, cycles_total, no_progress)?;
                    self.finish(&task, SliceStatus::Done, tokens_spent, None)?;
                    self.send_reply(&task, &task_state, keys::SLICE_DONE, &[("summary", summary.as_str())]);
                    let completion = Signal::new(
                        types::ACTION_SUCCEEDED,
                        "slice_executor",
                        serde_json::json!({"task_id": task.task_id.to_string(), "summary": summary}),
                    )
                    .with_correlation(task.correlation_id.clone());
                    if let Err(e) = self.bus.publish(completion).await {
                        tracing::debug!(error = %e, "completion signal dropped");
                    }
                    return Ok(());
                }
                CycleControl::WaitingUser(question) => {
                    self.save(&task, &task_state, checkpoint.version, cycles_total, no_progress)?;
                    self.finish(&task, SliceStatus::WaitingUser, tokens_spent, None)?;
                    self.send_reply(&task, &task_state, keys::SLICE_WAITING, &[("question", question.as_str())]);
                    return Ok(());
                }
                CycleControl::Failed(error) => {
                    failure_streak += 1;
                    if failure_streak >= self.config.failure_streak_limit {
                        self.finish(&task, SliceStatus::Failed, tokens_spent, Some(&error))?;
                    } else {
                        let delay = self.config.yield_delay_seconds.max(1) as i64 * failure_streak as i64;
                        self.store.requeue_slice(
                            &task.task_id,
                            &(now + Duration::seconds(delay)),
                            tokens_spent,
                            failure_streak,
                            Some(&error),
                        )?;
                        self.trace_slice(&task, events::SLICE_PERSISTED, Some(&error));
                    }
                    return Ok(());
                }
            }
        }

        // Slice budget spent without a terminal outcome: checkpoint and
        // requeue so other tasks get their turn.
        let book = serde_json::json!({"cycles_total": cycles_total, "no_progress": no_progress});
        let new_version = self
            .store
            .save_checkpoint(&task.task_id, &book, &task_state, checkpoint.version)?;
        self.store.requeue_slice(
            &task.task_id,
            &(now + Duration::seconds(self.config.yield_delay_seconds as i64)),
            tokens_spent,
            failure_streak,
            None,
        )?;
        self.store.append_slice_event(&task.task_id, events::SLICE_PERSISTED, Some(&format!("v{new_version}")))?;
        self.trace_slice(&task, events::SLICE_PERSISTED, None);
        Ok(())
    }

    fn save(
        &self,
        task: &SliceTask,
        task_state: &serde_json::Value,
        expected_version: i64,
        cycles_total: u32,
        no_progress: u32,
    ) -> Result<()> {
        let book = serde_json::json!({"cycles_total": cycles_total, "no_progress": no_progress});
        self.store.save_checkpoint(&task.task_id, &book, task_state, expected_version)?;
        Ok(())
    }

    fn finish(&self, task: &SliceTask, status: SliceStatus, tokens_spent: i64, error: Option<&str>) -> Result<()> {
        self.store.finish_slice(&task.task_id, status, tokens_spent, error)?;
        let event = match status {
            SliceStatus::Done => events::SLICE_COMPLETED,
            SliceStatus::Failed => events::SLICE_FAILED,
            SliceStatus::WaitingUser => events::SLICE_WAITING_USER,
            _ => events::SLICE_PERSISTED,
        };
        self.store.append_slice_event(&task.task_id, event, error)?;
        self.trace_slice(task, event, error);
        Ok(())
    }

    fn send_reply(&self, task: &SliceTask, task_state: &serde_json::Value, key: &str, extra: &[(&str, &str)]) {
        let reply = task_state.get("reply").cloned().unwrap_or(serde_json::Value::Null);
        let channel_type = reply.get("channel_type").and_then(|v| v.as_str()).unwrap_or("cli");
        let channel_target = reply
            .get("channel_target")
            .and_then(|v| v.as_str())
            .unwrap_or(&task.conversation_key);
        self.bus.publish_outbound(OutboundMessage {
            message: self.ctx.renderer.render(key, &vars(extra)),
            channel_type: channel_type.to_string(),
            channel_target: channel_target.to_string(),
            audience: Audience::user(task.owner_id.clone()),
            correlation_id: task.correlation_id.clone(),
            metadata: serde_json::Value::Null,
        });
    }

    fn trace_slice(&self, task: &SliceTask, event: &str, detail: Option<&str>) {
        let mut obs = ObsEvent::info(event, &task.correlation_id).with_user(&task.owner_id);
        if let Some(detail) = detail {
            obs = obs.with_detail(detail);
        }
        self.record(obs);
    }

    fn record(&self, event: ObsEvent) {
        event.emit();
        if let Err(e) = self.obs.record_event(&event) {
            tracing::warn!(error = %e, "observability write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerve_domain::action::SliceEnqueue;
    use nerve_domain::config::PublishMode;
    use nerve_domain::render::FallbackRenderer;
    use nerve_store::SliceDefaults;
    use nerve_tools::{EchoTool, ToolRegistry};
    use uuid::Uuid;

    fn worker(config: SliceConfig) -> (SliceWorker, Arc<Store>, Bus) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));
        let ctx = Arc::new(RuntimeContext::new(
            store.clone(),
            Arc::new(tools),
            Arc::new(FallbackRenderer),
            None,
        ));
        let (bus, _rx) = Bus::new(16, PublishMode::Block);
        let worker = SliceWorker::new(
            store.clone(),
            store.clone(),
            bus.clone(),
            ctx,
            Arc::new(ProgramRegistry::with_builtins()),
            config,
            "w-test".into(),
        );
        (worker, store, bus)
    }

    fn defaults(config: &SliceConfig) -> SliceDefaults {
        SliceDefaults {
            slice_cycles: config.default_cycles,
            max_cycles: config.max_cycles,
            max_runtime_seconds: config.max_runtime_seconds,
            token_budget: config.token_budget,
        }
    }

    fn enqueue_checklist(store: &Store, config: &SliceConfig, owner: &str, items: serde_json::Value) -> Uuid {
        store
            .enqueue_slice_task(
                &SliceEnqueue {
                    owner_id: owner.into(),
                    conversation_key: format!("cli:{owner}"),
                    session_id: "s1".into(),
                    priority: 0,
                    task_state: serde_json::json!({
                        "program": "checklist",
                        "items": items,
                        "reply": {"channel_type": "cli", "channel_target": "cli:local"},
                    }),
                    correlation_id: format!("C-{owner}"),
                },
                &defaults(config),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn short_checklist_completes_in_one_slice() {
        let config = SliceConfig::default();
        let (worker, store, bus) = worker(config.clone());
        let mut outbound = bus.subscribe_outbound();
        let task_id = enqueue_checklist(&store, &config, "u1", serde_json::json!(["a", "b"]));

        assert!(worker.work_once(Utc::now()).await.unwrap());

        let task = store.get_slice_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, SliceStatus::Done);
        let reply = outbound.recv().await.unwrap();
        assert!(reply.message.contains("completed 2 steps"), "got: {}", reply.message);
        assert_eq!(reply.correlation_id, "C-u1");

        let events = store.slice_events(&task_id).unwrap();
        assert_eq!(events, vec!["slice.started", "slice.completed"]);
    }

    #[tokio::test]
    async fn long_checklist_yields_with_checkpoint_and_resumes() {
        let mut config = SliceConfig::default();
        config.default_cycles = 3;
        let (worker, store, _bus) = worker(config.clone());
        let task_id = enqueue_checklist(
            &store,
            &config,
            "u1",
            serde_json::json!(["a", "b", "c", "d"]),
        );

        let now = Utc::now();
        assert!(worker.work_once(now).await.unwrap());

        // Slice 1: three cycles done, checkpoint persisted, requeued.
        let task = store.get_slice_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, SliceStatus::Queued);
        assert!(task.next_run_at > now);
        let cp = store.get_checkpoint(&task_id).unwrap().unwrap();
        assert_eq!(cp.version, 2);
        assert_eq!(cp.task_state_json["done"].as_array().unwrap().len(), 3);

        // Slice 2 (after the yield delay): finishes the remaining item plus
        // the final empty-list cycle.
        let later = now + Duration::seconds(config.yield_delay_seconds as i64 + 1);
        assert!(worker.work_once(later).await.unwrap());
        let task = store.get_slice_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, SliceStatus::Done);

        let events = store.slice_events(&task_id).unwrap();
        assert_eq!(
            events,
            vec!["slice.started", "slice.persisted", "slice.started", "slice.completed"]
        );
    }

    #[tokio::test]
    async fn two_tasks_share_the_worker_fairly() {
        let mut config = SliceConfig::default();
        config.default_cycles = 3;
        let (worker, store, _bus) = worker(config.clone());
        let first = enqueue_checklist(&store, &config, "alice", serde_json::json!(["a", "b", "c", "d"]));
        let second = enqueue_checklist(&store, &config, "bob", serde_json::json!(["x"]));

        let now = Utc::now() + Duration::seconds(1);
        // First pass: alice's task (older) gets a slice and yields.
        assert!(worker.work_once(now).await.unwrap());
        assert_eq!(store.get_slice_task(&first).unwrap().unwrap().status, SliceStatus::Queued);

        // Second pass at the same instant: bob's task runs while alice waits
        // out her yield delay.
        assert!(worker.work_once(now).await.unwrap());
        assert_eq!(store.get_slice_task(&second).unwrap().unwrap().status, SliceStatus::Done);

        // Alice resumes from her checkpoint and completes.
        let later = now + Duration::seconds(config.yield_delay_seconds as i64 + 1);
        assert!(worker.work_once(later).await.unwrap());
        assert_eq!(store.get_slice_task(&first).unwrap().unwrap().status, SliceStatus::Done);
    }

    #[tokio::test]
    async fn ask_item_parks_waiting_user() {
        let config = SliceConfig::default();
        let (worker, store, bus) = worker(config.clone());
        let mut outbound = bus.subscribe_outbound();
        let task_id = enqueue_checklist(
            &store,
            &config,
            "u1",
            serde_json::json!(["a", {"ask": "which plant?"}]),
        );

        worker.work_once(Utc::now()).await.unwrap();
        let task = store.get_slice_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, SliceStatus::WaitingUser);
        let msg = outbound.recv().await.unwrap();
        assert!(msg.message.contains("which plant?"));

        // Resume at the checkpoint version continues the task.
        let cp = store.get_checkpoint(&task_id).unwrap().unwrap();
        assert!(store.resume_slice(&task_id, cp.version, &Utc::now()).unwrap());
        assert_eq!(store.get_slice_task(&task_id).unwrap().unwrap().status, SliceStatus::Queued);
    }

    #[tokio::test]
    async fn failing_tool_builds_streak_then_fails() {
        let mut config = SliceConfig::default();
        config.failure_streak_limit = 2;
        config.yield_delay_seconds = 1;
        let (worker, store, _bus) = worker(config.clone());
        let task_id = enqueue_checklist(
            &store,
            &config,
            "u1",
            serde_json::json!([{"tool": "does_not_exist", "args": {}}]),
        );

        let now = Utc::now();
        worker.work_once(now).await.unwrap();
        let task = store.get_slice_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, SliceStatus::Queued, "first failure requeues with backoff");
        assert_eq!(task.failure_streak, 1);

        let later = now + Duration::seconds(5);
        worker.work_once(later).await.unwrap();
        let task = store.get_slice_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, SliceStatus::Failed, "streak limit reached");
        assert!(task.last_error.unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn token_budget_exhaustion_pauses() {
        let mut config = SliceConfig::default();
        config.token_budget = 15; // one 10-token cycle, then the gate trips
        let (worker, store, _bus) = worker(config.clone());
        let task_id = enqueue_checklist(&store, &config, "u1", serde_json::json!(["a", "b", "c"]));

        worker.work_once(Utc::now()).await.unwrap();
        let task = store.get_slice_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, SliceStatus::Paused);
        assert!(task.last_error.unwrap().contains("token budget"));
    }

    #[tokio::test]
    async fn tool_items_exercise_the_registry() {
        let config = SliceConfig::default();
        let (worker, store, _bus) = worker(config.clone());
        let task_id = enqueue_checklist(
            &store,
            &config,
            "u1",
            serde_json::json!([{"tool": "echo", "args": {"note": "hi"}}]),
        );
        worker.work_once(Utc::now()).await.unwrap();
        let cp = store.get_checkpoint(&task_id).unwrap().unwrap();
        assert_eq!(cp.task_state_json["done"][0]["tool"], "echo");
        assert_eq!(cp.task_state_json["done"][0]["result"]["note"], "hi");
    }
}
