//! Plan validation and execution.
//!
//! The registry rows live in the store (`plan_kind_versions`); executors are
//! in-code, dispatched by `executor_key`. Payloads are validated against a
//! compact JSON shape before an executor ever sees them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;

use nerve_domain::action::{ActionResult, ResultCode, TimedSignalRequest};
use nerve_domain::error::{Error, Result};
use nerve_domain::message::{Audience, OutboundMessage};
use nerve_domain::plan::{PlanInstance, PlanStatus};
use nerve_domain::render::keys;
use nerve_domain::signal::types;
use nerve_domain::trace::{events, ObsEvent};
use nerve_store::{PlanKindRow, Store};

use super::context::RuntimeContext;
use super::rrule::{parse_tz, Rrule};
use crate::bus::Bus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a payload against the registry's compact schema shape:
/// `{type, required, properties, items}`. Returns the first violation.
pub fn validate_payload(payload: &serde_json::Value, schema: &serde_json::Value) -> std::result::Result<(), String> {
    validate_at(payload, schema, "$")
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn validate_at(value: &serde_json::Value, schema: &serde_json::Value, path: &str) -> std::result::Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        let actual = type_name(value);
        let matches = expected == actual || (expected == "number" && actual == "integer");
        if !matches {
            return Err(format!("{path}: expected {expected}, got {actual}"));
        }
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if value.get(key).is_none() {
                return Err(format!("{path}: missing required field {key:?}"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, sub_schema) in properties {
            if let Some(sub_value) = value.get(key) {
                validate_at(sub_value, sub_schema, &format!("{path}.{key}"))?;
            }
        }
    }

    if let Some(items) = schema.get("items") {
        if let Some(array) = value.as_array() {
            for (i, item) in array.iter().enumerate() {
                validate_at(item, items, &format!("{path}[{i}]"))?;
            }
        }
    }

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait PlanExecutor: Send + Sync {
    fn key(&self) -> &str;
    async fn execute(&self, plan: &PlanInstance, ctx: &RuntimeContext) -> Result<ActionResult>;
}

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn PlanExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn PlanExecutor>) {
        self.executors.insert(executor.key().to_string(), executor);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn PlanExecutor>> {
        self.executors.get(key).cloned()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReminderExecutor));
        registry.register(Arc::new(NotifyExecutor));
        registry
    }
}

/// Install the built-in plan kinds into the store registry. Idempotent.
pub fn register_builtin_kinds(store: &Store) -> Result<()> {
    store.register_plan_kind(&PlanKindRow {
        plan_kind: "create_reminder".into(),
        plan_version: 1,
        schema: serde_json::json!({
            "type": "object",
            "required": ["task", "schedule"],
            "properties": {
                "task": {"type": "string"},
                "schedule": {"type": "object"},
                "channel_type": {"type": "string"},
                "channel_target": {"type": "string"},
                "user_id": {"type": "string"},
                "idempotency_key": {"type": "string"},
            },
        }),
        example: Some(serde_json::json!({
            "task": "water the plants",
            "schedule": {"in_seconds": 60},
        })),
        executor_key: "reminder_executor".into(),
        is_deprecated: false,
    })?;
    store.register_plan_kind(&PlanKindRow {
        plan_kind: "notify".into(),
        plan_version: 1,
        schema: serde_json::json!({
            "type": "object",
            "required": ["message"],
            "properties": {
                "message": {"type": "string"},
                "channel_type": {"type": "string"},
                "channel_target": {"type": "string"},
                "user_id": {"type": "string"},
            },
        }),
        example: Some(serde_json::json!({"message": "dinner is ready"})),
        executor_key: "notify_executor".into(),
        is_deprecated: false,
    })?;
    Ok(())
}

/// Turns a validated `create_reminder` payload into a timed signal.
pub struct ReminderExecutor;

#[async_trait::async_trait]
impl PlanExecutor for ReminderExecutor {
    fn key(&self) -> &str {
        "reminder_executor"
    }

    async fn execute(&self, plan: &PlanInstance, ctx: &RuntimeContext) -> Result<ActionResult> {
        let payload = &plan.payload;
        let task = payload
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("create_reminder payload missing task".into()))?;
        let schedule = payload
            .get("schedule")
            .ok_or_else(|| Error::Validation("create_reminder payload missing schedule".into()))?;

        let timezone = schedule
            .get("timezone")
            .and_then(|v| v.as_str())
            .unwrap_or(&ctx.default_timezone)
            .to_string();
        let now = Utc::now();

        let (trigger_at, rrule) = if let Some(secs) = schedule.get("in_seconds").and_then(|v| v.as_i64()) {
            if secs <= 0 {
                return Err(Error::Validation("schedule.in_seconds must be positive".into()));
            }
            (now + Duration::seconds(secs), None)
        } else if let Some(raw) = schedule.get("rrule").and_then(|v| v.as_str()) {
            let rule = Rrule::parse(raw)?;
            let first = rule
                .next_occurrence(&now, parse_tz(&timezone))
                .ok_or_else(|| Error::Validation("rrule yields no future occurrence".into()))?;
            (first, Some(raw.to_string()))
        } else {
            return Err(Error::Validation("schedule needs in_seconds or rrule".into()));
        };

        Ok(ActionResult::ok().with_timed(TimedSignalRequest {
            signal_type: types::TIMER_FIRED.into(),
            trigger_at,
            rrule,
            timezone,
            payload: serde_json::json!({
                "kind": "create_reminder",
                "task": task,
                "channel_type": payload.get("channel_type").and_then(|v| v.as_str()).unwrap_or("cli"),
                "user_id": payload.get("user_id").and_then(|v| v.as_str()).unwrap_or("local"),
                "idempotency_key": payload.get("idempotency_key").and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| format!("plan:{}", plan.plan_id)),
            }),
            target: payload.get("channel_target").and_then(|v| v.as_str()).map(String::from),
            origin: "reminder_executor".into(),
            correlation_id: plan.correlation_id.clone(),
        }))
    }
}

/// Immediate outbound message.
pub struct NotifyExecutor;

#[async_trait::async_trait]
impl PlanExecutor for NotifyExecutor {
    fn key(&self) -> &str {
        "notify_executor"
    }

    async fn execute(&self, plan: &PlanInstance, _ctx: &RuntimeContext) -> Result<ActionResult> {
        let message = plan
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("notify payload missing message".into()))?;
        Ok(ActionResult::ok().with_outbound(OutboundMessage {
            message: message.to_string(),
            channel_type: plan.payload.get("channel_type").and_then(|v| v.as_str()).unwrap_or(&plan.source_channel).to_string(),
            channel_target: plan
                .payload
                .get("channel_target")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("{}:default", plan.source_channel)),
            audience: Audience::user(
                plan.payload.get("user_id").and_then(|v| v.as_str()).unwrap_or(&plan.actor),
            ),
            correlation_id: plan.correlation_id.clone(),
            metadata: serde_json::Value::Null,
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PlanWorker {
    store: Arc<Store>,
    obs: Arc<Store>,
    bus: Bus,
    ctx: Arc<RuntimeContext>,
    executors: Arc<ExecutorRegistry>,
}

impl PlanWorker {
    pub fn new(store: Arc<Store>, obs: Arc<Store>, bus: Bus, ctx: Arc<RuntimeContext>, executors: Arc<ExecutorRegistry>) -> Self {
        Self { store, obs, bus, ctx, executors }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!("plan worker running");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_queued().await {
                        tracing::error!(error = %e, "plan batch failed");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("plan worker stopping");
                    break;
                }
            }
        }
    }

    /// Claim queued instances and drive each to a terminal status.
    pub async fn run_queued(&self) -> Result<usize> {
        let claimed = self.store.claim_queued_plans(8)?;
        let count = claimed.len();
        for plan in claimed {
            self.run_one(&plan).await?;
        }
        Ok(count)
    }

    async fn run_one(&self, plan: &PlanInstance) -> Result<()> {
        let kind = match self.store.get_plan_kind(&plan.plan_kind, plan.plan_version)? {
            Some(kind) => kind,
            None => {
                return self.fail_plan(plan, &format!("unknown plan kind {}@{}", plan.plan_kind, plan.plan_version));
            }
        };
        if kind.is_deprecated {
            return self.fail_plan(plan, &format!("plan kind {}@{} is deprecated", plan.plan_kind, plan.plan_version));
        }
        if let Err(violation) = validate_payload(&plan.payload, &kind.schema) {
            return self.fail_plan(plan, &format!("schema: {violation}"));
        }
        let Some(executor) = self.executors.get(&kind.executor_key) else {
            return self.fail_plan(plan, &format!("unknown executor {}", kind.executor_key));
        };

        let run_id = self.store.start_plan_run(&plan.plan_id)?;
        match executor.execute(plan, &self.ctx).await {
            Ok(result) => {
                let status = match result.result_code {
                    ResultCode::Succeeded => PlanStatus::Done,
                    ResultCode::Failed => PlanStatus::Failed,
                    ResultCode::WaitingUser => PlanStatus::AwaitingUser,
                };
                let mut scheduled = Vec::new();
                for timed in &result.timed_signals {
                    scheduled.push(self.store.insert_timed_signal(timed)?);
                }
                for msg in result.outbound_messages {
                    self.bus.publish_outbound(msg);
                }
                for signal in result.next_signals {
                    if signal.durable {
                        self.store.enqueue_signal(&signal)?;
                    } else if let Err(e) = self.bus.publish(signal).await {
                        tracing::warn!(error = %e, "dropping plan follow-up signal");
                    }
                }
                for follow_up in &result.plans {
                    self.store.insert_plan_instance(follow_up)?;
                }

                self.store.set_plan_status(&plan.plan_id, status, result.error_summary.as_deref())?;
                self.store.finish_plan_run(
                    &run_id,
                    status,
                    &serde_json::Value::Null,
                    &serde_json::json!({"timed_ids": scheduled}),
                    result.error_summary.as_deref(),
                )?;
                self.record_state(plan, status, None);
                Ok(())
            }
            Err(e) => {
                let summary = e.to_string();
                self.store.set_plan_status(&plan.plan_id, PlanStatus::Failed, Some(&summary))?;
                self.store.finish_plan_run(
                    &run_id,
                    PlanStatus::Failed,
                    &serde_json::Value::Null,
                    &serde_json::Value::Null,
                    Some(&summary),
                )?;
                self.record_state(plan, PlanStatus::Failed, Some(&summary));
                self.send_fallback(plan);
                Ok(())
            }
        }
    }

    /// Validation-stage failure: structured error on the instance, safe
    /// fallback to the user, no executor run.
    fn fail_plan(&self, plan: &PlanInstance, error: &str) -> Result<()> {
        self.store.set_plan_status(&plan.plan_id, PlanStatus::Failed, Some(error))?;
        self.record_state(plan, PlanStatus::Failed, Some(error));
        self.send_fallback(plan);
        Ok(())
    }

    fn send_fallback(&self, plan: &PlanInstance) {
        let message = self.ctx.renderer.render(keys::INTERNAL_PAUSE, &HashMap::new());
        self.bus.publish_outbound(OutboundMessage {
            message,
            channel_type: plan.source_channel.clone(),
            channel_target: plan
                .payload
                .get("channel_target")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("{}:default", plan.source_channel)),
            audience: Audience::user(plan.actor.clone()),
            correlation_id: plan.correlation_id.clone(),
            metadata: serde_json::Value::Null,
        });
    }

    fn record_state(&self, plan: &PlanInstance, status: PlanStatus, error: Option<&str>) {
        let mut event = ObsEvent::new(
            events::PLAN_STATE_CHANGED,
            if status == PlanStatus::Failed { nerve_domain::trace::Level::Error } else { nerve_domain::trace::Level::Info },
            &plan.correlation_id,
        )
        .with_status(status.as_str())
        .with_detail(&format!("{}@{}", plan.plan_kind, plan.plan_version));
        if let Some(error) = error {
            event = event.with_error_code("plan_failed").with_detail(error);
        }
        event.emit();
        if let Err(e) = self.obs.record_event(&event) {
            tracing::warn!(error = %e, "observability write failed");
        }
    }
}
