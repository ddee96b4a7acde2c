//! Action and guard registries plus the built-in handlers.
//!
//! Actions are pure logic: they read through the [`RuntimeContext`] and
//! declare every effect in the returned [`ActionResult`]. The engine applies
//! effects inside the step transaction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use nerve_domain::action::{ActionResult, PlanRequest, ResultCode, SliceRequest, TimedSignalRequest};
use nerve_domain::error::{Error, Result};
use nerve_domain::message::{InboundMessage, OutboundMessage};
use nerve_domain::render::{keys, vars};
use nerve_domain::signal::{types, Signal};

use super::context::RuntimeContext;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait Action: Send + Sync {
    fn key(&self) -> &str;
    async fn execute(&self, signal: &Signal, ctx: &RuntimeContext) -> Result<ActionResult>;
}

pub type Guard = fn(&Signal, &RuntimeContext) -> bool;

#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.key().to_string(), action);
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Every handler the default catalog references.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShutdownAction));
        registry.register(Arc::new(HandleIncomingMessage));
        registry.register(Arc::new(HandleTimerFired));
        registry.register(Arc::new(HandleActionFailure));
        registry.register(Arc::new(HandleStatus));
        registry.register(Arc::new(HandleTimedSignals));
        registry.register(Arc::new(HandleResume));
        registry
    }
}

#[derive(Default)]
pub struct GuardRegistry {
    guards: HashMap<String, Guard>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &str, guard: Guard) {
        self.guards.insert(key.to_string(), guard);
    }

    pub fn get(&self, key: &str) -> Option<Guard> {
        self.guards.get(key).copied()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.guards.keys().map(String::as_str).collect()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("has_text", guard_has_text);
        registry.register("not_dnd", guard_not_dnd);
        registry
    }
}

fn guard_has_text(signal: &Signal, _ctx: &RuntimeContext) -> bool {
    signal.text().is_some()
}

fn guard_not_dnd(signal: &Signal, ctx: &RuntimeContext) -> bool {
    let user_id = signal.payload.get("user_id").and_then(|v| v.as_str()).unwrap_or("");
    !ctx.dnd(user_id).unwrap_or(false)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Intent parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// "remind me to X in N minutes"
    RelativeReminder { task: String, seconds: i64 },
    /// "remind me to X every day at HH:MM"
    DailyReminder { task: String, hour: u32, minute: u32 },
    Unknown,
}

fn unit_seconds(unit: &str) -> Option<i64> {
    match unit.trim_end_matches('s') {
        "second" | "sec" => Some(1),
        "minute" | "min" => Some(60),
        "hour" => Some(3_600),
        "day" => Some(86_400),
        _ => None,
    }
}

fn parse_clock(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.trim().split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// Deterministic parse of the reminder intents. Anything else is `Unknown`
/// and falls through to the model (when configured) or a clarify response.
pub fn parse_intent(text: &str) -> Intent {
    let lower = text.trim().to_lowercase();
    let Some(rest) = lower.strip_prefix("remind me to ") else {
        return Intent::Unknown;
    };

    if let Some((task, clock)) = rest.split_once(" every day at ") {
        if let Some((hour, minute)) = parse_clock(clock) {
            if !task.trim().is_empty() {
                return Intent::DailyReminder { task: task.trim().to_string(), hour, minute };
            }
        }
        return Intent::Unknown;
    }

    // Use the last " in " so task text may itself contain the word.
    if let Some(split_at) = rest.rfind(" in ") {
        let task = rest[..split_at].trim();
        let duration = rest[split_at + 4..].trim();
        let mut parts = duration.split_whitespace();
        if let (Some(n), Some(unit)) = (parts.next(), parts.next()) {
            if let (Ok(n), Some(secs)) = (n.parse::<i64>(), unit_seconds(unit)) {
                if n > 0 && !task.is_empty() && parts.next().is_none() {
                    return Intent::RelativeReminder { task: task.to_string(), seconds: n * secs };
                }
            }
        }
    }
    Intent::Unknown
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn inbound_from(signal: &Signal) -> Result<InboundMessage> {
    serde_json::from_value(signal.payload.clone())
        .map_err(|e| Error::Validation(format!("malformed inbound payload: {e}")))
}

/// No work of its own: the transition into the terminal state is the effect.
pub struct ShutdownAction;

#[async_trait::async_trait]
impl Action for ShutdownAction {
    fn key(&self) -> &str {
        "shutdown"
    }

    async fn execute(&self, _signal: &Signal, _ctx: &RuntimeContext) -> Result<ActionResult> {
        Ok(ActionResult::ok())
    }
}

pub struct HandleIncomingMessage;

impl HandleIncomingMessage {
    fn reminder_payload(inbound: &InboundMessage, task: &str) -> serde_json::Value {
        serde_json::json!({
            "kind": "create_reminder",
            "task": task,
            "channel_type": inbound.channel_type,
            "user_id": inbound.user_id,
            "idempotency_key": format!("reminder:{}", inbound.correlation_id),
        })
    }

    /// Ask the configured model for a plan and parse it. Bounded attempts;
    /// repeated invalid output degrades to a calm pause, never a question.
    async fn plan_via_llm(
        &self,
        llm: &std::sync::Arc<dyn nerve_providers::LlmProvider>,
        inbound: &InboundMessage,
        ctx: &RuntimeContext,
    ) -> Result<ActionResult> {
        let system = "You translate a household request into exactly one JSON object \
                      {\"plan_kind\": string, \"plan_version\": number, \"payload\": object}. \
                      Known kinds: create_reminder (payload: task, schedule), notify (payload: message). \
                      Reply with JSON only.";
        for attempt in 0..2 {
            // Bounded retries cover both transient provider errors and
            // invalid output; neither surfaces to the user as a question.
            let raw = match llm.complete(system, &inbound.text).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "planner completion failed");
                    continue;
                }
            };
            let trimmed = raw.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```");
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed.trim()) {
                let kind = value.get("plan_kind").and_then(|v| v.as_str());
                let version = value.get("plan_version").and_then(|v| v.as_u64());
                let payload = value.get("payload");
                if let (Some(kind), Some(version), Some(payload)) = (kind, version, payload) {
                    return Ok(ActionResult::ok()
                        .with_plan(PlanRequest {
                            plan_kind: kind.to_string(),
                            plan_version: version as u32,
                            payload: payload.clone(),
                            actor: inbound.user_id.clone(),
                            source_channel: inbound.channel_type.clone(),
                            intent_confidence: 0.5,
                            correlation_id: inbound.correlation_id.clone(),
                        })
                        .with_outbound(OutboundMessage::reply_to(
                            inbound,
                            ctx.renderer.render(keys::REMINDER_ACK, &vars(&[("task", &inbound.text), ("when", "soon")])),
                        )));
                }
            }
        }
        // Planner degradation: failed attempt, calm user-facing pause.
        let mut result = ActionResult::failed("next_step_parse_failed");
        result.outbound_messages.push(OutboundMessage::reply_to(
            inbound,
            ctx.renderer.render(keys::INTERNAL_PAUSE, &HashMap::new()),
        ));
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Action for HandleIncomingMessage {
    fn key(&self) -> &str {
        "handle_incoming_message"
    }

    async fn execute(&self, signal: &Signal, ctx: &RuntimeContext) -> Result<ActionResult> {
        let inbound = inbound_from(signal)?;

        match parse_intent(&inbound.text) {
            Intent::RelativeReminder { task, seconds } => {
                let trigger_at = Utc::now() + Duration::seconds(seconds);
                let when = trigger_at.format("%H:%M").to_string();
                Ok(ActionResult::ok()
                    .with_timed(TimedSignalRequest {
                        signal_type: types::TIMER_FIRED.into(),
                        trigger_at,
                        rrule: None,
                        timezone: ctx.default_timezone.clone(),
                        payload: Self::reminder_payload(&inbound, &task),
                        target: Some(inbound.channel_target.clone()),
                        origin: self.key().into(),
                        correlation_id: inbound.correlation_id.clone(),
                    })
                    .with_outbound(OutboundMessage::reply_to(
                        &inbound,
                        ctx.renderer.render(keys::REMINDER_ACK, &vars(&[("task", &task), ("when", &when)])),
                    )))
            }
            Intent::DailyReminder { task, hour, minute } => {
                // Recurring schedules go through the typed plan path.
                let when = format!("every day at {hour:02}:{minute:02}");
                Ok(ActionResult::ok()
                    .with_plan(PlanRequest {
                        plan_kind: "create_reminder".into(),
                        plan_version: 1,
                        payload: serde_json::json!({
                            "task": task,
                            "schedule": {
                                "rrule": format!("FREQ=DAILY;BYHOUR={hour};BYMINUTE={minute}"),
                                "timezone": ctx.default_timezone,
                            },
                            "channel_type": inbound.channel_type,
                            "channel_target": inbound.channel_target,
                            "user_id": inbound.user_id,
                            "idempotency_key": format!("reminder:{}", inbound.correlation_id),
                        }),
                        actor: inbound.user_id.clone(),
                        source_channel: inbound.channel_type.clone(),
                        intent_confidence: 1.0,
                        correlation_id: inbound.correlation_id.clone(),
                    })
                    .with_outbound(OutboundMessage::reply_to(
                        &inbound,
                        ctx.renderer.render(keys::REMINDER_ACK, &vars(&[("task", &task), ("when", &when)])),
                    )))
            }
            Intent::Unknown => {
                if let Some(llm) = ctx.llm.clone() {
                    self.plan_via_llm(&llm, &inbound, ctx).await
                } else {
                    Ok(ActionResult::ok().with_outbound(OutboundMessage::reply_to(
                        &inbound,
                        ctx.renderer.render(keys::CLARIFY_INTENT, &HashMap::new()),
                    )))
                }
            }
        }
    }
}

/// Consumes `timed_signal.fired` (and bare `timer.fired`) dispatches.
pub struct HandleTimerFired;

#[async_trait::async_trait]
impl Action for HandleTimerFired {
    fn key(&self) -> &str {
        "handle_timer_fired"
    }

    async fn execute(&self, signal: &Signal, ctx: &RuntimeContext) -> Result<ActionResult> {
        // Scheduler dispatches wrap the original payload.
        let inner = signal.payload.get("payload").unwrap_or(&signal.payload);
        let task = inner.get("task").and_then(|v| v.as_str()).unwrap_or("(unnamed)");
        let channel_type = inner.get("channel_type").and_then(|v| v.as_str()).unwrap_or("cli");
        let user_id = inner.get("user_id").and_then(|v| v.as_str()).unwrap_or("local");
        let target = signal
            .payload
            .get("target")
            .and_then(|v| v.as_str())
            .unwrap_or("cli:local");

        let message = ctx.renderer.render(keys::REMINDER_FIRE, &vars(&[("task", task)]));
        Ok(ActionResult::ok().with_outbound(OutboundMessage {
            message,
            channel_type: channel_type.to_string(),
            channel_target: target.to_string(),
            audience: nerve_domain::message::Audience::user(user_id),
            correlation_id: signal.correlation_id.clone(),
            metadata: serde_json::json!({"urgency": "high"}),
        }))
    }
}

/// Bound to `action.failed` from any state. The state machine has already
/// moved to `error`; this keeps the user informed when a channel is known.
pub struct HandleActionFailure;

#[async_trait::async_trait]
impl Action for HandleActionFailure {
    fn key(&self) -> &str {
        "handle_action_failure"
    }

    async fn execute(&self, signal: &Signal, ctx: &RuntimeContext) -> Result<ActionResult> {
        let error = signal.payload.get("error").and_then(|v| v.as_str()).unwrap_or("unknown");
        tracing::warn!(correlation_id = %signal.correlation_id, error = %error, "action failure handled");

        let mut result = ActionResult::ok();
        if let (Some(channel_type), Some(channel_target)) = (
            signal.payload.get("channel_type").and_then(|v| v.as_str()),
            signal.payload.get("channel_target").and_then(|v| v.as_str()),
        ) {
            let user_id = signal.payload.get("user_id").and_then(|v| v.as_str()).unwrap_or("local");
            result.outbound_messages.push(OutboundMessage {
                message: ctx.renderer.render(keys::INTERNAL_PAUSE, &HashMap::new()),
                channel_type: channel_type.to_string(),
                channel_target: channel_target.to_string(),
                audience: nerve_domain::message::Audience::user(user_id),
                correlation_id: signal.correlation_id.clone(),
                metadata: serde_json::Value::Null,
            });
        }
        Ok(result)
    }
}

pub struct HandleStatus;

#[async_trait::async_trait]
impl Action for HandleStatus {
    fn key(&self) -> &str {
        "handle_status"
    }

    async fn execute(&self, signal: &Signal, ctx: &RuntimeContext) -> Result<ActionResult> {
        let counts = ctx.kernel_counts()?;
        let state = ctx.current_state()?;
        let message = ctx.renderer.render(
            keys::STATUS_REPORT,
            &vars(&[
                ("state", &state),
                ("queued", &counts.queued_signals.to_string()),
                ("timers", &counts.pending_timed.to_string()),
                ("tasks", &counts.active_slices.to_string()),
            ]),
        );
        Ok(ActionResult::ok().with_outbound(reply_from_signal(signal, message)))
    }
}

pub struct HandleTimedSignals;

#[async_trait::async_trait]
impl Action for HandleTimedSignals {
    fn key(&self) -> &str {
        "handle_timed_signals"
    }

    async fn execute(&self, signal: &Signal, ctx: &RuntimeContext) -> Result<ActionResult> {
        let pending = ctx.pending_timed(10)?;
        let items = if pending.is_empty() {
            "none".to_string()
        } else {
            pending
                .iter()
                .map(|t| format!("{} at {}", t.signal_type, t.trigger_at.format("%Y-%m-%d %H:%M")))
                .collect::<Vec<_>>()
                .join("; ")
        };
        let message = ctx.renderer.render(keys::TIMED_LIST, &vars(&[("items", &items)]));
        Ok(ActionResult::ok().with_outbound(reply_from_signal(signal, message)))
    }
}

/// `pdca.resume_requested`: wake a parked slice task unless the resume is
/// stale (the store compares checkpoint versions).
pub struct HandleResume;

#[async_trait::async_trait]
impl Action for HandleResume {
    fn key(&self) -> &str {
        "handle_resume"
    }

    async fn execute(&self, signal: &Signal, _ctx: &RuntimeContext) -> Result<ActionResult> {
        let task_id = signal
            .payload
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::Validation("pdca.resume_requested without task_id".into()))?;
        let version = signal.payload.get("version").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(ActionResult::ok().with_slice(SliceRequest::Resume { task_id, version }))
    }
}

/// Build a reply to whatever channel the request signal carries; gateway
/// signals always include the reply fields.
fn reply_from_signal(signal: &Signal, message: String) -> OutboundMessage {
    let channel_type = signal.payload.get("channel_type").and_then(|v| v.as_str()).unwrap_or("api");
    let channel_target = signal.payload.get("channel_target").and_then(|v| v.as_str()).unwrap_or("api:default");
    let user_id = signal.payload.get("user_id").and_then(|v| v.as_str()).unwrap_or("local");
    OutboundMessage {
        message,
        channel_type: channel_type.to_string(),
        channel_target: channel_target.to_string(),
        audience: nerve_domain::message::Audience::user(user_id),
        correlation_id: signal.correlation_id.clone(),
        metadata: serde_json::Value::Null,
    }
}
