//! The FSM engine: the single consumer of the signal bus.
//!
//! Per signal: resolve the transition for `(current_state, signal_type)`,
//! evaluate guards, run the action under a deadline, then apply the step
//! atomically through the store. Handler failures never propagate; they mark
//! the signal failed and emit a synthetic `action.failed`.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};

use nerve_domain::action::{ActionResult, ResultCode};
use nerve_domain::config::{FsmConfig, SliceConfig};
use nerve_domain::error::{Error, Result};
use nerve_domain::signal::{types, Signal};
use nerve_domain::trace::{events, ObsEvent};
use nerve_store::{FsmStepRecord, SliceDefaults, StepEffects, Store, TransitionCandidate};

use super::actions::{ActionRegistry, GuardRegistry};
use super::context::RuntimeContext;
use crate::bus::Bus;

pub struct FsmEngine {
    store: Arc<Store>,
    obs: Arc<Store>,
    ctx: Arc<RuntimeContext>,
    actions: Arc<ActionRegistry>,
    guards: Arc<GuardRegistry>,
    bus: Bus,
    config: FsmConfig,
    slice_defaults: SliceDefaults,
    shutdown_tx: watch::Sender<bool>,
}

impl FsmEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        obs: Arc<Store>,
        ctx: Arc<RuntimeContext>,
        actions: Arc<ActionRegistry>,
        guards: Arc<GuardRegistry>,
        bus: Bus,
        config: FsmConfig,
        slices: &SliceConfig,
    ) -> (Self, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            Self {
                store,
                obs,
                ctx,
                actions,
                guards,
                bus,
                config,
                slice_defaults: SliceDefaults {
                    slice_cycles: slices.default_cycles,
                    max_cycles: slices.max_cycles,
                    max_runtime_seconds: slices.max_runtime_seconds,
                    token_budget: slices.token_budget,
                },
                shutdown_tx,
            },
            shutdown_rx,
        )
    }

    /// Consume signals until the machine reaches a terminal state or the
    /// channel closes. Never panics out; every error is trapped per signal.
    pub async fn run(self, mut rx: mpsc::Receiver<Signal>) {
        tracing::info!("fsm engine consuming");
        while let Some(signal) = rx.recv().await {
            match self.step(&signal).await {
                Ok(reached_terminal) => {
                    if reached_terminal {
                        tracing::info!("terminal state reached, halting consumption");
                        break;
                    }
                }
                Err(e) => {
                    // Store-level failure: the signal could not even be
                    // traced. Log and keep consuming.
                    tracing::error!(signal_type = %signal.signal_type, error = %e, "fsm step failed");
                }
            }
        }
        self.bus.close();
        let _ = self.shutdown_tx.send(true);
    }

    /// Pick the first enabled candidate whose guard passes.
    fn select_transition(&self, signal: &Signal, candidates: &[TransitionCandidate]) -> Option<TransitionCandidate> {
        for candidate in candidates {
            if let Some(guard_key) = &candidate.guard_key {
                match self.guards.get(guard_key) {
                    Some(guard) if guard(signal, &self.ctx) => return Some(candidate.clone()),
                    Some(_) => continue,
                    None => {
                        tracing::warn!(guard = %guard_key, "guard key missing from registry, skipping candidate");
                        continue;
                    }
                }
            }
            return Some(candidate.clone());
        }
        None
    }

    pub(crate) async fn step(&self, signal: &Signal) -> Result<bool> {
        let started = Instant::now();
        let state_before = self.store.current_state()?;
        let candidates = self.store.resolve_transitions(&state_before, &signal.signal_type)?;

        let Some(transition) = self.select_transition(signal, &candidates) else {
            self.store.fsm_step(
                &FsmStepRecord {
                    correlation_id: signal.correlation_id.clone(),
                    state_before: state_before.clone(),
                    signal_type: signal.signal_type.clone(),
                    transition_id: None,
                    action_key: None,
                    state_after: state_before.clone(),
                    result: "no_transition".into(),
                    error_summary: None,
                },
                &StepEffects::default(),
                consumed(signal, true, None),
            )?;
            self.record(
                ObsEvent::info(events::FSM_NO_TRANSITION, &signal.correlation_id)
                    .with_node(&state_before)
                    .with_detail(&signal.signal_type),
            );
            return Ok(false);
        };

        let outcome = match &transition.action_key {
            Some(action_key) => self.run_action(action_key, signal).await,
            None => Ok(ActionResult::ok()),
        };

        match outcome {
            Ok(result) => {
                let state_after = transition.next_state_key.clone().unwrap_or_else(|| state_before.clone());
                let result_str = match result.result_code {
                    ResultCode::Succeeded => "succeeded",
                    ResultCode::Failed => "failed",
                    ResultCode::WaitingUser => "waiting_user",
                };

                let (durable_signals, ephemeral_signals): (Vec<_>, Vec<_>) =
                    result.next_signals.iter().cloned().partition(|s| s.durable);

                self.store.fsm_step(
                    &FsmStepRecord {
                        correlation_id: signal.correlation_id.clone(),
                        state_before: state_before.clone(),
                        signal_type: signal.signal_type.clone(),
                        transition_id: Some(transition.id),
                        action_key: transition.action_key.clone(),
                        state_after: state_after.clone(),
                        result: result_str.into(),
                        error_summary: result.error_summary.clone(),
                    },
                    &StepEffects {
                        durable_signals,
                        timed_signals: result.timed_signals.clone(),
                        plans: result.plans.clone(),
                        slice_requests: result.slice_requests.clone(),
                        slice_defaults: Some(self.slice_defaults),
                    },
                    consumed(signal, result.result_code != ResultCode::Failed, result.error_summary.as_deref()),
                )?;

                // Outside the transaction: delivery is best-effort.
                for msg in result.outbound_messages {
                    self.bus.publish_outbound(msg);
                }
                for next in ephemeral_signals {
                    if let Err(e) = self.bus.publish(next).await {
                        tracing::warn!(error = %e, "dropping ephemeral follow-up signal");
                    }
                }

                self.record(
                    ObsEvent::info(events::FSM_TRANSITION, &signal.correlation_id)
                        .with_node(&state_after)
                        .with_status(result_str)
                        .with_detail(&signal.signal_type)
                        .with_latency_ms(started.elapsed().as_millis() as i64),
                );

                if transition.next_state_terminal {
                    self.bus.close();
                    return Ok(true);
                }
                Ok(false)
            }
            Err(e) => {
                let summary = e.to_string();
                self.store.fsm_step(
                    &FsmStepRecord {
                        correlation_id: signal.correlation_id.clone(),
                        state_before: state_before.clone(),
                        signal_type: signal.signal_type.clone(),
                        transition_id: Some(transition.id),
                        action_key: transition.action_key.clone(),
                        state_after: state_before.clone(),
                        result: "failed".into(),
                        error_summary: Some(summary.clone()),
                    },
                    &StepEffects::default(),
                    consumed(signal, false, Some(&summary)),
                )?;
                self.record(
                    ObsEvent::error(events::SIGNAL_FAILED, &signal.correlation_id)
                        .with_node(&state_before)
                        .with_error_code(error_code(&e))
                        .with_detail(&summary),
                );

                // Synthetic failure signal, except for failures of the
                // failure handler itself.
                if signal.signal_type != types::ACTION_FAILED {
                    let mut payload = serde_json::json!({
                        "error": summary,
                        "original_signal_type": signal.signal_type,
                    });
                    for key in ["channel_type", "channel_target", "user_id"] {
                        if let Some(v) = signal.payload.get(key) {
                            payload[key] = v.clone();
                        }
                    }
                    let failed = Signal::new(types::ACTION_FAILED, "fsm", payload)
                        .with_correlation(signal.correlation_id.clone());
                    if let Err(e) = self.bus.publish(failed).await {
                        tracing::warn!(error = %e, "could not publish action.failed");
                    }
                }
                Ok(false)
            }
        }
    }

    async fn run_action(&self, action_key: &str, signal: &Signal) -> Result<ActionResult> {
        let action = self
            .actions
            .get(action_key)
            .ok_or_else(|| Error::UnknownHandler(action_key.to_string()))?;
        let deadline = std::time::Duration::from_secs(self.config.signal_deadline_seconds);
        match tokio::time::timeout(deadline, action.execute(signal, &self.ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "action {action_key} exceeded {}s deadline",
                self.config.signal_deadline_seconds
            ))),
        }
    }

    fn record(&self, event: ObsEvent) {
        event.emit();
        if let Err(e) = self.obs.record_event(&event) {
            tracing::warn!(error = %e, "observability write failed");
        }
    }
}

fn consumed<'a>(signal: &'a Signal, ok: bool, error: Option<&'a str>) -> Option<(&'a uuid::Uuid, bool, Option<&'a str>)> {
    signal.durable.then_some((&signal.id, ok, error))
}

fn error_code(e: &Error) -> &'static str {
    match e {
        Error::Timeout(_) => "timeout",
        Error::Validation(_) => "validation",
        Error::PermissionDenied(_) => "permission_denied",
        Error::Storage(_) => "storage",
        Error::Provider { .. } => "provider",
        _ => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerve_domain::config::PublishMode;
    use nerve_domain::message::InboundMessage;
    use nerve_domain::render::FallbackRenderer;
    use nerve_tools::ToolRegistry;

    struct Harness {
        store: Arc<Store>,
        engine: FsmEngine,
        bus: Bus,
    }

    fn harness() -> Harness {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.seed_default_catalog("idle").unwrap();
        let ctx = Arc::new(RuntimeContext::new(
            store.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(FallbackRenderer),
            None,
        ));
        let (bus, _rx) = Bus::new(32, PublishMode::Block);
        let (engine, _shutdown) = FsmEngine::new(
            store.clone(),
            store.clone(),
            ctx,
            Arc::new(ActionRegistry::with_builtins()),
            Arc::new(GuardRegistry::with_builtins()),
            bus.clone(),
            FsmConfig::default(),
            &SliceConfig::default(),
        );
        Harness { store, engine, bus }
    }

    fn message_signal(text: &str, correlation: &str) -> Signal {
        let inbound = InboundMessage::new(text, "cli", "cli:local", "u1", correlation);
        Signal::new(types::CLI_MESSAGE_RECEIVED, "cli", serde_json::to_value(&inbound).unwrap())
            .with_correlation(correlation)
    }

    #[tokio::test]
    async fn shutdown_from_any_state_reaches_terminal() {
        let h = harness();
        h.store.set_current_state("error").unwrap();
        let sig = Signal::new(types::SHUTDOWN_REQUESTED, "test", serde_json::json!({})).with_correlation("C0");

        let terminal = h.engine.step(&sig).await.unwrap();
        assert!(terminal);
        assert_eq!(h.store.current_state().unwrap(), "shutting_down");
        assert!(!h.bus.is_accepting(), "bus refuses publishes after shutdown");

        let trace = h.store.fsm_trace("C0").unwrap();
        assert_eq!(trace[0].2.as_deref(), Some("shutdown"));
    }

    #[tokio::test]
    async fn message_routing_creates_timed_row_and_outbound() {
        let h = harness();
        let mut outbound = h.bus.subscribe_outbound();
        let sig = message_signal("remind me to water the plants in 1 minute", "C1");

        let terminal = h.engine.step(&sig).await.unwrap();
        assert!(!terminal);
        assert_eq!(h.store.current_state().unwrap(), "idle");

        let trace = h.store.fsm_trace("C1").unwrap();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].2.as_deref(), Some("handle_incoming_message"));
        assert_eq!(trace[0].4, "succeeded");

        let pending = h.store.list_pending_timed(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["kind"], "create_reminder");

        let ack = outbound.recv().await.unwrap();
        assert_eq!(ack.correlation_id, "C1");
    }

    #[tokio::test]
    async fn guard_veto_yields_no_transition() {
        let h = harness();
        // Text-less message: has_text guard vetoes the only candidate.
        let inbound = InboundMessage::new("", "cli", "cli:local", "u1", "C2");
        let sig = Signal::new(types::CLI_MESSAGE_RECEIVED, "cli", serde_json::to_value(&inbound).unwrap())
            .with_correlation("C2");

        h.engine.step(&sig).await.unwrap();
        let trace = h.store.fsm_trace("C2").unwrap();
        assert_eq!(trace[0].4, "no_transition");
        assert_eq!(h.store.current_state().unwrap(), "idle");
    }

    #[tokio::test]
    async fn handler_error_marks_failed_and_emits_action_failed() {
        let h = harness();
        // Payload with text but not a valid inbound message: the guard
        // passes, the handler's deserialization fails.
        let sig = Signal::new(types::CLI_MESSAGE_RECEIVED, "cli", serde_json::json!({"text": "hello"}))
            .durable()
            .with_correlation("C3");
        h.store.enqueue_signal(&sig).unwrap();
        h.store.claim_signals(1).unwrap();

        h.engine.step(&sig).await.unwrap();

        assert_eq!(
            h.store.signal_status(&sig.id).unwrap(),
            Some(nerve_domain::signal::SignalStatus::Failed)
        );
        let trace = h.store.fsm_trace("C3").unwrap();
        assert_eq!(trace[0].4, "failed");
        assert_eq!(h.store.current_state().unwrap(), "idle", "state must not advance on failure");
    }

    #[tokio::test]
    async fn action_failed_signal_moves_machine_to_error_state() {
        let h = harness();
        let sig = Signal::new(
            types::ACTION_FAILED,
            "fsm",
            serde_json::json!({"error": "boom", "original_signal_type": "x"}),
        )
        .with_correlation("C4");
        h.engine.step(&sig).await.unwrap();
        assert_eq!(h.store.current_state().unwrap(), "error");
    }

    #[tokio::test]
    async fn status_request_does_not_move_state() {
        let h = harness();
        h.store.set_current_state("error").unwrap();
        let sig = Signal::new(
            types::API_STATUS_REQUESTED,
            "api",
            serde_json::json!({"channel_type": "api", "channel_target": "api:x", "user_id": "u1"}),
        )
        .with_correlation("C5");
        h.engine.step(&sig).await.unwrap();
        assert_eq!(h.store.current_state().unwrap(), "error", "stay transition must not recover the state");
    }

    #[tokio::test]
    async fn run_loop_consumes_until_terminal() {
        let h = harness();
        let (bus, rx) = Bus::new(32, PublishMode::Block);
        let store = h.store.clone();
        let ctx = Arc::new(RuntimeContext::new(
            store.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(FallbackRenderer),
            None,
        ));
        let (engine, mut shutdown) = FsmEngine::new(
            store.clone(),
            store.clone(),
            ctx,
            Arc::new(ActionRegistry::with_builtins()),
            Arc::new(GuardRegistry::with_builtins()),
            bus.clone(),
            FsmConfig::default(),
            &SliceConfig::default(),
        );
        let handle = tokio::spawn(engine.run(rx));

        bus.publish(message_signal("remind me to stretch in 5 minutes", "C6")).await.unwrap();
        bus.publish(Signal::new(types::SHUTDOWN_REQUESTED, "test", serde_json::json!({})).with_correlation("C7"))
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(*shutdown.borrow_and_update());
        assert_eq!(store.current_state().unwrap(), "shutting_down");
        assert_eq!(store.list_pending_timed(10).unwrap().len(), 1);
    }
}
