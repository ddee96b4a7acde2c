//! The FSM step transaction: consuming a signal, advancing the state,
//! writing the trace row, and persisting every declared side effect happen
//! atomically or not at all.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use nerve_domain::action::{PlanRequest, SliceRequest, TimedSignalRequest};
use nerve_domain::error::Result;
use nerve_domain::signal::Signal;

use crate::slices::SliceDefaults;
use crate::{catalog, db_err, fmt_ts, plans, queue, slices, timed, Store};

/// The trace row written for every consumed signal.
#[derive(Debug, Clone)]
pub struct FsmStepRecord {
    pub correlation_id: String,
    pub state_before: String,
    pub signal_type: String,
    pub transition_id: Option<i64>,
    pub action_key: Option<String>,
    pub state_after: String,
    pub result: String,
    pub error_summary: Option<String>,
}

/// Side effects declared by the action, applied inside the transaction.
/// Ephemeral next signals are not here: they go straight to the bus after
/// commit.
#[derive(Debug, Clone, Default)]
pub struct StepEffects {
    pub durable_signals: Vec<Signal>,
    pub timed_signals: Vec<TimedSignalRequest>,
    pub plans: Vec<PlanRequest>,
    pub slice_requests: Vec<SliceRequest>,
    pub slice_defaults: Option<SliceDefaults>,
}

/// Ids of the rows the step created.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub timed_ids: Vec<i64>,
    pub plan_ids: Vec<Uuid>,
    pub task_ids: Vec<Uuid>,
    pub resumed_tasks: Vec<Uuid>,
}

impl Store {
    /// Apply one FSM step atomically: state marker, trace row, durable
    /// side effects, and completion of the consumed durable signal.
    pub fn fsm_step(
        &self,
        record: &FsmStepRecord,
        effects: &StepEffects,
        consumed: Option<(&Uuid, bool, Option<&str>)>,
    ) -> Result<StepOutcome> {
        self.with_tx(|conn| {
            if record.state_after != record.state_before {
                catalog::set_current_state_tx(conn, &record.state_after)?;
            }

            conn.execute(
                "INSERT INTO fsm_trace
                    (ts, correlation_id, state_before, signal_type, transition_id, action_key, state_after, result, error_summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    fmt_ts(&Utc::now()),
                    record.correlation_id,
                    record.state_before,
                    record.signal_type,
                    record.transition_id,
                    record.action_key,
                    record.state_after,
                    record.result,
                    record.error_summary,
                ],
            )
            .map_err(db_err)?;

            let mut outcome = StepOutcome::default();

            for signal in &effects.durable_signals {
                queue::enqueue_signal_tx(conn, signal)?;
            }
            for req in &effects.timed_signals {
                outcome.timed_ids.push(timed::insert_timed_tx(conn, req)?);
            }
            for req in &effects.plans {
                outcome.plan_ids.push(plans::insert_plan_tx(conn, req)?);
            }
            if !effects.slice_requests.is_empty() {
                let defaults = effects.slice_defaults.unwrap_or(SliceDefaults {
                    slice_cycles: 3,
                    max_cycles: 60,
                    max_runtime_seconds: 120,
                    token_budget: 50_000,
                });
                let now = Utc::now();
                for req in &effects.slice_requests {
                    match req {
                        SliceRequest::Enqueue(enqueue) => {
                            outcome.task_ids.push(slices::enqueue_slice_tx(conn, enqueue, &defaults)?);
                        }
                        SliceRequest::Resume { task_id, version } => {
                            if slices::resume_slice_tx(conn, task_id, *version, &now)? {
                                outcome.resumed_tasks.push(*task_id);
                            }
                        }
                    }
                }
            }

            if let Some((signal_id, ok, error)) = consumed {
                queue::complete_signal_tx(conn, signal_id, ok, error)?;
            }

            Ok(outcome)
        })
    }

    /// Trace rows for a correlation id, oldest first, as
    /// `(state_before, signal_type, action_key, state_after, result)`.
    pub fn fsm_trace(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<(String, String, Option<String>, String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT state_before, signal_type, action_key, state_after, result
                     FROM fsm_trace WHERE correlation_id = ?1 ORDER BY id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([correlation_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    pub fn fsm_trace_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM fsm_trace", [], |row| row.get(0)).map_err(db_err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerve_domain::action::SliceEnqueue;
    use nerve_domain::signal::{types, SignalStatus};

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.seed_default_catalog("idle").unwrap();
        store
    }

    fn record(state_after: &str) -> FsmStepRecord {
        FsmStepRecord {
            correlation_id: "C1".into(),
            state_before: "idle".into(),
            signal_type: types::CLI_MESSAGE_RECEIVED.into(),
            transition_id: Some(1),
            action_key: Some("handle_incoming_message".into()),
            state_after: state_after.into(),
            result: "succeeded".into(),
            error_summary: None,
        }
    }

    #[test]
    fn step_writes_trace_state_and_effects_atomically() {
        let store = seeded();
        let timed = TimedSignalRequest {
            signal_type: types::TIMED_SIGNAL_FIRED.into(),
            trigger_at: Utc::now() + chrono::Duration::seconds(60),
            rrule: None,
            timezone: "UTC".into(),
            payload: serde_json::json!({"kind": "create_reminder", "task": "water the plants"}),
            target: Some("cli:local".into()),
            origin: "handle_incoming_message".into(),
            correlation_id: "C1".into(),
        };
        let effects = StepEffects { timed_signals: vec![timed], ..Default::default() };

        let outcome = store.fsm_step(&record("error"), &effects, None).unwrap();
        assert_eq!(outcome.timed_ids.len(), 1);
        assert_eq!(store.current_state().unwrap(), "error");

        let trace = store.fsm_trace("C1").unwrap();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].2.as_deref(), Some("handle_incoming_message"));

        let ts = store.get_timed_signal(outcome.timed_ids[0]).unwrap().unwrap();
        assert_eq!(ts.correlation_id, "C1");
    }

    #[test]
    fn step_completes_consumed_durable_signal() {
        let store = seeded();
        let signal = Signal::new(types::CLI_MESSAGE_RECEIVED, "cli", serde_json::json!({"text": "x"})).durable();
        store.enqueue_signal(&signal).unwrap();
        store.claim_signals(1).unwrap();

        store
            .fsm_step(&record("idle"), &StepEffects::default(), Some((&signal.id, true, None)))
            .unwrap();
        assert_eq!(store.signal_status(&signal.id).unwrap(), Some(SignalStatus::Done));
    }

    #[test]
    fn step_enqueues_slices_and_plans() {
        let store = seeded();
        let effects = StepEffects {
            plans: vec![PlanRequest {
                plan_kind: "notify".into(),
                plan_version: 1,
                payload: serde_json::json!({"message": "hello"}),
                actor: "u1".into(),
                source_channel: "cli".into(),
                intent_confidence: 1.0,
                correlation_id: "C1".into(),
            }],
            slice_requests: vec![SliceRequest::Enqueue(SliceEnqueue {
                owner_id: "u1".into(),
                conversation_key: "conv:u1".into(),
                session_id: "s1".into(),
                priority: 0,
                task_state: serde_json::json!({"items": []}),
                correlation_id: "C1".into(),
            })],
            ..Default::default()
        };
        let outcome = store.fsm_step(&record("idle"), &effects, None).unwrap();
        assert_eq!(outcome.plan_ids.len(), 1);
        assert_eq!(outcome.task_ids.len(), 1);
        let plan = store.get_plan_instance(&outcome.plan_ids[0]).unwrap().unwrap();
        assert_eq!(plan.status, nerve_domain::plan::PlanStatus::Queued);
    }

    #[test]
    fn stay_step_leaves_state_marker_untouched() {
        let store = seeded();
        store.fsm_step(&record("idle"), &StepEffects::default(), None).unwrap();
        assert_eq!(store.current_state().unwrap(), "idle");
        assert_eq!(store.fsm_trace_count().unwrap(), 1);
    }

    #[test]
    fn resume_requests_are_applied_in_step() {
        let store = seeded();
        let defaults = SliceDefaults { slice_cycles: 3, max_cycles: 60, max_runtime_seconds: 120, token_budget: 1000 };
        let task_id = store
            .enqueue_slice_task(
                &SliceEnqueue {
                    owner_id: "u1".into(),
                    conversation_key: "c".into(),
                    session_id: "s".into(),
                    priority: 0,
                    task_state: serde_json::json!({}),
                    correlation_id: "C1".into(),
                },
                &defaults,
            )
            .unwrap();
        let now = Utc::now();
        store.claim_next_slice("w1", &now, 120).unwrap().unwrap();
        store.finish_slice(&task_id, nerve_domain::slice::SliceStatus::WaitingUser, 0, None).unwrap();

        let effects = StepEffects {
            slice_requests: vec![SliceRequest::Resume { task_id, version: 1 }],
            ..Default::default()
        };
        let outcome = store.fsm_step(&record("idle"), &effects, None).unwrap();
        assert_eq!(outcome.resumed_tasks, vec![task_id]);
        let task = store.get_slice_task(&task_id).unwrap().unwrap();
        assert_eq!(task.status, nerve_domain::slice::SliceStatus::Queued);
    }
}
