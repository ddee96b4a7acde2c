//! End-to-end kernel flows: senses to FSM to scheduler to extremities,
//! against a real on-disk-equivalent store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};

use nerve_domain::config::{FsmConfig, PublishMode, SchedulerConfig, SliceConfig};
use nerve_domain::message::OutboundMessage;
use nerve_domain::plan::PlanStatus;
use nerve_domain::render::FallbackRenderer;
use nerve_domain::signal::{types, Signal, SignalStatus};
use nerve_domain::timed::TimedStatus;
use nerve_gateway::bus::{Bus, SignalIngress};
use nerve_gateway::runtime::{
    register_builtin_kinds, ActionRegistry, ExecutorRegistry, FsmEngine, GuardRegistry, PlanWorker,
    ProgramRegistry, RuntimeContext, SliceWorker, TimedScheduler,
};
use nerve_gateway::senses::{CliSense, QueuePoller};
use nerve_store::Store;
use nerve_tools::{EchoTool, ToolRegistry};

struct Kernel {
    store: Arc<Store>,
    bus: Bus,
    ingress: SignalIngress,
    scheduler: TimedScheduler,
    plans: PlanWorker,
    shutdown: watch::Receiver<bool>,
    fsm: tokio::task::JoinHandle<()>,
}

fn kernel() -> Kernel {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store.seed_default_catalog("idle").unwrap();
    register_builtin_kinds(&store).unwrap();

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    let ctx = Arc::new(RuntimeContext::new(
        store.clone(),
        Arc::new(tools),
        Arc::new(FallbackRenderer),
        None,
    ));

    let (bus, fsm_rx) = Bus::new(64, PublishMode::Block);
    let ingress = SignalIngress::new(bus.clone(), store.clone());

    let (engine, shutdown) = FsmEngine::new(
        store.clone(),
        store.clone(),
        ctx.clone(),
        Arc::new(ActionRegistry::with_builtins()),
        Arc::new(GuardRegistry::with_builtins()),
        bus.clone(),
        FsmConfig::default(),
        &SliceConfig::default(),
    );
    let fsm = tokio::spawn(engine.run(fsm_rx));
    tokio::spawn(QueuePoller::new(store.clone(), bus.clone()).run(shutdown.clone()));

    let scheduler = TimedScheduler::new(store.clone(), store.clone(), SchedulerConfig::default());
    let plans = PlanWorker::new(
        store.clone(),
        store.clone(),
        bus.clone(),
        ctx,
        Arc::new(ExecutorRegistry::with_builtins()),
    );

    Kernel { store, bus, ingress, scheduler, plans, shutdown, fsm }
}

async fn recv_reply(rx: &mut broadcast::Receiver<OutboundMessage>, correlation_id: &str) -> OutboundMessage {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(msg) if msg.correlation_id == correlation_id => return msg,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("outbound channel closed"),
            }
        }
    })
    .await
    .expect("no reply within deadline")
}

// Scenario: shutdown from any state.
#[tokio::test]
async fn shutdown_halts_the_kernel() {
    let k = kernel();
    let sig = Signal::new(types::SHUTDOWN_REQUESTED, "test", serde_json::json!({})).with_correlation("SHUT");
    k.bus.publish(sig).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), k.fsm).await.unwrap().unwrap();
    assert_eq!(k.store.current_state().unwrap(), "shutting_down");
    assert!(!k.bus.is_accepting(), "bus refuses new publishes");
    assert!(*k.shutdown.borrow(), "workers observe shutdown");

    let trace = k.store.fsm_trace("SHUT").unwrap();
    assert_eq!(trace[0].2.as_deref(), Some("shutdown"));
}

// Scenario: text message routing end to end, correlation id preserved.
#[tokio::test]
async fn reminder_message_flows_to_timed_row_and_ack() {
    let k = kernel();
    let mut outbound = k.bus.subscribe_outbound();

    let signal = CliSense::signal_for_line("local", "remind me to water the plants in 1 minute");
    let correlation_id = signal.correlation_id.clone();
    k.ingress.submit(signal.clone()).await.unwrap();

    let ack = recv_reply(&mut outbound, &correlation_id).await;
    assert!(ack.message.contains("water the plants"));
    assert_eq!(ack.channel_type, "cli");

    // Durable signal consumed exactly once and marked done.
    assert_eq!(k.store.signal_status(&signal.id).unwrap(), Some(SignalStatus::Done));

    // One pending timed row about a minute out.
    let pending = k.store.list_pending_timed(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload["kind"], "create_reminder");
    assert_eq!(pending[0].correlation_id, correlation_id);
    let delta = (pending[0].trigger_at - Utc::now()).num_seconds();
    assert!((50..=70).contains(&delta), "expected ~60s, got {delta}");

    let trace = k.store.fsm_trace(&correlation_id).unwrap();
    assert_eq!(trace.len(), 1);
    assert_eq!(trace[0].2.as_deref(), Some("handle_incoming_message"));
    assert_eq!(k.store.current_state().unwrap(), "idle");
}

// Scenario: timed fire and dispatch, correlation follows the chain.
#[tokio::test]
async fn timed_row_fires_and_reminder_is_delivered() {
    let k = kernel();
    let mut outbound = k.bus.subscribe_outbound();

    // Create the reminder through the real inbound path.
    let signal = CliSense::signal_for_line("local", "remind me to water the plants in 1 second");
    let correlation_id = signal.correlation_id.clone();
    k.ingress.submit(signal).await.unwrap();
    let _ack = recv_reply(&mut outbound, &correlation_id).await;

    // Tick the scheduler after the trigger time.
    let row_id = k.store.list_pending_timed(1).unwrap()[0].id;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let stats = k.scheduler.tick(&Utc::now()).unwrap();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(k.store.get_timed_signal(row_id).unwrap().unwrap().status, TimedStatus::Fired);

    // The fired signal flows through the durable queue back into the FSM
    // and out as a reminder, still under the original correlation id.
    let reminder = recv_reply(&mut outbound, &correlation_id).await;
    assert_eq!(reminder.message, "Reminder: water the plants");
    assert_eq!(reminder.channel_target, "cli:local");
}

// Scenario: invalid plan payload fails validation, no side effects.
#[tokio::test]
async fn invalid_plan_payload_fails_closed() {
    let k = kernel();
    let mut outbound = k.bus.subscribe_outbound();

    let plan_id = k
        .store
        .insert_plan_instance(&nerve_domain::action::PlanRequest {
            plan_kind: "create_reminder".into(),
            plan_version: 1,
            payload: serde_json::json!({"target": {}}),
            actor: "u1".into(),
            source_channel: "cli".into(),
            intent_confidence: 0.4,
            correlation_id: "BAD-PLAN".into(),
        })
        .unwrap();
    assert_eq!(k.store.get_plan_instance(&plan_id).unwrap().unwrap().status, PlanStatus::Queued);

    k.plans.run_queued().await.unwrap();

    let plan = k.store.get_plan_instance(&plan_id).unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Failed);
    let error = plan.error.unwrap();
    assert!(error.contains("schema"), "structured error, got: {error}");
    assert_eq!(plan.payload, serde_json::json!({"target": {}}), "payload unchanged");

    assert!(k.store.list_pending_timed(10).unwrap().is_empty(), "no timed row created");

    let fallback = recv_reply(&mut outbound, "BAD-PLAN").await;
    assert!(!fallback.message.contains("schema"), "safe fallback only");
}

// Scenario: duplicate durable delivery collapses to one consumption.
#[tokio::test]
async fn duplicate_durable_signal_consumed_once() {
    let k = kernel();
    let mut outbound = k.bus.subscribe_outbound();

    let signal = CliSense::signal_for_line("local", "remind me to stretch in 2 minutes");
    let correlation_id = signal.correlation_id.clone();

    // Webhook-style duplicate: same signal id submitted twice.
    assert!(k.ingress.submit(signal.clone()).await.unwrap());
    assert!(
        !k.ingress.submit(signal.clone()).await.unwrap(),
        "second delivery must collapse onto the queued row"
    );

    let _ack = recv_reply(&mut outbound, &correlation_id).await;
    // Give the poller a moment to (not) deliver a second copy.
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(k.store.signal_status(&signal.id).unwrap(), Some(SignalStatus::Done));
    let trace = k.store.fsm_trace(&correlation_id).unwrap();
    assert_eq!(trace.len(), 1, "exactly one FSM invocation");
    assert_eq!(k.store.list_pending_timed(10).unwrap().len(), 1, "no duplicate reminder");
}

// Scenario: slice yield and resume across two users, fair interleaving.
#[tokio::test]
async fn slices_yield_interleave_and_resume() {
    let k = kernel();
    let mut outbound = k.bus.subscribe_outbound();

    let slice_config = SliceConfig::default();
    let ctx = Arc::new(RuntimeContext::new(
        k.store.clone(),
        Arc::new(ToolRegistry::new()),
        Arc::new(FallbackRenderer),
        None,
    ));
    let worker = SliceWorker::new(
        k.store.clone(),
        k.store.clone(),
        k.bus.clone(),
        ctx,
        Arc::new(ProgramRegistry::with_builtins()),
        slice_config.clone(),
        "slice-test".into(),
    );

    let defaults = nerve_store::SliceDefaults {
        slice_cycles: slice_config.default_cycles,
        max_cycles: slice_config.max_cycles,
        max_runtime_seconds: slice_config.max_runtime_seconds,
        token_budget: slice_config.token_budget,
    };
    let enqueue = |owner: &str, items: serde_json::Value| {
        k.store
            .enqueue_slice_task(
                &nerve_domain::action::SliceEnqueue {
                    owner_id: owner.into(),
                    conversation_key: format!("cli:{owner}"),
                    session_id: "s1".into(),
                    priority: 0,
                    task_state: serde_json::json!({
                        "program": "checklist",
                        "items": items,
                        "reply": {"channel_type": "cli", "channel_target": "cli:local"},
                    }),
                    correlation_id: format!("SLICE-{owner}"),
                },
                &defaults,
            )
            .unwrap()
    };
    let first = enqueue("alice", serde_json::json!(["a", "b", "c", "d"]));
    let second = enqueue("bob", serde_json::json!(["x"]));

    // Slice 1: alice works three cycles, checkpoints, yields.
    let now = Utc::now() + chrono::Duration::seconds(1);
    assert!(worker.work_once(now).await.unwrap());
    let cp = k.store.get_checkpoint(&first).unwrap().unwrap();
    assert_eq!(cp.version, 2);

    // Fairness: bob runs before alice's yield delay elapses.
    assert!(worker.work_once(now).await.unwrap());
    assert_eq!(
        k.store.get_slice_task(&second).unwrap().unwrap().status,
        nerve_domain::slice::SliceStatus::Done
    );

    // Alice resumes from the recorded checkpoint and completes.
    let later = now + chrono::Duration::seconds(slice_config.yield_delay_seconds as i64 + 1);
    assert!(worker.work_once(later).await.unwrap());
    assert_eq!(
        k.store.get_slice_task(&first).unwrap().unwrap().status,
        nerve_domain::slice::SliceStatus::Done
    );

    let final_msg = recv_reply(&mut outbound, "SLICE-alice").await;
    assert!(final_msg.message.contains("completed 4 steps"), "got: {}", final_msg.message);

    assert_eq!(
        k.store.slice_events(&first).unwrap(),
        vec!["slice.started", "slice.persisted", "slice.started", "slice.completed"]
    );
}

// Status requests answer synchronously and leave the state alone.
#[tokio::test]
async fn status_request_round_trip() {
    let k = kernel();
    let mut outbound = k.bus.subscribe_outbound();

    let sig = Signal::new(
        types::API_STATUS_REQUESTED,
        "api",
        serde_json::json!({"channel_type": "api", "channel_target": "api:test", "user_id": "api"}),
    )
    .with_correlation("STATUS-1");
    k.bus.publish(sig).await.unwrap();

    let reply = recv_reply(&mut outbound, "STATUS-1").await;
    assert!(reply.message.contains("State: idle"), "got: {}", reply.message);
    assert_eq!(k.store.current_state().unwrap(), "idle");
}
