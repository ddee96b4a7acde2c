use rusqlite::Connection;

use nerve_domain::error::Result;

use crate::db_err;

// Schema version (increment when changing table definitions).
pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(db_err)?;
    if current == SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch(
        r#"
        -- FSM catalog
        CREATE TABLE IF NOT EXISTS fsm_states (
            id INTEGER PRIMARY KEY,
            key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            is_terminal INTEGER NOT NULL DEFAULT 0,
            is_enabled INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS fsm_signals (
            id INTEGER PRIMARY KEY,
            key TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS fsm_transitions (
            id INTEGER PRIMARY KEY,
            state_id INTEGER REFERENCES fsm_states(id),
            signal_id INTEGER NOT NULL REFERENCES fsm_signals(id),
            next_state_id INTEGER REFERENCES fsm_states(id),
            priority INTEGER NOT NULL DEFAULT 100,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            guard_key TEXT,
            action_key TEXT,
            match_any_state INTEGER NOT NULL DEFAULT 0
        );

        -- Process-wide runtime markers (current state lives here)
        CREATE TABLE IF NOT EXISTS fsm_runtime (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fsm_trace (
            id INTEGER PRIMARY KEY,
            ts TEXT NOT NULL,
            correlation_id TEXT NOT NULL,
            state_before TEXT NOT NULL,
            signal_type TEXT NOT NULL,
            transition_id INTEGER,
            action_key TEXT,
            state_after TEXT NOT NULL,
            result TEXT NOT NULL,
            error_summary TEXT
        );

        -- Durable signal queue
        CREATE TABLE IF NOT EXISTS signal_queue (
            id TEXT PRIMARY KEY,
            signal_type TEXT NOT NULL,
            source TEXT NOT NULL,
            payload TEXT NOT NULL,
            correlation_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            error TEXT,
            claimed_at TEXT
        );

        -- Timed signals
        CREATE TABLE IF NOT EXISTS timed_signals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trigger_at TEXT NOT NULL,
            next_trigger_at TEXT,
            rrule TEXT,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            status TEXT NOT NULL DEFAULT 'pending',
            fired_at TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            signal_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            target TEXT,
            origin TEXT NOT NULL,
            correlation_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            claimed_at TEXT,
            worker_id TEXT
        );

        -- Plan registry and instances
        CREATE TABLE IF NOT EXISTS plan_kind_versions (
            plan_kind TEXT NOT NULL,
            plan_version INTEGER NOT NULL,
            schema_json TEXT NOT NULL,
            example_json TEXT,
            executor_key TEXT NOT NULL,
            is_deprecated INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (plan_kind, plan_version)
        );

        CREATE TABLE IF NOT EXISTS plan_instances (
            plan_id TEXT PRIMARY KEY,
            plan_kind TEXT NOT NULL,
            plan_version INTEGER NOT NULL,
            correlation_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            payload TEXT NOT NULL,
            actor TEXT NOT NULL,
            source_channel TEXT NOT NULL,
            intent_confidence REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            error TEXT
        );

        CREATE TABLE IF NOT EXISTS plan_runs (
            run_id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL REFERENCES plan_instances(plan_id),
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            state_json TEXT,
            scheduled_json TEXT,
            resolution TEXT
        );

        -- Cooperative slice tasks
        CREATE TABLE IF NOT EXISTS pdca_tasks (
            task_id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            conversation_key TEXT NOT NULL,
            session_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            priority INTEGER NOT NULL DEFAULT 0,
            next_run_at TEXT NOT NULL,
            lease_until TEXT,
            worker_id TEXT,
            slice_cycles INTEGER NOT NULL,
            max_cycles INTEGER NOT NULL,
            max_runtime_seconds INTEGER NOT NULL,
            token_budget_remaining INTEGER NOT NULL,
            failure_streak INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            correlation_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pdca_checkpoints (
            task_id TEXT PRIMARY KEY REFERENCES pdca_tasks(task_id),
            state_json TEXT NOT NULL,
            task_state_json TEXT NOT NULL,
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pdca_events (
            id INTEGER PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES pdca_tasks(task_id),
            ts TEXT NOT NULL,
            event TEXT NOT NULL,
            detail TEXT
        );

        -- Principals and preferences
        CREATE TABLE IF NOT EXISTS principals (
            user_id TEXT PRIMARY KEY,
            name TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS preferences (
            user_id TEXT NOT NULL REFERENCES principals(user_id),
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (user_id, key)
        );

        -- Observability
        CREATE TABLE IF NOT EXISTS obs_events (
            id INTEGER PRIMARY KEY,
            ts TEXT NOT NULL,
            level TEXT NOT NULL,
            event TEXT NOT NULL,
            correlation_id TEXT NOT NULL,
            channel TEXT,
            user_id TEXT,
            node TEXT,
            cycle INTEGER,
            status TEXT,
            tool TEXT,
            error_code TEXT,
            latency_ms INTEGER,
            detail TEXT
        );

        CREATE TABLE IF NOT EXISTS obs_rollup (
            day TEXT NOT NULL,
            event TEXT NOT NULL,
            level TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (day, event, level)
        );

        CREATE INDEX IF NOT EXISTS idx_transitions_signal ON fsm_transitions(signal_id, is_enabled);
        CREATE INDEX IF NOT EXISTS idx_queue_status ON signal_queue(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_timed_due ON timed_signals(status, trigger_at);
        CREATE INDEX IF NOT EXISTS idx_plans_status ON plan_instances(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_runnable ON pdca_tasks(status, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_obs_corr ON obs_events(correlation_id);
        CREATE INDEX IF NOT EXISTS idx_obs_ts ON obs_events(ts);
        CREATE INDEX IF NOT EXISTS idx_fsm_trace_corr ON fsm_trace(correlation_id);
        "#,
    )
    .map_err(db_err)?;

    conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])
        .map_err(db_err)?;
    Ok(())
}
