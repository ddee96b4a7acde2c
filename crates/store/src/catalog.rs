//! FSM catalog repository: states, signals, transitions, and the
//! process-wide current-state marker.

use rusqlite::{params, Connection, OptionalExtension};

use nerve_domain::error::{Error, Result};
use nerve_domain::signal::types;

use crate::{db_err, Store};

pub const DEFAULT_ERROR_STATE: &str = "error";
pub const DEFAULT_SHUTDOWN_STATE: &str = "shutting_down";

const CURRENT_STATE_KEY: &str = "current_state";

/// One resolvable transition, ordered per the resolution rules: explicit
/// source before wildcard, then priority ascending, then id ascending.
#[derive(Debug, Clone)]
pub struct TransitionCandidate {
    pub id: i64,
    /// `None` means "stay in the current state".
    pub next_state_key: Option<String>,
    pub next_state_terminal: bool,
    pub guard_key: Option<String>,
    pub action_key: Option<String>,
    pub match_any_state: bool,
    pub priority: i64,
}

impl Store {
    // ── Current state marker ────────────────────────────────────────

    pub fn current_state(&self) -> Result<String> {
        self.with_conn(|conn| current_state_tx(conn))
    }

    pub fn set_current_state(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| set_current_state_tx(conn, key))
    }

    // ── Catalog queries ─────────────────────────────────────────────

    /// All transition candidates for `(state, signal)`, in resolution order.
    /// Candidates whose target state is disabled are skipped as if absent.
    pub fn resolve_transitions(&self, state_key: &str, signal_key: &str) -> Result<Vec<TransitionCandidate>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT t.id, ns.key, COALESCE(ns.is_terminal, 0), COALESCE(ns.is_enabled, 1),
                           t.guard_key, t.action_key, t.match_any_state, t.priority
                    FROM fsm_transitions t
                    JOIN fsm_signals s ON s.id = t.signal_id
                    LEFT JOIN fsm_states ns ON ns.id = t.next_state_id
                    WHERE s.key = ?1
                      AND t.is_enabled = 1
                      AND (t.match_any_state = 1
                           OR t.state_id = (SELECT id FROM fsm_states WHERE key = ?2))
                    ORDER BY t.match_any_state ASC, t.priority ASC, t.id ASC
                    "#,
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![signal_key, state_key], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            Ok(rows
                .into_iter()
                .filter(|(_, _, _, next_enabled, ..)| *next_enabled)
                .map(|(id, next_state_key, next_state_terminal, _, guard_key, action_key, match_any_state, priority)| {
                    TransitionCandidate {
                        id,
                        next_state_key,
                        next_state_terminal,
                        guard_key,
                        action_key,
                        match_any_state,
                        priority,
                    }
                })
                .collect())
        })
    }

    pub fn state_is_terminal(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT is_terminal FROM fsm_states WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::Validation(format!("unknown state: {key}")))
        })
    }

    pub fn catalog_counts(&self) -> Result<(i64, i64, i64)> {
        self.with_conn(|conn| {
            let states: i64 = conn
                .query_row("SELECT COUNT(*) FROM fsm_states", [], |row| row.get(0))
                .map_err(db_err)?;
            let signals: i64 = conn
                .query_row("SELECT COUNT(*) FROM fsm_signals", [], |row| row.get(0))
                .map_err(db_err)?;
            let transitions: i64 = conn
                .query_row("SELECT COUNT(*) FROM fsm_transitions", [], |row| row.get(0))
                .map_err(db_err)?;
            Ok((states, signals, transitions))
        })
    }

    /// Every handler key the catalog references must exist in the in-code
    /// registries. Unknown keys are a boot-time validation error.
    pub fn validate_handler_keys(&self, actions: &[&str], guards: &[&str]) -> Result<()> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT action_key, guard_key FROM fsm_transitions")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            let mut unknown = Vec::new();
            for (action_key, guard_key) in rows {
                if let Some(key) = action_key {
                    if !actions.contains(&key.as_str()) {
                        unknown.push(format!("action:{key}"));
                    }
                }
                if let Some(key) = guard_key {
                    if !guards.contains(&key.as_str()) {
                        unknown.push(format!("guard:{key}"));
                    }
                }
            }
            if unknown.is_empty() {
                Ok(())
            } else {
                unknown.sort();
                unknown.dedup();
                Err(Error::Validation(format!("catalog references unknown handlers: {}", unknown.join(", "))))
            }
        })
    }

    // ── Seeding ─────────────────────────────────────────────────────

    /// Install the default catalog if the store is empty, and set the boot
    /// state marker. Idempotent across restarts.
    pub fn seed_default_catalog(&self, initial_state: &str) -> Result<()> {
        self.with_tx(|conn| {
            let states: i64 = conn
                .query_row("SELECT COUNT(*) FROM fsm_states", [], |row| row.get(0))
                .map_err(db_err)?;
            if states == 0 {
                seed_states(conn, initial_state)?;
                seed_signals(conn)?;
                seed_transitions(conn, initial_state)?;
            }
            if current_state_opt_tx(conn)?.is_none() {
                set_current_state_tx(conn, initial_state)?;
            }
            Ok(())
        })
    }
}

pub(crate) fn current_state_tx(conn: &Connection) -> Result<String> {
    current_state_opt_tx(conn)?.ok_or_else(|| Error::Storage("current state marker missing".into()))
}

fn current_state_opt_tx(conn: &Connection) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM fsm_runtime WHERE key = ?1",
        [CURRENT_STATE_KEY],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err)
}

pub(crate) fn set_current_state_tx(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO fsm_runtime (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = ?2",
        params![CURRENT_STATE_KEY, key],
    )
    .map_err(db_err)?;
    Ok(())
}

fn seed_states(conn: &Connection, initial_state: &str) -> Result<()> {
    let mut keys = vec![initial_state, DEFAULT_ERROR_STATE, DEFAULT_SHUTDOWN_STATE];
    keys.dedup();
    for key in keys {
        let terminal = key == DEFAULT_SHUTDOWN_STATE;
        conn.execute(
            "INSERT OR IGNORE INTO fsm_states (key, name, is_terminal, is_enabled) VALUES (?1, ?2, ?3, 1)",
            params![key, key, terminal],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

fn seed_signals(conn: &Connection) -> Result<()> {
    for key in types::ALL {
        conn.execute("INSERT OR IGNORE INTO fsm_signals (key) VALUES (?1)", [key]).map_err(db_err)?;
    }
    Ok(())
}

fn insert_transition(
    conn: &Connection,
    state: Option<&str>,
    signal: &str,
    next_state: Option<&str>,
    priority: i64,
    guard_key: Option<&str>,
    action_key: Option<&str>,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO fsm_transitions
            (state_id, signal_id, next_state_id, priority, is_enabled, guard_key, action_key, match_any_state)
        VALUES (
            (SELECT id FROM fsm_states WHERE key = ?1),
            (SELECT id FROM fsm_signals WHERE key = ?2),
            (SELECT id FROM fsm_states WHERE key = ?3),
            ?4, 1, ?5, ?6, ?7
        )
        "#,
        params![state, signal, next_state, priority, guard_key, action_key, state.is_none()],
    )
    .map_err(db_err)?;
    Ok(())
}

fn seed_transitions(conn: &Connection, initial: &str) -> Result<()> {
    // Always installed: shutdown from any state wins over everything.
    insert_transition(conn, None, types::SHUTDOWN_REQUESTED, Some(DEFAULT_SHUTDOWN_STATE), 0, None, Some("shutdown"))?;
    insert_transition(conn, None, types::ACTION_FAILED, Some(DEFAULT_ERROR_STATE), 10, None, Some("handle_action_failure"))?;

    for signal in [
        types::CLI_MESSAGE_RECEIVED,
        types::TELEGRAM_MESSAGE_RECEIVED,
        types::API_MESSAGE_RECEIVED,
    ] {
        insert_transition(conn, Some(initial), signal, Some(initial), 50, Some("has_text"), Some("handle_incoming_message"))?;
        // A user message pulls the agent out of the error state.
        insert_transition(conn, Some(DEFAULT_ERROR_STATE), signal, Some(initial), 50, Some("has_text"), Some("handle_incoming_message"))?;
    }

    for signal in [types::TIMER_FIRED, types::TIMED_SIGNAL_FIRED] {
        insert_transition(conn, Some(initial), signal, Some(initial), 50, None, Some("handle_timer_fired"))?;
    }

    // Status and listing work from any state without moving it.
    insert_transition(conn, None, types::API_STATUS_REQUESTED, None, 50, None, Some("handle_status"))?;
    insert_transition(conn, None, types::API_TIMED_SIGNALS_REQUESTED, None, 50, None, Some("handle_timed_signals"))?;
    insert_transition(conn, None, types::PDCA_RESUME_REQUESTED, None, 50, None, Some("handle_resume"))?;
    Ok(())
}
