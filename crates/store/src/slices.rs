//! Slice task repository: lease acquisition, versioned checkpoints, events.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use nerve_domain::action::SliceEnqueue;
use nerve_domain::error::{Error, Result};
use nerve_domain::slice::{Checkpoint, SliceStatus, SliceTask};

use crate::{db_err, fmt_ts, parse_ts, Store};

/// Budget defaults applied when a task is enqueued.
#[derive(Debug, Clone, Copy)]
pub struct SliceDefaults {
    pub slice_cycles: u32,
    pub max_cycles: u32,
    pub max_runtime_seconds: u64,
    pub token_budget: i64,
}

const TASK_COLUMNS: &str = "task_id, owner_id, conversation_key, session_id, status, priority, \
                            next_run_at, lease_until, worker_id, slice_cycles, max_cycles, \
                            max_runtime_seconds, token_budget_remaining, failure_streak, last_error, \
                            correlation_id, created_at, updated_at";

struct RawTask {
    task_id: String,
    owner_id: String,
    conversation_key: String,
    session_id: String,
    status: String,
    priority: i64,
    next_run_at: String,
    lease_until: Option<String>,
    worker_id: Option<String>,
    slice_cycles: i64,
    max_cycles: i64,
    max_runtime_seconds: i64,
    token_budget_remaining: i64,
    failure_streak: i64,
    last_error: Option<String>,
    correlation_id: String,
    created_at: String,
    updated_at: String,
}

fn raw_task(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        task_id: row.get(0)?,
        owner_id: row.get(1)?,
        conversation_key: row.get(2)?,
        session_id: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        next_run_at: row.get(6)?,
        lease_until: row.get(7)?,
        worker_id: row.get(8)?,
        slice_cycles: row.get(9)?,
        max_cycles: row.get(10)?,
        max_runtime_seconds: row.get(11)?,
        token_budget_remaining: row.get(12)?,
        failure_streak: row.get(13)?,
        last_error: row.get(14)?,
        correlation_id: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

impl RawTask {
    fn into_task(self) -> Result<SliceTask> {
        Ok(SliceTask {
            task_id: Uuid::parse_str(&self.task_id).map_err(|e| Error::Storage(format!("bad task id: {e}")))?,
            owner_id: self.owner_id,
            conversation_key: self.conversation_key,
            session_id: self.session_id,
            status: SliceStatus::parse(&self.status)
                .ok_or_else(|| Error::Storage(format!("bad slice status {:?}", self.status)))?,
            priority: self.priority as i32,
            next_run_at: parse_ts(&self.next_run_at)?,
            lease_until: self.lease_until.as_deref().map(parse_ts).transpose()?,
            worker_id: self.worker_id,
            slice_cycles: self.slice_cycles as u32,
            max_cycles: self.max_cycles as u32,
            max_runtime_seconds: self.max_runtime_seconds as u64,
            token_budget_remaining: self.token_budget_remaining,
            failure_streak: self.failure_streak as u32,
            last_error: self.last_error,
            correlation_id: self.correlation_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl Store {
    pub fn enqueue_slice_task(&self, req: &SliceEnqueue, defaults: &SliceDefaults) -> Result<Uuid> {
        self.with_tx(|conn| enqueue_slice_tx(conn, req, defaults))
    }

    pub fn get_slice_task(&self, task_id: &Uuid) -> Result<Option<SliceTask>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {TASK_COLUMNS} FROM pdca_tasks WHERE task_id = ?1");
            conn.query_row(&sql, [task_id.to_string()], raw_task)
                .optional()
                .map_err(db_err)?
                .map(RawTask::into_task)
                .transpose()
        })
    }

    /// Select the next runnable task and acquire its lease. Runnable means
    /// queued-and-due, or running with an expired lease (stolen). Selection
    /// order: priority DESC, next_run_at ASC, updated_at ASC.
    pub fn claim_next_slice(&self, worker_id: &str, now: &DateTime<Utc>, lease_ttl_seconds: u64) -> Result<Option<SliceTask>> {
        self.with_tx(|conn| {
            let now_s = fmt_ts(now);
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM pdca_tasks
                 WHERE (status = 'queued' AND next_run_at <= ?1)
                    OR (status = 'running' AND lease_until IS NOT NULL AND lease_until < ?1)
                 ORDER BY priority DESC, next_run_at ASC, updated_at ASC
                 LIMIT 1"
            );
            let candidate = conn
                .query_row(&sql, [&now_s], raw_task)
                .optional()
                .map_err(db_err)?
                .map(RawTask::into_task)
                .transpose()?;

            let Some(mut task) = candidate else { return Ok(None) };

            let lease_until = *now + chrono::Duration::seconds(lease_ttl_seconds as i64);
            let updated = conn
                .execute(
                    "UPDATE pdca_tasks
                     SET status = 'running', lease_until = ?2, worker_id = ?3, updated_at = ?4
                     WHERE task_id = ?1
                       AND ((status = 'queued' AND next_run_at <= ?4)
                            OR (status = 'running' AND lease_until < ?4))",
                    params![task.task_id.to_string(), fmt_ts(&lease_until), worker_id, now_s],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Ok(None);
            }
            task.status = SliceStatus::Running;
            task.lease_until = Some(lease_until);
            task.worker_id = Some(worker_id.to_string());
            Ok(Some(task))
        })
    }

    /// Release the lease and requeue for another slice.
    pub fn requeue_slice(
        &self,
        task_id: &Uuid,
        next_run_at: &DateTime<Utc>,
        token_spent: i64,
        failure_streak: u32,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pdca_tasks
                 SET status = 'queued', lease_until = NULL, worker_id = NULL,
                     next_run_at = ?2, token_budget_remaining = token_budget_remaining - ?3,
                     failure_streak = ?4, last_error = ?5, updated_at = ?6
                 WHERE task_id = ?1",
                params![
                    task_id.to_string(),
                    fmt_ts(next_run_at),
                    token_spent,
                    failure_streak,
                    last_error,
                    fmt_ts(&Utc::now()),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    /// Mark a task terminal or parked and release the lease.
    pub fn finish_slice(&self, task_id: &Uuid, status: SliceStatus, token_spent: i64, last_error: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pdca_tasks
                 SET status = ?2, lease_until = NULL, worker_id = NULL,
                     token_budget_remaining = token_budget_remaining - ?3,
                     last_error = ?4, updated_at = ?5
                 WHERE task_id = ?1",
                params![
                    task_id.to_string(),
                    status.as_str(),
                    token_spent,
                    last_error,
                    fmt_ts(&Utc::now()),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    pub fn get_checkpoint(&self, task_id: &Uuid) -> Result<Option<Checkpoint>> {
        self.with_conn(|conn| get_checkpoint_tx(conn, task_id))
    }

    /// Compare-and-swap checkpoint write. `expected_version = 0` means the
    /// first checkpoint; otherwise the stored version must match.
    pub fn save_checkpoint(
        &self,
        task_id: &Uuid,
        state_json: &serde_json::Value,
        task_state_json: &serde_json::Value,
        expected_version: i64,
    ) -> Result<i64> {
        self.with_tx(|conn| {
            let new_version = expected_version + 1;
            let affected = if expected_version == 0 {
                conn.execute(
                    "INSERT INTO pdca_checkpoints (task_id, state_json, task_state_json, version)
                     VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT(task_id) DO NOTHING",
                    params![task_id.to_string(), state_json.to_string(), task_state_json.to_string()],
                )
                .map_err(db_err)?
            } else {
                conn.execute(
                    "UPDATE pdca_checkpoints
                     SET state_json = ?2, task_state_json = ?3, version = ?4
                     WHERE task_id = ?1 AND version = ?5",
                    params![
                        task_id.to_string(),
                        state_json.to_string(),
                        task_state_json.to_string(),
                        new_version,
                        expected_version,
                    ],
                )
                .map_err(db_err)?
            };
            if affected == 0 {
                return Err(Error::Conflict(format!(
                    "checkpoint version mismatch for task {task_id} (expected {expected_version})"
                )));
            }
            Ok(new_version)
        })
    }

    // ── Resume & events ─────────────────────────────────────────────

    /// Wake a parked task if the resume request is not stale: a checkpoint
    /// newer than the requested version means work already moved on.
    pub fn resume_slice(&self, task_id: &Uuid, version: i64, now: &DateTime<Utc>) -> Result<bool> {
        self.with_tx(|conn| resume_slice_tx(conn, task_id, version, now))
    }

    pub fn append_slice_event(&self, task_id: &Uuid, event: &str, detail: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pdca_events (task_id, ts, event, detail) VALUES (?1, ?2, ?3, ?4)",
                params![task_id.to_string(), fmt_ts(&Utc::now()), event, detail],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn slice_events(&self, task_id: &Uuid) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT event FROM pdca_events WHERE task_id = ?1 ORDER BY id ASC")
                .map_err(db_err)?;
            let events = stmt
                .query_map([task_id.to_string()], |row| row.get(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(events)
        })
    }

    pub fn count_slices_by_status(&self, status: SliceStatus) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM pdca_tasks WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
    }
}

pub(crate) fn enqueue_slice_tx(conn: &Connection, req: &SliceEnqueue, defaults: &SliceDefaults) -> Result<Uuid> {
    let task_id = Uuid::new_v4();
    let now = fmt_ts(&Utc::now());
    conn.execute(
        "INSERT INTO pdca_tasks
            (task_id, owner_id, conversation_key, session_id, status, priority, next_run_at,
             slice_cycles, max_cycles, max_runtime_seconds, token_budget_remaining,
             failure_streak, correlation_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?6, ?6)",
        params![
            task_id.to_string(),
            req.owner_id,
            req.conversation_key,
            req.session_id,
            req.priority,
            now,
            defaults.slice_cycles,
            defaults.max_cycles,
            defaults.max_runtime_seconds as i64,
            defaults.token_budget,
            req.correlation_id,
        ],
    )
    .map_err(db_err)?;
    // The initial task state is checkpoint version 0 territory: store it as
    // the program's starting state so rehydration always has something.
    conn.execute(
        "INSERT INTO pdca_checkpoints (task_id, state_json, task_state_json, version)
         VALUES (?1, '{}', ?2, 1)",
        params![task_id.to_string(), req.task_state.to_string()],
    )
    .map_err(db_err)?;
    Ok(task_id)
}

pub(crate) fn get_checkpoint_tx(conn: &Connection, task_id: &Uuid) -> Result<Option<Checkpoint>> {
    conn.query_row(
        "SELECT state_json, task_state_json, version FROM pdca_checkpoints WHERE task_id = ?1",
        [task_id.to_string()],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        },
    )
    .optional()
    .map_err(db_err)?
    .map(|(state, task_state, version)| {
        Ok(Checkpoint {
            task_id: *task_id,
            state_json: serde_json::from_str(&state)?,
            task_state_json: serde_json::from_str(&task_state)?,
            version,
        })
    })
    .transpose()
}

pub(crate) fn resume_slice_tx(conn: &Connection, task_id: &Uuid, version: i64, now: &DateTime<Utc>) -> Result<bool> {
    let checkpoint = get_checkpoint_tx(conn, task_id)?;
    if let Some(cp) = checkpoint {
        if cp.version > version {
            return Ok(false); // stale resume
        }
    }
    let updated = conn
        .execute(
            "UPDATE pdca_tasks
             SET status = 'queued', next_run_at = ?2, updated_at = ?2
             WHERE task_id = ?1 AND status IN ('waiting_user', 'paused')",
            params![task_id.to_string(), fmt_ts(now)],
        )
        .map_err(db_err)?;
    Ok(updated > 0)
}
