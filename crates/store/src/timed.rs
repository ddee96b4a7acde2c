//! Timed signal repository: durable one-shot and recurring schedules.
//!
//! A single scheduler claims rows via a conditional update from `pending` to
//! `processing` carrying its worker id; stale claims are reclaimed after the
//! lease expires.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use nerve_domain::action::TimedSignalRequest;
use nerve_domain::error::Result;
use nerve_domain::timed::{TimedSignal, TimedStatus};

use crate::{db_err, fmt_ts, parse_ts, Store};

const TIMED_COLUMNS: &str = "id, trigger_at, next_trigger_at, rrule, timezone, status, fired_at, \
                             attempts, last_error, signal_type, payload, target, origin, correlation_id, created_at";

/// Raw column values, parsed into domain types outside rusqlite's error type.
struct RawTimed {
    id: i64,
    trigger_at: String,
    next_trigger_at: Option<String>,
    rrule: Option<String>,
    timezone: String,
    status: String,
    fired_at: Option<String>,
    attempts: i64,
    last_error: Option<String>,
    signal_type: String,
    payload: String,
    target: Option<String>,
    origin: String,
    correlation_id: String,
    created_at: String,
}

fn raw_timed(row: &Row<'_>) -> rusqlite::Result<RawTimed> {
    Ok(RawTimed {
        id: row.get(0)?,
        trigger_at: row.get(1)?,
        next_trigger_at: row.get(2)?,
        rrule: row.get(3)?,
        timezone: row.get(4)?,
        status: row.get(5)?,
        fired_at: row.get(6)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        signal_type: row.get(9)?,
        payload: row.get(10)?,
        target: row.get(11)?,
        origin: row.get(12)?,
        correlation_id: row.get(13)?,
        created_at: row.get(14)?,
    })
}

impl RawTimed {
    fn into_timed(self) -> Result<TimedSignal> {
        Ok(TimedSignal {
            id: self.id,
            trigger_at: parse_ts(&self.trigger_at)?,
            next_trigger_at: self.next_trigger_at.as_deref().map(parse_ts).transpose()?,
            rrule: self.rrule,
            timezone: self.timezone,
            status: TimedStatus::parse(&self.status).ok_or_else(|| {
                nerve_domain::error::Error::Storage(format!("bad timed status {:?}", self.status))
            })?,
            fired_at: self.fired_at.as_deref().map(parse_ts).transpose()?,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            signal_type: self.signal_type,
            payload: serde_json::from_str(&self.payload)?,
            target: self.target,
            origin: self.origin,
            correlation_id: self.correlation_id,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn query_timed(conn: &Connection, where_clause: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<TimedSignal>> {
    let sql = format!("SELECT {TIMED_COLUMNS} FROM timed_signals {where_clause}");
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params, raw_timed)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    rows.into_iter().map(RawTimed::into_timed).collect()
}

impl Store {
    pub fn insert_timed_signal(&self, req: &TimedSignalRequest) -> Result<i64> {
        self.with_conn(|conn| insert_timed_tx(conn, req))
    }

    pub fn get_timed_signal(&self, id: i64) -> Result<Option<TimedSignal>> {
        self.with_conn(|conn| {
            let mut rows = query_timed(conn, "WHERE id = ?1", &[&id])?;
            Ok(rows.pop())
        })
    }

    /// Claim every due pending row for dispatch. The conditional update means
    /// a row is handed to exactly one claimer even across processes.
    pub fn claim_due_timed(&self, now: &DateTime<Utc>, worker_id: &str) -> Result<Vec<TimedSignal>> {
        self.with_tx(|conn| {
            let due = query_timed(
                conn,
                "WHERE status = 'pending' AND trigger_at <= ?1 ORDER BY trigger_at ASC",
                &[&fmt_ts(now)],
            )?;
            let mut claimed = Vec::with_capacity(due.len());
            for ts in due {
                let updated = conn
                    .execute(
                        "UPDATE timed_signals
                         SET status = 'processing', worker_id = ?2, claimed_at = ?3, attempts = attempts + 1
                         WHERE id = ?1 AND status = 'pending'",
                        params![ts.id, worker_id, fmt_ts(now)],
                    )
                    .map_err(db_err)?;
                if updated > 0 {
                    let mut ts = ts;
                    ts.status = TimedStatus::Processing;
                    ts.attempts += 1;
                    claimed.push(ts);
                }
            }
            Ok(claimed)
        })
    }

    pub fn mark_timed_fired(&self, id: i64, fired_at: &DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE timed_signals SET status = 'fired', fired_at = ?2 WHERE id = ?1",
                params![id, fmt_ts(fired_at)],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn mark_timed_failed(&self, id: i64, error: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE timed_signals SET status = 'failed', last_error = ?2 WHERE id = ?1",
                params![id, error],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn mark_timed_skipped(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE timed_signals SET status = 'skipped' WHERE id = ?1", [id])
                .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn cancel_timed(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn
                .execute(
                    "UPDATE timed_signals SET status = 'cancelled' WHERE id = ?1 AND status = 'pending'",
                    [id],
                )
                .map_err(db_err)?;
            Ok(updated > 0)
        })
    }

    /// Insert the next occurrence of a recurring row. The fired row keeps its
    /// terminal status as history; `next_trigger_at` links to the follow-up.
    pub fn schedule_next_occurrence(&self, fired: &TimedSignal, next_at: &DateTime<Utc>) -> Result<i64> {
        self.with_tx(|conn| {
            let req = TimedSignalRequest {
                signal_type: fired.signal_type.clone(),
                trigger_at: *next_at,
                rrule: fired.rrule.clone(),
                timezone: fired.timezone.clone(),
                payload: fired.payload.clone(),
                target: fired.target.clone(),
                origin: fired.origin.clone(),
                correlation_id: fired.correlation_id.clone(),
            };
            let new_id = insert_timed_tx(conn, &req)?;
            conn.execute(
                "UPDATE timed_signals SET next_trigger_at = ?2 WHERE id = ?1",
                params![fired.id, fmt_ts(next_at)],
            )
            .map_err(db_err)?;
            Ok(new_id)
        })
    }

    /// Return stale `processing` rows to `pending` (crash recovery).
    pub fn reclaim_stale_timed(&self, cutoff: &DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE timed_signals
                 SET status = 'pending', worker_id = NULL, claimed_at = NULL
                 WHERE status = 'processing' AND claimed_at < ?1",
                [fmt_ts(cutoff)],
            )
            .map_err(db_err)
        })
    }

    pub fn list_pending_timed(&self, limit: usize) -> Result<Vec<TimedSignal>> {
        self.with_conn(|conn| {
            query_timed(
                conn,
                "WHERE status = 'pending' ORDER BY trigger_at ASC LIMIT ?1",
                &[&(limit as i64)],
            )
        })
    }

    pub fn count_timed_by_status(&self, status: TimedStatus) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM timed_signals WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
    }
}

pub(crate) fn insert_timed_tx(conn: &Connection, req: &TimedSignalRequest) -> Result<i64> {
    conn.execute(
        "INSERT INTO timed_signals
            (trigger_at, rrule, timezone, status, attempts, signal_type, payload, target, origin, correlation_id, created_at)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            fmt_ts(&req.trigger_at),
            req.rrule,
            req.timezone,
            req.signal_type,
            req.payload.to_string(),
            req.target,
            req.origin,
            req.correlation_id,
            fmt_ts(&Utc::now()),
        ],
    )
    .map_err(db_err)?;
    Ok(conn.last_insert_rowid())
}
