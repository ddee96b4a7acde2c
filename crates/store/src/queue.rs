//! Durable signal queue: at-least-once ingestion, idempotent on signal id.

use rusqlite::{params, Connection};
use uuid::Uuid;

use nerve_domain::error::Result;
use nerve_domain::signal::{Signal, SignalStatus};

use crate::{db_err, fmt_ts, parse_ts, Store};

impl Store {
    /// Idempotent enqueue. Returns `true` when the signal was newly queued,
    /// `false` when a row with the same id already existed.
    pub fn enqueue_signal(&self, signal: &Signal) -> Result<bool> {
        self.with_conn(|conn| enqueue_signal_tx(conn, signal))
    }

    /// Atomically claim up to `max_n` queued signals, oldest first.
    pub fn claim_signals(&self, max_n: usize) -> Result<Vec<Signal>> {
        self.with_tx(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, signal_type, source, payload, correlation_id, created_at
                     FROM signal_queue
                     WHERE status = 'queued'
                     ORDER BY created_at ASC, id ASC
                     LIMIT ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([max_n as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            let now = fmt_ts(&chrono::Utc::now());
            let mut signals = Vec::with_capacity(rows.len());
            for (id, signal_type, source, payload, correlation_id, created_at) in rows {
                let updated = conn
                    .execute(
                        "UPDATE signal_queue SET status = 'processing', claimed_at = ?2
                         WHERE id = ?1 AND status = 'queued'",
                        params![id, now],
                    )
                    .map_err(db_err)?;
                if updated == 0 {
                    continue;
                }
                signals.push(Signal {
                    id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                    signal_type,
                    source,
                    payload: serde_json::from_str(&payload)?,
                    correlation_id,
                    created_at: parse_ts(&created_at)?,
                    durable: true,
                });
            }
            Ok(signals)
        })
    }

    /// Mark a claimed signal terminal.
    pub fn complete_signal(&self, signal_id: &Uuid, ok: bool, error: Option<&str>) -> Result<()> {
        self.with_conn(|conn| complete_signal_tx(conn, signal_id, ok, error))
    }

    pub fn signal_status(&self, signal_id: &Uuid) -> Result<Option<SignalStatus>> {
        self.with_conn(|conn| {
            use rusqlite::OptionalExtension;
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM signal_queue WHERE id = ?1",
                    [signal_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            Ok(status.and_then(|s| SignalStatus::parse(&s)))
        })
    }

    pub fn queue_depth(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM signal_queue WHERE status = 'queued'",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
    }

    /// Requeue `processing` rows claimed before `cutoff` (crash recovery).
    pub fn requeue_stale_signals(&self, cutoff: &chrono::DateTime<chrono::Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE signal_queue SET status = 'queued', claimed_at = NULL
                 WHERE status = 'processing' AND claimed_at < ?1",
                [fmt_ts(cutoff)],
            )
            .map_err(db_err)
        })
    }
}

pub(crate) fn enqueue_signal_tx(conn: &Connection, signal: &Signal) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO signal_queue
                (id, signal_type, source, payload, correlation_id, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued')",
            params![
                signal.id.to_string(),
                signal.signal_type,
                signal.source,
                signal.payload.to_string(),
                signal.correlation_id,
                fmt_ts(&signal.created_at),
            ],
        )
        .map_err(db_err)?;
    Ok(inserted > 0)
}

pub(crate) fn complete_signal_tx(conn: &Connection, signal_id: &Uuid, ok: bool, error: Option<&str>) -> Result<()> {
    let status = if ok { "done" } else { "failed" };
    conn.execute(
        "UPDATE signal_queue SET status = ?2, error = ?3 WHERE id = ?1",
        params![signal_id.to_string(), status, error],
    )
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerve_domain::signal::types;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn signal() -> Signal {
        Signal::new(types::CLI_MESSAGE_RECEIVED, "cli", serde_json::json!({"text": "hi"})).durable()
    }

    #[test]
    fn enqueue_is_idempotent_on_id() {
        let store = store();
        let sig = signal();
        assert!(store.enqueue_signal(&sig).unwrap());
        assert!(!store.enqueue_signal(&sig).unwrap(), "duplicate id must be ignored");
        assert_eq!(store.queue_depth().unwrap(), 1);
    }

    #[test]
    fn claim_moves_to_processing_and_preserves_payload() {
        let store = store();
        let sig = signal();
        store.enqueue_signal(&sig).unwrap();

        let claimed = store.claim_signals(10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, sig.id);
        assert_eq!(claimed[0].payload, sig.payload);
        assert!(claimed[0].durable);
        assert_eq!(store.signal_status(&sig.id).unwrap(), Some(SignalStatus::Processing));

        // Second claim finds nothing.
        assert!(store.claim_signals(10).unwrap().is_empty());
    }

    #[test]
    fn claim_respects_max_n_and_order() {
        let store = store();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut sig = signal();
            sig.created_at = chrono::Utc::now() + chrono::Duration::milliseconds(i);
            store.enqueue_signal(&sig).unwrap();
            ids.push(sig.id);
        }
        let first = store.claim_signals(2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, ids[0], "oldest first");
        let rest = store.claim_signals(10).unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn complete_marks_terminal() {
        let store = store();
        let sig = signal();
        store.enqueue_signal(&sig).unwrap();
        store.claim_signals(1).unwrap();

        store.complete_signal(&sig.id, true, None).unwrap();
        assert_eq!(store.signal_status(&sig.id).unwrap(), Some(SignalStatus::Done));

        let sig2 = signal();
        store.enqueue_signal(&sig2).unwrap();
        store.claim_signals(1).unwrap();
        store.complete_signal(&sig2.id, false, Some("boom")).unwrap();
        assert_eq!(store.signal_status(&sig2.id).unwrap(), Some(SignalStatus::Failed));
    }

    #[test]
    fn stale_processing_rows_requeue() {
        let store = store();
        let sig = signal();
        store.enqueue_signal(&sig).unwrap();
        store.claim_signals(1).unwrap();

        // A cutoff in the future makes the claim stale.
        let cutoff = chrono::Utc::now() + chrono::Duration::seconds(60);
        let requeued = store.requeue_stale_signals(&cutoff).unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(store.signal_status(&sig.id).unwrap(), Some(SignalStatus::Queued));
    }
}
