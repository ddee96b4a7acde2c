//! Observability repository: append-only events, daily rollups, retention.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};

use nerve_domain::error::Result;
use nerve_domain::trace::{Level, ObsEvent};

use crate::{db_err, fmt_ts, parse_ts, Store};

fn raw_event(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, Option<String>, Option<String>, Option<String>, Option<i64>, Option<String>, Option<String>, Option<String>, Option<i64>, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

const EVENT_COLUMNS: &str =
    "ts, level, event, correlation_id, channel, user_id, node, cycle, status, tool, error_code, latency_ms, detail";

fn build_event(
    raw: (String, String, String, String, Option<String>, Option<String>, Option<String>, Option<i64>, Option<String>, Option<String>, Option<String>, Option<i64>, Option<String>),
) -> Result<ObsEvent> {
    let (ts, level, event, correlation_id, channel, user_id, node, cycle, status, tool, error_code, latency_ms, detail) = raw;
    Ok(ObsEvent {
        ts: parse_ts(&ts)?,
        level: Level::parse(&level).unwrap_or(Level::Info),
        event,
        correlation_id,
        channel,
        user_id,
        node,
        cycle,
        status,
        tool,
        error_code,
        latency_ms,
        detail,
    })
}

impl Store {
    /// Persist one event and bump the matching daily rollup counter.
    pub fn record_event(&self, ev: &ObsEvent) -> Result<()> {
        self.with_tx(|conn| {
            conn.execute(
                "INSERT INTO obs_events
                    (ts, level, event, correlation_id, channel, user_id, node, cycle, status, tool, error_code, latency_ms, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    fmt_ts(&ev.ts),
                    ev.level.as_str(),
                    ev.event,
                    ev.correlation_id,
                    ev.channel,
                    ev.user_id,
                    ev.node,
                    ev.cycle,
                    ev.status,
                    ev.tool,
                    ev.error_code,
                    ev.latency_ms,
                    ev.detail,
                ],
            )
            .map_err(db_err)?;
            conn.execute(
                "INSERT INTO obs_rollup (day, event, level, count) VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(day, event, level) DO UPDATE SET count = count + 1",
                params![ev.ts.format("%Y-%m-%d").to_string(), ev.event, ev.level.as_str()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn events_by_correlation(&self, correlation_id: &str) -> Result<Vec<ObsEvent>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM obs_events WHERE correlation_id = ?1 ORDER BY id ASC"
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map([correlation_id], raw_event)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows.into_iter().map(build_event).collect()
        })
    }

    pub fn rollup_count(&self, day: &str, event: &str, level: Level) -> Result<i64> {
        self.with_conn(|conn| {
            use rusqlite::OptionalExtension;
            Ok(conn
                .query_row(
                    "SELECT count FROM obs_rollup WHERE day = ?1 AND event = ?2 AND level = ?3",
                    params![day, event, level.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
                .unwrap_or(0))
        })
    }

    pub fn event_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM obs_events", [], |row| row.get(0)).map_err(db_err)
        })
    }

    /// Apply retention: per-severity TTLs, then the global row cap pruning
    /// oldest first. Returns the number of rows deleted.
    pub fn prune_events(
        &self,
        now: &DateTime<Utc>,
        non_error_ttl_days: u32,
        error_ttl_days: u32,
        max_rows: u64,
    ) -> Result<usize> {
        self.with_tx(|conn| {
            let non_error_cutoff = fmt_ts(&(*now - Duration::days(non_error_ttl_days as i64)));
            let error_cutoff = fmt_ts(&(*now - Duration::days(error_ttl_days as i64)));

            let mut deleted = conn
                .execute(
                    "DELETE FROM obs_events WHERE level != 'error' AND ts < ?1",
                    [&non_error_cutoff],
                )
                .map_err(db_err)?;
            deleted += conn
                .execute(
                    "DELETE FROM obs_events WHERE level = 'error' AND ts < ?1",
                    [&error_cutoff],
                )
                .map_err(db_err)?;

            let total: i64 = conn
                .query_row("SELECT COUNT(*) FROM obs_events", [], |row| row.get(0))
                .map_err(db_err)?;
            let excess = total - max_rows as i64;
            if excess > 0 {
                deleted += conn
                    .execute(
                        "DELETE FROM obs_events WHERE id IN
                            (SELECT id FROM obs_events ORDER BY id ASC LIMIT ?1)",
                        [excess],
                    )
                    .map_err(db_err)?;
            }
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nerve_domain::trace::events;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn record_and_read_by_correlation() {
        let store = store();
        store
            .record_event(&ObsEvent::info(events::FSM_TRANSITION, "C1").with_node("idle").with_status("done"))
            .unwrap();
        store.record_event(&ObsEvent::info(events::DELIVERY_RECEIPT, "C1").with_channel("cli")).unwrap();
        store.record_event(&ObsEvent::info(events::FSM_TRANSITION, "C2")).unwrap();

        let chain = store.events_by_correlation("C1").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].event, "fsm.transition");
        assert_eq!(chain[1].event, "delivery_receipt");
        assert_eq!(chain[1].channel.as_deref(), Some("cli"));
    }

    #[test]
    fn rollup_counts_per_day_event_level() {
        let store = store();
        let ev = ObsEvent::info(events::FSM_TRANSITION, "C1");
        let day = ev.ts.format("%Y-%m-%d").to_string();
        store.record_event(&ev).unwrap();
        store.record_event(&ObsEvent::info(events::FSM_TRANSITION, "C2")).unwrap();
        store.record_event(&ObsEvent::error(events::SIGNAL_FAILED, "C3")).unwrap();

        assert_eq!(store.rollup_count(&day, events::FSM_TRANSITION, Level::Info).unwrap(), 2);
        assert_eq!(store.rollup_count(&day, events::SIGNAL_FAILED, Level::Error).unwrap(), 1);
        assert_eq!(store.rollup_count(&day, events::SIGNAL_FAILED, Level::Info).unwrap(), 0);
    }

    #[test]
    fn prune_applies_ttls_per_severity() {
        let store = store();
        let now = Utc::now();

        let mut old_info = ObsEvent::info(events::FSM_TRANSITION, "C1");
        old_info.ts = now - Duration::days(20);
        let mut old_error = ObsEvent::error(events::SIGNAL_FAILED, "C2");
        old_error.ts = now - Duration::days(20);
        let mut ancient_error = ObsEvent::error(events::SIGNAL_FAILED, "C3");
        ancient_error.ts = now - Duration::days(40);

        store.record_event(&old_info).unwrap();
        store.record_event(&old_error).unwrap();
        store.record_event(&ancient_error).unwrap();
        store.record_event(&ObsEvent::info(events::FSM_TRANSITION, "C4")).unwrap();

        // 14d non-error TTL drops the old info; 30d error TTL drops only the
        // ancient error.
        let deleted = store.prune_events(&now, 14, 30, 1_000_000).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.event_count().unwrap(), 2);
    }

    #[test]
    fn prune_enforces_row_cap_oldest_first() {
        let store = store();
        let now = Utc::now();
        for i in 0..10 {
            let mut ev = ObsEvent::info(events::FSM_TRANSITION, format!("C{i}"));
            ev.ts = now - Duration::seconds(100 - i);
            store.record_event(&ev).unwrap();
        }
        let deleted = store.prune_events(&now, 14, 30, 4).unwrap();
        assert_eq!(deleted, 6);
        assert_eq!(store.event_count().unwrap(), 4);
        // Newest correlations survive.
        assert_eq!(store.events_by_correlation("C9").unwrap().len(), 1);
        assert!(store.events_by_correlation("C0").unwrap().is_empty());
    }
}
