//! Embedded relational store for the agent kernel.
//!
//! One SQLite file owns everything persistent: the FSM catalog, the durable
//! signal queue, timed signals, plan registry/instances/runs, slice tasks and
//! checkpoints, principals, and the observability tables. All repositories
//! are `impl Store` blocks over a single serialized connection; the FSM step
//! runs as one transaction via [`Store::fsm_step`].

mod catalog;
mod fsm_step;
mod observability;
mod plans;
mod principals;
mod queue;
mod schema;
mod slices;
mod timed;

pub use catalog::{TransitionCandidate, DEFAULT_ERROR_STATE, DEFAULT_SHUTDOWN_STATE};
pub use fsm_step::{FsmStepRecord, StepEffects, StepOutcome};
pub use plans::PlanKindRow;
pub use slices::SliceDefaults;

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use nerve_domain::error::{Error, Result};

/// Map a rusqlite error into the shared error type.
pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("bad timestamp {s:?}: {e}")))
}

// Fixed-width RFC3339 so lexicographic SQL comparisons match time order.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("open {}: {e}", db_path.display())))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\n\
             PRAGMA synchronous = NORMAL;\n\
             PRAGMA foreign_keys = ON;",
        )
        .map_err(db_err)?;
        let store = Self { conn: Mutex::new(conn) };
        store.with_conn(|conn| schema::init_schema(conn))?;
        Ok(store)
    }

    /// Run a closure against the serialized connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside a write transaction. Rolls back on error.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db_err)?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT").map_err(db_err)?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    pub fn schema_version(&self) -> Result<i32> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA user_version", [], |row| row.get(0)).map_err(db_err)
        })
    }
}
