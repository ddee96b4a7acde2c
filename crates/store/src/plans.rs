//! Plan registry rows, instances, and runs.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use nerve_domain::action::PlanRequest;
use nerve_domain::error::{Error, Result};
use nerve_domain::plan::{PlanInstance, PlanStatus};

use crate::{db_err, fmt_ts, parse_ts, Store};

/// One registered `(kind, version)` entry.
#[derive(Debug, Clone)]
pub struct PlanKindRow {
    pub plan_kind: String,
    pub plan_version: u32,
    pub schema: serde_json::Value,
    pub example: Option<serde_json::Value>,
    pub executor_key: String,
    pub is_deprecated: bool,
}

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<(String, String, i64, String, String, String, String, String, f64, String, Option<String>)> {
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
    ))
}

const INSTANCE_COLUMNS: &str = "plan_id, plan_kind, plan_version, correlation_id, status, payload, \
                                actor, source_channel, intent_confidence, created_at, error";

fn build_instance(
    raw: (String, String, i64, String, String, String, String, String, f64, String, Option<String>),
) -> Result<PlanInstance> {
    let (plan_id, plan_kind, plan_version, correlation_id, status, payload, actor, source_channel, intent_confidence, created_at, error) = raw;
    Ok(PlanInstance {
        plan_id: Uuid::parse_str(&plan_id).map_err(|e| Error::Storage(format!("bad plan id: {e}")))?,
        plan_kind,
        plan_version: plan_version as u32,
        correlation_id,
        status: PlanStatus::parse(&status).ok_or_else(|| Error::Storage(format!("bad plan status {status:?}")))?,
        payload: serde_json::from_str(&payload)?,
        actor,
        source_channel,
        intent_confidence,
        created_at: parse_ts(&created_at)?,
        error,
    })
}

impl Store {
    // ── Registry ────────────────────────────────────────────────────

    pub fn register_plan_kind(&self, row: &PlanKindRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO plan_kind_versions
                    (plan_kind, plan_version, schema_json, example_json, executor_key, is_deprecated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(plan_kind, plan_version) DO UPDATE SET
                    schema_json = ?3, example_json = ?4, executor_key = ?5, is_deprecated = ?6",
                params![
                    row.plan_kind,
                    row.plan_version,
                    row.schema.to_string(),
                    row.example.as_ref().map(|v| v.to_string()),
                    row.executor_key,
                    row.is_deprecated,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn get_plan_kind(&self, plan_kind: &str, plan_version: u32) -> Result<Option<PlanKindRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT plan_kind, plan_version, schema_json, example_json, executor_key, is_deprecated
                 FROM plan_kind_versions WHERE plan_kind = ?1 AND plan_version = ?2",
                params![plan_kind, plan_version],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?
            .map(|(plan_kind, plan_version, schema, example, executor_key, is_deprecated)| {
                Ok(PlanKindRow {
                    plan_kind,
                    plan_version: plan_version as u32,
                    schema: serde_json::from_str(&schema)?,
                    example: example.as_deref().map(serde_json::from_str).transpose()?,
                    executor_key,
                    is_deprecated,
                })
            })
            .transpose()
        })
    }

    // ── Instances ───────────────────────────────────────────────────

    pub fn insert_plan_instance(&self, req: &PlanRequest) -> Result<Uuid> {
        self.with_conn(|conn| insert_plan_tx(conn, req))
    }

    pub fn get_plan_instance(&self, plan_id: &Uuid) -> Result<Option<PlanInstance>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {INSTANCE_COLUMNS} FROM plan_instances WHERE plan_id = ?1");
            conn.query_row(&sql, [plan_id.to_string()], row_to_instance)
                .optional()
                .map_err(db_err)?
                .map(build_instance)
                .transpose()
        })
    }

    /// Claim up to `max_n` queued plans, oldest first, marking them running.
    pub fn claim_queued_plans(&self, max_n: usize) -> Result<Vec<PlanInstance>> {
        self.with_tx(|conn| {
            let sql = format!(
                "SELECT {INSTANCE_COLUMNS} FROM plan_instances
                 WHERE status = 'queued' ORDER BY created_at ASC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let raw = stmt
                .query_map([max_n as i64], row_to_instance)
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;

            let mut claimed = Vec::with_capacity(raw.len());
            for r in raw {
                let mut instance = build_instance(r)?;
                let updated = conn
                    .execute(
                        "UPDATE plan_instances SET status = 'running'
                         WHERE plan_id = ?1 AND status = 'queued'",
                        [instance.plan_id.to_string()],
                    )
                    .map_err(db_err)?;
                if updated > 0 {
                    instance.status = PlanStatus::Running;
                    claimed.push(instance);
                }
            }
            Ok(claimed)
        })
    }

    pub fn set_plan_status(&self, plan_id: &Uuid, status: PlanStatus, error: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE plan_instances SET status = ?2, error = ?3 WHERE plan_id = ?1",
                params![plan_id.to_string(), status.as_str(), error],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    // ── Runs ────────────────────────────────────────────────────────

    pub fn start_plan_run(&self, plan_id: &Uuid) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO plan_runs (run_id, plan_id, status, started_at) VALUES (?1, ?2, 'running', ?3)",
                params![run_id.to_string(), plan_id.to_string(), fmt_ts(&Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })?;
        Ok(run_id)
    }

    pub fn finish_plan_run(
        &self,
        run_id: &Uuid,
        status: PlanStatus,
        state_json: &serde_json::Value,
        scheduled_json: &serde_json::Value,
        resolution: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE plan_runs
                 SET status = ?2, ended_at = ?3, state_json = ?4, scheduled_json = ?5, resolution = ?6
                 WHERE run_id = ?1",
                params![
                    run_id.to_string(),
                    status.as_str(),
                    fmt_ts(&Utc::now()),
                    state_json.to_string(),
                    scheduled_json.to_string(),
                    resolution,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn count_plans_by_status(&self, status: PlanStatus) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM plan_instances WHERE status = ?1",
                [status.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
    }
}

pub(crate) fn insert_plan_tx(conn: &Connection, req: &PlanRequest) -> Result<Uuid> {
    let plan_id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO plan_instances
            (plan_id, plan_kind, plan_version, correlation_id, status, payload, actor, source_channel, intent_confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7, ?8, ?9)",
        params![
            plan_id.to_string(),
            req.plan_kind,
            req.plan_version,
            req.correlation_id,
            req.payload.to_string(),
            req.actor,
            req.source_channel,
            req.intent_confidence,
            fmt_ts(&Utc::now()),
        ],
    )
    .map_err(db_err)?;
    Ok(plan_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn kind_row() -> PlanKindRow {
        PlanKindRow {
            plan_kind: "create_reminder".into(),
            plan_version: 1,
            schema: serde_json::json!({
                "type": "object",
                "required": ["task", "schedule"],
                "properties": {"task": {"type": "string"}, "schedule": {"type": "object"}}
            }),
            example: Some(serde_json::json!({"task": "water the plants", "schedule": {"in_seconds": 60}})),
            executor_key: "reminder_executor".into(),
            is_deprecated: false,
        }
    }

    fn plan_request() -> PlanRequest {
        PlanRequest {
            plan_kind: "create_reminder".into(),
            plan_version: 1,
            payload: serde_json::json!({"task": "water the plants", "schedule": {"in_seconds": 60}}),
            actor: "u1".into(),
            source_channel: "cli".into(),
            intent_confidence: 0.9,
            correlation_id: "C1".into(),
        }
    }

    #[test]
    fn register_and_get_kind() {
        let store = store();
        store.register_plan_kind(&kind_row()).unwrap();
        let row = store.get_plan_kind("create_reminder", 1).unwrap().unwrap();
        assert_eq!(row.executor_key, "reminder_executor");
        assert!(!row.is_deprecated);
        assert_eq!(row.schema["required"][0], "task");
        assert!(store.get_plan_kind("create_reminder", 2).unwrap().is_none());
    }

    #[test]
    fn register_kind_upserts() {
        let store = store();
        store.register_plan_kind(&kind_row()).unwrap();
        let mut updated = kind_row();
        updated.is_deprecated = true;
        store.register_plan_kind(&updated).unwrap();
        assert!(store.get_plan_kind("create_reminder", 1).unwrap().unwrap().is_deprecated);
    }

    #[test]
    fn instance_payload_unchanged_through_lifecycle() {
        let store = store();
        let req = plan_request();
        let plan_id = store.insert_plan_instance(&req).unwrap();

        let claimed = store.claim_queued_plans(10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].plan_id, plan_id);
        assert_eq!(claimed[0].status, PlanStatus::Running);
        assert_eq!(claimed[0].payload, req.payload, "payload must survive claim");

        store.set_plan_status(&plan_id, PlanStatus::Done, None).unwrap();
        let done = store.get_plan_instance(&plan_id).unwrap().unwrap();
        assert_eq!(done.status, PlanStatus::Done);
        assert_eq!(done.payload, req.payload, "payload must survive completion");
    }

    #[test]
    fn claim_skips_non_queued() {
        let store = store();
        let plan_id = store.insert_plan_instance(&plan_request()).unwrap();
        store.set_plan_status(&plan_id, PlanStatus::Failed, Some("schema mismatch")).unwrap();
        assert!(store.claim_queued_plans(10).unwrap().is_empty());
    }

    #[test]
    fn run_lifecycle() {
        let store = store();
        let plan_id = store.insert_plan_instance(&plan_request()).unwrap();
        let run_id = store.start_plan_run(&plan_id).unwrap();
        store
            .finish_plan_run(
                &run_id,
                PlanStatus::Done,
                &serde_json::json!({"step": 1}),
                &serde_json::json!({"timed_id": 7}),
                Some("completed"),
            )
            .unwrap();
        let status: String = store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT status FROM plan_runs WHERE run_id = ?1",
                    [run_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(db_err)
            })
            .unwrap();
        assert_eq!(status, "done");
    }

    #[test]
    fn count_by_status() {
        let store = store();
        store.insert_plan_instance(&plan_request()).unwrap();
        store.insert_plan_instance(&plan_request()).unwrap();
        assert_eq!(store.count_plans_by_status(PlanStatus::Queued).unwrap(), 2);
        assert_eq!(store.count_plans_by_status(PlanStatus::Done).unwrap(), 0);
    }
}
