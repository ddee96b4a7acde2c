//! Principals and preferences. The `dnd` preference here is the single
//! authority for do-not-disturb; nothing in the FSM catalog duplicates it.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use nerve_domain::error::Result;

use crate::{db_err, fmt_ts, Store};

impl Store {
    pub fn upsert_principal(&self, user_id: &str, name: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO principals (user_id, name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET name = COALESCE(?2, name)",
                params![user_id, name, fmt_ts(&Utc::now())],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn principal_name(&self, user_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT name FROM principals WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
            .map(Option::flatten)
        })
    }

    pub fn set_preference(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        // The principal row must exist first (foreign key).
        self.upsert_principal(user_id, None)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO preferences (user_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, key) DO UPDATE SET value = ?3",
                params![user_id, key, value],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    pub fn get_preference(&self, user_id: &str, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM preferences WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
        })
    }

    /// Authoritative do-not-disturb flag for a user. Unset = false.
    pub fn dnd(&self, user_id: &str) -> Result<bool> {
        Ok(self.get_preference(user_id, "dnd")?.map(|v| v == "true").unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn upsert_keeps_name_when_none() {
        let store = store();
        store.upsert_principal("u1", Some("Ada")).unwrap();
        store.upsert_principal("u1", None).unwrap();
        assert_eq!(store.principal_name("u1").unwrap().as_deref(), Some("Ada"));
    }

    #[test]
    fn preferences_upsert() {
        let store = store();
        store.set_preference("u1", "locale", "fr").unwrap();
        store.set_preference("u1", "locale", "en").unwrap();
        assert_eq!(store.get_preference("u1", "locale").unwrap().as_deref(), Some("en"));
        assert!(store.get_preference("u1", "tone").unwrap().is_none());
    }

    #[test]
    fn dnd_defaults_false_and_reads_preference() {
        let store = store();
        assert!(!store.dnd("u1").unwrap());
        store.set_preference("u1", "dnd", "true").unwrap();
        assert!(store.dnd("u1").unwrap());
        store.set_preference("u1", "dnd", "false").unwrap();
        assert!(!store.dnd("u1").unwrap());
    }
}
