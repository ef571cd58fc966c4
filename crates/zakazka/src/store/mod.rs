//! SQLite-backed relational store.
//!
//! `Db` wraps a single connection behind a mutex; every public method locks,
//! runs, and unlocks — callers never hold the connection across an await
//! point. Catalog, organization, and membership rows are owned by the ERP
//! ingest collaborator in production; the write helpers here exist so tests
//! and the `seed` CLI can populate the same schema.
//!
//! Case-insensitive Russian matching is done against precomputed `*_norm`
//! columns (lowercased, `ё`→`е`, punctuation flattened) because SQLite's
//! `LIKE` only case-folds ASCII.

pub mod aliases;
pub mod catalog;
pub mod log;
pub mod schema;
pub mod stats;
pub mod synonyms;

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Handle to the relational store.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, String> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| format!("failed to open database: {e}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| format!("failed to set WAL mode: {e}"))?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and the eval harness.
    pub fn open_in_memory() -> Result<Self, String> {
        let conn =
            Connection::open_in_memory().map_err(|e| format!("failed to open memory db: {e}"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, String> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| format!("failed to enable foreign keys: {e}"))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside a single transaction. Rolls back on error.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let conn = self.conn();
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| format!("failed to begin transaction: {e}"))?;
        match f(&conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| format!("failed to commit: {e}"))?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // ── Organizations & members ────────────────────────────────────

    pub fn upsert_organization(&self, id: i64, name: &str) -> Result<(), String> {
        self.conn()
            .execute(
                "INSERT INTO organizations (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![id, name],
            )
            .map_err(|e| format!("failed to upsert organization: {e}"))?;
        Ok(())
    }

    pub fn upsert_org_member(
        &self,
        org_id: i64,
        user_id: i64,
        role: &str,
        status: &str,
    ) -> Result<(), String> {
        self.conn()
            .execute(
                "INSERT INTO org_members (org_id, user_id, role, status)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(org_id, user_id)
                 DO UPDATE SET role = excluded.role, status = excluded.status",
                params![org_id, user_id, role, status],
            )
            .map_err(|e| format!("failed to upsert org member: {e}"))?;
        Ok(())
    }

    /// The org of a user: lowest org id among active memberships.
    pub fn resolve_org_for_user(&self, user_id: i64) -> Result<Option<i64>, String> {
        self.conn()
            .query_row(
                "SELECT org_id FROM org_members
                 WHERE user_id = ?1 AND status = 'active'
                 ORDER BY org_id LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("failed to resolve org membership: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_resolution_picks_lowest_active_org() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_organization(7, "Мебель-Опт").unwrap();
        db.upsert_organization(3, "Фурнитура").unwrap();
        db.upsert_org_member(7, 100, "member", "active").unwrap();
        db.upsert_org_member(3, 100, "member", "active").unwrap();
        assert_eq!(db.resolve_org_for_user(100).unwrap(), Some(3));
    }

    #[test]
    fn inactive_memberships_are_ignored() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_organization(1, "Орг").unwrap();
        db.upsert_org_member(1, 5, "member", "blocked").unwrap();
        assert_eq!(db.resolve_org_for_user(5).unwrap(), None);
        db.upsert_org_member(1, 5, "member", "active").unwrap();
        assert_eq!(db.resolve_org_for_user(5).unwrap(), Some(1));
    }

    #[test]
    fn opens_on_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Db::open(&path).unwrap();
        db.upsert_organization(1, "Орг").unwrap();
        drop(db);
        let reopened = Db::open(&path).unwrap();
        assert_eq!(reopened.resolve_org_for_user(1).unwrap(), None);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = Db::open_in_memory().unwrap();
        let result: Result<(), String> = db.in_transaction(|conn| {
            conn.execute(
                "INSERT INTO organizations (id, name) VALUES (1, 'Орг')",
                [],
            )
            .map_err(|e| e.to_string())?;
            Err("boom".to_string())
        });
        assert!(result.is_err());
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM organizations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
