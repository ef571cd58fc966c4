//! Persistent token rewrites: global rows (`org_id IS NULL`) plus per-tenant
//! overrides. The merged map is cached by the search layer.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::Db;

impl Db {
    /// Enabled token rewrites for a scope (`None` = global rows).
    pub fn search_alias_rows(&self, org_id: Option<i64>) -> Result<Vec<(String, String)>, String> {
        let conn = self.conn();
        let (sql, org) = match org_id {
            Some(org) => (
                "SELECT src, dst FROM search_aliases
                 WHERE enabled = 1 AND kind = 'token' AND org_id = ?1
                 ORDER BY src",
                org,
            ),
            None => (
                "SELECT src, dst FROM search_aliases
                 WHERE enabled = 1 AND kind = 'token' AND org_id IS NULL
                 ORDER BY src",
                0,
            ),
        };
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| format!("failed to prepare synonym rows: {e}"))?;
        let map_row =
            |row: &rusqlite::Row<'_>| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
        let rows = if org_id.is_some() {
            stmt.query_map(params![org], map_row)
                .map_err(|e| format!("failed to read synonym rows: {e}"))?
                .collect::<rusqlite::Result<Vec<_>>>()
        } else {
            stmt.query_map([], map_row)
                .map_err(|e| format!("failed to read synonym rows: {e}"))?
                .collect::<rusqlite::Result<Vec<_>>>()
        }
        .map_err(|e| format!("failed to collect synonym rows: {e}"))?;
        Ok(rows)
    }

    /// Insert or update a token rewrite for a scope.
    pub fn upsert_search_alias(
        &self,
        org_id: Option<i64>,
        src: &str,
        dst: &str,
        enabled: bool,
    ) -> Result<(), String> {
        let conn = self.conn();
        let existing: Option<i64> = match org_id {
            Some(org) => conn.query_row(
                "SELECT id FROM search_aliases WHERE org_id = ?1 AND src = ?2",
                params![org, src],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT id FROM search_aliases WHERE org_id IS NULL AND src = ?1",
                params![src],
                |row| row.get(0),
            ),
        }
        .optional()
        .map_err(|e| format!("failed to look up synonym: {e}"))?;

        let now = Utc::now().to_rfc3339();
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE search_aliases SET dst = ?1, enabled = ?2, updated_at = ?3
                     WHERE id = ?4",
                    params![dst, enabled as i64, now, id],
                )
                .map_err(|e| format!("failed to update synonym: {e}"))?;
            }
            None => {
                conn.execute(
                    "INSERT INTO search_aliases (org_id, src, dst, kind, enabled, updated_at)
                     VALUES (?1, ?2, ?3, 'token', ?4, ?5)",
                    params![org_id, src, dst, enabled as i64, now],
                )
                .map_err(|e| format!("failed to insert synonym: {e}"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_and_org_scopes_are_separate() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_search_alias(None, "спандбонд", "спанбонд", true).unwrap();
        db.upsert_search_alias(Some(1), "ппу", "поролон вторичка", true).unwrap();

        let global = db.search_alias_rows(None).unwrap();
        assert_eq!(global, vec![("спандбонд".into(), "спанбонд".into())]);
        let org = db.search_alias_rows(Some(1)).unwrap();
        assert_eq!(org, vec![("ппу".into(), "поролон вторичка".into())]);
    }

    #[test]
    fn upsert_overwrites_and_respects_enabled() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_search_alias(None, "ппу", "поролон", true).unwrap();
        db.upsert_search_alias(None, "ппу", "поролон листовой", true).unwrap();
        assert_eq!(
            db.search_alias_rows(None).unwrap(),
            vec![("ппу".into(), "поролон листовой".into())]
        );
        db.upsert_search_alias(None, "ппу", "поролон листовой", false).unwrap();
        assert!(db.search_alias_rows(None).unwrap().is_empty());
    }
}
