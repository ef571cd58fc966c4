//! Immutable search audit log.

use chrono::Utc;
use rusqlite::{Connection, params};

use super::Db;

/// Connection-level insert so the dialog layer can batch it with the
/// autolearn write.
pub fn insert_search_log_conn(
    conn: &Connection,
    user_id: Option<i64>,
    raw_text: &str,
    parsed_json: Option<&str>,
    selected_json: Option<&str>,
    confidence: Option<f64>,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO search_log (user_id, raw_text, parsed_json, selected_json, confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id,
            raw_text,
            parsed_json,
            selected_json,
            confidence,
            Utc::now().to_rfc3339()
        ],
    )
    .map_err(|e| format!("failed to insert search log: {e}"))?;
    Ok(())
}

impl Db {
    pub fn insert_search_log(
        &self,
        user_id: Option<i64>,
        raw_text: &str,
        parsed_json: Option<&str>,
        selected_json: Option<&str>,
        confidence: Option<f64>,
    ) -> Result<(), String> {
        let conn = self.conn();
        insert_search_log_conn(&conn, user_id, raw_text, parsed_json, selected_json, confidence)
    }

    pub fn search_log_count(&self) -> Result<i64, String> {
        self.conn()
            .query_row("SELECT COUNT(*) FROM search_log", [], |row| row.get(0))
            .map_err(|e| format!("failed to count search log: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_rows_append() {
        let db = Db::open_in_memory().unwrap();
        db.insert_search_log(Some(7), "болт 8x30", Some("{}"), None, Some(0.9))
            .unwrap();
        db.insert_search_log(None, "поролон", None, None, None).unwrap();
        assert_eq!(db.search_log_count().unwrap(), 2);
    }
}
