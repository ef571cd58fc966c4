//! Per-tenant learned aliases: a normalized phrase remembered against a
//! product, with a confirmation weight that only ever grows.

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::LazyLock;

use super::Db;
use crate::text::tokens::truncate_chars;

static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static QTY_UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\d+(?:[.,]\d+)?\s*(?:т\.?\s*шт|тыс\.?\s*шт|шт|кг|кор(?:обка)?|уп(?:ак)?|рулон|рол(?:ик)?|пог\.?\s*м|м)\b",
    )
    .unwrap()
});
static NON_WORDS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s-]+").unwrap());
static LETTER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)[a-zа-яё]").unwrap());
static NUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

const AUTOLEARN_STOPWORDS: &[&str] = &["ок", "спасибо", "привет", "здравствуйте", "да", "нет"];

const ALIAS_MAX_CHARS: usize = 255;

/// Canonical alias form: lowercase, quantity/unit phrases removed,
/// whitespace collapsed, truncated to 255 chars. Idempotent.
pub fn normalize_alias(text: &str) -> String {
    let cleaned = text.to_lowercase();
    let cleaned = QTY_UNIT_RE.replace_all(cleaned.trim(), " ");
    let cleaned = SPACES_RE.replace_all(&cleaned, " ");
    truncate_chars(cleaned.trim(), ALIAS_MAX_CHARS)
}

/// Stricter normalization for unattended learning: additionally strips
/// punctuation, rejects stop-phrases, too-short strings, and letterless
/// strings unless they carry at least two numbers. Empty result = reject.
pub fn normalize_alias_for_autolearn(text: &str) -> String {
    let cleaned = text.to_lowercase();
    let cleaned = QTY_UNIT_RE.replace_all(cleaned.trim(), " ");
    let cleaned = cleaned.replace('-', " ");
    let cleaned = NON_WORDS_RE.replace_all(&cleaned, " ");
    let cleaned = SPACES_RE.replace_all(&cleaned, " ");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || AUTOLEARN_STOPWORDS.contains(&cleaned) {
        return String::new();
    }
    if !LETTER_RE.is_match(cleaned) && NUM_RE.find_iter(cleaned).count() < 2 {
        return String::new();
    }
    if cleaned.chars().count() < 4 {
        return String::new();
    }
    truncate_chars(cleaned, ALIAS_MAX_CHARS)
}

/// Connection-level upsert so the dialog layer can batch it into one
/// transaction with the search-log insert.
pub fn upsert_org_alias_conn(
    conn: &Connection,
    org_id: i64,
    alias_text: &str,
    product_id: i64,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let normalized = normalize_alias(alias_text);
    if normalized.is_empty() {
        return Ok(());
    }
    let stamp = now.to_rfc3339();
    conn.execute(
        "INSERT INTO org_aliases
             (org_id, alias_text, normalized_alias, product_id, weight, last_used_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5, ?5)
         ON CONFLICT(org_id, normalized_alias, product_id) DO UPDATE SET
             weight = weight + 1,
             last_used_at = excluded.last_used_at,
             updated_at = excluded.updated_at",
        params![
            org_id,
            truncate_chars(alias_text, ALIAS_MAX_CHARS),
            normalized,
            product_id,
            stamp
        ],
    )
    .map_err(|e| format!("failed to upsert org alias: {e}"))?;
    Ok(())
}

impl Db {
    /// Remember (or reinforce) an alias for a product.
    pub fn upsert_org_alias(
        &self,
        org_id: i64,
        alias_text: &str,
        product_id: i64,
    ) -> Result<(), String> {
        let conn = self.conn();
        upsert_org_alias_conn(&conn, org_id, alias_text, product_id, Utc::now())
    }

    /// Guarded learning: returns whether the alias was accepted.
    pub fn autolearn_org_alias(
        &self,
        org_id: i64,
        alias_text: &str,
        product_id: i64,
    ) -> Result<bool, String> {
        let normalized = normalize_alias_for_autolearn(alias_text);
        if normalized.is_empty() {
            return Ok(false);
        }
        self.upsert_org_alias(org_id, &normalized, product_id)?;
        Ok(true)
    }

    /// Product ids remembered for a phrase, strongest first. Falls back to a
    /// substring match when no exact normalized alias exists (legacy
    /// behavior, relied upon — see DESIGN.md).
    pub fn find_org_alias_candidates(
        &self,
        org_id: i64,
        alias_text: &str,
        limit: usize,
    ) -> Result<Vec<i64>, String> {
        let normalized = normalize_alias(alias_text);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let exact = query_alias_ids(
            &conn,
            "SELECT product_id FROM org_aliases
             WHERE org_id = ?1 AND normalized_alias = ?2
             ORDER BY weight DESC, last_used_at DESC LIMIT ?3",
            org_id,
            &normalized,
            limit,
        )?;
        if !exact.is_empty() {
            return Ok(exact);
        }
        query_alias_ids(
            &conn,
            "SELECT product_id FROM org_aliases
             WHERE org_id = ?1 AND normalized_alias LIKE ?2
             ORDER BY weight DESC, last_used_at DESC LIMIT ?3",
            org_id,
            &format!("%{normalized}%"),
            limit,
        )
    }

    /// Current weight of an alias row, if present.
    pub fn org_alias_weight(
        &self,
        org_id: i64,
        alias_text: &str,
        product_id: i64,
    ) -> Result<Option<i64>, String> {
        let normalized = normalize_alias(alias_text);
        self.conn()
            .query_row(
                "SELECT weight FROM org_aliases
                 WHERE org_id = ?1 AND normalized_alias = ?2 AND product_id = ?3",
                params![org_id, normalized, product_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("failed to read alias weight: {e}"))
    }
}

fn query_alias_ids(
    conn: &Connection,
    sql: &str,
    org_id: i64,
    needle: &str,
    limit: usize,
) -> Result<Vec<i64>, String> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| format!("failed to prepare alias lookup: {e}"))?;
    let rows = stmt
        .query_map(params![org_id, needle, limit as i64], |row| row.get(0))
        .map_err(|e| format!("failed to run alias lookup: {e}"))?
        .collect::<rusqlite::Result<Vec<i64>>>()
        .map_err(|e| format!("failed to collect alias ids: {e}"))?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_quantities() {
        assert_eq!(normalize_alias("Нитки белые 10 шт"), "нитки белые");
        assert_eq!(normalize_alias("поролон 2 рулон"), "поролон");
        assert_eq!(normalize_alias("гайка 2 т.шт"), "гайка");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["Нитки белые 10 шт", "болт 8x30 дин 933", "  поролон  "] {
            let once = normalize_alias(raw);
            assert_eq!(normalize_alias(&once), once);
        }
    }

    #[test]
    fn autolearn_rejects_noise() {
        assert_eq!(normalize_alias_for_autolearn("ок"), "");
        assert_eq!(normalize_alias_for_autolearn("да"), "");
        assert_eq!(normalize_alias_for_autolearn("aб1"), "");
        // Letterless needs two numbers.
        assert_eq!(normalize_alias_for_autolearn("1234"), "");
        assert_eq!(normalize_alias_for_autolearn("12 345"), "12 345");
        assert_eq!(
            normalize_alias_for_autolearn("Молния - спираль №5"),
            "молния спираль 5"
        );
    }

    #[test]
    fn weight_is_monotone_and_counts_upserts() {
        let db = Db::open_in_memory().unwrap();
        for _ in 0..3 {
            db.upsert_org_alias(1, "нитки белые", 42).unwrap();
        }
        assert_eq!(db.org_alias_weight(1, "нитки белые", 42).unwrap(), Some(3));
    }

    #[test]
    fn candidates_ordered_by_weight() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_org_alias(1, "молния", 10).unwrap();
        db.upsert_org_alias(1, "молния", 20).unwrap();
        db.upsert_org_alias(1, "молния", 20).unwrap();
        let ids = db.find_org_alias_candidates(1, "молния", 5).unwrap();
        assert_eq!(ids, vec![20, 10]);
    }

    #[test]
    fn substring_fallback_matches() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_org_alias(1, "молния спираль серая", 7).unwrap();
        // No exact row for the shorter phrase, substring fallback finds it.
        let ids = db.find_org_alias_candidates(1, "спираль", 5).unwrap();
        assert_eq!(ids, vec![7]);
    }

    #[test]
    fn aliases_are_tenant_scoped() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_org_alias(1, "поролон", 5).unwrap();
        assert!(db.find_org_alias_candidates(2, "поролон", 5).unwrap().is_empty());
    }

    #[test]
    fn autolearn_accepts_real_phrases() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.autolearn_org_alias(1, "мел белый", 3).unwrap());
        assert!(!db.autolearn_org_alias(1, "ок", 3).unwrap());
        assert_eq!(db.find_org_alias_candidates(1, "мел белый", 5).unwrap(), vec![3]);
    }
}
