//! Per-(org, product) order rollups. Written by the ERP ingest collaborator
//! per ordered line; the history retriever only reads them.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::Db;

/// One ordered line, as the ingest side reports it.
#[derive(Debug, Clone)]
pub struct OrderedLine {
    pub product_id: i64,
    pub qty: f64,
    pub unit: Option<String>,
    pub ordered_at: Option<DateTime<Utc>>,
}

/// Joined stats + product row for history scoring.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub product_id: i64,
    pub orders_count: i64,
    pub last_order_at: Option<DateTime<Utc>>,
    pub sku: Option<String>,
    pub title_ru: String,
    pub price: f64,
    pub stock_qty: i64,
    pub title_norm: String,
    pub sku_norm: String,
}

/// How many stats+product rows the retriever will consider per query.
pub const HISTORY_SCAN_LIMIT: usize = 3000;

impl Db {
    /// Fold ordered lines into the rollup. `last_*` fields only move forward
    /// in time; RFC3339 strings compare correctly as text.
    pub fn upsert_org_product_stats(
        &self,
        org_id: i64,
        lines: &[OrderedLine],
    ) -> Result<(), String> {
        let conn = self.conn();
        for line in lines {
            let ordered_at = line.ordered_at.map(|t| t.to_rfc3339());
            conn.execute(
                "INSERT INTO org_product_stats
                     (org_id, product_id, orders_count, qty_sum, last_order_at, last_qty, last_unit)
                 VALUES (?1, ?2, 1, ?3,
                         ?4,
                         CASE WHEN ?4 IS NULL THEN NULL ELSE ?3 END,
                         CASE WHEN ?4 IS NULL THEN NULL ELSE ?5 END)
                 ON CONFLICT(org_id, product_id) DO UPDATE SET
                     orders_count = orders_count + 1,
                     qty_sum = qty_sum + excluded.qty_sum,
                     last_order_at = CASE
                         WHEN excluded.last_order_at IS NOT NULL
                              AND (last_order_at IS NULL OR excluded.last_order_at >= last_order_at)
                         THEN excluded.last_order_at ELSE last_order_at END,
                     last_qty = CASE
                         WHEN excluded.last_order_at IS NOT NULL
                              AND (last_order_at IS NULL OR excluded.last_order_at >= last_order_at)
                         THEN excluded.last_qty ELSE last_qty END,
                     last_unit = CASE
                         WHEN excluded.last_order_at IS NOT NULL
                              AND (last_order_at IS NULL OR excluded.last_order_at >= last_order_at)
                         THEN excluded.last_unit ELSE last_unit END",
                params![org_id, line.product_id, line.qty, ordered_at, line.unit],
            )
            .map_err(|e| format!("failed to upsert product stats: {e}"))?;
        }
        Ok(())
    }

    /// Stats rows joined with products, most-ordered first.
    pub fn history_rows(&self, org_id: i64, limit: usize) -> Result<Vec<HistoryRow>, String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT s.product_id, s.orders_count, s.last_order_at,
                        p.sku, p.title_ru, p.price, p.stock_qty, p.title_norm, p.sku_norm
                 FROM org_product_stats s
                 JOIN products p ON p.id = s.product_id
                 WHERE s.org_id = ?1
                 ORDER BY s.orders_count DESC, s.last_order_at DESC
                 LIMIT ?2",
            )
            .map_err(|e| format!("failed to prepare history rows: {e}"))?;
        let rows = stmt
            .query_map(params![org_id, limit as i64], |row| {
                let last_raw: Option<String> = row.get(2)?;
                Ok(HistoryRow {
                    product_id: row.get(0)?,
                    orders_count: row.get(1)?,
                    last_order_at: last_raw.and_then(|s| {
                        DateTime::parse_from_rfc3339(&s)
                            .ok()
                            .map(|t| t.with_timezone(&Utc))
                    }),
                    sku: row.get(3)?,
                    title_ru: row.get(4)?,
                    price: row.get(5)?,
                    stock_qty: row.get(6)?,
                    title_norm: row.get(7)?,
                    sku_norm: row.get(8)?,
                })
            })
            .map_err(|e| format!("failed to read history rows: {e}"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("failed to collect history rows: {e}"))?;
        Ok(rows)
    }

    /// Total number of products this org has ever ordered.
    pub fn count_org_candidates(&self, org_id: i64) -> Result<i64, String> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM org_product_stats WHERE org_id = ?1",
                params![org_id],
                |row| row.get(0),
            )
            .map_err(|e| format!("failed to count org candidates: {e}"))
    }

    /// Distinct previously-ordered products whose title matches a head token.
    pub fn history_title_matches(
        &self,
        org_id: i64,
        token: &str,
        limit: usize,
    ) -> Result<Vec<(i64, String)>, String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT p.id, p.title_ru
                 FROM org_product_stats s
                 JOIN products p ON p.id = s.product_id
                 WHERE s.org_id = ?1 AND p.title_norm LIKE ?2
                 ORDER BY s.orders_count DESC, s.last_order_at DESC
                 LIMIT ?3",
            )
            .map_err(|e| format!("failed to prepare history suggestions: {e}"))?;
        let rows = stmt
            .query_map(
                params![org_id, format!("%{token}%"), limit as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(|e| format!("failed to read history suggestions: {e}"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("failed to collect history suggestions: {e}"))?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn stats_accumulate_per_line() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(5, None, "Болт мебельный 8 * 30 (din 603)", 2.0, 10, None)
            .unwrap();
        for day in 1..=3 {
            db.upsert_org_product_stats(
                1,
                &[OrderedLine {
                    product_id: 5,
                    qty: 100.0,
                    unit: Some("шт".into()),
                    ordered_at: Some(ts(2026, 7, day)),
                }],
            )
            .unwrap();
        }
        let rows = db.history_rows(1, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].orders_count, 3);
        assert_eq!(rows[0].last_order_at, Some(ts(2026, 7, 3)));
        assert_eq!(db.count_org_candidates(1).unwrap(), 1);
    }

    #[test]
    fn out_of_order_lines_keep_latest_timestamp() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(5, None, "Болт", 2.0, 10, None).unwrap();
        db.upsert_org_product_stats(
            1,
            &[
                OrderedLine {
                    product_id: 5,
                    qty: 1.0,
                    unit: None,
                    ordered_at: Some(ts(2026, 7, 10)),
                },
                OrderedLine {
                    product_id: 5,
                    qty: 1.0,
                    unit: None,
                    ordered_at: Some(ts(2026, 7, 1)),
                },
            ],
        )
        .unwrap();
        let rows = db.history_rows(1, 10).unwrap();
        assert_eq!(rows[0].orders_count, 2);
        assert_eq!(rows[0].last_order_at, Some(ts(2026, 7, 10)));
    }

    #[test]
    fn history_title_matches_are_org_scoped() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(1, None, "Молния спираль", 1.0, 1, None).unwrap();
        db.upsert_org_product_stats(
            1,
            &[OrderedLine {
                product_id: 1,
                qty: 1.0,
                unit: None,
                ordered_at: Some(ts(2026, 6, 1)),
            }],
        )
        .unwrap();
        assert_eq!(db.history_title_matches(1, "молния", 10).unwrap().len(), 1);
        assert!(db.history_title_matches(2, "молния", 10).unwrap().is_empty());
    }
}
