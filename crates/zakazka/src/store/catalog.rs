//! Product and category reads (plus the upserts the ingest side uses).

use rusqlite::{Row, params};
use std::collections::HashMap;

use super::Db;
use crate::text::tokens::normalize_catalog_text;

/// A catalog row as the search stages see it.
#[derive(Debug, Clone)]
pub struct ProductRow {
    pub id: i64,
    pub sku: Option<String>,
    pub title_ru: String,
    pub price: f64,
    pub stock_qty: i64,
    pub category_id: Option<i64>,
    pub title_norm: String,
    pub sku_norm: String,
}

impl ProductRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sku: row.get(1)?,
            title_ru: row.get(2)?,
            price: row.get(3)?,
            stock_qty: row.get(4)?,
            category_id: row.get(5)?,
            title_norm: row.get(6)?,
            sku_norm: row.get(7)?,
        })
    }
}

const PRODUCT_COLUMNS: &str =
    "id, sku, title_ru, price, stock_qty, category_id, title_norm, sku_norm";

/// Catalog prefetch filter built by the search layer.
#[derive(Debug, Default)]
pub struct PrefetchFilter {
    /// `title_norm LIKE` patterns that are ANDed together.
    pub like_patterns: Vec<String>,
    pub category_ids: Option<Vec<i64>>,
    pub product_ids: Option<Vec<i64>>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct CategoryRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub title_ru: String,
}

impl Db {
    /// Insert or replace a catalog product, maintaining the `*_norm` columns.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_product(
        &self,
        id: i64,
        sku: Option<&str>,
        title_ru: &str,
        price: f64,
        stock_qty: i64,
        category_id: Option<i64>,
    ) -> Result<(), String> {
        let title_norm = normalize_catalog_text(title_ru);
        let sku_norm = sku.map(normalize_catalog_text).unwrap_or_default();
        self.conn()
            .execute(
                "INSERT INTO products (id, sku, title_ru, price, stock_qty, category_id, title_norm, sku_norm)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                     sku = excluded.sku,
                     title_ru = excluded.title_ru,
                     price = excluded.price,
                     stock_qty = excluded.stock_qty,
                     category_id = excluded.category_id,
                     title_norm = excluded.title_norm,
                     sku_norm = excluded.sku_norm",
                params![id, sku, title_ru, price, stock_qty, category_id, title_norm, sku_norm],
            )
            .map_err(|e| format!("failed to upsert product: {e}"))?;
        Ok(())
    }

    pub fn upsert_category(
        &self,
        id: i64,
        parent_id: Option<i64>,
        title_ru: &str,
        order_index: i64,
    ) -> Result<(), String> {
        self.conn()
            .execute(
                "INSERT INTO categories (id, parent_id, title_ru, order_index)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     parent_id = excluded.parent_id,
                     title_ru = excluded.title_ru,
                     order_index = excluded.order_index",
                params![id, parent_id, title_ru, order_index],
            )
            .map_err(|e| format!("failed to upsert category: {e}"))?;
        Ok(())
    }

    /// AND-filtered candidate prefetch for the catalog index.
    pub fn prefetch_products(&self, filter: &PrefetchFilter) -> Result<Vec<ProductRow>, String> {
        let mut sql = format!("SELECT {PRODUCT_COLUMNS} FROM products");
        let mut clauses: Vec<String> = Vec::new();
        for _ in &filter.like_patterns {
            clauses.push("title_norm LIKE ?".to_string());
        }
        if let Some(cats) = &filter.category_ids {
            if cats.is_empty() {
                return Ok(Vec::new());
            }
            let list = cats
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            clauses.push(format!("category_id IN ({list})"));
        }
        if let Some(ids) = &filter.product_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let list = ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            clauses.push(format!("id IN ({list})"));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id LIMIT {}", filter.limit.max(1)));

        let conn = self.conn();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| format!("failed to prepare prefetch: {e}"))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(filter.like_patterns.iter()),
                ProductRow::from_row,
            )
            .map_err(|e| format!("failed to run prefetch: {e}"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("failed to read prefetch rows: {e}"))?;
        Ok(rows)
    }

    /// `id → category_id` for the final payload attachment.
    pub fn product_category_map(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, Option<i64>>, String> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT id, category_id FROM products WHERE id IN ({list})"
            ))
            .map_err(|e| format!("failed to prepare category map: {e}"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)))
            .map_err(|e| format!("failed to read category map: {e}"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("failed to collect category map: {e}"))?;
        Ok(rows.into_iter().collect())
    }

    pub fn list_categories(&self) -> Result<Vec<CategoryRow>, String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, parent_id, title_ru FROM categories ORDER BY order_index, id")
            .map_err(|e| format!("failed to prepare category list: {e}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CategoryRow {
                    id: row.get(0)?,
                    parent_id: row.get(1)?,
                    title_ru: row.get(2)?,
                })
            })
            .map_err(|e| format!("failed to read categories: {e}"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("failed to collect categories: {e}"))?;
        Ok(rows)
    }

    pub fn product_counts_by_category(&self) -> Result<HashMap<i64, i64>, String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT category_id, COUNT(id) FROM products
                 WHERE category_id IS NOT NULL GROUP BY category_id",
            )
            .map_err(|e| format!("failed to prepare counts: {e}"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| format!("failed to read counts: {e}"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| format!("failed to collect counts: {e}"))?;
        Ok(rows.into_iter().collect())
    }

    pub fn category_examples(&self, category_id: i64, limit: usize) -> Result<Vec<String>, String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT title_ru FROM products WHERE category_id = ?1
                 ORDER BY title_ru LIMIT ?2",
            )
            .map_err(|e| format!("failed to prepare examples: {e}"))?;
        let rows = stmt
            .query_map(params![category_id, limit as i64], |row| row.get(0))
            .map_err(|e| format!("failed to read examples: {e}"))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(|e| format!("failed to collect examples: {e}"))?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_products() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(1, Some("BT-830"), "Болт мебельный 8 * 30 (din 603)", 2.5, 100, None)
            .unwrap();
        db.upsert_product(2, None, "Карандаш меловой белый для разметки", 15.0, 40, None)
            .unwrap();
        db.upsert_product(3, None, "Липа контактная белый 20мм", 5.0, 10, None)
            .unwrap();
        db
    }

    #[test]
    fn prefetch_ands_like_patterns() {
        let db = db_with_products();
        let rows = db
            .prefetch_products(&PrefetchFilter {
                like_patterns: vec!["%мел%".into(), "%бел%".into()],
                limit: 100,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);
    }

    #[test]
    fn prefetch_respects_product_id_restriction() {
        let db = db_with_products();
        let rows = db
            .prefetch_products(&PrefetchFilter {
                like_patterns: vec!["%бел%".into()],
                product_ids: Some(vec![3]),
                limit: 100,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 3);
    }

    #[test]
    fn empty_id_restriction_short_circuits() {
        let db = db_with_products();
        let rows = db
            .prefetch_products(&PrefetchFilter {
                like_patterns: vec![],
                product_ids: Some(vec![]),
                limit: 100,
                ..Default::default()
            })
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn norm_columns_fold_case_and_yo() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_product(10, None, "Саморез ЖЁЛТЫЙ 4x25", 1.0, 5, None)
            .unwrap();
        let rows = db
            .prefetch_products(&PrefetchFilter {
                like_patterns: vec!["%желтый%".into()],
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn category_map_attaches_ids() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_category(5, None, "Крепёж", 0).unwrap();
        db.upsert_product(1, None, "Болт", 1.0, 1, Some(5)).unwrap();
        let map = db.product_category_map(&[1]).unwrap();
        assert_eq!(map.get(&1), Some(&Some(5)));
    }
}
