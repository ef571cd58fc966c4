//! Schema definition.
//!
//! `init` is idempotent — every statement is `IF NOT EXISTS`. The unique
//! index on `search_aliases` coalesces a NULL org to 0 so that global rows
//! obey the same one-src-per-scope rule as tenant rows.

use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS categories (
    id           INTEGER PRIMARY KEY,
    parent_id    INTEGER REFERENCES categories(id),
    title_ru     TEXT NOT NULL,
    order_index  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS products (
    id           INTEGER PRIMARY KEY,
    sku          TEXT UNIQUE,
    title_ru     TEXT NOT NULL,
    title_lat    TEXT,
    description  TEXT,
    stock_qty    INTEGER NOT NULL DEFAULT 0,
    price        REAL NOT NULL DEFAULT 0,
    category_id  INTEGER REFERENCES categories(id),
    title_norm   TEXT NOT NULL DEFAULT '',
    sku_norm     TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);

CREATE TABLE IF NOT EXISTS organizations (
    id           INTEGER PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    external_id  TEXT UNIQUE
);

CREATE TABLE IF NOT EXISTS org_members (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id   INTEGER NOT NULL REFERENCES organizations(id),
    user_id  INTEGER NOT NULL,
    role     TEXT NOT NULL DEFAULT 'member',
    status   TEXT NOT NULL DEFAULT 'active',
    UNIQUE (org_id, user_id)
);

CREATE TABLE IF NOT EXISTS org_aliases (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id            INTEGER NOT NULL,
    alias_text        TEXT NOT NULL,
    normalized_alias  TEXT NOT NULL,
    product_id        INTEGER NOT NULL,
    weight            INTEGER NOT NULL DEFAULT 1,
    last_used_at      TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    UNIQUE (org_id, normalized_alias, product_id)
);
CREATE INDEX IF NOT EXISTS idx_org_aliases_lookup ON org_aliases(org_id, normalized_alias);

CREATE TABLE IF NOT EXISTS org_product_stats (
    org_id         INTEGER NOT NULL,
    product_id     INTEGER NOT NULL,
    orders_count   INTEGER NOT NULL DEFAULT 0,
    qty_sum        REAL NOT NULL DEFAULT 0,
    last_order_at  TEXT,
    last_qty       REAL,
    last_unit      TEXT,
    PRIMARY KEY (org_id, product_id)
);
CREATE INDEX IF NOT EXISTS idx_stats_org_orders ON org_product_stats(org_id, orders_count DESC);

CREATE TABLE IF NOT EXISTS search_aliases (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id      INTEGER,
    src         TEXT NOT NULL,
    dst         TEXT NOT NULL,
    kind        TEXT NOT NULL DEFAULT 'token',
    enabled     INTEGER NOT NULL DEFAULT 1,
    updated_at  TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_search_aliases_scope_src
    ON search_aliases(COALESCE(org_id, 0), src);

CREATE TABLE IF NOT EXISTS search_log (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id        INTEGER,
    raw_text       TEXT NOT NULL,
    parsed_json    TEXT,
    selected_json  TEXT,
    confidence     REAL,
    created_at     TEXT NOT NULL
);
";

/// Create all tables and indices.
pub fn init(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| format!("failed to initialize schema: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(tables >= 8, "expected the full table set, got {tables}");
    }
}
