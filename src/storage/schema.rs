//! Idempotent schema migration (spec.md §4.1, §6).
//!
//! Table shapes follow `task_db.py`'s `task_groups`/`tasks` tables in the
//! Python original, translated into the teacher's `rusqlite` idiom
//! (`execute_batch` with `IF NOT EXISTS`, run once at `Storage::open`).
//! Timestamps are stored as Unix-epoch `INTEGER`s, matching
//! `vault/vault_db.rs`'s `ts INTEGER NOT NULL` columns, rather than text.

use rusqlite::Connection;

use crate::errors::CoreError;

pub fn migrate(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS task_groups (
            id                        INTEGER PRIMARY KEY AUTOINCREMENT,
            name                      TEXT NOT NULL UNIQUE,
            enabled                   INTEGER NOT NULL DEFAULT 1,
            default_interval_seconds  INTEGER NOT NULL DEFAULT 300,
            default_zip_code          TEXT NOT NULL DEFAULT '',
            created_at                INTEGER NOT NULL,
            updated_at                INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id           INTEGER NOT NULL REFERENCES task_groups(id) ON DELETE CASCADE,
            name               TEXT NOT NULL,
            enabled            INTEGER NOT NULL DEFAULT 1,
            retailer           TEXT NOT NULL,
            query              TEXT NOT NULL,
            set_name           TEXT NOT NULL DEFAULT '',
            zip_code           TEXT,
            interval_seconds   INTEGER,
            last_run_at        INTEGER,
            last_status        TEXT,
            last_error         TEXT,
            last_in_stock_keys TEXT NOT NULL DEFAULT '[]',
            created_at         INTEGER NOT NULL,
            updated_at         INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_group_id ON tasks(group_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_enabled ON tasks(enabled);
        CREATE INDEX IF NOT EXISTS idx_tasks_last_run_at ON tasks(last_run_at);

        CREATE TABLE IF NOT EXISTS products (
            canonical_key TEXT PRIMARY KEY,
            retailer      TEXT NOT NULL,
            set_name      TEXT NOT NULL DEFAULT '',
            name          TEXT NOT NULL,
            sku           TEXT,
            url           TEXT,
            price         REAL,
            in_stock      INTEGER NOT NULL,
            status_text   TEXT,
            observed_at   INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_products_retailer ON products(retailer);
        CREATE INDEX IF NOT EXISTS idx_products_set_name_retailer ON products(set_name, retailer);

        CREATE TABLE IF NOT EXISTS price_snapshots (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            product_key   TEXT NOT NULL REFERENCES products(canonical_key) ON DELETE CASCADE,
            listed_price  REAL NOT NULL,
            market_price  REAL,
            delta_pct     REAL,
            confidence    REAL,
            created_at    INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_price_snapshots_product_key_created_at
            ON price_snapshots(product_key, created_at);

        CREATE TABLE IF NOT EXISTS proxy_entries (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            url             TEXT NOT NULL UNIQUE,
            success_count   INTEGER NOT NULL DEFAULT 0,
            failure_count   INTEGER NOT NULL DEFAULT 0,
            last_used_at    INTEGER,
            blocked_until   INTEGER
        );

        CREATE TABLE IF NOT EXISTS block_records (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            host          TEXT NOT NULL,
            proxy_id      INTEGER REFERENCES proxy_entries(id) ON DELETE SET NULL,
            reason        TEXT NOT NULL,
            blocked_at    INTEGER NOT NULL,
            blocked_until INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_block_records_host ON block_records(host);
        CREATE INDEX IF NOT EXISTS idx_block_records_blocked_until ON block_records(blocked_until);
        "#,
    )
    .map_err(|e| CoreError::StorageError(format!("migrate: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='tasks'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
