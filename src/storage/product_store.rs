//! Product and price-snapshot persistence (spec.md §3, §4.6, §4.7).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{from_epoch, to_epoch};
use crate::errors::CoreError;
use crate::models::{PriceSnapshot, Product};

fn row_to_product(row: &rusqlite::Row) -> rusqlite::Result<Product> {
    Ok(Product {
        retailer: row.get("retailer")?,
        set_name: row.get("set_name")?,
        name: row.get("name")?,
        sku: row.get("sku")?,
        url: row.get("url")?,
        price: row.get("price")?,
        in_stock: row.get::<_, i64>("in_stock")? != 0,
        stock_status_text: row.get("status_text")?,
        observed_at: from_epoch(row.get("observed_at")?).unwrap_or_else(|_| Utc::now()),
    })
}

/// Upserts a product row keyed by `canonical_key`. Last-write-wins on every
/// scan, matching the Transition Engine's read-then-write cycle (spec.md
/// §4.6): the row always reflects the most recent observation.
pub fn upsert_product(conn: &Connection, product: &Product) -> Result<(), CoreError> {
    conn.execute(
        "INSERT INTO products (canonical_key, retailer, set_name, name, sku, url, price, in_stock, status_text, observed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(canonical_key) DO UPDATE SET
            retailer = excluded.retailer,
            set_name = excluded.set_name,
            name = excluded.name,
            sku = excluded.sku,
            url = excluded.url,
            price = excluded.price,
            in_stock = excluded.in_stock,
            status_text = excluded.status_text,
            observed_at = excluded.observed_at",
        params![
            product.canonical_key(),
            product.retailer,
            product.set_name,
            product.name,
            product.sku,
            product.url,
            product.price,
            product.in_stock as i64,
            product.stock_status_text,
            to_epoch(product.observed_at),
        ],
    )
    .map_err(|e| CoreError::StorageError(format!("upsert_product: {e}")))?;
    Ok(())
}

pub fn get_product(conn: &Connection, canonical_key: &str) -> Result<Option<Product>, CoreError> {
    conn.query_row(
        "SELECT * FROM products WHERE canonical_key = ?1",
        params![canonical_key],
        row_to_product,
    )
    .optional()
    .map_err(|e| CoreError::StorageError(e.to_string()))
}

/// Appends a price observation. Never updated, never deleted except by
/// `ON DELETE CASCADE` when the parent product row disappears.
pub fn insert_price_snapshot(conn: &Connection, snapshot: &PriceSnapshot) -> Result<(), CoreError> {
    conn.execute(
        "INSERT INTO price_snapshots (product_key, listed_price, market_price, delta_pct, confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            snapshot.product_key,
            snapshot.listed_price,
            snapshot.market_price,
            snapshot.delta_pct,
            snapshot.confidence,
            to_epoch(snapshot.created_at),
        ],
    )
    .map_err(|e| CoreError::StorageError(format!("insert_price_snapshot: {e}")))?;
    Ok(())
}

pub fn recent_price_snapshots(
    conn: &Connection,
    product_key: &str,
    limit: usize,
) -> Result<Vec<PriceSnapshot>, CoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT product_key, listed_price, market_price, delta_pct, confidence, created_at
             FROM price_snapshots WHERE product_key = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

    let rows = stmt
        .query_map(params![product_key, limit as i64], |row| {
            Ok(PriceSnapshot {
                product_key: row.get(0)?,
                listed_price: row.get(1)?,
                market_price: row.get(2)?,
                delta_pct: row.get(3)?,
                confidence: row.get(4)?,
                created_at: from_epoch(row.get(5)?).unwrap_or_else(|_| Utc::now()),
            })
        })
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::StorageError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::migrate;
    use chrono::Utc;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn
    }

    fn product() -> Product {
        Product {
            retailer: "target".into(),
            set_name: "series-1".into(),
            name: "Widget".into(),
            sku: Some("abc123".into()),
            url: None,
            price: Some(19.99),
            in_stock: true,
            stock_status_text: Some("In Stock".into()),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let conn = setup();
        let p = product();
        upsert_product(&conn, &p).unwrap();
        let fetched = get_product(&conn, &p.canonical_key()).unwrap().unwrap();
        assert_eq!(fetched.name, "Widget");
        assert!(fetched.in_stock);
    }

    #[test]
    fn upsert_overwrites_prior_observation() {
        let conn = setup();
        let mut p = product();
        upsert_product(&conn, &p).unwrap();
        p.in_stock = false;
        p.price = Some(24.99);
        upsert_product(&conn, &p).unwrap();

        let fetched = get_product(&conn, &p.canonical_key()).unwrap().unwrap();
        assert!(!fetched.in_stock);
        assert_eq!(fetched.price, Some(24.99));
    }

    #[test]
    fn price_snapshots_returned_most_recent_first() {
        let conn = setup();
        let snap1 = PriceSnapshot::new("target|abc123".into(), 19.99, Some(20.00));
        insert_price_snapshot(&conn, &snap1).unwrap();
        let snap2 = PriceSnapshot::new("target|abc123".into(), 17.99, Some(20.00));
        insert_price_snapshot(&conn, &snap2).unwrap();

        let recent = recent_price_snapshots(&conn, "target|abc123", 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].listed_price, 17.99);
    }
}
