//! Proxy and block-record persistence (spec.md §3, §4.3, §4.4).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{from_epoch, to_epoch};
use crate::errors::CoreError;
use crate::models::{BlockRecord, BlockReason, ProxyEntry};

fn parse_reason(s: &str) -> BlockReason {
    match s {
        "rate_limited" => BlockReason::RateLimited,
        "forbidden" => BlockReason::Forbidden,
        "challenge" => BlockReason::Challenge,
        "server_error" => BlockReason::ServerError,
        _ => BlockReason::Timeout,
    }
}

pub fn upsert_proxy(conn: &Connection, url: &str) -> Result<i64, CoreError> {
    conn.execute(
        "INSERT INTO proxy_entries (url) VALUES (?1)
         ON CONFLICT(url) DO UPDATE SET url = excluded.url",
        params![url],
    )
    .map_err(|e| CoreError::StorageError(format!("upsert_proxy: {e}")))?;
    conn.query_row("SELECT id FROM proxy_entries WHERE url = ?1", params![url], |r| r.get(0))
        .map_err(|e| CoreError::StorageError(e.to_string()))
}

pub fn list_proxies(conn: &Connection) -> Result<Vec<ProxyEntry>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM proxy_entries")
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

    let rows = stmt
        .query_map([], |row| {
            let last_used_at: Option<i64> = row.get("last_used_at")?;
            let blocked_until: Option<i64> = row.get("blocked_until")?;
            Ok(ProxyEntry {
                id: row.get("id")?,
                url: row.get("url")?,
                in_use: false,
                blocked_until: blocked_until.and_then(|ts| from_epoch(ts).ok()),
                success_count: row.get::<_, i64>("success_count")? as u64,
                failure_count: row.get::<_, i64>("failure_count")? as u64,
                last_used_at: last_used_at.and_then(|ts| from_epoch(ts).ok()),
            })
        })
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::StorageError(e.to_string()))
}

/// Records the outcome of one use of a proxy: bumps the success/failure
/// counter and, on failure, optionally sets a quarantine deadline.
pub fn record_proxy_outcome(
    conn: &Connection,
    proxy_id: i64,
    success: bool,
    blocked_until: Option<DateTime<Utc>>,
) -> Result<(), CoreError> {
    let now = to_epoch(Utc::now());
    let blocked_until_epoch = blocked_until.map(to_epoch);
    if success {
        conn.execute(
            "UPDATE proxy_entries SET success_count = success_count + 1, last_used_at = ?1 WHERE id = ?2",
            params![now, proxy_id],
        )
    } else {
        conn.execute(
            "UPDATE proxy_entries SET failure_count = failure_count + 1, last_used_at = ?1,
                    blocked_until = COALESCE(?2, blocked_until)
             WHERE id = ?3",
            params![now, blocked_until_epoch, proxy_id],
        )
    }
    .map_err(|e| CoreError::StorageError(format!("record_proxy_outcome: {e}")))?;
    Ok(())
}

pub fn insert_block_record(conn: &Connection, record: &BlockRecord) -> Result<(), CoreError> {
    conn.execute(
        "INSERT INTO block_records (host, proxy_id, reason, blocked_at, blocked_until)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.host,
            record.proxy_id,
            record.reason.as_str(),
            to_epoch(record.blocked_at),
            to_epoch(record.blocked_until),
        ],
    )
    .map_err(|e| CoreError::StorageError(format!("insert_block_record: {e}")))?;
    Ok(())
}

/// Block records whose quarantine window has not yet elapsed, used to
/// rehydrate `BlockTable` on process restart (spec.md §4.4, §4.8).
pub fn active_block_records(conn: &Connection) -> Result<Vec<BlockRecord>, CoreError> {
    let now = to_epoch(Utc::now());
    let mut stmt = conn
        .prepare("SELECT * FROM block_records WHERE blocked_until > ?1")
        .map_err(|e| CoreError::StorageError(e.to_string()))?;

    let rows = stmt
        .query_map(params![now], |row| {
            let reason: String = row.get("reason")?;
            Ok(BlockRecord {
                host: row.get("host")?,
                proxy_id: row.get("proxy_id")?,
                blocked_at: from_epoch(row.get("blocked_at")?).unwrap_or_else(|_| Utc::now()),
                blocked_until: from_epoch(row.get("blocked_until")?).unwrap_or_else(|_| Utc::now()),
                reason: parse_reason(&reason),
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
    use chrono::Duration as ChronoDuration;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn upsert_proxy_is_idempotent_by_url() {
        let conn = setup();
        let a = upsert_proxy(&conn, "http://proxy-1:8080").unwrap();
        let b = upsert_proxy(&conn, "http://proxy-1:8080").unwrap();
        assert_eq!(a, b);
        assert_eq!(list_proxies(&conn).unwrap().len(), 1);
    }

    #[test]
    fn block_record_expires_out_of_active_set() {
        let conn = setup();
        let now = Utc::now();
        let expired = BlockRecord {
            host: "target.com".into(),
            proxy_id: None,
            blocked_at: now - ChronoDuration::hours(2),
            blocked_until: now - ChronoDuration::hours(1),
            reason: BlockReason::RateLimited,
        };
        let active = BlockRecord {
            host: "walmart.com".into(),
            proxy_id: None,
            blocked_at: now,
            blocked_until: now + ChronoDuration::hours(1),
            reason: BlockReason::Forbidden,
        };
        insert_block_record(&conn, &expired).unwrap();
        insert_block_record(&conn, &active).unwrap();

        let active_records = active_block_records(&conn).unwrap();
        assert_eq!(active_records.len(), 1);
        assert_eq!(active_records[0].host, "walmart.com");
    }
}
