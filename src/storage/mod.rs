//! Storage component (spec.md §4.1).
//!
//! A bounded pool of SQLite connections (`pool`), an idempotent schema
//! migration run once at startup (`schema`), and narrow CRUD modules per
//! aggregate, mirroring how `vault/vault_db.rs` groups all persistence
//! behind one struct rather than scattering raw SQL through call sites.

mod block_store;
mod pool;
mod product_store;
mod schema;
mod task_store;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::CoreError;
use crate::models::{
    BlockRecord, PriceSnapshot, Product, ProxyEntry, Task, TaskGroup, TaskStatus, TaskWithGroup,
};
pub use pool::DbPool;

/// Converts a `DateTime<Utc>` to the Unix-epoch seconds stored in SQLite,
/// matching `vault/vault_db.rs`'s `ts INTEGER` columns.
pub(crate) fn to_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// The inverse of `to_epoch`. A row written by this crate always round-trips;
/// only a corrupted or hand-edited database can fail here, so we surface it
/// as a `StorageError` rather than panicking.
pub(crate) fn from_epoch(ts: i64) -> Result<DateTime<Utc>, CoreError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| CoreError::StorageError(format!("invalid epoch timestamp: {ts}")))
}

/// Facade over the bounded connection pool and the per-aggregate CRUD
/// modules. Every public method acquires a connection, does its work, and
/// lets the `PooledConnection` guard return it to the pool on drop.
#[derive(Clone)]
pub struct Storage {
    pool: DbPool,
}

impl Storage {
    pub async fn open(
        database_path: &str,
        pool_size: usize,
        acquire_timeout: Duration,
    ) -> Result<Self, CoreError> {
        let pool = DbPool::open(database_path, pool_size, acquire_timeout)?;
        {
            let conn = pool.acquire().await?;
            schema::migrate(&conn)?;
        }
        Ok(Self { pool })
    }

    pub async fn insert_group(
        &self,
        name: &str,
        enabled: bool,
        default_interval_seconds: i64,
        default_zip_code: &str,
    ) -> Result<i64, CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::insert_group(&conn, name, enabled, default_interval_seconds, default_zip_code)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_task(
        &self,
        group_id: i64,
        name: &str,
        retailer: &str,
        query: &str,
        zip_code: Option<&str>,
        interval_seconds: Option<i64>,
        set_name: &str,
    ) -> Result<i64, CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::insert_task(
            &conn,
            group_id,
            name,
            retailer,
            query,
            zip_code,
            interval_seconds,
            set_name,
        )
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::list_tasks(&conn)
    }

    pub async fn list_groups(&self) -> Result<Vec<TaskGroup>, CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::list_groups(&conn)
    }

    pub async fn toggle_group_enabled(&self, group_id: i64, enabled: bool) -> Result<(), CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::toggle_group_enabled(&conn, group_id, enabled)
    }

    pub async fn toggle_task_enabled(&self, task_id: i64, enabled: bool) -> Result<(), CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::toggle_task_enabled(&conn, task_id, enabled)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_task(
        &self,
        task_id: i64,
        name: &str,
        retailer: &str,
        query: &str,
        set_name: &str,
        zip_code: Option<&str>,
        interval_seconds: Option<i64>,
    ) -> Result<(), CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::update_task(&conn, task_id, name, retailer, query, set_name, zip_code, interval_seconds)
    }

    pub async fn list_enabled_tasks_with_groups(&self) -> Result<Vec<TaskWithGroup>, CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::list_enabled_tasks_with_groups(&conn)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<Task>, CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::get_task(&conn, task_id)
    }

    pub async fn get_group(&self, group_id: i64) -> Result<Option<TaskGroup>, CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::get_group(&conn, group_id)
    }

    pub async fn record_task_result(
        &self,
        task_id: i64,
        status: TaskStatus,
        error: Option<&str>,
        new_in_stock_keys: Option<&BTreeSet<String>>,
    ) -> Result<(), CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::record_task_result(&conn, task_id, status, error, new_in_stock_keys)
    }

    pub async fn record_crash_recovery(&self, task_id: i64, error: &str) -> Result<(), CoreError> {
        let conn = self.pool.acquire().await?;
        task_store::record_crash_recovery(&conn, task_id, error)
    }

    pub async fn upsert_product(&self, product: &Product) -> Result<(), CoreError> {
        let conn = self.pool.acquire().await?;
        product_store::upsert_product(&conn, product)
    }

    pub async fn get_product(&self, canonical_key: &str) -> Result<Option<Product>, CoreError> {
        let conn = self.pool.acquire().await?;
        product_store::get_product(&conn, canonical_key)
    }

    pub async fn insert_price_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), CoreError> {
        let conn = self.pool.acquire().await?;
        product_store::insert_price_snapshot(&conn, snapshot)
    }

    pub async fn recent_price_snapshots(
        &self,
        product_key: &str,
        limit: usize,
    ) -> Result<Vec<PriceSnapshot>, CoreError> {
        let conn = self.pool.acquire().await?;
        product_store::recent_price_snapshots(&conn, product_key, limit)
    }

    pub async fn upsert_proxy(&self, url: &str) -> Result<i64, CoreError> {
        let conn = self.pool.acquire().await?;
        block_store::upsert_proxy(&conn, url)
    }

    pub async fn list_proxies(&self) -> Result<Vec<ProxyEntry>, CoreError> {
        let conn = self.pool.acquire().await?;
        block_store::list_proxies(&conn)
    }

    pub async fn record_proxy_outcome(
        &self,
        proxy_id: i64,
        success: bool,
        blocked_until: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let conn = self.pool.acquire().await?;
        block_store::record_proxy_outcome(&conn, proxy_id, success, blocked_until)
    }

    pub async fn insert_block_record(&self, record: &BlockRecord) -> Result<(), CoreError> {
        let conn = self.pool.acquire().await?;
        block_store::insert_block_record(&conn, record)
    }

    pub async fn active_block_records(&self) -> Result<Vec<BlockRecord>, CoreError> {
        let conn = self.pool.acquire().await?;
        block_store::active_block_records(&conn)
    }
}
