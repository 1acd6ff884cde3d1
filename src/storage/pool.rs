//! Bounded connection pool (spec.md §4.1, §5).
//!
//! `vault/vault_db.rs` in the teacher wraps a single `rusqlite::Connection`
//! in `Arc<Mutex<Connection>>`. The core needs more than one logical
//! connection in flight (one worker per in-flight task, §5), so this
//! generalizes that pattern into a small fixed-size pool: a deque of idle
//! connections guarded by `parking_lot::Mutex` (short critical sections
//! only — the lock is never held across I/O), gated by a `tokio::sync::Semaphore`
//! so `acquire()` can wait, with a timeout, rather than busy-poll.

use parking_lot::Mutex as SyncMutex;
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::errors::CoreError;

struct PoolInner {
    idle: SyncMutex<VecDeque<Connection>>,
    available: tokio::sync::Semaphore,
}

/// A bounded pool of `rusqlite::Connection`s opened against the same file,
/// each with WAL journaling and `synchronous = NORMAL` so readers are not
/// blocked by a concurrent writer (spec.md §4.1).
#[derive(Clone)]
pub struct DbPool {
    inner: Arc<PoolInner>,
    acquire_timeout: Duration,
}

impl DbPool {
    pub fn open(path: &str, size: usize, acquire_timeout: Duration) -> Result<Self, CoreError> {
        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size.max(1) {
            let conn = Connection::open(path)
                .map_err(|e| CoreError::StorageError(format!("open {path}: {e}")))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| CoreError::StorageError(e.to_string()))?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(|e| CoreError::StorageError(e.to_string()))?;
            conn.pragma_update(None, "foreign_keys", "ON")
                .map_err(|e| CoreError::StorageError(e.to_string()))?;
            idle.push_back(conn);
        }
        let count = idle.len();
        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: SyncMutex::new(idle),
                available: tokio::sync::Semaphore::new(count),
            }),
            acquire_timeout,
        })
    }

    /// Acquire a connection scoped to one logical operation. The connection
    /// is returned to the pool on every exit path, including panics inside
    /// the guard's scope, via `Drop`.
    pub async fn acquire(&self) -> Result<PooledConnection, CoreError> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.inner.available.acquire())
            .await
            .map_err(|_| CoreError::StorageError("db pool acquire timed out".to_string()))?
            .map_err(|_| CoreError::StorageError("db pool closed".to_string()))?;
        permit.forget();

        let conn = self
            .inner
            .idle
            .lock()
            .pop_front()
            .ok_or_else(|| CoreError::StorageError("db pool inconsistent: no idle connection".to_string()))?;

        Ok(PooledConnection {
            conn: Some(conn),
            inner: self.inner.clone(),
        })
    }
}

/// An RAII guard around a pooled connection. Returned to the pool on drop
/// regardless of whether the caller's operation succeeded.
pub struct PooledConnection {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner.idle.lock().push_back(conn);
            self.inner.available.add_permits(1);
        } else {
            warn!("pooled connection dropped with no inner connection");
        }
    }
}
