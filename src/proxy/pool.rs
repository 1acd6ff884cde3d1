//! In-memory proxy rotation and quarantine accounting.
//!
//! Structured like `route_quality/mitigation.rs`'s `CircuitBreaker` map: a
//! small state machine held behind a `parking_lot::RwLock` rather than a
//! database round trip per acquire, because the pool is consulted on every
//! dispatch (spec.md §4.3, §5 "Proxy Pool: mutators are acquire/release;
//! acquisition is fair").

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::debug;

use crate::models::ProxyEntry;

/// A loaned proxy. Dropping it without calling `release` leaks no state —
/// the entry simply stays marked `in_use` until the caller releases it, by
/// design: a crashed worker's proxy is recovered at process restart when
/// the pool is rebuilt from configuration, not by a timeout here.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    pub id: i64,
    pub url: String,
}

/// The outcome a caller reports back through `release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    Blocked,
    TransientError,
}

/// What changed in a proxy's operational record as of one `release` call,
/// for the caller to persist through `Storage::record_proxy_outcome`
/// (spec.md §3, "Proxy Pool exclusively mutates ProxyEntry operational
/// fields" — persistence is the caller's job, the in-memory pool is the
/// source of truth while the process is up).
#[derive(Debug, Clone, Copy)]
pub struct ProxyReleaseRecord {
    pub proxy_id: i64,
    pub success: bool,
    pub blocked_until: Option<DateTime<Utc>>,
}

struct ProxyState {
    id: i64,
    url: String,
    in_use: bool,
    blocked_until: Option<DateTime<Utc>>,
    success_count: u64,
    failure_count: u64,
    last_used_at: Option<DateTime<Utc>>,
    consecutive_transient: u32,
}

pub struct ProxyPool {
    entries: RwLock<Vec<ProxyState>>,
    quarantine: Duration,
    transient_quarantine: Duration,
}

impl ProxyPool {
    /// `entries` are `(id, url)` pairs, expected to be the rows
    /// `Storage::upsert_proxy` already persisted — keeping the in-memory
    /// `id` aligned with the `proxy_entries.id` the caller will later write
    /// `record_proxy_outcome`/`insert_block_record` rows against.
    pub fn new(entries: &[(i64, String)], quarantine: Duration, transient_quarantine: Duration) -> Self {
        let entries = entries
            .iter()
            .map(|(id, url)| ProxyState {
                id: *id,
                url: url.clone(),
                in_use: false,
                blocked_until: None,
                success_count: 0,
                failure_count: 0,
                last_used_at: None,
                consecutive_transient: 0,
            })
            .collect();
        Self {
            entries: RwLock::new(entries),
            quarantine,
            transient_quarantine,
        }
    }

    /// Selects the least-recently-used proxy not currently quarantined or
    /// in use. LRU selection alone satisfies the rotation guarantee (§4.3):
    /// the just-acquired entry's `last_used_at` becomes the newest, so it
    /// cannot be picked again while any other eligible entry exists.
    /// Returns `None` when the pool is empty or every entry is unavailable
    /// — the caller proceeds without a proxy.
    pub fn acquire(&self) -> Option<ProxyHandle> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let pick = entries
            .iter_mut()
            .filter(|e| !e.in_use && e.blocked_until.map(|b| b <= now).unwrap_or(true))
            .min_by_key(|e| e.last_used_at.unwrap_or(DateTime::<Utc>::MIN_UTC))?;

        pick.in_use = true;
        pick.last_used_at = Some(now);
        Some(ProxyHandle {
            id: pick.id,
            url: pick.url.clone(),
        })
    }

    /// Records the outcome of a proxy use and returns it to the available
    /// set. Three consecutive `TransientError`s without an intervening
    /// success earn a shorter quarantine than an explicit `Blocked` (§4.3).
    /// Returns `None` if `handle` no longer names a known entry.
    pub fn release(&self, handle: &ProxyHandle, outcome: ProxyOutcome) -> Option<ProxyReleaseRecord> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let entry = entries.iter_mut().find(|e| e.id == handle.id)?;
        entry.in_use = false;
        match outcome {
            ProxyOutcome::Success => {
                entry.success_count += 1;
                entry.consecutive_transient = 0;
            }
            ProxyOutcome::Blocked => {
                entry.failure_count += 1;
                entry.consecutive_transient = 0;
                entry.blocked_until = Some(now + self.quarantine);
                debug!(proxy_id = entry.id, "proxy quarantined: blocked");
            }
            ProxyOutcome::TransientError => {
                entry.failure_count += 1;
                entry.consecutive_transient += 1;
                if entry.consecutive_transient >= 3 {
                    entry.blocked_until = Some(now + self.transient_quarantine);
                    entry.consecutive_transient = 0;
                    debug!(proxy_id = entry.id, "proxy quarantined: transient run");
                }
            }
        }
        Some(ProxyReleaseRecord {
            proxy_id: entry.id,
            success: outcome == ProxyOutcome::Success,
            blocked_until: entry.blocked_until,
        })
    }

    pub fn stats(&self) -> Vec<ProxyEntry> {
        self.entries
            .read()
            .iter()
            .map(|e| ProxyEntry {
                id: e.id,
                url: e.url.clone(),
                in_use: e.in_use,
                blocked_until: e.blocked_until,
                success_count: e.success_count,
                failure_count: e.failure_count,
                last_used_at: e.last_used_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> ProxyPool {
        let entries: Vec<(i64, String)> = (0..n)
            .map(|i| (i as i64 + 1, format!("http://proxy-{i}:8080")))
            .collect();
        ProxyPool::new(&entries, Duration::from_secs(1800), Duration::from_secs(300))
    }

    #[test]
    fn rotation_guarantee_returns_distinct_proxies() {
        let p = pool(2);
        let a = p.acquire().unwrap();
        p.release(&a, ProxyOutcome::Success);
        let b = p.acquire().unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn blocked_outcome_quarantines_entry() {
        let p = pool(1);
        let a = p.acquire().unwrap();
        p.release(&a, ProxyOutcome::Blocked);
        assert!(p.acquire().is_none());
    }

    #[test]
    fn three_consecutive_transients_quarantine() {
        let p = pool(1);
        for _ in 0..2 {
            let h = p.acquire().unwrap();
            p.release(&h, ProxyOutcome::TransientError);
        }
        assert!(p.acquire().is_some());
        let h = p.acquire().unwrap();
        p.release(&h, ProxyOutcome::TransientError);
        assert!(p.acquire().is_none());
    }

    #[test]
    fn success_resets_transient_counter() {
        let p = pool(1);
        for _ in 0..2 {
            let h = p.acquire().unwrap();
            p.release(&h, ProxyOutcome::TransientError);
        }
        let h = p.acquire().unwrap();
        p.release(&h, ProxyOutcome::Success);
        for _ in 0..2 {
            let h = p.acquire().unwrap();
            p.release(&h, ProxyOutcome::TransientError);
        }
        assert!(p.acquire().is_some());
    }

    #[test]
    fn empty_pool_returns_none() {
        let p = pool(0);
        assert!(p.acquire().is_none());
    }
}
