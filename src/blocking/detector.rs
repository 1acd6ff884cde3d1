//! Response classification and per-host quarantine (spec.md §4.4).
//!
//! The quarantine table follows `middleware/rate_limit.rs`'s per-key sliding
//! window exactly — a single `parking_lot::Mutex<HashMap<String, _>>` rather
//! than a sharded structure, since all host lookups are O(1) map operations
//! and a single lock already satisfies "single-writer per host" (spec.md §5).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::models::{BlockReason, BlockRecord};

/// What the caller observed for one HTTP attempt, enough for `classify` to
/// decide without reaching back into the HTTP client.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub timed_out: bool,
    pub status: Option<u16>,
    pub body: Option<String>,
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Ok,
    OkEmpty,
    RateLimited,
    Forbidden,
    Challenge,
    ServerError,
    Timeout,
}

impl Classification {
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Classification::RateLimited
                | Classification::Forbidden
                | Classification::Challenge
                | Classification::ServerError
                | Classification::Timeout
        )
    }
}

const CHALLENGE_MARKERS: &[&str] = &[
    "checking your browser",
    "cf-challenge",
    "cloudflare",
    "captcha",
    "recaptcha",
    "hcaptcha",
    "access denied",
    "are you a robot",
    "i'm not a robot",
];

/// Generic product-page content markers. A body under `suspicious_min_bytes`
/// that contains none of these looks like an interstitial rather than a
/// real listing (spec.md §4.4 rule 6).
const EXPECTED_CONTENT_MARKERS: &[&str] = &["price", "in stock", "out of stock", "add to cart", "$"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

/// Classifies one raw HTTP attempt per the eight ordered rules in spec.md
/// §4.4. `ok_empty` is not decided here — it depends on the parsed product
/// list, which the detector never sees — callers should downgrade `Ok` to
/// `OkEmpty` themselves via [`Classification::OkEmpty`] once parsing
/// produces zero results.
pub fn classify(response: &RawResponse, suspicious_min_bytes: usize) -> Classification {
    if response.timed_out {
        return Classification::Timeout;
    }
    match response.status {
        Some(429) => return Classification::RateLimited,
        Some(403) => return Classification::Forbidden,
        Some(503) => {
            if response
                .body
                .as_deref()
                .map(|b| contains_any(b, CHALLENGE_MARKERS))
                .unwrap_or(false)
            {
                return Classification::Challenge;
            }
            return Classification::ServerError;
        }
        Some(s) if (500..600).contains(&s) => return Classification::ServerError,
        Some(200) => {
            let body = response.body.as_deref().unwrap_or("");
            if body.len() < suspicious_min_bytes && !contains_any(body, EXPECTED_CONTENT_MARKERS) {
                return Classification::Challenge;
            }
            if contains_any(body, CHALLENGE_MARKERS) {
                return Classification::Challenge;
            }
            return Classification::Ok;
        }
        _ => {}
    }
    Classification::Ok
}

struct HostState {
    blocked_until: Option<DateTime<Utc>>,
    reason: Option<BlockReason>,
    transient_hits: Vec<DateTime<Utc>>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            blocked_until: None,
            reason: None,
            transient_hits: Vec::new(),
        }
    }
}

/// Per-host quarantine table, rehydrated from `Storage::active_block_records`
/// on startup so a restart does not forget an in-progress cool-down.
pub struct BlockTable {
    hosts: Mutex<HashMap<String, HostState>>,
    host_quarantine: Duration,
    rate_limited_quarantine: Duration,
    transient_quarantine: Duration,
    transient_window: Duration,
}

impl BlockTable {
    pub fn new(host_quarantine: Duration, rate_limited_quarantine: Duration) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            host_quarantine,
            rate_limited_quarantine,
            transient_quarantine: Duration::from_secs(15 * 60),
            transient_window: Duration::from_secs(10 * 60),
        }
    }

    pub fn restore(&self, records: &[BlockRecord]) {
        let mut hosts = self.hosts.lock();
        for r in records {
            let entry = hosts.entry(r.host.clone()).or_default();
            if entry.blocked_until.map(|b| r.blocked_until > b).unwrap_or(true) {
                entry.blocked_until = Some(r.blocked_until);
                entry.reason = Some(r.reason);
            }
        }
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        let hosts = self.hosts.lock();
        hosts
            .get(host)
            .and_then(|s| s.blocked_until)
            .map(|b| b > Utc::now())
            .unwrap_or(false)
    }

    /// Applies the cool-down policy for `classification` and returns the
    /// `BlockRecord` to persist, if the classification warrants a quarantine.
    /// `proxy_id` is recorded alongside the host when a proxy was in use.
    pub fn record_block(
        &self,
        host: &str,
        proxy_id: Option<i64>,
        classification: Classification,
        retry_after_secs: Option<u64>,
    ) -> Option<BlockRecord> {
        let now = Utc::now();
        let mut hosts = self.hosts.lock();
        let entry = hosts.entry(host.to_string()).or_default();

        let (reason, until) = match classification {
            Classification::RateLimited => (
                BlockReason::RateLimited,
                now + retry_after_secs
                    .map(|s| ChronoDuration::seconds(s as i64))
                    .unwrap_or_else(|| ChronoDuration::from_std(self.rate_limited_quarantine).unwrap()),
            ),
            Classification::Forbidden => (
                BlockReason::Forbidden,
                now + ChronoDuration::from_std(self.host_quarantine).unwrap(),
            ),
            Classification::Challenge => (
                BlockReason::Challenge,
                now + ChronoDuration::from_std(self.host_quarantine).unwrap(),
            ),
            Classification::Timeout | Classification::ServerError => {
                entry.transient_hits.push(now);
                let window_start = now - ChronoDuration::from_std(self.transient_window).unwrap();
                entry.transient_hits.retain(|t| *t >= window_start);
                if entry.transient_hits.len() < 3 {
                    return None;
                }
                entry.transient_hits.clear();
                let reason = if classification == Classification::Timeout {
                    BlockReason::Timeout
                } else {
                    BlockReason::ServerError
                };
                (reason, now + ChronoDuration::from_std(self.transient_quarantine).unwrap())
            }
            Classification::Ok | Classification::OkEmpty => return None,
        };

        entry.blocked_until = Some(until);
        entry.reason = Some(reason);

        Some(BlockRecord {
            host: host.to_string(),
            proxy_id,
            blocked_at: now,
            blocked_until: until,
            reason,
        })
    }

    /// Drops expired entries so the table does not grow unbounded across a
    /// long-running process. Safe to call on any cadence; an expired entry
    /// is already indistinguishable from "never blocked" to `is_blocked`.
    pub fn sweep_expired(&self) {
        let now = Utc::now();
        self.hosts
            .lock()
            .retain(|_, s| s.blocked_until.map(|b| b > now).unwrap_or(false));
    }

    /// A point-in-time view of every host currently under quarantine, for
    /// operator inspection.
    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>, BlockReason)> {
        let now = Utc::now();
        self.hosts
            .lock()
            .iter()
            .filter_map(|(host, s)| {
                let until = s.blocked_until.filter(|b| *b > now)?;
                Some((host.clone(), until, s.reason.unwrap_or(BlockReason::Timeout)))
            })
            .collect()
    }
}
