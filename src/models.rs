//! Data model (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named container defining per-task defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub default_interval_seconds: i64,
    pub default_zip_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Implementation-defined constant used when neither the task nor its group
/// supplies a zip code (spec.md §3, "effective zip").
pub const DEFAULT_ZIP_CODE: &str = "90210";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Ok,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Ok => "ok",
            TaskStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(TaskStatus::Idle),
            "running" => Some(TaskStatus::Running),
            "ok" => Some(TaskStatus::Ok),
            "error" => Some(TaskStatus::Error),
            _ => None,
        }
    }
}

/// One recurring scan job bound to a retailer+query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub group_id: i64,
    pub name: String,
    pub enabled: bool,
    pub retailer: String,
    pub query: String,
    /// Collectible set this task scans within, e.g. a trading-card release
    /// name. Opaque to the core; stamped onto every `Product` it produces
    /// so storage can index and dedup by (set, retailer) (spec.md §4.1,
    /// §6). Empty string when the retailer has no set concept.
    pub set_name: String,
    pub zip_code: Option<String>,
    pub interval_seconds: Option<i64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<TaskStatus>,
    pub last_error: Option<String>,
    pub last_in_stock_keys: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task joined with its group's defaults, as returned by
/// `Storage::list_enabled_tasks_with_groups`.
#[derive(Debug, Clone)]
pub struct TaskWithGroup {
    pub task: Task,
    pub group_enabled: bool,
    pub group_default_interval_seconds: i64,
    pub group_default_zip_code: String,
}

impl TaskWithGroup {
    /// `effective_enabled` = task.enabled AND group.enabled.
    pub fn effective_enabled(&self) -> bool {
        self.task.enabled && self.group_enabled
    }

    /// `effective_interval` = task override else group default.
    pub fn effective_interval_seconds(&self) -> i64 {
        self.task
            .interval_seconds
            .unwrap_or(self.group_default_interval_seconds)
    }

    /// `effective_zip` = task override else group default else the
    /// implementation-defined constant.
    pub fn effective_zip(&self) -> &str {
        self.task
            .zip_code
            .as_deref()
            .filter(|z| !z.is_empty())
            .unwrap_or(
                if self.group_default_zip_code.is_empty() {
                    DEFAULT_ZIP_CODE
                } else {
                    &self.group_default_zip_code
                },
            )
    }
}

/// A normalized listing as returned by a `RetailerScanner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub retailer: String,
    /// The collectible set this listing belongs to, stamped from the
    /// owning `Task::set_name` (spec.md §4.1 "Product by (set, retailer)",
    /// §6 schema). Not part of `canonical_key`.
    pub set_name: String,
    pub name: String,
    pub sku: Option<String>,
    pub url: Option<String>,
    pub price: Option<f64>,
    pub in_stock: bool,
    pub stock_status_text: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl Product {
    /// `lowercase(retailer) | (sku OR url OR name)` — stable across scans
    /// for the same listing. Matches `_product_key` in the Python original
    /// (`agents/tasks/runner.py`).
    pub fn canonical_key(&self) -> String {
        let retailer = self.retailer.trim().to_lowercase();
        let ident = self
            .sku
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| self.url.as_deref().map(str::trim).filter(|s| !s.is_empty()))
            .unwrap_or_else(|| self.name.trim());
        format!("{retailer}|{ident}")
    }
}

/// An append-only price observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub product_key: String,
    pub listed_price: f64,
    pub market_price: Option<f64>,
    pub delta_pct: Option<f64>,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl PriceSnapshot {
    pub fn new(product_key: String, listed_price: f64, market_price: Option<f64>) -> Self {
        let delta_pct = market_price
            .filter(|m| *m != 0.0)
            .map(|m| (listed_price - m) / m);
        Self {
            product_key,
            listed_price,
            market_price,
            delta_pct,
            confidence: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// A subscriber's watch criteria (spec.md §3, §4.7). The core only
/// implements matching; delivery transports are pluggable (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub item_match: String,
    pub target_price: Option<f64>,
    pub notify_on_stock: bool,
    pub locale: Option<String>,
}

/// A point-in-time operational record for one proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEntry {
    pub id: i64,
    pub url: String,
    pub in_use: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Reason a host or (host, proxy) pair was quarantined (spec.md §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RateLimited,
    Forbidden,
    Challenge,
    ServerError,
    Timeout,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::RateLimited => "rate_limited",
            BlockReason::Forbidden => "forbidden",
            BlockReason::Challenge => "challenge",
            BlockReason::ServerError => "server_error",
            BlockReason::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub host: String,
    pub proxy_id: Option<i64>,
    pub blocked_at: DateTime<Utc>,
    pub blocked_until: DateTime<Utc>,
    pub reason: BlockReason,
}

/// The kinds of transition events the engine (spec.md §4.6) can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewInStock,
    LostStock,
    PriceChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewInStock => "new_in_stock",
            EventKind::LostStock => "lost_stock",
            EventKind::PriceChanged => "price_changed",
        }
    }
}

/// Language-neutral event payload shape (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockEvent {
    pub kind: EventKind,
    pub retailer: String,
    pub product_key: String,
    pub product_name: String,
    pub url: Option<String>,
    pub price: Option<f64>,
    pub market_price: Option<f64>,
    pub delta_pct: Option<f64>,
    pub observed_at: DateTime<Utc>,
    pub source_task_id: i64,
}
