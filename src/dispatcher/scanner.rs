//! The pluggable scanner capability set (spec.md §4.5, §6).
//!
//! Mirrors `vault/execution.rs`'s `ExecutionAdapter` shape: a small
//! `async_trait` seam the dispatcher drives, implemented per retailer
//! outside this crate's scope.

use async_trait::async_trait;

use super::headers::HeaderSet;
use crate::errors::CoreError;
use crate::models::Product;

/// Raw bytes plus enough HTTP metadata for the Blocking Detector to
/// classify the attempt, returned by `RetailerScanner::fetch`.
#[derive(Debug, Clone)]
pub struct RawFetch {
    pub status: u16,
    pub body: String,
    pub retry_after_secs: Option<u64>,
}

/// One retailer integration. Implementations MUST NOT mutate shared state
/// or block indefinitely — they return within the enclosing task deadline
/// (spec.md §6).
#[async_trait]
pub trait RetailerScanner: Send + Sync {
    /// Stable key this scanner answers for, e.g. `"target"`.
    fn retailer(&self) -> &str;

    /// The host dispatched requests land on, used for blocking/quarantine
    /// bookkeeping independent of any single URL.
    fn host(&self) -> &str;

    fn requires_zip(&self) -> bool {
        false
    }

    fn supports_sku_lookup(&self) -> bool {
        false
    }

    async fn fetch(
        &self,
        query: &str,
        zip: &str,
        client: &reqwest::Client,
        proxy_url: Option<&str>,
        headers: &HeaderSet,
    ) -> Result<RawFetch, CoreError>;

    fn parse(&self, raw: &RawFetch) -> Result<Vec<Product>, CoreError>;
}
