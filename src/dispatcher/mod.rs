//! Retailer Dispatcher (spec.md §4.5).

mod headers;
mod scanner;

pub use scanner::{RawFetch, RetailerScanner};

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::blocking::{classify, BlockTable, Classification, RawResponse};
use crate::config::RunnerConfig;
use crate::errors::CoreError;
use crate::models::Product;
use crate::proxy::{ProxyOutcome, ProxyPool};
use crate::retry::{retry, RetryPolicy};
use crate::storage::Storage;

/// The outcome of one `dispatch` call: the normalized products (empty when
/// blocked or skipped) and the classification the caller should log and
/// fold into task state.
pub struct DispatchOutcome {
    pub products: Vec<Product>,
    pub classification: Classification,
}

/// Runs the per-call algorithm in spec.md §4.5 steps 1-7, plus the optional
/// stock-verification refetch. `prev_in_stock_keys` is the task's prior
/// `last_in_stock_keys`, used only to decide which products need
/// verification (a product already known in-stock does not).
pub async fn dispatch(
    scanner: &dyn RetailerScanner,
    query: &str,
    zip: &str,
    http_client: &reqwest::Client,
    proxy_pool: &ProxyPool,
    block_table: &BlockTable,
    retry_policy: &RetryPolicy,
    config: &RunnerConfig,
    prev_in_stock_keys: &BTreeSet<String>,
    storage: &Storage,
) -> Result<DispatchOutcome, CoreError> {
    let host = scanner.host().to_string();

    // Step 1: skip entirely while the host is quarantined; no network I/O.
    if block_table.is_blocked(&host) {
        return Ok(DispatchOutcome {
            products: Vec::new(),
            classification: Classification::Forbidden,
        });
    }

    // Step 2: borrow a proxy (may be none).
    let proxy = proxy_pool.acquire();

    // Step 3: jitter so two requests never land on the same host back to back.
    let delay = {
        let mut rng = rand::thread_rng();
        rng.gen_range(config.scan_min_delay_seconds..=config.scan_max_delay_seconds)
    };
    tokio::time::sleep(Duration::from_secs_f64(delay)).await;

    // Step 4: a realistic, internally-consistent header set.
    let header_set = headers::random_header_set();

    // Step 5: fetch under retry with the network-only predicate (is_retryable
    // already excludes blocking/parse errors, so this IS the network predicate).
    let proxy_url = proxy.as_ref().map(|p| p.url.as_str());
    let fetch_result = retry(retry_policy, || async {
        scanner.fetch(query, zip, http_client, proxy_url, &header_set).await
    })
    .await;

    let raw = match fetch_result {
        Ok(raw) => raw,
        Err(err) => {
            let (classification, retry_after) = classification_for_dispatch_error(&err);
            if let Some(record) =
                block_table.record_block(&host, proxy.as_ref().map(|p| p.id), classification, retry_after)
            {
                debug!(host = %record.host, reason = record.reason.as_str(), "host quarantined");
                persist_block_record(storage, &record).await;
            }
            if let Some(p) = &proxy {
                let released = proxy_pool.release(p, outcome_for_classification(classification));
                persist_proxy_release(storage, released).await;
            }
            return Ok(DispatchOutcome {
                products: Vec::new(),
                classification,
            });
        }
    };

    // Step 6: classify the successful HTTP exchange.
    let classification = classify(
        &RawResponse {
            timed_out: false,
            status: Some(raw.status),
            body: Some(raw.body.clone()),
            retry_after_secs: raw.retry_after_secs,
        },
        config.suspicious_min_bytes,
    );

    if classification.is_blocking() {
        if let Some(record) =
            block_table.record_block(&host, proxy.as_ref().map(|p| p.id), classification, raw.retry_after_secs)
        {
            debug!(host = %record.host, reason = record.reason.as_str(), "host quarantined");
            persist_block_record(storage, &record).await;
        }
        if let Some(p) = &proxy {
            let released = proxy_pool.release(p, outcome_for_classification(classification));
            persist_proxy_release(storage, released).await;
        }
        return Ok(DispatchOutcome {
            products: Vec::new(),
            classification,
        });
    }

    let mut products = scanner.parse(&raw)?;

    // Stock verification: a product newly reporting in-stock gets one
    // bounded-delay refetch before we trust it (spec.md §4.5).
    for product in products.iter_mut() {
        let key = product.canonical_key();
        if product.in_stock && !prev_in_stock_keys.contains(&key) {
            if !verify_in_stock(scanner, query, zip, http_client, proxy_url, &header_set, &key, config).await {
                warn!(product_key = %key, "stock verification failed, downgrading to out of stock");
                product.in_stock = false;
            }
        }
    }

    if let Some(p) = &proxy {
        let released = proxy_pool.release(p, ProxyOutcome::Success);
        persist_proxy_release(storage, released).await;
    }

    let classification = if products.is_empty() {
        Classification::OkEmpty
    } else {
        classification
    };

    Ok(DispatchOutcome { products, classification })
}

async fn verify_in_stock(
    scanner: &dyn RetailerScanner,
    query: &str,
    zip: &str,
    http_client: &reqwest::Client,
    proxy_url: Option<&str>,
    header_set: &HeaderSet,
    key: &str,
    config: &RunnerConfig,
) -> bool {
    tokio::time::sleep(Duration::from_secs_f64(config.verification_refetch_delay_seconds)).await;

    let Ok(raw) = scanner.fetch(query, zip, http_client, proxy_url, header_set).await else {
        return false;
    };
    let Ok(reparsed) = scanner.parse(&raw) else {
        return false;
    };
    reparsed
        .iter()
        .any(|p| p.canonical_key() == key && p.in_stock)
}

/// Best-effort persistence of an in-memory `BlockTable` entry. A storage
/// failure here must not abort the scan in progress — it only means the
/// next restart's `BlockTable::restore` rehydrates one host late.
async fn persist_block_record(storage: &Storage, record: &crate::models::BlockRecord) {
    if let Err(err) = storage.insert_block_record(record).await {
        warn!(host = %record.host, error = %err, "failed to persist block record");
    }
}

/// Best-effort persistence of a `ProxyPool::release` outcome, same
/// non-fatal treatment as `persist_block_record`.
async fn persist_proxy_release(storage: &Storage, released: Option<crate::proxy::ProxyReleaseRecord>) {
    let Some(record) = released else { return };
    if let Err(err) = storage
        .record_proxy_outcome(record.proxy_id, record.success, record.blocked_until)
        .await
    {
        warn!(proxy_id = record.proxy_id, error = %err, "failed to persist proxy outcome");
    }
}

fn classification_for_dispatch_error(err: &CoreError) -> (Classification, Option<u64>) {
    match err {
        CoreError::RateLimited { retry_after_secs } => (Classification::RateLimited, *retry_after_secs),
        CoreError::Blocked { .. } => (Classification::Forbidden, None),
        CoreError::Challenged { .. } => (Classification::Challenge, None),
        CoreError::TransientNetwork(_) => (Classification::Timeout, None),
        _ => (Classification::ServerError, None),
    }
}

fn outcome_for_classification(classification: Classification) -> ProxyOutcome {
    match classification {
        Classification::Ok | Classification::OkEmpty => ProxyOutcome::Success,
        Classification::Forbidden | Classification::Challenge => ProxyOutcome::Blocked,
        Classification::RateLimited | Classification::ServerError | Classification::Timeout => {
            ProxyOutcome::TransientError
        }
    }
}

pub use headers::{random_header_set, HeaderSet};
