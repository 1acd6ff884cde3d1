//! Proxy Pool (spec.md §4.3).

mod pool;

pub use pool::{ProxyHandle, ProxyOutcome, ProxyPool, ProxyReleaseRecord};
