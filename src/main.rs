//! Binary entry point: wires the configured components together and serves
//! the operational surface beside the task runner, the way
//! `bin/route_quality_monitor.rs` serves `/metrics` beside its prober loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Router};
use clap::Parser;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stockwatch_core::blocking::BlockTable;
use stockwatch_core::config::RunnerConfig;
use stockwatch_core::dispatcher::RetailerScanner;
use stockwatch_core::notify::NotificationDispatcher;
use stockwatch_core::proxy::ProxyPool;
use stockwatch_core::retry::RetryPolicy;
use stockwatch_core::runner::TaskRunner;
use stockwatch_core::storage::Storage;

#[derive(Parser, Debug)]
#[command(name = "stockwatch")]
#[command(about = "Periodic retail-stock monitoring engine")]
struct Args {
    /// Operational HTTP port for /healthz and /metrics
    #[arg(short, long, default_value = "8089")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

struct AppState {
    block_table: Arc<BlockTable>,
    proxy_pool: Arc<ProxyPool>,
    runner: Arc<TaskRunner>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting stockwatch");

    let config = RunnerConfig::from_env()?;

    let storage = Storage::open(
        &config.database_path,
        config.db_pool_size,
        Duration::from_secs(config.db_acquire_timeout_seconds),
    )
    .await?;

    let mut proxy_entries = Vec::with_capacity(config.proxy_urls.len());
    for url in &config.proxy_urls {
        let id = storage.upsert_proxy(url).await?;
        proxy_entries.push((id, url.clone()));
    }
    let proxy_pool = Arc::new(ProxyPool::new(
        &proxy_entries,
        Duration::from_secs(config.proxy_quarantine_seconds),
        Duration::from_secs(config.proxy_transient_quarantine_seconds),
    ));

    let block_table = Arc::new(BlockTable::new(
        Duration::from_secs(config.host_quarantine_seconds),
        Duration::from_secs(config.rate_limited_quarantine_seconds),
    ));
    block_table.restore(&storage.active_block_records().await?);

    let notifier = Arc::new(NotificationDispatcher::new(
        Vec::new(),
        config.dedup_capacity,
        Duration::from_secs(config.dedup_window_seconds),
    ));

    // Concrete retailer integrations are a pluggable, out-of-scope layer
    // (spec.md §6, §9 non-goals); this registry starts empty and is meant to
    // be populated by the embedding application before tasks targeting a
    // given retailer become schedulable.
    let scanners: HashMap<String, Arc<dyn RetailerScanner>> = HashMap::new();

    let runner = Arc::new(TaskRunner::new(
        storage,
        proxy_pool.clone(),
        block_table.clone(),
        notifier,
        scanners,
        Vec::new(),
        reqwest::Client::builder()
            .timeout(Duration::from_secs(config.network_timeout_seconds))
            .build()?,
        RetryPolicy::default(),
        config.clone(),
    ));

    let state = Arc::new(AppState {
        block_table: block_table.clone(),
        proxy_pool: proxy_pool.clone(),
        runner: runner.clone(),
    });
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!(%addr, "operational surface listening");
    let http_server = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner_task = tokio::spawn(async move { runner.run(shutdown_rx).await });

    tokio::select! {
        _ = http_server => {
            info!("operational HTTP server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }
    let _ = shutdown_tx.send(true);

    match runner_task.await {
        Ok(Err(err)) => tracing::error!(error = %err, "task runner exited with error"),
        Err(join_err) => tracing::error!(error = %join_err, "task runner panicked"),
        Ok(Ok(())) => info!("task runner stopped cleanly"),
    }

    Ok(())
}

async fn healthz(State(state): State<Arc<AppState>>) -> axum::Json<serde_json::Value> {
    let blocked = state.block_table.snapshot();
    let proxies = state.proxy_pool.stats();
    axum::Json(json!({
        "status": "ok",
        "blocked_hosts": blocked.len(),
        "proxy_count": proxies.len(),
        "in_flight_tasks": state.runner.in_flight_count(),
    }))
}

/// Hand-rolled Prometheus text exposition, following
/// `route_quality/metrics.rs`'s `to_prometheus()` pattern rather than
/// pulling in a metrics crate for a handful of gauges.
async fn metrics(State(state): State<Arc<AppState>>) -> String {
    let blocked = state.block_table.snapshot();
    let proxies = state.proxy_pool.stats();
    let in_use = proxies.iter().filter(|p| p.in_use).count();
    let in_flight = state.runner.in_flight_count();

    format!(
        "# HELP stockwatch_blocked_hosts Currently quarantined hosts\n\
         # TYPE stockwatch_blocked_hosts gauge\n\
         stockwatch_blocked_hosts {}\n\
         # HELP stockwatch_proxies_total Configured proxy endpoints\n\
         # TYPE stockwatch_proxies_total gauge\n\
         stockwatch_proxies_total {}\n\
         # HELP stockwatch_proxies_in_use Proxies currently on loan\n\
         # TYPE stockwatch_proxies_in_use gauge\n\
         stockwatch_proxies_in_use {}\n\
         # HELP stockwatch_tasks_in_flight Tasks currently dispatching\n\
         # TYPE stockwatch_tasks_in_flight gauge\n\
         stockwatch_tasks_in_flight {}\n",
        blocked.len(),
        proxies.len(),
        in_use,
        in_flight,
    )
}
