//! Task Runner (spec.md §4.8, §5).
//!
//! The supervisor loop: a fixed-cadence tick (`route_quality/prober.rs`'s
//! `tokio::select!`-over-intervals shape, collapsed to one interval since
//! the runner has a single wake cadence rather than several probe kinds)
//! that selects due tasks, bounds how many run concurrently with a
//! `Semaphore`, and drives each through dispatch -> transition -> notify.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::blocking::BlockTable;
use crate::config::RunnerConfig;
use crate::dispatcher::{dispatch, RetailerScanner};
use crate::errors::CoreError;
use crate::models::{Subscription, Task, TaskStatus, TaskWithGroup};
use crate::notify::NotificationDispatcher;
use crate::proxy::ProxyPool;
use crate::retry::RetryPolicy;
use crate::storage::Storage;
use crate::transition::reconcile;

/// How overdue a task must be, as a multiple of its own effective interval,
/// before it jumps ahead of the normal FIFO ordering (spec.md §4.8,
/// "starvation promotion").
const STARVATION_FACTOR: i64 = 3;

/// Upper bound on how long shutdown waits for in-flight workers to finish
/// before abandoning them (spec.md §5, "cancellation and timeouts").
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct DueTask {
    with_group: TaskWithGroup,
    promoted: bool,
    staleness: i64,
}

/// Owns every shared component the pipeline needs and runs the scheduling
/// loop. Construct once per process; `run` takes ownership via `Arc` so
/// spawned workers can hold a clone.
pub struct TaskRunner {
    storage: Storage,
    proxy_pool: Arc<ProxyPool>,
    block_table: Arc<BlockTable>,
    notifier: Arc<NotificationDispatcher>,
    scanners: HashMap<String, Arc<dyn RetailerScanner>>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    http_client: reqwest::Client,
    retry_policy: RetryPolicy,
    config: RunnerConfig,
    in_flight: Arc<Mutex<HashSet<i64>>>,
    semaphore: Arc<Semaphore>,
}

impl TaskRunner {
    pub fn new(
        storage: Storage,
        proxy_pool: Arc<ProxyPool>,
        block_table: Arc<BlockTable>,
        notifier: Arc<NotificationDispatcher>,
        scanners: HashMap<String, Arc<dyn RetailerScanner>>,
        subscriptions: Vec<Subscription>,
        http_client: reqwest::Client,
        retry_policy: RetryPolicy,
        config: RunnerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        Self {
            storage,
            proxy_pool,
            block_table,
            notifier,
            scanners,
            subscriptions: Arc::new(RwLock::new(subscriptions)),
            http_client,
            retry_policy,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            semaphore,
        }
    }

    pub fn set_subscriptions(&self, subscriptions: Vec<Subscription>) {
        *self.subscriptions.write() = subscriptions;
    }

    /// Number of tasks currently past dispatch/transition/notify and not yet
    /// settled, for the operational surface (SPEC_FULL.md §10.6).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Runs until `shutdown` reports `true`, then drains in-flight workers
    /// under `SHUTDOWN_JOIN_TIMEOUT` before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        self.reconcile_crashed_tasks().await?;

        let mut ticker = tokio::time::interval(Duration::from_secs_f64(
            self.config.loop_sleep_seconds.max(0.01),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.block_table.sweep_expired();
                    if let Err(err) = self.schedule_due_tasks(&mut workers).await {
                        warn!(error = %err, "failed to list due tasks this tick");
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(join_err) = joined {
                        if join_err.is_panic() {
                            error!(error = %join_err, "worker task panicked");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(pending = workers.len(), "stopping: waiting for in-flight tasks");
        let drained = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown join timeout elapsed, abandoning in-flight tasks");
            workers.abort_all();
        }
        Ok(())
    }

    /// A crashed process can leave a task's `last_status` as `running`. On
    /// startup those are immediately eligible again, recorded as an error so
    /// the crash is visible in task history (spec.md §4.8, "crash recovery").
    async fn reconcile_crashed_tasks(&self) -> Result<(), CoreError> {
        let tasks = self.storage.list_enabled_tasks_with_groups().await?;
        for t in tasks {
            if t.task.last_status == Some(TaskStatus::Running) {
                warn!(task_id = t.task.id, "recovering task stuck in running state after restart");
                self.storage
                    .record_crash_recovery(t.task.id, "recovered after crash")
                    .await?;
            }
        }
        Ok(())
    }

    /// Selects due, effectively-enabled, not-already-in-flight tasks,
    /// orders them per spec.md §4.8 (starved tasks first, then FIFO by
    /// `last_run_at` with nulls first), and spawns one worker per task up
    /// to however many permits `semaphore` currently has free.
    async fn schedule_due_tasks(&self, workers: &mut JoinSet<()>) -> Result<(), CoreError> {
        let now = Utc::now();
        let candidates = self.storage.list_enabled_tasks_with_groups().await?;

        let mut due: Vec<DueTask> = {
            let in_flight = self.in_flight.lock();
            candidates
                .into_iter()
                .filter(|t| t.effective_enabled() && !in_flight.contains(&t.task.id))
                .filter_map(|t| due_task(t, now))
                .collect()
        };

        due.sort_by(|a, b| {
            b.promoted
                .cmp(&a.promoted)
                .then(b.staleness.cmp(&a.staleness))
        });

        for candidate in due {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            let task_id = candidate.with_group.task.id;
            self.in_flight.lock().insert(task_id);

            let storage = self.storage.clone();
            let proxy_pool = self.proxy_pool.clone();
            let block_table = self.block_table.clone();
            let notifier = self.notifier.clone();
            let scanners = self.scanners.clone();
            let subscriptions = self.subscriptions.clone();
            let http_client = self.http_client.clone();
            let retry_policy = self.retry_policy.clone();
            let config = self.config.clone();
            let in_flight = self.in_flight.clone();

            workers.spawn(async move {
                let _permit = permit;
                run_one_task(
                    candidate.with_group,
                    &storage,
                    &proxy_pool,
                    &block_table,
                    &notifier,
                    &scanners,
                    &subscriptions,
                    &http_client,
                    &retry_policy,
                    &config,
                )
                .await;
                in_flight.lock().remove(&task_id);
            });
        }

        Ok(())
    }
}

fn due_task(with_group: TaskWithGroup, now: chrono::DateTime<Utc>) -> Option<DueTask> {
    let interval = with_group.effective_interval_seconds().max(1);
    let staleness = match with_group.task.last_run_at {
        None => i64::MAX,
        Some(last) => now.signed_duration_since(last).num_seconds(),
    };
    if staleness < interval {
        return None;
    }
    let promoted = staleness != i64::MAX && staleness >= interval * STARVATION_FACTOR;
    Some(DueTask { with_group, promoted, staleness })
}

/// One full pipeline run for a single task: fetch -> classify -> reconcile
/// -> notify -> persist. Every exit path records a terminal `TaskStatus`
/// (spec.md §4.8, "idle -> running -> {ok|error} -> idle"), including the
/// deadline-exceeded and missing-scanner cases.
#[allow(clippy::too_many_arguments)]
async fn run_one_task(
    with_group: TaskWithGroup,
    storage: &Storage,
    proxy_pool: &ProxyPool,
    block_table: &BlockTable,
    notifier: &NotificationDispatcher,
    scanners: &HashMap<String, Arc<dyn RetailerScanner>>,
    subscriptions: &RwLock<Vec<Subscription>>,
    http_client: &reqwest::Client,
    retry_policy: &RetryPolicy,
    config: &RunnerConfig,
) {
    let task = &with_group.task;
    // Captured before the `running` transition, which stamps `last_run_at`
    // to now on every status (including `running`) and would otherwise mask
    // "never run before" once read back.
    let is_first_scan = task.last_run_at.is_none();

    if let Err(err) = storage.record_task_result(task.id, TaskStatus::Running, None, None).await {
        error!(task_id = task.id, error = %err, "failed to mark task running");
        return;
    }

    let Some(scanner) = scanners.get(&task.retailer).cloned() else {
        let msg = format!("no scanner registered for retailer '{}'", task.retailer);
        error!(task_id = task.id, %msg);
        let _ = storage.record_task_result(task.id, TaskStatus::Error, Some(&msg), None).await;
        return;
    };

    let deadline = Duration::from_secs_f64(
        (with_group.effective_interval_seconds() as f64).min(config.max_task_deadline_seconds as f64),
    );

    let zip = with_group.effective_zip().to_string();
    let prev_keys = task.last_in_stock_keys.clone();

    let outcome = tokio::time::timeout(
        deadline,
        run_task_body(
            task.id,
            scanner.as_ref(),
            &task.query,
            &zip,
            &task.set_name,
            &prev_keys,
            is_first_scan,
            storage,
            proxy_pool,
            block_table,
            notifier,
            subscriptions,
            http_client,
            retry_policy,
            config,
        ),
    )
    .await;

    match outcome {
        Ok(Ok(new_keys)) => {
            if let Err(err) = storage
                .record_task_result(task.id, TaskStatus::Ok, None, Some(&new_keys))
                .await
            {
                error!(task_id = task.id, error = %err, "failed to persist task result");
            }
        }
        Ok(Err(err)) => {
            warn!(task_id = task.id, error = %err, "task run failed");
            let _ = storage
                .record_task_result(task.id, TaskStatus::Error, Some(&err.to_string()), None)
                .await;
        }
        Err(_) => {
            warn!(task_id = task.id, "task deadline exceeded");
            let _ = storage
                .record_task_result(task.id, TaskStatus::Error, Some("deadline_exceeded"), None)
                .await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task_body(
    task_id: i64,
    scanner: &dyn RetailerScanner,
    query: &str,
    zip: &str,
    set_name: &str,
    prev_keys: &BTreeSet<String>,
    is_first_scan: bool,
    storage: &Storage,
    proxy_pool: &ProxyPool,
    block_table: &BlockTable,
    notifier: &NotificationDispatcher,
    subscriptions: &RwLock<Vec<Subscription>>,
    http_client: &reqwest::Client,
    retry_policy: &RetryPolicy,
    config: &RunnerConfig,
) -> Result<BTreeSet<String>, CoreError> {
    let mut outcome = dispatch(
        scanner,
        query,
        zip,
        http_client,
        proxy_pool,
        block_table,
        retry_policy,
        config,
        prev_keys,
        storage,
    )
    .await?;

    if outcome.classification.is_blocking() {
        // Host is under quarantine or the attempt failed; carry the prior
        // in-stock set forward untouched rather than reconciling against an
        // empty scan, which would spuriously fire `lost_stock` for every key.
        return Ok(prev_keys.clone());
    }

    for product in outcome.products.iter_mut() {
        product.set_name = set_name.to_string();
    }

    let mut last_prices = HashMap::new();
    for product in &outcome.products {
        let key = product.canonical_key();
        if let Ok(mut snaps) = storage.recent_price_snapshots(&key, 1).await {
            if let Some(snap) = snaps.pop() {
                last_prices.insert(key, snap.listed_price);
            }
        }
    }

    let reconciled = reconcile(
        task_id,
        prev_keys,
        &outcome.products,
        |key| last_prices.get(key).copied(),
        config.price_change_threshold,
        is_first_scan,
    );

    for product in &outcome.products {
        storage.upsert_product(product).await?;
    }
    for snapshot in &reconciled.snapshots {
        storage.insert_price_snapshot(snapshot).await?;
    }

    if !reconciled.events.is_empty() {
        let subs = subscriptions.read().clone();
        for event in &reconciled.events {
            notifier.emit(event, &subs).await;
        }
    }

    Ok(reconciled.new_in_stock_keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn twg(last_run_at: Option<chrono::DateTime<Utc>>, interval: i64) -> TaskWithGroup {
        TaskWithGroup {
            task: Task {
                id: 1,
                group_id: 1,
                name: "t".into(),
                enabled: true,
                retailer: "target".into(),
                query: "widget".into(),
                set_name: String::new(),
                zip_code: None,
                interval_seconds: None,
                last_run_at,
                last_status: None,
                last_error: None,
                last_in_stock_keys: BTreeSet::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            group_enabled: true,
            group_default_interval_seconds: interval,
            group_default_zip_code: "10001".into(),
        }
    }

    #[test]
    fn never_run_task_is_always_due_and_not_promoted() {
        let now = Utc::now();
        let result = due_task(twg(None, 60), now).unwrap();
        assert!(!result.promoted);
    }

    #[test]
    fn task_within_interval_is_not_due() {
        let now = Utc::now();
        let last = now - ChronoDuration::seconds(10);
        assert!(due_task(twg(Some(last), 60), now).is_none());
    }

    #[test]
    fn task_overdue_by_starvation_factor_is_promoted() {
        let now = Utc::now();
        let last = now - ChronoDuration::seconds(61 * 3);
        let result = due_task(twg(Some(last), 61), now).unwrap();
        assert!(result.promoted);
    }

    #[test]
    fn task_just_due_is_not_promoted() {
        let now = Utc::now();
        let last = now - ChronoDuration::seconds(60);
        let result = due_task(twg(Some(last), 60), now).unwrap();
        assert!(!result.promoted);
    }

    #[tokio::test]
    async fn restart_recovers_stuck_task_as_immediately_due() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("stockwatch.sqlite3");
        let storage = Storage::open(db_path.to_str().unwrap(), 4, Duration::from_secs(5))
            .await
            .unwrap();

        let group_id = storage.insert_group("group-a", true, 60, "10001").await.unwrap();
        let task_id = storage
            .insert_task(group_id, "task-a", "target", "widget", None, None, "")
            .await
            .unwrap();
        // Simulate a crash mid-run: status left at Running, last_run_at stale
        // from the run before the one that crashed.
        storage
            .record_task_result(task_id, TaskStatus::Ok, None, Some(&BTreeSet::new()))
            .await
            .unwrap();
        let before_crash = storage.get_task(task_id).await.unwrap().unwrap().last_run_at;
        storage
            .record_task_result(task_id, TaskStatus::Running, None, None)
            .await
            .unwrap();

        let runner = TaskRunner::new(
            storage,
            Arc::new(ProxyPool::new(&[], Duration::from_secs(1), Duration::from_secs(1))),
            Arc::new(BlockTable::new(Duration::from_secs(1), Duration::from_secs(1))),
            Arc::new(NotificationDispatcher::new(Vec::new(), 16, Duration::from_secs(60))),
            HashMap::new(),
            Vec::new(),
            reqwest::Client::new(),
            RetryPolicy::default(),
            RunnerConfig::default(),
        );

        runner.reconcile_crashed_tasks().await.unwrap();

        let recovered = runner.storage.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(recovered.last_status, Some(TaskStatus::Error));
        assert_eq!(recovered.last_run_at, before_crash);
        // Interval is 60s and the run-before-crash just happened, so the task
        // is only due again if last_run_at truly stayed untouched by the
        // crash recovery, not bumped to "now".
        assert!(due_task(
            TaskWithGroup {
                task: recovered.clone(),
                group_enabled: true,
                group_default_interval_seconds: 60,
                group_default_zip_code: "10001".into(),
            },
            before_crash.unwrap() + ChronoDuration::seconds(61),
        )
        .is_some());
    }
}
