use crate::{SyncEngine, SyncError, SyncQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;
use wherry_core::{SyncErrorKind, SyncLimits, SyncTask};
use wherry_storage::Store;

/// Priority of the periodic keep-fresh discovery sweep.
pub const PRIORITY_LOW: i32 = 0;
/// Priority of on-demand triggers (user action, first sync); jumps
/// ahead of the sweep on the next dispatch cycle.
pub const PRIORITY_HIGH: i32 = 10;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub discovery_interval: Duration,
    pub dispatch_interval: Duration,
    pub worker_count: usize,
    pub dispatch_batch_size: usize,
    pub limits: SyncLimits,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(4 * 60 * 60),
            dispatch_interval: Duration::from_secs(60),
            worker_count: 4,
            dispatch_batch_size: 8,
            limits: SyncLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchSummary {
    pub completed: usize,
    pub failed: usize,
}

/// Drives sync: a long-period discovery sweep enqueues every active
/// account, a short-period dispatch cycle drains the queue through a
/// bounded worker pool, and on-demand triggers enqueue at high
/// priority. Shutdown is cooperative; workers observe it between
/// batches.
pub struct SyncScheduler {
    store: Store,
    queue: SyncQueue,
    engine: Arc<SyncEngine>,
    config: SchedulerConfig,
    shutdown: watch::Sender<bool>,
}

impl SyncScheduler {
    pub fn new(store: Store, engine: Arc<SyncEngine>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue: SyncQueue::new(store.clone()),
            store,
            engine,
            config,
            shutdown,
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// On-demand trigger; the thin exposed surface together with
    /// [`status`].
    ///
    /// [`status`]: SyncScheduler::status
    pub async fn sync(&self, account_id: Uuid, priority: i32) -> Result<Uuid, SyncError> {
        self.queue.enqueue(account_id, priority).await
    }

    pub async fn status(&self, task_id: Uuid) -> Result<Option<SyncTask>, SyncError> {
        self.queue.task(task_id).await
    }

    /// Spawn the discovery and dispatch timer loops. Both stop after
    /// [`shutdown`] is called.
    ///
    /// [`shutdown`]: SyncScheduler::shutdown
    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let discovery = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.discovery_loop().await })
        };
        let dispatch = tokio::spawn(async move { self.dispatch_loop().await });
        vec![discovery, dispatch]
    }

    /// Stop scheduling new cycles and signal in-flight runs; each run
    /// observes the signal at its next batch boundary.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn discovery_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.run_discovery().await {
                    Ok(enqueued) if enqueued > 0 => {
                        info!(enqueued, "discovery sweep enqueued accounts");
                    }
                    Ok(_) => {}
                    Err(err) => error!("discovery sweep failed: {err}"),
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn dispatch_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.dispatch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.run_dispatch_cycle().await {
                    Ok(summary) if summary.completed > 0 || summary.failed > 0 => {
                        info!(
                            completed = summary.completed,
                            failed = summary.failed,
                            "dispatch cycle finished"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => error!("dispatch cycle failed: {err}"),
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Enqueue every active account at low priority; live tasks are
    /// deduplicated by the queue.
    pub async fn run_discovery(&self) -> Result<usize, SyncError> {
        let accounts = self.store.list_active_accounts().await?;
        let mut enqueued = 0_usize;

        for account in &accounts {
            self.queue.enqueue(account.id, PRIORITY_LOW).await?;
            enqueued += 1;
        }

        Ok(enqueued)
    }

    /// One drain pass: take the dispatchable tasks and run them to
    /// completion with at most `worker_count` in flight.
    pub async fn run_dispatch_cycle(&self) -> Result<DispatchSummary, SyncError> {
        let tasks = self
            .queue
            .take_batch(self.config.dispatch_batch_size)
            .await?;

        let mut summary = DispatchSummary::default();
        if tasks.is_empty() {
            return Ok(summary);
        }

        let worker_count = self.config.worker_count.max(1);
        let mut workers = JoinSet::new();
        let mut queued = tasks.into_iter();

        for task in (&mut queued).take(worker_count) {
            self.spawn_worker(&mut workers, task);
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(true) => summary.completed += 1,
                Ok(false) => summary.failed += 1,
                Err(err) => {
                    error!("sync worker join failed: {err}");
                    summary.failed += 1;
                }
            }

            if let Some(task) = queued.next() {
                self.spawn_worker(&mut workers, task);
            }
        }

        Ok(summary)
    }

    fn spawn_worker(&self, workers: &mut JoinSet<bool>, task: SyncTask) {
        let queue = self.queue.clone();
        let engine = Arc::clone(&self.engine);
        let store = self.store.clone();
        let limits = self.config.limits;
        let shutdown = self.shutdown.subscribe();

        workers.spawn(async move { run_task(queue, engine, store, limits, shutdown, task).await });
    }
}

/// Worker body: claim the task, run the engine, record the outcome.
/// Returns whether the task completed.
async fn run_task(
    queue: SyncQueue,
    engine: Arc<SyncEngine>,
    store: Store,
    limits: SyncLimits,
    shutdown: watch::Receiver<bool>,
    task: SyncTask,
) -> bool {
    if let Err(err) = queue.mark_processing(task.id).await {
        warn!(task = %task.id, "task already claimed: {err}");
        return false;
    }

    let account = match store.get_account(task.account_id).await {
        Ok(Some(account)) if account.active => account,
        Ok(_) => {
            let _ = queue
                .mark_failed(
                    task.id,
                    SyncErrorKind::Transient,
                    "account missing or inactive",
                )
                .await;
            return false;
        }
        Err(err) => {
            let _ = queue
                .mark_failed(task.id, SyncErrorKind::Transient, &err.to_string())
                .await;
            return false;
        }
    };

    match engine.run(&account, limits, &shutdown).await {
        Ok(report) => {
            info!(
                account = %account.email_address,
                saved = report.saved_count,
                stop = ?report.stop,
                "sync task completed"
            );
            queue.mark_completed(task.id).await.is_ok()
        }
        Err(err) => {
            error!(account = %account.email_address, "sync task failed: {err}");
            let _ = queue
                .mark_failed(task.id, err.kind(), &err.to_string())
                .await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{account, expired_credential, fresh_credential, FakeCredentials, ScriptedProvider};
    use wherry_core::TaskStatus;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn scheduler_with(
        store: Store,
        provider: Arc<ScriptedProvider>,
        credentials: Arc<FakeCredentials>,
        limits: SyncLimits,
    ) -> Arc<SyncScheduler> {
        let engine = Arc::new(SyncEngine::new(store.clone(), provider, credentials));
        Arc::new(SyncScheduler::new(
            store,
            engine,
            SchedulerConfig {
                worker_count: 2,
                limits,
                ..SchedulerConfig::default()
            },
        ))
    }

    #[tokio::test]
    async fn end_to_end_cold_sync_completes_task_and_stores_all_pages() {
        let store = Store::open_in_memory().await.expect("open store");
        let acct = account();
        store.upsert_account(&acct).await.expect("account");

        // Three pages of two ids, newest first, no overlap.
        let provider = Arc::new(ScriptedProvider::new(ids(&["f", "e", "d", "c", "b", "a"])));
        let credentials = Arc::new(FakeCredentials::new(fresh_credential()));
        let limits = SyncLimits {
            max_new: 500,
            batch_size: 2,
            max_batches: 10,
        };
        let scheduler = scheduler_with(store.clone(), Arc::clone(&provider), credentials, limits);

        let task_id = scheduler.sync(acct.id, PRIORITY_HIGH).await.expect("enqueue");
        let summary = scheduler.run_dispatch_cycle().await.expect("dispatch");

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(store.count_messages(acct.id).await.expect("count"), 6);

        let stored = store
            .get_message(acct.id, "d")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.body_text.as_deref(), Some("body of d"));
        assert_eq!(stored.subject, "Subject d");
        assert!(!stored.flags.is_read);

        let task = scheduler
            .status(task_id)
            .await
            .expect("status")
            .expect("present");
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn discovery_enqueues_active_accounts_only() {
        let store = Store::open_in_memory().await.expect("open store");
        let active = account();
        store.upsert_account(&active).await.expect("account");

        let mut inactive = account();
        inactive.email_address = "gone@example.com".into();
        inactive.active = false;
        store.upsert_account(&inactive).await.expect("account");

        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let credentials = Arc::new(FakeCredentials::new(fresh_credential()));
        let scheduler =
            scheduler_with(store, provider, credentials, SyncLimits::default());

        let enqueued = scheduler.run_discovery().await.expect("discovery");
        assert_eq!(enqueued, 1);

        // A second sweep reuses the live task instead of duplicating it.
        let enqueued = scheduler.run_discovery().await.expect("discovery");
        assert_eq!(enqueued, 1);
        let batch = scheduler.queue().take_batch(10).await.expect("take");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].account_id, active.id);
    }

    #[tokio::test]
    async fn auth_expired_marks_task_failed_without_retry() {
        let store = Store::open_in_memory().await.expect("open store");
        let acct = account();
        store.upsert_account(&acct).await.expect("account");

        let provider = Arc::new(ScriptedProvider::new(ids(&["a"])));
        let credentials = Arc::new(FakeCredentials::failing_refresh(expired_credential(true)));
        let scheduler = scheduler_with(
            store.clone(),
            Arc::clone(&provider),
            credentials,
            SyncLimits::default(),
        );

        let task_id = scheduler.sync(acct.id, PRIORITY_HIGH).await.expect("enqueue");
        let summary = scheduler.run_dispatch_cycle().await.expect("dispatch");

        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 1);

        let task = scheduler
            .status(task_id)
            .await
            .expect("status")
            .expect("present");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error
            .as_deref()
            .is_some_and(|error| error.starts_with("auth_expired:")));

        // No provider call happened and the run was not silently retried.
        assert_eq!(provider.list_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        let summary = scheduler.run_dispatch_cycle().await.expect("dispatch");
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_before_the_first_batch() {
        let store = Store::open_in_memory().await.expect("open store");
        let acct = account();
        store.upsert_account(&acct).await.expect("account");

        let provider = Arc::new(ScriptedProvider::new(ids(&["a", "b"])));
        let credentials = Arc::new(FakeCredentials::new(fresh_credential()));
        let scheduler = scheduler_with(
            store.clone(),
            provider,
            credentials,
            SyncLimits::default(),
        );

        let task_id = scheduler.sync(acct.id, PRIORITY_HIGH).await.expect("enqueue");
        scheduler.shutdown();
        scheduler.run_dispatch_cycle().await.expect("dispatch");

        let task = scheduler
            .status(task_id)
            .await
            .expect("status")
            .expect("present");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error
            .as_deref()
            .is_some_and(|error| error.starts_with("cancelled:")));
        assert_eq!(store.count_messages(acct.id).await.expect("count"), 0);
    }
}
