use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::scheduler::CronSchedule;
use super::task_processor::{resolve_encryption_key, BackupTaskProcessor, TaskProcessor};
use super::{BackupTask, TaskSpec, TaskStatus};
use crate::error::{BackupError, Result};
use crate::provider::ProviderRegistry;
use crate::security::{Credential, CredentialVault};
use crate::storage::TaskStore;
use crate::sync::FolderSyncEngine;
use crate::utils::config::Config;
use crate::utils::retry::RetryPolicy;

/// Owns task lifecycle: creation, execution under retry, continuous sync
/// and scheduling.
///
/// Cheap to clone; clones share state. Constructed once at startup and
/// torn down with [`TaskManager::shutdown`].
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    store: TaskStore,
    vault: Arc<CredentialVault>,
    processor: Arc<dyn TaskProcessor>,
    retry: RetryPolicy,
    /// Stop signal per running continuous sync
    syncs: Mutex<HashMap<String, CancellationToken>>,
    /// Cancel signal per active schedule
    schedules: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    metrics: Mutex<Metrics>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub files_synced: u64,
}

impl TaskManager {
    pub fn new(config: Config, vault: Arc<CredentialVault>, providers: Arc<ProviderRegistry>) -> Self {
        let store = TaskStore::new(&config.task_file);
        let processor = Arc::new(BackupTaskProcessor::new(
            store.clone(),
            vault.clone(),
            providers,
            config.staging_dir.clone(),
            config.upload_timeout,
        ));
        Self::with_processor(config, store, vault, processor)
    }

    /// Build with a custom per-attempt processor.
    pub fn with_processor(
        config: Config,
        store: TaskStore,
        vault: Arc<CredentialVault>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Self {
        info!(task_file = %config.task_file.display(), "Initializing task manager");
        let retry = config.retry.clone();
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                vault,
                processor,
                retry,
                syncs: Mutex::new(HashMap::new()),
                schedules: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                metrics: Mutex::new(Metrics::default()),
            }),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.inner.vault
    }

    pub fn metrics(&self) -> Metrics {
        *self.inner.metrics.lock()
    }

    pub async fn create_task(&self, spec: TaskSpec) -> Result<BackupTask> {
        if spec.source_path.trim().is_empty() {
            return Err(BackupError::Validation("source path is required".into()));
        }
        if spec.provider.trim().is_empty() {
            return Err(BackupError::Validation("provider is required".into()));
        }
        let schedule = spec.schedule.filter(|s| !s.trim().is_empty());
        if let Some(expression) = &schedule {
            CronSchedule::parse(expression)?;
        }

        let mut task = BackupTask {
            id: uuid::Uuid::new_v4().to_string(),
            source_path: spec.source_path,
            provider: spec.provider,
            destination_path: spec.destination_path,
            schedule,
            recurring: spec.recurring,
            compress: spec.compress,
            encrypt: spec.encrypt,
            created_at: chrono::Utc::now(),
            status: TaskStatus::Pending,
            is_single: spec.is_single,
            is_sync: spec.is_sync,
            error_message: None,
            encryption_key: None,
            transient: false,
        };

        if task.encrypt {
            let key = spec
                .encryption_key
                .filter(|k| !k.is_empty())
                .unwrap_or_else(crate::security::EncryptionManager::generate_key);
            let entry = Credential::task_key(&task.id, &key);
            self.inner
                .vault
                .run_blocking(move |vault| vault.store_credential(entry))
                .await?;
            task.encryption_key = Some(key);
        }

        self.inner.store.append(&task).await?;
        info!(task_id = %task.id, source = %task.source_path, provider = %task.provider, "Created task");
        Ok(task)
    }

    pub async fn list_tasks(&self) -> Result<Vec<BackupTask>> {
        self.inner.store.load_tasks().await
    }

    pub async fn get_task(&self, id: &str) -> Result<BackupTask> {
        self.inner.store.get(id).await
    }

    /// Remove a task from the list, stopping any sync or schedule it has.
    /// Its encryption key stays in the vault so old artifacts remain
    /// decryptable.
    pub async fn delete_task(&self, id: &str) -> Result<BackupTask> {
        self.stop_sync(id);
        self.cancel_schedule(id);
        self.inner.store.remove(id).await
    }

    /// Run a task to completion or terminal failure.
    ///
    /// Continuous-sync tasks block here until [`TaskManager::stop_sync`].
    pub async fn execute_task(&self, task: &BackupTask) -> Result<()> {
        if task.is_sync {
            return self.run_sync(task, None).await;
        }
        self.run_with_retry(task, &self.inner.shutdown).await
    }

    async fn run_with_retry(&self, task: &BackupTask, cancel: &CancellationToken) -> Result<()> {
        let processor = self.inner.processor.clone();
        let shared = Arc::new(task.clone());
        let result = self
            .inner
            .retry
            .run(cancel, |attempt| {
                let processor = processor.clone();
                let task = shared.clone();
                async move { processor.process(&task, attempt).await }
            })
            .await;

        let mut metrics = self.inner.metrics.lock();
        match &result {
            Ok(()) => metrics.tasks_completed += 1,
            Err(e) => {
                metrics.tasks_failed += 1;
                warn!(task_id = %task.id, kind = e.kind(), "Task failed: {}", e);
            }
        }
        result
    }

    /// Signal a running sync to stop. Returns whether one was running;
    /// calling it again is harmless.
    pub fn stop_sync(&self, id: &str) -> bool {
        match self.inner.syncs.lock().get(id) {
            Some(stop) => {
                if !stop.is_cancelled() {
                    info!(task_id = %id, "Stopping sync");
                }
                stop.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_syncing(&self, id: &str) -> bool {
        self.inner.syncs.lock().contains_key(id)
    }

    /// Run a continuous sync until stopped, or until `ceiling` elapses,
    /// which stops it the same way and then fails it with a timeout.
    async fn run_sync(&self, task: &BackupTask, ceiling: Option<Duration>) -> Result<()> {
        let stop = self.inner.shutdown.child_token();
        let _registration = ActiveEntry::register(&self.inner.syncs, &task.id, stop.clone())
            .ok_or_else(|| BackupError::Sync(format!("task {} is already syncing", task.id)))?;

        let result = self.sync_loop(task, &stop, ceiling).await;

        if let Err(e) = &result {
            if let Err(status_err) = self
                .inner
                .store
                .update_status(&task.id, TaskStatus::Failed, Some(e.to_string()))
                .await
            {
                error!(task_id = %task.id, "Could not record sync failure: {}", status_err);
            }
        }
        result
    }

    async fn sync_loop(
        &self,
        task: &BackupTask,
        stop: &CancellationToken,
        ceiling: Option<Duration>,
    ) -> Result<()> {
        let key = if task.encrypt {
            Some(resolve_encryption_key(&self.inner.vault, task).await?)
        } else {
            None
        };

        let state_file = self.inner.config.state_dir.join(format!("{}.json", task.id));
        let engine = FolderSyncEngine::new(&task.source_path, state_file)?;
        let mut queue = engine
            .take_upload_queue()
            .ok_or_else(|| BackupError::Sync("upload queue unavailable".into()))?;

        self.inner
            .store
            .update_status(&task.id, TaskStatus::Syncing, None)
            .await?;
        engine.start().await?;
        info!(task_id = %task.id, root = %task.source_path, "Sync started");

        // Queued uploads always get their full retry budget; shutdown only
        // ends the watch, never the drain
        let uploads = CancellationToken::new();
        let deadline = async {
            match ceiling {
                Some(ceiling) => tokio::time::sleep(ceiling).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut timed_out = false;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
                next = queue.recv() => match next {
                    Some(path) => self.sync_one(task, key.as_deref(), &path, &uploads).await,
                    None => break,
                },
            }
        }

        engine.stop().await?;
        let mut drained = 0usize;
        while let Some(path) = queue.recv().await {
            self.sync_one(task, key.as_deref(), &path, &uploads).await;
            drained += 1;
        }
        debug!(task_id = %task.id, drained, "Upload queue drained");

        if let Some(ceiling) = ceiling.filter(|_| timed_out) {
            let err = BackupError::Timeout {
                task_id: task.id.clone(),
                after: humantime::format_duration(ceiling).to_string(),
            };
            error!(task_id = %task.id, "{}", err);
            return Err(err);
        }

        self.inner
            .store
            .update_status(&task.id, TaskStatus::Completed, None)
            .await?;
        info!(task_id = %task.id, "Sync stopped");
        Ok(())
    }

    /// Upload one changed file as a transient single-file sub-task. A
    /// failure is logged and does not end the sync.
    async fn sync_one(
        &self,
        parent: &BackupTask,
        key: Option<&str>,
        path: &Path,
        cancel: &CancellationToken,
    ) {
        let root = Path::new(&parent.source_path);
        let relative = path.strip_prefix(root).unwrap_or(path);
        let sub = BackupTask {
            id: uuid::Uuid::new_v4().to_string(),
            source_path: path.to_string_lossy().into_owned(),
            provider: parent.provider.clone(),
            destination_path: join_remote(&parent.destination_path, relative),
            schedule: None,
            recurring: false,
            compress: parent.compress,
            encrypt: parent.encrypt,
            created_at: chrono::Utc::now(),
            status: TaskStatus::Pending,
            is_single: true,
            is_sync: false,
            error_message: None,
            encryption_key: key.map(str::to_string),
            transient: true,
        };

        debug!(task_id = %parent.id, path = %path.display(), remote = %sub.destination_path, "Syncing file");
        match self.run_with_retry(&sub, cancel).await {
            Ok(()) => self.inner.metrics.lock().files_synced += 1,
            Err(e) => error!(task_id = %parent.id, path = %path.display(), "Sync upload failed: {}", e),
        }
    }

    /// Run a task on its cron schedule.
    ///
    /// One-shot: wait for the next fire time, then execute once under the
    /// one-shot ceiling. Recurring: execute at every fire time until the
    /// first error, which is returned.
    pub async fn schedule_task(&self, task: &BackupTask) -> Result<()> {
        let expression = task
            .schedule
            .as_deref()
            .ok_or_else(|| BackupError::Schedule(format!("task {} has no schedule", task.id)))?;
        let schedule = CronSchedule::parse(expression)?;

        let cancel = self.inner.shutdown.child_token();
        let _registration = ActiveEntry::register(&self.inner.schedules, &task.id, cancel.clone())
            .ok_or_else(|| BackupError::Schedule(format!("task {} is already scheduled", task.id)))?;
        info!(task_id = %task.id, schedule = %schedule.expression(), recurring = task.recurring, "Scheduled task");

        if task.recurring {
            self.run_recurring(task, &schedule, &cancel).await
        } else {
            self.run_one_shot(task, &schedule, &cancel).await
        }
    }

    pub fn cancel_schedule(&self, id: &str) -> bool {
        match self.inner.schedules.lock().get(id) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_one_shot(
        &self,
        task: &BackupTask,
        schedule: &CronSchedule,
        cancel: &CancellationToken,
    ) -> Result<()> {
        wait_for_fire(task, schedule, cancel).await?;

        let ceiling = self.inner.config.one_shot_timeout;
        if task.is_sync {
            // A sync is stopped and drained at the ceiling rather than dropped
            return self.run_sync(task, Some(ceiling)).await;
        }
        match tokio::time::timeout(ceiling, self.execute_task(task)).await {
            Ok(result) => result,
            Err(_) => {
                let err = BackupError::Timeout {
                    task_id: task.id.clone(),
                    after: humantime::format_duration(ceiling).to_string(),
                };
                error!(task_id = %task.id, "{}", err);
                self.inner
                    .store
                    .update_status(&task.id, TaskStatus::Failed, Some(err.to_string()))
                    .await?;
                Err(err)
            }
        }
    }

    async fn run_recurring(
        &self,
        task: &BackupTask,
        schedule: &CronSchedule,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut runs = 0u64;
        loop {
            wait_for_fire(task, schedule, cancel).await?;
            runs += 1;
            debug!(task_id = %task.id, run = runs, "Recurring run");

            if let Err(e) = self.execute_task(task).await {
                error!(task_id = %task.id, run = runs, "Recurring task stopped: {}", e);
                return Err(e);
            }
        }
    }

    /// Cancel every schedule and stop every sync.
    pub fn shutdown(&self) {
        let syncs = self.inner.syncs.lock().len();
        let schedules = self.inner.schedules.lock().len();
        info!(syncs, schedules, "Shutting down task manager");
        self.inner.shutdown.cancel();
    }
}

/// Entry in one of the active-task maps, removed when dropped so an
/// abandoned future never leaves the task marked as running.
struct ActiveEntry<'a> {
    map: &'a Mutex<HashMap<String, CancellationToken>>,
    id: String,
}

impl<'a> ActiveEntry<'a> {
    fn register(
        map: &'a Mutex<HashMap<String, CancellationToken>>,
        id: &str,
        token: CancellationToken,
    ) -> Option<Self> {
        let mut active = map.lock();
        if active.contains_key(id) {
            return None;
        }
        active.insert(id.to_string(), token);
        Some(Self {
            map,
            id: id.to_string(),
        })
    }
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        self.map.lock().remove(&self.id);
    }
}

async fn wait_for_fire(task: &BackupTask, schedule: &CronSchedule, cancel: &CancellationToken) -> Result<()> {
    let wait = schedule.until_next()?;
    debug!(task_id = %task.id, wait_ms = wait.as_millis() as u64, "Waiting for next run");
    tokio::select! {
        _ = cancel.cancelled() => Err(BackupError::Cancelled(format!("schedule for task {} cancelled", task.id))),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}

/// `destination` joined with a relative local path, always with `/`.
fn join_remote(destination: &str, relative: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let base = destination.trim_end_matches('/');
    if !base.is_empty() {
        parts.push(base.to_string());
    }
    parts.extend(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    if parts.is_empty() {
        return String::new();
    }
    let joined = parts.join("/");
    if destination.starts_with('/') && !joined.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("task_file", &self.inner.store.path())
            .field("active_syncs", &self.inner.syncs.lock().len())
            .field("active_schedules", &self.inner.schedules.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_entry_is_exclusive_and_released_on_drop() {
        let map = Mutex::new(HashMap::new());
        let first = ActiveEntry::register(&map, "t1", CancellationToken::new());
        assert!(first.is_some());
        assert!(ActiveEntry::register(&map, "t1", CancellationToken::new()).is_none());

        drop(first);
        assert!(map.lock().is_empty());
        assert!(ActiveEntry::register(&map, "t1", CancellationToken::new()).is_some());
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/backups", Path::new("a.txt")), "/backups/a.txt");
        assert_eq!(join_remote("/backups/", Path::new("sub/b.txt")), "/backups/sub/b.txt");
        assert_eq!(join_remote("", Path::new("sub/b.txt")), "sub/b.txt");
        assert_eq!(join_remote("/", Path::new("c.txt")), "/c.txt");
    }
}
