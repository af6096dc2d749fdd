use crate::backup::{BackupTask, TaskStatus};
use crate::error::{BackupError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Persisted task list: one pretty-printed JSON array, rewritten wholesale
/// on every mutation.
#[derive(Clone)]
pub struct TaskStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load_tasks(&self) -> Result<Vec<BackupTask>> {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }

    pub async fn save_tasks(&self, tasks: &[BackupTask]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_all(tasks).await
    }

    pub async fn append(&self, task: &BackupTask) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read_all().await?;
        tasks.push(task.clone());
        self.write_all(&tasks).await?;
        info!(task_id = %task.id, "Saved task");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<BackupTask> {
        self.load_tasks()
            .await?
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| BackupError::TaskNotFound(id.to_string()))
    }

    /// Move a task to `status`, recording `error` (cleared on success paths).
    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<BackupTask> {
        self.update_task(id, |task| {
            if task.status != status && !task.status.can_transition_to(status) {
                return Err(BackupError::InvalidTransition {
                    task_id: task.id.clone(),
                    from: task.status.to_string(),
                    to: status.to_string(),
                });
            }
            debug!(task_id = %task.id, from = %task.status, to = %status, "Status transition");
            task.status = status;
            task.error_message = error;
            Ok(())
        })
        .await
    }

    /// Apply `mutate` to one task and persist the list.
    pub async fn update_task<F>(&self, id: &str, mutate: F) -> Result<BackupTask>
    where
        F: FnOnce(&mut BackupTask) -> Result<()>,
    {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read_all().await?;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| BackupError::TaskNotFound(id.to_string()))?;
        mutate(task)?;
        let updated = task.clone();
        self.write_all(&tasks).await?;
        Ok(updated)
    }

    pub async fn remove(&self, id: &str) -> Result<BackupTask> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read_all().await?;
        let index = tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| BackupError::TaskNotFound(id.to_string()))?;
        let removed = tasks.remove(index);
        self.write_all(&tasks).await?;
        info!(task_id = %id, "Deleted task");
        Ok(removed)
    }

    async fn read_all(&self) -> Result<Vec<BackupTask>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&data)?)
    }

    async fn write_all(&self, tasks: &[BackupTask]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_string_pretty(tasks)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
