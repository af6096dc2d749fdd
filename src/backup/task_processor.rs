use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{BackupTask, TaskStatus};
use crate::error::{BackupError, Result};
use crate::provider::ProviderRegistry;
use crate::security::{task_key_entry, Credential, CredentialVault, EncryptionManager};
use crate::storage::TaskStore;
use crate::utils::compress;
use crate::utils::temp_file::TempArtifact;

/// One attempt at one task.
///
/// The retry controller calls this once per attempt; implementations own
/// the status transitions of the attempt.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &BackupTask, attempt: u32) -> Result<()>;
}

/// Default processor: transform the payload, then hand it to the provider.
pub struct BackupTaskProcessor {
    store: TaskStore,
    vault: Arc<CredentialVault>,
    providers: Arc<ProviderRegistry>,
    staging_dir: PathBuf,
    upload_timeout: Duration,
}

impl BackupTaskProcessor {
    pub fn new(
        store: TaskStore,
        vault: Arc<CredentialVault>,
        providers: Arc<ProviderRegistry>,
        staging_dir: PathBuf,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            store,
            vault,
            providers,
            staging_dir,
            upload_timeout,
        }
    }

    async fn set_status(&self, task: &BackupTask, status: TaskStatus, error: Option<String>) -> Result<()> {
        if task.transient {
            debug!(task_id = %task.id, status = %status, "Sub-task status");
            return Ok(());
        }

        match self.store.update_status(&task.id, status, error).await {
            Ok(_) => Ok(()),
            Err(e @ (BackupError::TaskNotFound(_) | BackupError::InvalidTransition { .. })) => Err(e),
            Err(e) => Err(BackupError::StatusUpdate(e.to_string())),
        }
    }

    async fn run_pipeline(&self, task: &BackupTask) -> Result<()> {
        let source = PathBuf::from(&task.source_path);
        if !source.exists() {
            return Err(BackupError::Validation(format!(
                "source path does not exist: {}",
                source.display()
            )));
        }

        // Dropped on every exit path, which removes the side-car files
        let mut artifacts: Vec<TempArtifact> = Vec::new();
        let mut payload = source.clone();
        let mut suffix = String::new();

        if task.encrypt || task.compress {
            tokio::fs::create_dir_all(&self.staging_dir).await.map_err(|e| {
                BackupError::Transform(format!(
                    "cannot create staging dir {}: {e}",
                    self.staging_dir.display()
                ))
            })?;
        }

        if task.encrypt {
            let key = resolve_encryption_key(&self.vault, task).await?;
            let manager = EncryptionManager::from_passphrase(&key)?;

            if payload.is_dir() {
                let stem = artifact_stem(task, &payload);
                let archived = self.blocking_transform(payload.clone(), stem, compress::archive_directory).await?;
                artifacts.push(TempArtifact::new(archived.clone()));
                payload = archived;
                suffix.push_str(".tar");
            }

            let stem = artifact_stem(task, &payload);
            let encrypted = manager.encrypt_file(&payload, &self.staging_dir, &stem).await?;
            artifacts.push(TempArtifact::new(encrypted.clone()));
            payload = encrypted;
            suffix.push_str(".enc");
            debug!(task_id = %task.id, "Encrypted payload to {}", payload.display());
        }

        if task.compress {
            let was_dir = payload.is_dir();
            let stem = artifact_stem(task, &payload);
            let compressed = self.blocking_transform(payload.clone(), stem, compress::compress_path).await?;
            artifacts.push(TempArtifact::new(compressed.clone()));
            payload = compressed;
            suffix.push_str(if was_dir { ".tar.gz" } else { ".gz" });
            debug!(task_id = %task.id, "Compressed payload to {}", payload.display());
        }

        let provider_name = task.provider.clone();
        let credential = self
            .vault
            .run_blocking(move |vault| vault.get_credential(&provider_name))
            .await?;
        let provider = self.providers.create(&task.provider, &credential)?;
        provider.authenticate().await?;

        let remote = format!("{}{}", remote_path(task), suffix);
        info!(task_id = %task.id, provider = %task.provider, remote = %remote, "Uploading");

        match tokio::time::timeout(self.upload_timeout, provider.upload(&payload, &remote)).await {
            Ok(result) => result,
            Err(_) => Err(BackupError::Timeout {
                task_id: task.id.clone(),
                after: humantime::format_duration(self.upload_timeout).to_string(),
            }),
        }
    }

    async fn blocking_transform(
        &self,
        source: PathBuf,
        stem: String,
        transform: fn(&Path, &Path, &str) -> Result<PathBuf>,
    ) -> Result<PathBuf> {
        let out_dir = self.staging_dir.clone();
        tokio::task::spawn_blocking(move || transform(&source, &out_dir, &stem))
            .await
            .map_err(|e| BackupError::Transform(format!("transform worker failed: {e}")))?
    }
}

#[async_trait]
impl TaskProcessor for BackupTaskProcessor {
    async fn process(&self, task: &BackupTask, attempt: u32) -> Result<()> {
        self.set_status(task, TaskStatus::Running, None).await?;
        debug!(task_id = %task.id, attempt = attempt + 1, "Running task");

        let outcome = match AssertUnwindSafe(self.run_pipeline(task)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(BackupError::Panic(panic_message(panic.as_ref()))),
        };

        match outcome {
            Ok(()) => {
                self.set_status(task, TaskStatus::Completed, None).await?;
                info!(task_id = %task.id, "Task completed");
                Ok(())
            }
            Err(err) => {
                error!(task_id = %task.id, kind = err.kind(), "Task attempt failed: {}", err);
                if let Err(status_err) = self
                    .set_status(task, TaskStatus::Failed, Some(err.to_string()))
                    .await
                {
                    error!(task_id = %task.id, "Could not record failure: {}", status_err);
                }
                Err(err)
            }
        }
    }
}

/// Payload key for `task`: the in-memory key, else the vault entry, else a
/// freshly generated key that is stored in the vault.
pub async fn resolve_encryption_key(vault: &Arc<CredentialVault>, task: &BackupTask) -> Result<String> {
    if let Some(key) = task.encryption_key.as_deref().filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }

    let task_id = task.id.clone();
    vault.run_blocking(move |vault| stored_or_new_key(vault, &task_id)).await
}

fn stored_or_new_key(vault: &CredentialVault, task_id: &str) -> Result<String> {
    match vault.get_credential(&task_key_entry(task_id)) {
        Ok(entry) => Ok(entry.secret),
        Err(BackupError::CredentialNotFound(_)) => {
            let key = EncryptionManager::generate_key();
            vault.store_credential(Credential::task_key(task_id, &key))?;
            info!(task_id = %task_id, "Generated encryption key");
            Ok(key)
        }
        Err(e) => Err(e),
    }
}

/// Remote target before transform suffixes.
///
/// A single-file task uploads to the destination itself; anything else
/// lands under the destination with the source's own name.
pub fn remote_path(task: &BackupTask) -> String {
    let destination = task.destination_path.trim();
    let source_name = Path::new(&task.source_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup".to_string());

    if task.is_single && !destination.is_empty() {
        return destination.to_string();
    }

    let destination = destination.trim_end_matches('/');
    if destination.is_empty() {
        source_name
    } else {
        format!("{destination}/{source_name}")
    }
}

fn artifact_stem(task: &BackupTask, payload: &Path) -> String {
    let name = payload
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_string());
    if name.starts_with(&task.id) {
        name
    } else {
        format!("{}-{}", task.id, name)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
