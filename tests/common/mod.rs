#![allow(dead_code)]

use async_trait::async_trait;
use cloud_backup::provider::{RemoteFile, StorageProvider};
use cloud_backup::{
    BackupError, Config, Credential, CredentialVault, ProviderRegistry, Result, RetryPolicy,
    TaskManager,
};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Retryable,
    Fatal,
    Panic,
    Hang,
}

/// Provider double that fails its first `fail_first` uploads.
pub struct StubProvider {
    pub calls: AtomicU32,
    pub fail_first: u32,
    pub failure: Failure,
    /// Time every upload takes before it resolves
    pub delay: Duration,
    pub uploads: Mutex<Vec<String>>,
}

impl StubProvider {
    pub fn succeeding() -> Arc<Self> {
        Self::failing(0, Failure::Retryable)
    }

    pub fn failing(fail_first: u32, failure: Failure) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first,
            failure,
            delay: Duration::ZERO,
            uploads: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
            failure: Failure::Retryable,
            delay,
            uploads: Mutex::new(Vec::new()),
        })
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageProvider for StubProvider {
    fn name(&self) -> &str {
        "gdrive"
    }

    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, _local_path: &Path, remote_path: &str) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if call < self.fail_first {
            return match self.failure {
                Failure::Retryable => Err(BackupError::Provider("503 service unavailable".into())),
                Failure::Fatal => Err(BackupError::Validation("destination rejected".into())),
                Failure::Panic => panic!("provider exploded"),
                Failure::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            };
        }
        self.uploads.lock().push(remote_path.to_string());
        Ok(())
    }

    async fn download(&self, _local_path: &Path, _remote_id: &str) -> Result<()> {
        Ok(())
    }

    async fn list_files(&self, _remote_folder_id: &str) -> Result<Vec<RemoteFile>> {
        Ok(Vec::new())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub vault: Arc<CredentialVault>,
    pub registry: Arc<ProviderRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            task_file: dir.path().join("backup_tasks.json"),
            credentials_dir: dir.path().join("credentials"),
            state_dir: dir.path().join("state"),
            staging_dir: dir.path().join("staging"),
            retry: RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_max_attempts(5)
                .with_jitter(0.0),
            ..Config::default()
        };
        let vault = Arc::new(CredentialVault::open(&config.credentials_dir, "pw1").unwrap());
        vault
            .store_credential(Credential {
                provider: "gdrive".into(),
                key: "id".into(),
                secret: "sec".into(),
                redirect_url: "http://localhost:8080/callback".into(),
            })
            .unwrap();

        Self {
            dir,
            config,
            vault,
            registry: Arc::new(ProviderRegistry::with_builtin()),
        }
    }

    pub fn with_stub(self, stub: Arc<StubProvider>) -> Self {
        self.registry.register(
            "gdrive",
            move |_: &Credential| -> Result<Arc<dyn StorageProvider>> {
                Ok(stub.clone() as Arc<dyn StorageProvider>)
            },
        );
        self
    }

    pub fn configure_local(&self, root: &Path) {
        self.vault
            .store_credential(Credential {
                provider: "local".into(),
                key: root.to_string_lossy().into_owned(),
                secret: String::new(),
                redirect_url: String::new(),
            })
            .unwrap();
    }

    pub fn manager(&self) -> TaskManager {
        TaskManager::new(self.config.clone(), self.vault.clone(), self.registry.clone())
    }

    pub fn write_source(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
