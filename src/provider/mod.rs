//! Storage Provider capability
//!
//! Concrete cloud backends plug in here. The engine only looks at
//! success or failure and the error text of each call.

pub mod local;

pub use local::LocalProvider;

use crate::error::{BackupError, Result};
use crate::security::Credential;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Remote file descriptor as reported by a provider listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub is_folder: bool,
}

/// One remote storage backend.
///
/// Implementations report transient failures (network, quota, auth
/// refresh) as [`BackupError::Provider`] so that they are retried.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn authenticate(&self) -> Result<()>;

    /// Upload a file, or a directory tree, to `remote_path`
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()>;

    async fn download(&self, local_path: &Path, remote_id: &str) -> Result<()>;

    async fn list_files(&self, remote_folder_id: &str) -> Result<Vec<RemoteFile>>;
}

/// Builds a provider from the credential stored under its name.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, credential: &Credential) -> Result<Arc<dyn StorageProvider>>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&Credential) -> Result<Arc<dyn StorageProvider>> + Send + Sync,
{
    fn create(&self, credential: &Credential) -> Result<Arc<dyn StorageProvider>> {
        self(credential)
    }
}

/// Name → factory lookup used by the execution pipeline.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ProviderFactory>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(
            local::PROVIDER_NAME,
            |credential: &Credential| -> Result<Arc<dyn StorageProvider>> {
                Ok(Arc::new(LocalProvider::from_credential(credential)?))
            },
        );
        registry
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: ProviderFactory + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create(&self, name: &str, credential: &Credential) -> Result<Arc<dyn StorageProvider>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BackupError::UnsupportedProvider(name.to_string()))?;
        factory.create(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(provider: &str, key: &str) -> Credential {
        Credential {
            provider: provider.into(),
            key: key.into(),
            secret: String::new(),
            redirect_url: String::new(),
        }
    }

    #[test]
    fn test_unknown_provider_is_unsupported() {
        let registry = ProviderRegistry::with_builtin();
        let err = registry.create("ftp", &credential("ftp", "x")).err().unwrap();
        assert!(matches!(err, BackupError::UnsupportedProvider(ref n) if n == "ftp"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_builtin_local_provider() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["local".to_string()]);

        let provider = registry
            .create("local", &credential("local", dir.path().to_str().unwrap()))
            .unwrap();
        assert_eq!(provider.name(), "local");
    }
}
