use super::{RemoteFile, StorageProvider};
use crate::error::{BackupError, Result};
use crate::security::Credential;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub const PROVIDER_NAME: &str = "local";

/// Mirrors uploads into a directory on this machine.
///
/// The credential's key field names the root directory; remote paths are
/// resolved beneath it.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_credential(credential: &Credential) -> Result<Self> {
        if credential.key.trim().is_empty() {
            return Err(BackupError::Credential(
                "local provider needs a root directory as its key".into(),
            ));
        }
        Ok(Self::new(&credential.key))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `remote` beneath the root, rejecting `..` escapes.
    fn resolve(&self, remote: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(remote).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(BackupError::Validation(format!(
                        "remote path escapes provider root: {remote}"
                    )))
                }
            }
        }
        Ok(path)
    }
}

fn provider_error(action: &str, path: &Path, err: impl std::fmt::Display) -> BackupError {
    BackupError::Provider(format!("{action} {}: {err}", path.display()))
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn authenticate(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| provider_error("cannot create root", &self.root, e))
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let target = self.resolve(remote_path)?;
        let source = local_path.to_path_buf();
        debug!("Uploading {} to {}", source.display(), target.display());

        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| BackupError::Provider(format!("upload worker failed: {e}")))?
    }

    async fn download(&self, local_path: &Path, remote_id: &str) -> Result<()> {
        let source = self.resolve(remote_id)?;
        let target = local_path.to_path_buf();

        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| BackupError::Provider(format!("download worker failed: {e}")))?
    }

    async fn list_files(&self, remote_folder_id: &str) -> Result<Vec<RemoteFile>> {
        let folder = self.resolve(remote_folder_id)?;
        let mut entries = tokio::fs::read_dir(&folder)
            .await
            .map_err(|e| provider_error("cannot list", &folder, e))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| provider_error("cannot list", &folder, e))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| provider_error("cannot stat", &entry.path(), e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = Path::new(remote_folder_id).join(&name).to_string_lossy().into_owned();
            files.push(RemoteFile {
                id,
                name,
                size: metadata.len(),
                is_folder: metadata.is_dir(),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    if source.is_dir() {
        for entry in WalkDir::new(source) {
            let entry = entry.map_err(|e| provider_error("cannot walk", source, e))?;
            let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
            let destination = target.join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&destination)
                    .map_err(|e| provider_error("cannot create", &destination, e))?;
            } else {
                std::fs::copy(entry.path(), &destination)
                    .map_err(|e| provider_error("cannot copy to", &destination, e))?;
            }
        }
        return Ok(());
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| provider_error("cannot create", parent, e))?;
    }
    std::fs::copy(source, target).map_err(|e| provider_error("cannot copy to", target, e))?;
    Ok(())
}
