use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Content hash plus metadata for one watched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: PathBuf,
    /// blake3 digest of the full content, hex encoded
    pub hash: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

impl FileFingerprint {
    pub fn compute(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Self::compute_with(path, &metadata)
    }

    fn compute_with(path: &Path, metadata: &std::fs::Metadata) -> Result<Self> {
        let mut hasher = blake3::Hasher::new();
        let mut reader = BufReader::new(File::open(path)?);
        std::io::copy(&mut reader, &mut hasher)?;

        Ok(Self {
            path: path.to_path_buf(),
            hash: hasher.finalize().to_hex().to_string(),
            last_modified: modified_at(metadata)?,
            size: metadata.len(),
        })
    }
}

fn modified_at(metadata: &std::fs::Metadata) -> Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(metadata.modified()?))
}

/// Durable path → fingerprint map for one watched root.
///
/// Reads share the lock; updates and the flush to disk are exclusive.
#[derive(Debug)]
pub struct SyncStateStore {
    state_file: PathBuf,
    entries: RwLock<HashMap<PathBuf, FileFingerprint>>,
}

impl SyncStateStore {
    /// Load persisted fingerprints; a missing state file starts empty.
    pub fn load(state_file: impl Into<PathBuf>) -> Result<Self> {
        let state_file = state_file.into();
        let entries = match std::fs::read_to_string(&state_file) {
            Ok(data) if !data.trim().is_empty() => {
                let list: Vec<FileFingerprint> = serde_json::from_str(&data)?;
                list.into_iter().map(|fp| (fp.path.clone(), fp)).collect()
            }
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(
            "Loaded {} fingerprints from {}",
            entries.len(),
            state_file.display()
        );
        Ok(Self {
            state_file,
            entries: RwLock::new(entries),
        })
    }

    pub fn get(&self, path: &Path) -> Option<FileFingerprint> {
        self.entries.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn update(&self, fingerprint: FileFingerprint) {
        self.entries
            .write()
            .insert(fingerprint.path.clone(), fingerprint);
    }

    /// Look at `path` and report whether it needs uploading.
    ///
    /// Unknown files are changed. A known file is rehashed only when its
    /// modification time advanced (or its size moved), and is changed only
    /// if the hash differs.
    /// Whatever was recomputed is recorded.
    pub fn observe(&self, path: &Path) -> Result<bool> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(BackupError::Sync(format!("not a regular file: {}", path.display())));
        }

        let previous = self.get(path);
        let changed = match previous {
            None => {
                self.update(FileFingerprint::compute_with(path, &metadata)?);
                true
            }
            Some(prev) => {
                // Same-tick writes can leave mtime unchanged; size still moves
                if modified_at(&metadata)? <= prev.last_modified && metadata.len() == prev.size {
                    return Ok(false);
                }
                let current = FileFingerprint::compute_with(path, &metadata)?;
                let changed = current.hash != prev.hash;
                self.update(current);
                changed
            }
        };

        debug!(path = %path.display(), changed, "Observed file");
        Ok(changed)
    }

    /// Write the map to the state file (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let entries = self.entries.write();
        let mut list: Vec<&FileFingerprint> = entries.values().collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        let data = serde_json::to_string_pretty(&list)?;

        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.state_file.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.state_file)?;

        debug!("Flushed {} fingerprints to {}", list.len(), self.state_file.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn bump_mtime(path: &Path) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();
    }

    #[test]
    fn test_new_file_is_changed_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"one").unwrap();

        let store = SyncStateStore::load(dir.path().join("state.json")).unwrap();
        assert!(store.observe(&file).unwrap());
        assert!(!store.observe(&file).unwrap());
    }

    #[test]
    fn test_touch_without_content_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"same").unwrap();

        let store = SyncStateStore::load(dir.path().join("state.json")).unwrap();
        store.observe(&file).unwrap();
        let before = store.get(&file).unwrap();

        bump_mtime(&file);
        assert!(!store.observe(&file).unwrap());

        let after = store.get(&file).unwrap();
        assert_eq!(after.hash, before.hash);
        assert!(after.last_modified > before.last_modified);
    }

    #[test]
    fn test_content_change_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"before").unwrap();

        let store = SyncStateStore::load(dir.path().join("state.json")).unwrap();
        store.observe(&file).unwrap();

        std::fs::write(&file, b"after!").unwrap();
        bump_mtime(&file);
        assert!(store.observe(&file).unwrap());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"persist me").unwrap();
        let state_file = dir.path().join("state/task.json");

        let store = SyncStateStore::load(&state_file).unwrap();
        store.observe(&file).unwrap();
        store.save().unwrap();

        let reloaded = SyncStateStore::load(&state_file).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(&file), store.get(&file));
        assert!(!reloaded.observe(&file).unwrap());
    }
}
