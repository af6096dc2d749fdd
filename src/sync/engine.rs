use super::state::SyncStateStore;
use crate::error::{BackupError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Watching,
    Stopped,
}

type SharedWatcher = Arc<Mutex<Option<RecommendedWatcher>>>;

/// Watches one root folder and queues changed files for upload.
///
/// The notification loop is the producer; whoever took the queue with
/// [`FolderSyncEngine::take_upload_queue`] is the only consumer. After
/// [`FolderSyncEngine::stop`] the queue yields its remaining paths and
/// then closes.
pub struct FolderSyncEngine {
    root: PathBuf,
    store: Arc<SyncStateStore>,
    state: Mutex<SyncState>,
    watcher: SharedWatcher,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<PathBuf>>>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<PathBuf>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl FolderSyncEngine {
    pub fn new(root: impl Into<PathBuf>, state_file: impl Into<PathBuf>) -> Result<Self> {
        let store = SyncStateStore::load(state_file)?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Ok(Self {
            root: root.into(),
            store: Arc::new(store),
            state: Mutex::new(SyncState::Idle),
            watcher: Arc::new(Mutex::new(None)),
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx: Mutex::new(Some(queue_rx)),
            event_loop: Mutex::new(None),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    pub fn store(&self) -> &Arc<SyncStateStore> {
        &self.store
    }

    /// Hand out the receiving end of the upload queue; there is only one.
    pub fn take_upload_queue(&self) -> Option<mpsc::UnboundedReceiver<PathBuf>> {
        self.queue_rx.lock().take()
    }

    /// Walk the root, queue what changed since the last run, then follow
    /// filesystem notifications until stopped.
    pub async fn start(&self) -> Result<()> {
        if self.state() != SyncState::Idle {
            return Err(BackupError::Sync(format!(
                "sync engine for {} already started",
                self.root.display()
            )));
        }
        if !self.root.is_dir() {
            return Err(BackupError::Sync(format!(
                "watch root is not a directory: {}",
                self.root.display()
            )));
        }

        let queue = self
            .queue_tx
            .lock()
            .clone()
            .ok_or_else(|| BackupError::Sync("upload queue already closed".into()))?;

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Receiver gone means the engine is stopping
            let _ = raw_tx.send(res);
        })
        .map_err(|e| BackupError::Sync(format!("failed to create watcher: {e}")))?;
        *self.watcher.lock() = Some(watcher);

        let queued = {
            let root = self.root.clone();
            let store = self.store.clone();
            let watcher = self.watcher.clone();
            let queue = queue.clone();
            tokio::task::spawn_blocking(move || scan_tree(&root, &store, &watcher, &queue))
                .await
                .map_err(|e| BackupError::Sync(format!("initial scan failed: {e}")))??
        };
        info!(
            root = %self.root.display(),
            queued,
            tracked = self.store.len(),
            "Initial scan complete"
        );

        *self.state.lock() = SyncState::Watching;

        let store = self.store.clone();
        let watcher = self.watcher.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = raw_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    Ok(event) if is_content_event(&event.kind) => {
                        let store = store.clone();
                        let watcher = watcher.clone();
                        let queue = queue.clone();
                        let handled = tokio::task::spawn_blocking(move || {
                            for path in &event.paths {
                                handle_path(path, &store, &watcher, &queue);
                            }
                        })
                        .await;
                        if let Err(e) = handled {
                            error!("Sync event handler failed: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("File watcher error: {}", e),
                }
            }
            debug!("Sync event loop exited");
        });
        *self.event_loop.lock() = Some(handle);

        Ok(())
    }

    /// Stop watching and flush fingerprints. Only the first call has any
    /// effect.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.cancel();
        self.watcher.lock().take();

        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Sync event loop panicked: {}", e);
            }
        }

        // Closes the queue once the consumer has drained it
        self.queue_tx.lock().take();
        *self.state.lock() = SyncState::Stopped;

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save())
            .await
            .map_err(|e| BackupError::Sync(format!("state flush failed: {e}")))??;

        info!(root = %self.root.display(), "Stopped folder sync");
        Ok(())
    }
}

impl Drop for FolderSyncEngine {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) || self.state() == SyncState::Idle {
            return;
        }
        // Dropped without stop(): end the watch and keep what was observed
        self.cancel.cancel();
        self.watcher.lock().take();
        if let Err(e) = self.store.save() {
            error!(root = %self.root.display(), "Failed to flush sync state: {}", e);
        }
        warn!(root = %self.root.display(), "Sync engine dropped while running");
    }
}

fn is_content_event(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// Register every directory under `dir` and observe every file.
/// Returns how many files were queued.
fn scan_tree(
    dir: &Path,
    store: &SyncStateStore,
    watcher: &SharedWatcher,
    queue: &mpsc::UnboundedSender<PathBuf>,
) -> Result<usize> {
    let mut queued = 0;
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            watch_dir(entry.path(), watcher)?;
        } else if entry.file_type().is_file() && observe_and_queue(entry.path(), store, queue) {
            queued += 1;
        }
    }
    Ok(queued)
}

fn handle_path(
    path: &Path,
    store: &SyncStateStore,
    watcher: &SharedWatcher,
    queue: &mpsc::UnboundedSender<PathBuf>,
) {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            debug!(path = %path.display(), "Ignoring event for vanished path: {}", e);
            return;
        }
    };

    if metadata.is_dir() {
        // Files may land in a new directory before it is watched
        if let Err(e) = scan_tree(path, store, watcher, queue) {
            warn!(path = %path.display(), "Failed to register new directory: {}", e);
        }
    } else if metadata.is_file() {
        observe_and_queue(path, store, queue);
    }
}

fn observe_and_queue(path: &Path, store: &SyncStateStore, queue: &mpsc::UnboundedSender<PathBuf>) -> bool {
    match store.observe(path) {
        Ok(true) => {
            debug!(path = %path.display(), "Queued for upload");
            queue.send(path.to_path_buf()).is_ok()
        }
        Ok(false) => false,
        Err(e) => {
            warn!(path = %path.display(), "Failed to fingerprint file: {}", e);
            false
        }
    }
}

fn watch_dir(path: &Path, watcher: &SharedWatcher) -> Result<()> {
    match watcher.lock().as_mut() {
        Some(watcher) => watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| BackupError::Sync(format!("failed to watch {}: {e}", path.display()))),
        None => Ok(()),
    }
}
