pub mod engine;
pub mod state;

pub use engine::{FolderSyncEngine, SyncState};
pub use state::{FileFingerprint, SyncStateStore};
