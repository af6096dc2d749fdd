//! Backup orchestration engine: task lifecycle, retries with backoff,
//! folder sync and an encrypted credential vault.

pub mod backup;
pub mod cli;
pub mod error;
pub mod provider;
pub mod security;
pub mod storage;
pub mod sync;
pub mod utils;

pub use backup::{BackupTask, TaskManager, TaskSpec, TaskStatus};
pub use error::{BackupError, Result};
pub use provider::{ProviderRegistry, StorageProvider};
pub use security::{Credential, CredentialVault, EncryptionManager};
pub use utils::config::Config;
pub use utils::retry::RetryPolicy;
