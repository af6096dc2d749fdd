pub mod encryption;
pub mod vault;

pub use encryption::EncryptionManager;
pub use vault::{task_key_entry, Credential, CredentialVault};
