use super::encryption::{EncryptionManager, KEY_LEN};
use crate::error::{BackupError, Result};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CREDENTIALS_FILE: &str = "credentials.enc";
const SALT_LEN: usize = 16;

/// Vault entry name under which a task's payload key is kept
pub fn task_key_entry(task_id: &str) -> String {
    format!("task-key:{task_id}")
}

/// Opaque per-provider secret triple.
///
/// Depending on the provider the key/secret pair is an OAuth client id and
/// secret or a raw API token; the vault does not interpret it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub provider: String,
    pub key: String,
    pub secret: String,
    #[serde(default)]
    pub redirect_url: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .field("redirect_url", &self.redirect_url)
            .finish()
    }
}

impl Credential {
    /// Vault entry carrying a task's payload key in the secret field
    pub fn task_key(task_id: &str, key: &str) -> Self {
        Self {
            provider: task_key_entry(task_id),
            key: String::new(),
            secret: key.to_string(),
            redirect_url: String::new(),
        }
    }
}

type CredentialMap = BTreeMap<String, Credential>;

/// Encrypted-at-rest store of provider credentials.
///
/// The whole map is sealed as one blob: `base64(salt || nonce || ciphertext || tag)`
/// where the key is Argon2id(master password, salt). Every operation is a
/// read-decrypt-modify-encrypt-write cycle under the lock; writers replace
/// the file atomically so readers never see a partial write.
pub struct CredentialVault {
    path: PathBuf,
    salt: [u8; SALT_LEN],
    cipher: EncryptionManager,
    lock: RwLock<()>,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Unlock (or create) the vault in `dir` with the master password.
    ///
    /// An existing vault is verified immediately so a wrong password fails
    /// here rather than on first use.
    pub fn open(dir: &Path, master_password: &str) -> Result<Self> {
        if master_password.is_empty() {
            return Err(BackupError::Credential("master password is required".into()));
        }

        create_private_dir(dir)?;
        let path = dir.join(CREDENTIALS_FILE);

        let salt = match read_sealed(&path)? {
            Some(sealed) => {
                let salt = split_salt(&sealed)?.0;
                let vault = Self::with_salt(path, salt, master_password)?;
                vault.load_unlocked()?;
                info!("Unlocked credential vault at {}", vault.path.display());
                return Ok(vault);
            }
            None => {
                let mut salt = [0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                salt
            }
        };

        debug!("Creating new credential vault at {}", path.display());
        Self::with_salt(path, salt, master_password)
    }

    fn with_salt(path: PathBuf, salt: [u8; SALT_LEN], master_password: &str) -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(master_password.as_bytes(), &salt, &mut key)
            .map_err(|e| BackupError::Credential(format!("key derivation failed: {e}")))?;

        Ok(Self {
            path,
            salt,
            cipher: EncryptionManager::from_key(key),
            lock: RwLock::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a vault operation on the blocking pool. Every operation reads
    /// and rewrites the file, so async callers go through here.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: FnOnce(&CredentialVault) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let vault = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&vault))
            .await
            .map_err(|e| BackupError::Credential(format!("vault worker failed: {e}")))?
    }

    pub fn store_credential(&self, credential: Credential) -> Result<()> {
        if credential.provider.trim().is_empty() {
            return Err(BackupError::Validation("credential provider name is required".into()));
        }

        let _guard = self.lock.write();
        let mut credentials = self.load_unlocked()?;
        info!(provider = %credential.provider, "Storing credentials");
        credentials.insert(credential.provider.clone(), credential);
        self.save_unlocked(&credentials)
    }

    pub fn get_credential(&self, provider: &str) -> Result<Credential> {
        let _guard = self.lock.read();
        self.load_unlocked()?
            .remove(provider)
            .ok_or_else(|| BackupError::CredentialNotFound(provider.to_string()))
    }

    /// Remove a provider entry; removing an absent entry is not an error.
    pub fn delete_credential(&self, provider: &str) -> Result<()> {
        let _guard = self.lock.write();
        let mut credentials = self.load_unlocked()?;
        if credentials.remove(provider).is_some() {
            info!(provider = %provider, "Deleting credentials");
            self.save_unlocked(&credentials)?;
        }
        Ok(())
    }

    /// Names of every stored entry, task keys included
    pub fn list_providers(&self) -> Result<Vec<String>> {
        let _guard = self.lock.read();
        Ok(self.load_unlocked()?.into_keys().collect())
    }

    fn load_unlocked(&self) -> Result<CredentialMap> {
        let Some(sealed) = read_sealed(&self.path)? else {
            return Ok(CredentialMap::new());
        };

        let (_, body) = split_salt(&sealed)?;
        let plaintext = self.cipher.decrypt(body).map_err(|_| {
            BackupError::Credential(
                "failed to decrypt credentials: wrong master password or corrupted vault".into(),
            )
        })?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| BackupError::Credential(format!("failed to parse credentials: {e}")))
    }

    fn save_unlocked(&self, credentials: &CredentialMap) -> Result<()> {
        let plaintext = serde_json::to_vec(credentials)?;
        let body = self
            .cipher
            .encrypt(&plaintext)
            .map_err(|e| BackupError::Credential(format!("failed to encrypt credentials: {e}")))?;

        let mut sealed = Vec::with_capacity(SALT_LEN + body.len());
        sealed.extend_from_slice(&self.salt);
        sealed.extend_from_slice(&body);

        write_atomic_private(&self.path, BASE64.encode(sealed).as_bytes())
            .map_err(|e| BackupError::Credential(format!("failed to write credentials file: {e}")))
    }
}

fn read_sealed(path: &Path) -> Result<Option<Vec<u8>>> {
    let armored = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(BackupError::Credential(format!(
                "failed to read credentials file: {e}"
            )))
        }
    };
    if armored.trim().is_empty() {
        return Ok(None);
    }

    BASE64
        .decode(armored.trim())
        .map(Some)
        .map_err(|e| BackupError::Credential(format!("credentials file is not valid base64: {e}")))
}

fn split_salt(sealed: &[u8]) -> Result<([u8; SALT_LEN], &[u8])> {
    if sealed.len() < SALT_LEN {
        return Err(BackupError::Credential("credentials file is truncated".into()));
    }
    let (salt_bytes, body) = sealed.split_at(SALT_LEN);
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(salt_bytes);
    Ok((salt, body))
}

fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|e| BackupError::Credential(format!("failed to create credentials directory: {e}")))
}

/// Write to a sibling temp file (0600), fsync, then rename over the target.
fn write_atomic_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("enc.tmp");

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)
}
