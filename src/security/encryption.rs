//! Authenticated encryption for task payloads and the credential vault.
//!
//! AES-256-GCM with a fresh 12-byte nonce per call. The sealed form is
//! `nonce || ciphertext || tag`, self-contained apart from the key.

use crate::error::{BackupError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Extension given to encrypted side-car artifacts
pub const ENCRYPTED_EXTENSION: &str = "enc";

#[derive(Clone)]
pub struct EncryptionManager {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl EncryptionManager {
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Key a manager from a per-task passphrase (SHA-256 of the text).
    ///
    /// Task keys are either random (see [`EncryptionManager::generate_key`])
    /// or chosen by the user; the vault derives its own key with Argon2.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(BackupError::Transform("encryption key must not be empty".into()));
        }
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }

    /// Fresh random task key, base64 encoded.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| BackupError::Transform(format!("encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(BackupError::Transform("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| BackupError::Transform("decryption failed: wrong key or corrupted data".into()))
    }

    /// Base64-armored form of [`EncryptionManager::encrypt`]
    pub fn encrypt_armored(&self, plaintext: &[u8]) -> Result<String> {
        Ok(BASE64.encode(self.encrypt(plaintext)?))
    }

    pub fn decrypt_armored(&self, armored: &str) -> Result<Vec<u8>> {
        let sealed = BASE64
            .decode(armored.trim())
            .map_err(|e| BackupError::Transform(format!("failed to decode base64: {e}")))?;
        self.decrypt(&sealed)
    }

    /// Encrypt `source` into `out_dir/<stem>.enc` and return the new path.
    pub async fn encrypt_file(&self, source: &Path, out_dir: &Path, stem: &str) -> Result<PathBuf> {
        let plaintext = tokio::fs::read(source).await.map_err(|e| {
            BackupError::Transform(format!("failed to read {}: {e}", source.display()))
        })?;

        let manager = self.clone();
        let sealed = tokio::task::spawn_blocking(move || manager.encrypt(&plaintext))
            .await
            .map_err(|e| BackupError::Transform(format!("encryption worker failed: {e}")))??;

        let target = out_dir.join(format!("{stem}.{ENCRYPTED_EXTENSION}"));
        write_private(&target, &sealed).await?;
        Ok(target)
    }

    /// Decrypt an artifact produced by [`EncryptionManager::encrypt_file`].
    pub async fn decrypt_file(&self, encrypted: &Path, output: &Path) -> Result<PathBuf> {
        let sealed = tokio::fs::read(encrypted).await.map_err(|e| {
            BackupError::Transform(format!("failed to read {}: {e}", encrypted.display()))
        })?;
        let plaintext = self.decrypt(&sealed)?;
        write_private(output, &plaintext).await?;
        Ok(output.to_path_buf())
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| BackupError::Transform(format!("failed to create cipher: {e}")))
    }
}

async fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let write = async {
        use tokio::io::AsyncWriteExt;
        let mut file = options.open(path).await?;
        file.write_all(data).await?;
        file.flush().await
    };
    write
        .await
        .map_err(|e| BackupError::Transform(format!("failed to write {}: {e}", path.display())))
}
