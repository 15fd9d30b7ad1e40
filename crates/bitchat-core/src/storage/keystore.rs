//! Database key management.
//!
//! The message/contact database is encrypted with a random 256-bit key
//! that never touches disk in plaintext. The key is wrapped by a
//! [`SecureEnclave`] (the OS keystore on mobile platforms; a
//! per-install machine secret here) and only the wrapped form is
//! persisted. `shred` destroys the wrapped key, making any surviving
//! ciphertext unreadable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hmac::Hmac;
use rand::RngCore;
use sha2::Sha256;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Size of the database encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the AEAD nonce in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// PBKDF2 iterations for deriving the wrapping key from the machine
/// secret.
pub const WRAP_ITERATIONS: u32 = 100_000;

/// Context salt for the wrapping-key derivation.
const WRAP_SALT: &[u8] = b"bitchat.dbkey.wrap.v1";

/// File name of the wrapped database key.
pub const WRAPPED_KEY_FILE: &str = "dbkey.wrapped";

/// File name of the per-install machine secret.
pub const MACHINE_SECRET_FILE: &str = "machine.secret";

/// Seam to the OS-managed key wrapping facility.
///
/// `wrap` must be the inverse of `unwrap_key`; implementations bind the
/// wrapped blob to a stable per-install identifier so it cannot be
/// unwrapped on another device.
pub trait SecureEnclave: Send + Sync {
    /// Wrap key material for at-rest storage.
    fn wrap(&self, key: &[u8]) -> Result<Vec<u8>>;
    /// Unwrap previously wrapped key material.
    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// Default enclave: a per-install random machine secret on disk, with
/// the database key wrapped by ChaCha20-Poly1305 under a
/// PBKDF2-HMAC-SHA256-derived wrapping key.
pub struct MachineEnclave {
    secret_path: PathBuf,
}

impl MachineEnclave {
    /// Create an enclave rooted in the given data directory.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            secret_path: data_dir.join(MACHINE_SECRET_FILE),
        }
    }

    /// Load the machine secret, generating it on first use.
    fn machine_secret(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        if self.secret_path.exists() {
            let bytes = std::fs::read(&self.secret_path)?;
            let secret: [u8; KEY_SIZE] = bytes
                .try_into()
                .map_err(|_| Error::Crypto("machine secret corrupted".into()))?;
            return Ok(Zeroizing::new(secret));
        }

        let mut secret = Zeroizing::new([0u8; KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(secret.as_mut());
        if let Some(parent) = self.secret_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.secret_path, secret.as_ref())?;
        Ok(secret)
    }

    /// Derive the wrapping key from the machine secret.
    fn wrapping_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let secret = self.machine_secret()?;
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        pbkdf2::pbkdf2::<Hmac<Sha256>>(secret.as_ref(), WRAP_SALT, WRAP_ITERATIONS, key.as_mut())
            .map_err(|_| Error::Crypto("key derivation failed".into()))?;
        Ok(key)
    }
}

impl SecureEnclave for MachineEnclave {
    fn wrap(&self, key: &[u8]) -> Result<Vec<u8>> {
        let wrap_key = self.wrapping_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(wrap_key.as_ref()));

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), key)
            .map_err(|_| Error::Crypto("key wrap failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if wrapped.len() < NONCE_SIZE {
            return Err(Error::Crypto("wrapped key too short".into()));
        }
        let (nonce, ciphertext) = wrapped.split_at(NONCE_SIZE);

        let wrap_key = self.wrapping_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(wrap_key.as_ref()));

        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("key unwrap failed".into()))?;
        Ok(Zeroizing::new(plaintext))
    }
}

/// Keystore for the database encryption key.
pub struct EncryptedDbKeystore {
    enclave: Arc<dyn SecureEnclave>,
    wrapped_path: PathBuf,
    cached: Mutex<Option<Zeroizing<[u8; KEY_SIZE]>>>,
}

impl EncryptedDbKeystore {
    /// Create a keystore rooted in the given data directory, using the
    /// default machine enclave.
    pub fn new(data_dir: &Path) -> Self {
        Self::with_enclave(data_dir, Arc::new(MachineEnclave::new(data_dir)))
    }

    /// Create a keystore with an explicit enclave implementation.
    pub fn with_enclave(data_dir: &Path, enclave: Arc<dyn SecureEnclave>) -> Self {
        Self {
            enclave,
            wrapped_path: data_dir.join(WRAPPED_KEY_FILE),
            cached: Mutex::new(None),
        }
    }

    /// Return the database key, generating and persisting (wrapped) a
    /// fresh one on first call.
    pub async fn get_or_create(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let mut cached = self.cached.lock().await;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = if self.wrapped_path.exists() {
            let wrapped = std::fs::read(&self.wrapped_path)?;
            let plain = self.enclave.unwrap_key(&wrapped)?;
            let key: [u8; KEY_SIZE] = plain
                .as_slice()
                .try_into()
                .map_err(|_| Error::Crypto("unwrapped key has wrong length".into()))?;
            Zeroizing::new(key)
        } else {
            let mut key = Zeroizing::new([0u8; KEY_SIZE]);
            rand::rngs::OsRng.fill_bytes(key.as_mut());

            let wrapped = self.enclave.wrap(key.as_ref())?;
            if let Some(parent) = self.wrapped_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&self.wrapped_path, wrapped)?;
            tracing::info!("Generated fresh database key");
            key
        };

        *cached = Some(key.clone());
        Ok(key)
    }

    /// Destroy the wrapped key and any cached copy. A subsequent
    /// `get_or_create` generates a fresh key, making any surviving
    /// ciphertext unreadable.
    pub async fn shred(&self) -> Result<()> {
        let mut cached = self.cached.lock().await;
        *cached = None;

        match std::fs::remove_file(&self.wrapped_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of the wrapped key file (for the panic wipe inventory).
    pub fn wrapped_key_path(&self) -> &Path {
        &self.wrapped_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keystore = EncryptedDbKeystore::new(dir.path());

        let k1 = keystore.get_or_create().await.expect("create");
        let k2 = keystore.get_or_create().await.expect("reload");
        assert_eq!(k1.as_ref(), k2.as_ref());

        // A second keystore over the same directory unwraps the same key.
        let keystore2 = EncryptedDbKeystore::new(dir.path());
        let k3 = keystore2.get_or_create().await.expect("unwrap");
        assert_eq!(k1.as_ref(), k3.as_ref());
    }

    #[tokio::test]
    async fn test_shred_produces_fresh_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keystore = EncryptedDbKeystore::new(dir.path());

        let before = keystore.get_or_create().await.expect("create");
        keystore.shred().await.expect("shred");
        assert!(!keystore.wrapped_key_path().exists());

        let after = keystore.get_or_create().await.expect("recreate");
        assert_ne!(before.as_ref(), after.as_ref());
    }

    #[tokio::test]
    async fn test_shred_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keystore = EncryptedDbKeystore::new(dir.path());
        keystore.shred().await.expect("shred without key");
    }

    #[test]
    fn test_wrap_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let enclave = MachineEnclave::new(dir.path());

        let key = [0x5Au8; KEY_SIZE];
        let wrapped = enclave.wrap(&key).expect("wrap");
        assert_ne!(&wrapped[..], &key[..]);

        let unwrapped = enclave.unwrap_key(&wrapped).expect("unwrap");
        assert_eq!(unwrapped.as_slice(), &key[..]);
    }

    #[test]
    fn test_unwrap_rejects_tampering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let enclave = MachineEnclave::new(dir.path());

        let mut wrapped = enclave.wrap(&[0x5Au8; KEY_SIZE]).expect("wrap");
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;
        assert!(enclave.unwrap_key(&wrapped).is_err());
    }
}
