//! AES-GCM sealing for credential blobs.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

use crate::crypto::hkdf::derive_key;

const BLOB_KEY_SALT: &[u8] = b"wa-session/credential-blob";
const BLOB_KEY_INFO: &[u8] = b"aes-256-gcm";

/// AES-256-GCM cipher with a fresh random nonce per sealed blob.
#[derive(Clone)]
pub struct BlobCipher {
    key: [u8; 32],
}

impl BlobCipher {
    /// Create a new cipher with the given key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the blob key from a configured secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        Self::new(derive_key(secret, BLOB_KEY_SALT, BLOB_KEY_INFO))
    }

    /// Encrypt `plaintext`, returning the nonce used and the ciphertext.
    pub fn seal(&self, plaintext: &[u8], ad: &[u8]) -> Result<([u8; 12], Vec<u8>), CipherError> {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .aead()?
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ad })
            .map_err(|_| CipherError::EncryptionFailed)?;
        Ok((nonce, ciphertext))
    }

    /// Decrypt and authenticate a sealed blob.
    pub fn open(&self, nonce: &[u8; 12], ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.aead()?
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| CipherError::DecryptionFailed)
    }

    fn aead(&self) -> Result<Aes256Gcm, CipherError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::InvalidKey)
    }
}

impl std::fmt::Debug for BlobCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCipher").field("key", &"[REDACTED]").finish()
    }
}

/// Cipher errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}
