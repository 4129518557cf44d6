//! Noise_XX_25519_AESGCM_SHA256 handshake state and transport ciphers.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::derive_key_pair;

/// Protocol name, exactly 32 bytes so it seeds the hash unhashed.
pub const NOISE_PATTERN: &[u8; 32] = b"Noise_XX_25519_AESGCM_SHA256\0\0\0\0";

/// Prologue sent in front of the first frame: `WA`, protocol 6, dictionary 3.
pub const WA_HEADER: [u8; 4] = [b'W', b'A', 6, 3];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NoiseError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

fn nonce(counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

fn seal(key: &[u8; 32], counter: u32, aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| NoiseError::Encrypt)?;
    cipher
        .encrypt(Nonce::from_slice(&nonce(counter)), Payload { msg, aad })
        .map_err(|_| NoiseError::Encrypt)
}

fn open(key: &[u8; 32], counter: u32, aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, NoiseError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| NoiseError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce(counter)), Payload { msg, aad })
        .map_err(|_| NoiseError::Decrypt)
}

/// Symmetric state of a handshake in progress.
pub struct NoiseState {
    hash: [u8; 32],
    salt: [u8; 32],
    key: [u8; 32],
    counter: u32,
}

impl NoiseState {
    /// Start a handshake and mix in the prologue.
    pub fn new(prologue: &[u8]) -> Self {
        let mut state = Self {
            hash: *NOISE_PATTERN,
            salt: *NOISE_PATTERN,
            key: *NOISE_PATTERN,
            counter: 0,
        };
        state.authenticate(prologue);
        state
    }

    /// Mix public data into the transcript hash.
    pub fn authenticate(&mut self, data: &[u8]) {
        self.hash = Sha256::new()
            .chain_update(self.hash)
            .chain_update(data)
            .finalize()
            .into();
    }

    /// Encrypt a handshake payload bound to the transcript.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = seal(&self.key, self.counter, &self.hash, plaintext)?;
        self.counter += 1;
        self.authenticate(&ciphertext);
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let plaintext = open(&self.key, self.counter, &self.hash, ciphertext)?;
        self.counter += 1;
        self.authenticate(ciphertext);
        Ok(plaintext)
    }

    /// Mix a Diffie-Hellman result into the chaining key.
    pub fn mix_shared_secret(&mut self, private: &[u8; 32], public: &[u8; 32]) {
        let shared = StaticSecret::from(*private).diffie_hellman(&PublicKey::from(*public));
        let (salt, key) = derive_key_pair(shared.as_bytes(), &self.salt);
        self.salt = salt;
        self.key = key;
        self.counter = 0;
    }

    /// Finish the handshake: `(write, read)` ciphers for the initiator.
    pub fn split(&self) -> (FrameCipher, FrameCipher) {
        let (write, read) = derive_key_pair(&[], &self.salt);
        (FrameCipher::new(write), FrameCipher::new(read))
    }
}

/// One direction of the post-handshake transport.
pub struct FrameCipher {
    key: [u8; 32],
    counter: u32,
}

impl FrameCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let ciphertext = seal(&self.key, self.counter, &[], plaintext)?;
        self.counter += 1;
        Ok(ciphertext)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let plaintext = open(&self.key, self.counter, &[], ciphertext)?;
        self.counter += 1;
        Ok(plaintext)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher")
            .field("key", &"[REDACTED]")
            .field("counter", &self.counter)
            .finish()
    }
}
