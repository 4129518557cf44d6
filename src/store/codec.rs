//! Session codec: authentication state to/from the encrypted blob format.
//!
//! Blob layout is a JSON envelope `{version, nonce, ciphertext}` where the
//! ciphertext is the AES-256-GCM sealed JSON of an [`AuthState`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::BlobCipher;
use crate::store::{AuthState, StoreError};

const ENVELOPE_VERSION: u8 = 1;
const ENVELOPE_AD: &[u8] = b"wa-session/auth-state/v1";

/// The stored blob could not be turned back into a usable session.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("corrupt credential: {reason}")]
pub struct CorruptCredentialError {
    pub reason: String,
}

impl CorruptCredentialError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u8,
    #[serde(with = "crate::crypto::b64")]
    nonce: [u8; 12],
    #[serde(with = "crate::crypto::b64::vec")]
    ciphertext: Vec<u8>,
}

/// Encodes and decodes [`AuthState`] blobs.
#[derive(Debug, Clone)]
pub struct SessionCodec {
    cipher: BlobCipher,
}

impl SessionCodec {
    pub fn new(cipher: BlobCipher) -> Self {
        Self { cipher }
    }

    /// Build a codec keyed from the configured encryption secret.
    pub fn from_secret(secret: &str) -> Self {
        Self::new(BlobCipher::from_secret(secret.as_bytes()))
    }

    /// Serialize and seal the full state. Called after every incremental
    /// update, so the latest blob always reflects the latest state.
    pub fn encode(&self, state: &AuthState) -> Result<Vec<u8>, StoreError> {
        let plaintext =
            serde_json::to_vec(state).map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let (nonce, ciphertext) = self
            .cipher
            .seal(&plaintext, ENVELOPE_AD)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        serde_json::to_vec(&Envelope {
            version: ENVELOPE_VERSION,
            nonce,
            ciphertext,
        })
        .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    /// Open a blob and check the resulting state can resume a session.
    pub fn decode(&self, blob: &[u8]) -> Result<AuthState, CorruptCredentialError> {
        let envelope: Envelope = serde_json::from_slice(blob)
            .map_err(|e| CorruptCredentialError::new(format!("unreadable envelope: {}", e)))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CorruptCredentialError::new(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }

        let plaintext = self
            .cipher
            .open(&envelope.nonce, &envelope.ciphertext, ENVELOPE_AD)
            .map_err(|_| CorruptCredentialError::new("cannot decrypt (wrong secret or tampered blob)"))?;
        let state: AuthState = serde_json::from_slice(&plaintext)
            .map_err(|e| CorruptCredentialError::new(format!("unreadable state: {}", e)))?;
        state.validate().map_err(CorruptCredentialError::new)?;

        Ok(state)
    }
}
