//! Cryptographic key pair utilities for WhatsApp protocol.
//!
//! Provides Curve25519 key pair generation and pre-key signing.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

/// A Curve25519 key pair for Signal Protocol operations.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Public key (32 bytes)
    #[serde(with = "crate::crypto::b64")]
    pub public: [u8; 32],
    /// Private key (32 bytes)
    #[serde(with = "crate::crypto::b64")]
    pub private: [u8; 32],
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);

        // Curve25519 clamping
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;

        Self::from_private_key(private)
    }

    /// Create a key pair from an existing private key.
    pub fn from_private_key(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);

        Self {
            public: *public.as_bytes(),
            private,
        }
    }

    /// Whether the public half really belongs to the private half.
    pub fn is_consistent(&self) -> bool {
        Self::from_private_key(self.private).public == self.public
    }

    /// Sign another key's public half: `sig(0x05 || public)`.
    pub fn sign(&self, key_to_sign: &KeyPair) -> [u8; 64] {
        let signing_key = SigningKey::from_bytes(&self.private);
        signing_key.sign(&djb_message(&key_to_sign.public)).to_bytes()
    }

    /// Check a signature produced by [`KeyPair::sign`].
    pub fn verify(&self, signed: &KeyPair, signature: &[u8; 64]) -> bool {
        let verifying_key = SigningKey::from_bytes(&self.private).verifying_key();
        verifying_key
            .verify(&djb_message(&signed.public), &Signature::from_bytes(signature))
            .is_ok()
    }
}

fn djb_message(public: &[u8; 32]) -> [u8; 33] {
    let mut message = [0u8; 33];
    message[0] = 0x05; // DJB type
    message[1..].copy_from_slice(public);
    message
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public))
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// A pre-key for Signal Protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey {
    /// The key pair
    pub key_pair: KeyPair,
    /// Key ID
    pub key_id: u32,
    /// Signature (if signed pre-key)
    #[serde(default, with = "crate::crypto::b64::option")]
    pub signature: Option<[u8; 64]>,
}

impl PreKey {
    /// Generate a new pre-key with the given ID.
    pub fn new(key_id: u32) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            key_id,
            signature: None,
        }
    }

    /// Generate a signed pre-key.
    pub fn new_signed(key_id: u32, identity_key: &KeyPair) -> Self {
        let mut pre_key = Self::new(key_id);
        pre_key.signature = Some(identity_key.sign(&pre_key.key_pair));
        pre_key
    }

    /// Generate `count` consecutive one-time pre-keys starting at `first_id`.
    pub fn batch(first_id: u32, count: u32) -> Vec<Self> {
        (first_id..first_id.saturating_add(count)).map(Self::new).collect()
    }
}
