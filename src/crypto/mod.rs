//! Cryptographic primitives for WhatsApp sessions.
//!
//! This module provides the key material carried in the authentication state
//! and the sealing used for credential blobs at rest.

pub mod b64;
mod keypair;
mod hkdf;
mod cipher;

pub use keypair::{KeyPair, PreKey};
pub use hkdf::{derive_key, derive_key_pair};
pub use cipher::{BlobCipher, CipherError};
