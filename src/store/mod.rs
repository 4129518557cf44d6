//! Storage module for WhatsApp session persistence.
//!
//! Provides the authentication state, the codec that turns it into an
//! encrypted blob, and the credential stores holding those blobs.

mod auth;
mod codec;
mod traits;
mod memory;
mod file;

pub use auth::{AuthState, CredentialUpdate};
pub use codec::{CorruptCredentialError, SessionCodec};
pub use traits::*;
pub use memory::MemoryCredentialStore;
pub use file::FileCredentialStore;
