//! Credential store trait.
//!
//! Durable per-account persistence of the opaque encrypted credential blob.
//! Implementations know nothing about the protocol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::AccountId;

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The persisted authentication material of one account.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCredential {
    pub account: AccountId,
    /// Encrypted blob produced by the session codec.
    pub blob: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// One row per account, upsert and delete by key.
///
/// Every operation is idempotent. Calls for different accounts may run
/// concurrently; calls for the same account are serialized by its session.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the credential of an account, if one is stored.
    async fn get(&self, account: &AccountId) -> StoreResult<Option<StoredCredential>>;

    /// Insert or replace the credential of an account.
    async fn put(&self, account: &AccountId, blob: &[u8]) -> StoreResult<()>;

    /// Remove the credential of an account. Removing a missing row succeeds.
    async fn delete(&self, account: &AccountId) -> StoreResult<()>;
}
