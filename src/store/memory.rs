//! In-memory credential store for development and testing.
//!
//! For production use, see [`FileCredentialStore`](crate::store::FileCredentialStore)
//! or implement [`CredentialStore`] over a database.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::store::{CredentialStore, StoreError, StoreResult, StoredCredential};
use crate::types::AccountId;

/// In-memory implementation of [`CredentialStore`].
#[derive(Default)]
pub struct MemoryCredentialStore {
    rows: RwLock<HashMap<AccountId, StoredCredential>>,
}

impl MemoryCredentialStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("lock poisoned".to_string())
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, account: &AccountId) -> StoreResult<Option<StoredCredential>> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.get(account).cloned())
    }

    async fn put(&self, account: &AccountId, blob: &[u8]) -> StoreResult<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        rows.insert(
            account.clone(),
            StoredCredential {
                account: account.clone(),
                blob: blob.to_vec(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, account: &AccountId) -> StoreResult<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        rows.remove(account);
        Ok(())
    }
}
