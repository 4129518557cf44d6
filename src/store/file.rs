//! File-backed credential store: one JSON row per account.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::store::{CredentialStore, StoreError, StoreResult, StoredCredential};
use crate::types::AccountId;

/// On-disk layout of a stored row.
#[derive(Serialize, Deserialize)]
struct Row {
    account: AccountId,
    #[serde(with = "crate::crypto::b64::vec")]
    blob: Vec<u8>,
    updated_at: DateTime<Utc>,
}

/// Stores each account's credential in `<dir>/<hex(account)>.json`.
///
/// Rows are written to a temporary file and renamed into place, so readers
/// never observe a partially written row.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(io_error)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn row_path(&self, account: &AccountId) -> PathBuf {
        // Account ids are opaque; hex keeps them filesystem-safe.
        self.dir.join(format!("{}.json", hex::encode(account.as_str())))
    }
}

fn io_error(err: std::io::Error) -> StoreError {
    StoreError::DatabaseError(err.to_string())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, account: &AccountId) -> StoreResult<Option<StoredCredential>> {
        let raw = match fs::read(self.row_path(account)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(err)),
        };
        let row: Row = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        if &row.account != account {
            return Err(StoreError::DatabaseError(format!(
                "row for {} holds credentials of {}",
                account, row.account
            )));
        }

        Ok(Some(StoredCredential {
            account: row.account,
            blob: row.blob,
            updated_at: row.updated_at,
        }))
    }

    async fn put(&self, account: &AccountId, blob: &[u8]) -> StoreResult<()> {
        let row = Row {
            account: account.clone(),
            blob: blob.to_vec(),
            updated_at: Utc::now(),
        };
        let serialized = serde_json::to_vec_pretty(&row)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let path = self.row_path(account);
        let tmp = path.with_extension(format!("json.{:08x}.tmp", rand::random::<u32>()));
        fs::write(&tmp, serialized).await.map_err(io_error)?;
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(err));
        }
        Ok(())
    }

    async fn delete(&self, account: &AccountId) -> StoreResult<()> {
        match fs::remove_file(self.row_path(account)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path().join("creds")).await.unwrap();
        let account = AccountId::from("tenant/with spaces");

        assert!(store.get(&account).await.unwrap().is_none());

        store.put(&account, b"blob-1").await.unwrap();
        store.put(&account, b"blob-2").await.unwrap();
        let row = store.get(&account).await.unwrap().unwrap();
        assert_eq!(row.blob, b"blob-2");
        assert_eq!(row.account, account);

        store.delete(&account).await.unwrap();
        store.delete(&account).await.unwrap();
        assert!(store.get(&account).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_leaves_no_temporary_files() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        store.put(&AccountId::from("a"), b"x").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", hex::encode("a"))]);
    }

    #[tokio::test]
    async fn test_file_store_reports_unreadable_rows() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path()).await.unwrap();
        let account = AccountId::from("broken");
        std::fs::write(store.row_path(&account), b"{not json").unwrap();

        assert!(matches!(
            store.get(&account).await,
            Err(StoreError::SerializationError(_))
        ));
    }
}
