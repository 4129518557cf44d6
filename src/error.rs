//! Errors surfaced by session operations.

use thiserror::Error;

use crate::store::{CorruptCredentialError, StoreError};

/// Errors returned by session handles, the registry and the gateway.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("stored credential is unusable: {0}")]
    CorruptCredential(String),
    #[error("credential storage failed: {0}")]
    Storage(#[from] StoreError),
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },
    #[error("account is not connected")]
    NotConnected,
    #[error("pairing challenges expired without being scanned")]
    PairingExpired,
    #[error("session was logged out")]
    LoggedOut,
    #[error("server closed the session: {0}")]
    Fatal(String),
    #[error("operation cancelled by disconnect")]
    Cancelled,
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("session is closed")]
    Closed,
}

impl From<CorruptCredentialError> for SessionError {
    fn from(err: CorruptCredentialError) -> Self {
        Self::CorruptCredential(err.reason)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
