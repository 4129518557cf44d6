use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::protocol::PairingChallenge;
use crate::types::{AccountId, JID};

/// Connection state of one account. Lives in memory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingPairing,
    Connected,
    Reconnecting,
    LoggedOut,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::AwaitingPairing => "AWAITING_PAIRING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::LoggedOut => "LOGGED_OUT",
        })
    }
}

/// Category of the last failure, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CorruptCredential,
    Storage,
    ConnectionLost,
    NotConnected,
    PairingExpired,
    LoggedOut,
    Fatal,
    Cancelled,
    InvalidRecipient,
    SendFailed,
    Closed,
}

/// A diagnostic safe to show on a dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&SessionError> for SessionFailure {
    fn from(err: &SessionError) -> Self {
        let kind = match err {
            SessionError::CorruptCredential(_) => FailureKind::CorruptCredential,
            SessionError::Storage(_) => FailureKind::Storage,
            SessionError::ConnectionLost { .. } => FailureKind::ConnectionLost,
            SessionError::NotConnected => FailureKind::NotConnected,
            SessionError::PairingExpired => FailureKind::PairingExpired,
            SessionError::LoggedOut => FailureKind::LoggedOut,
            SessionError::Fatal(_) => FailureKind::Fatal,
            SessionError::Cancelled => FailureKind::Cancelled,
            SessionError::InvalidRecipient(_) => FailureKind::InvalidRecipient,
            SessionError::SendFailed(_) => FailureKind::SendFailed,
            SessionError::Closed => FailureKind::Closed,
        };
        Self {
            kind,
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// Snapshot of a session as the dashboard sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub account: AccountId,
    pub state: ConnectionState,
    /// The challenge to display while awaiting pairing.
    pub pairing: Option<PairingChallenge>,
    pub error: Option<SessionFailure>,
    /// Our own device JID once paired.
    pub me: Option<JID>,
    /// Current reconnect attempt, 0 when not reconnecting.
    pub reconnect_attempt: u32,
    pub updated_at: DateTime<Utc>,
}

impl SessionStatus {
    pub fn new(account: AccountId) -> Self {
        Self {
            account,
            state: ConnectionState::Disconnected,
            pairing: None,
            error: None,
            me: None,
            reconnect_attempt: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn test_status_serializes_for_dashboard() {
        let mut status = SessionStatus::new(AccountId::new("tenant-7"));
        status.state = ConnectionState::AwaitingPairing;
        status.error = Some(SessionFailure::from(&SessionError::Storage(StoreError::NotFound)));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["account"], "tenant-7");
        assert_eq!(json["state"], "AWAITING_PAIRING");
        assert_eq!(json["error"]["kind"], "storage");

        let back: SessionStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_failure_carries_message_not_source() {
        let failure = SessionFailure::from(&SessionError::ConnectionLost { attempts: 5 });
        assert_eq!(failure.kind, FailureKind::ConnectionLost);
        assert!(failure.message.contains('5'));
    }
}
