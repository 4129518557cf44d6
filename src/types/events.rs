//! Event types emitted by the protocol layer.
//!
//! Every live link pushes these into its account's session actor, which
//! consumes them strictly in order.

use std::fmt;

use crate::store::CredentialUpdate;
use crate::types::{MessageID, JID};

/// Events a protocol link reports to the session that owns it.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// The server has no registration for us and issued pairing refs.
    PairingRefs(Vec<String>),
    /// The remote phone accepted the pairing challenge.
    PairSuccess,
    /// The protocol mutated the authentication state.
    CredentialsUpdated(CredentialUpdate),
    /// Handshake complete; the link can carry messages.
    Open,
    /// Delivery/read status for messages we sent.
    Receipt(Receipt),
    /// Text message received from a contact.
    Message(IncomingText),
    /// The transport went away.
    Closed(DisconnectReason),
}

/// Receipt event for message delivery/read status
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    /// Message IDs this receipt is for
    pub message_ids: Vec<MessageID>,
    /// The chat JID
    pub chat: JID,
    /// Type of receipt
    pub receipt_type: ReceiptType,
    /// Timestamp of the receipt (unix seconds)
    pub timestamp: i64,
}

/// Type of receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptType {
    /// Server received the message
    Server,
    /// Message was delivered
    Delivered,
    /// Message was read
    Read,
    /// Media was played (for audio/video)
    Played,
    /// Recipient could not decrypt or the server rejected the message
    Error,
}

/// An inbound text message.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingText {
    pub id: MessageID,
    pub from: JID,
    pub body: String,
    pub timestamp: i64,
}

/// Reason the transport closed, from the protocol's documented codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 401
    LoggedOut,
    /// 402
    TempBanned,
    /// 403
    Forbidden,
    /// 405
    ClientOutdated,
    /// 406
    UnknownLogout,
    /// 408
    ConnectionLost,
    /// 409
    BadUserAgent,
    /// 411
    MultideviceMismatch,
    /// 428
    ConnectionClosed,
    /// 440
    ConnectionReplaced,
    /// 500
    BadSession,
    /// 503
    ServiceUnavailable,
    /// 515
    RestartRequired,
    /// Any code not listed above.
    Unknown(u16),
    /// The socket failed without a server-provided code.
    Network(String),
}

/// What the session does about a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAction {
    /// Recoverable: reconnect with backoff.
    Retry,
    /// The remote device revoked the session: delete credentials.
    Logout,
    /// Cannot be fixed by retrying; keep credentials and report.
    Fatal,
}

impl DisconnectReason {
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            402 => Self::TempBanned,
            403 => Self::Forbidden,
            405 => Self::ClientOutdated,
            406 => Self::UnknownLogout,
            408 => Self::ConnectionLost,
            409 => Self::BadUserAgent,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> Option<u16> {
        Some(match self {
            Self::LoggedOut => 401,
            Self::TempBanned => 402,
            Self::Forbidden => 403,
            Self::ClientOutdated => 405,
            Self::UnknownLogout => 406,
            Self::ConnectionLost => 408,
            Self::BadUserAgent => 409,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::ServiceUnavailable => 503,
            Self::RestartRequired => 515,
            Self::Unknown(code) => *code,
            Self::Network(_) => return None,
        })
    }

    pub fn action(&self) -> DisconnectAction {
        match self {
            Self::LoggedOut | Self::Forbidden | Self::UnknownLogout => DisconnectAction::Logout,
            Self::TempBanned
            | Self::ClientOutdated
            | Self::BadUserAgent
            | Self::MultideviceMismatch
            | Self::ConnectionReplaced
            | Self::BadSession => DisconnectAction::Fatal,
            Self::ConnectionLost
            | Self::ConnectionClosed
            | Self::ServiceUnavailable
            | Self::RestartRequired
            | Self::Unknown(_)
            | Self::Network(_) => DisconnectAction::Retry,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LoggedOut => "logged out",
            Self::TempBanned => "temporarily banned",
            Self::Forbidden => "forbidden",
            Self::ClientOutdated => "client outdated",
            Self::UnknownLogout => "unknown logout",
            Self::ConnectionLost => "connection lost",
            Self::BadUserAgent => "bad user agent",
            Self::MultideviceMismatch => "multi-device mismatch",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionReplaced => "connection replaced by another client",
            Self::BadSession => "bad session",
            Self::ServiceUnavailable => "service unavailable",
            Self::RestartRequired => "restart required",
            Self::Unknown(_) => "unknown reason",
            Self::Network(detail) => return write!(f, "network error: {}", detail),
        };
        match self.code() {
            Some(code) => write!(f, "{} ({})", text, code),
            None => f.write_str(text),
        }
    }
}
