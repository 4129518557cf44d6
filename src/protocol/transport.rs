//! The seam between session management and the real-time protocol.
//!
//! A [`Connector`] opens one [`Link`] per connection attempt. While the link
//! lives, the protocol implementation pushes [`ProtocolEvent`]s into the
//! channel it was given; the owning session consumes them in order.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::AuthState;
use crate::types::{AccountId, ProtocolEvent, JID};

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("server rejected the connection with reason {0}")]
    Rejected(u16),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
}

/// Opens protocol connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and handshake as `account` using `auth`.
    ///
    /// Events for the returned link must be sent on `events`, in the order
    /// the protocol produces them. Dropping `events` is treated as the
    /// transport going away.
    async fn open(
        &self,
        account: &AccountId,
        auth: &AuthState,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Result<Box<dyn Link>, TransportError>;
}

/// An established protocol connection.
#[async_trait]
pub trait Link: Send {
    /// Send a text message with a caller-chosen message id.
    async fn send_text(&mut self, to: &JID, body: &str, message_id: &str) -> Result<(), TransportError>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&mut self);
}
