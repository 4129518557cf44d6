//! Message gateway: outbound text over a live session and inbound
//! receipt/reply normalization.
//!
//! The gateway keeps no message history; every outcome is handed to a
//! [`MessageTracker`], whose failures are logged and otherwise ignored.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::SessionError;
use crate::session::SessionRegistry;
use crate::types::{servers, AccountId, IncomingText, MessageID, Receipt, ReceiptType, JID};

/// Delivery status of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl From<ReceiptType> for MessageStatus {
    fn from(receipt_type: ReceiptType) -> Self {
        match receipt_type {
            ReceiptType::Server => Self::Sent,
            ReceiptType::Delivered => Self::Delivered,
            ReceiptType::Read | ReceiptType::Played => Self::Read,
            ReceiptType::Error => Self::Failed,
        }
    }
}

/// An outbound text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub correlation_id: Uuid,
    pub account: AccountId,
    pub recipient: JID,
    /// The phone number as the caller supplied it.
    pub recipient_phone: String,
    pub body: String,
}

/// What happened to an outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum OutboundOutcome {
    Sent { provider_message_id: MessageID },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub message: OutboundMessage,
    #[serde(flatten)]
    pub outcome: OutboundOutcome,
    pub at: DateTime<Utc>,
}

/// Normalized inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundEvent {
    Status {
        provider_message_id: MessageID,
        from: JID,
        status: MessageStatus,
        at: DateTime<Utc>,
    },
    Reply {
        provider_message_id: MessageID,
        from: JID,
        body: String,
        at: DateTime<Utc>,
    },
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: MessageID,
    pub correlation_id: Uuid,
    pub recipient: JID,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("tracker error: {0}")]
pub struct TrackerError(pub String);

/// External message log.
#[async_trait]
pub trait MessageTracker: Send + Sync {
    async fn outbound(&self, account: &AccountId, record: &OutboundRecord) -> Result<(), TrackerError>;

    async fn inbound(&self, account: &AccountId, event: &InboundEvent) -> Result<(), TrackerError>;
}

/// Tracker that does nothing.
pub struct NullTracker;

#[async_trait]
impl MessageTracker for NullTracker {
    async fn outbound(&self, _: &AccountId, _: &OutboundRecord) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn inbound(&self, _: &AccountId, _: &InboundEvent) -> Result<(), TrackerError> {
        Ok(())
    }
}

/// Tracker keeping everything in memory.
#[derive(Default)]
pub struct MemoryTracker {
    outbound: Mutex<Vec<(AccountId, OutboundRecord)>>,
    inbound: Mutex<Vec<(AccountId, InboundEvent)>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbound_records(&self) -> Vec<(AccountId, OutboundRecord)> {
        self.outbound.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn inbound_events(&self) -> Vec<(AccountId, InboundEvent)> {
        self.inbound.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> TrackerError {
    TrackerError("lock poisoned".to_string())
}

#[async_trait]
impl MessageTracker for MemoryTracker {
    async fn outbound(&self, account: &AccountId, record: &OutboundRecord) -> Result<(), TrackerError> {
        self.outbound
            .lock()
            .map_err(poisoned)?
            .push((account.clone(), record.clone()));
        Ok(())
    }

    async fn inbound(&self, account: &AccountId, event: &InboundEvent) -> Result<(), TrackerError> {
        self.inbound
            .lock()
            .map_err(poisoned)?
            .push((account.clone(), event.clone()));
        Ok(())
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

/// Forwards normalized traffic of every session to the tracker.
#[derive(Clone)]
pub struct InboundRouter {
    tracker: Arc<dyn MessageTracker>,
}

impl InboundRouter {
    pub fn new(tracker: Arc<dyn MessageTracker>) -> Self {
        Self { tracker }
    }

    /// Forward one status update per message id in the receipt.
    pub async fn receipt(&self, account: &AccountId, receipt: Receipt) {
        let status = MessageStatus::from(receipt.receipt_type);
        let at = timestamp(receipt.timestamp);
        for id in receipt.message_ids {
            debug!("[{}] {} is {:?}", account, id, status);
            self.forward(
                account,
                InboundEvent::Status {
                    provider_message_id: id,
                    from: receipt.chat.clone(),
                    status,
                    at,
                },
            )
            .await;
        }
    }

    pub async fn message(&self, account: &AccountId, message: IncomingText) {
        self.forward(
            account,
            InboundEvent::Reply {
                provider_message_id: message.id,
                from: message.from,
                body: message.body,
                at: timestamp(message.timestamp),
            },
        )
        .await;
    }

    async fn forward(&self, account: &AccountId, event: InboundEvent) {
        if let Err(err) = self.tracker.inbound(account, &event).await {
            warn!("[{}] tracker rejected inbound event: {}", account, err);
        }
    }

    async fn outbound(&self, account: &AccountId, record: OutboundRecord) {
        if let Err(err) = self.tracker.outbound(account, &record).await {
            warn!("[{}] tracker rejected outbound record: {}", account, err);
        }
    }
}

/// Normalize a phone number into a user JID.
///
/// Accepts formatted numbers (`+55 (11) 98888-7777`), an international
/// `00` prefix, national numbers with a trunk `0` when a default country
/// code is given, and already-formed user JIDs.
pub fn normalize_phone(phone: &str, default_country_code: Option<&str>) -> Result<JID, SessionError> {
    let trimmed = phone.trim();
    let invalid = || SessionError::InvalidRecipient(phone.to_string());

    if trimmed.contains('@') {
        let jid: JID = trimmed.parse().map_err(|_| invalid())?;
        if jid.server != servers::DEFAULT_USER || !valid_length(&jid.user) {
            return Err(invalid());
        }
        return Ok(jid.to_non_ad());
    }

    if trimmed
        .chars()
        .any(|c| !(c.is_ascii_digit() || " +-().".contains(c)))
    {
        return Err(invalid());
    }

    let international = trimmed.starts_with('+');
    let mut digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if !international {
        if let Some(rest) = digits.strip_prefix("00") {
            digits = rest.to_string();
        } else if let (Some(national), Some(code)) = (digits.strip_prefix('0'), default_country_code) {
            digits = format!("{}{}", code.trim_start_matches('+'), national);
        }
    }

    if !valid_length(&digits) {
        return Err(invalid());
    }
    Ok(JID::from_phone(&digits))
}

fn valid_length(digits: &str) -> bool {
    (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

/// Sends text for any account of a registry.
#[derive(Clone)]
pub struct MessageGateway {
    registry: SessionRegistry,
    router: InboundRouter,
    default_country_code: Option<String>,
}

impl MessageGateway {
    pub fn new(registry: SessionRegistry) -> Self {
        let router = registry.router().clone();
        let default_country_code = registry.config().default_country_code.clone();
        Self {
            registry,
            router,
            default_country_code,
        }
    }

    /// Send a text message from `account`.
    ///
    /// The account must already be connected; this never connects
    /// implicitly.
    pub async fn send_text(
        &self,
        account: &AccountId,
        recipient_phone: &str,
        body: &str,
    ) -> Result<SendReceipt, SessionError> {
        let recipient = normalize_phone(recipient_phone, self.default_country_code.as_deref())?;
        let handle = self
            .registry
            .get(account)
            .filter(|handle| handle.is_connected())
            .ok_or(SessionError::NotConnected)?;

        let message = OutboundMessage {
            correlation_id: Uuid::new_v4(),
            account: account.clone(),
            recipient: recipient.clone(),
            recipient_phone: recipient_phone.to_string(),
            body: body.to_string(),
        };
        let result = handle.send_text(recipient.clone(), body.to_string()).await;

        let outcome = match &result {
            Ok(id) => OutboundOutcome::Sent {
                provider_message_id: id.clone(),
            },
            Err(err) => {
                warn!("[{}] send to {} failed: {}", account, recipient, err);
                OutboundOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        let correlation_id = message.correlation_id;
        self.router
            .outbound(
                account,
                OutboundRecord {
                    message,
                    outcome,
                    at: Utc::now(),
                },
            )
            .await;

        result.map(|provider_message_id| SendReceipt {
            provider_message_id,
            correlation_id,
            recipient,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::protocol::LoopbackConnector;
    use crate::session::ConnectionState;
    use crate::store::{AuthState, CredentialStore, CredentialUpdate, MemoryCredentialStore, SessionCodec};
    use std::time::Duration;

    #[test]
    fn test_receipt_types_map_to_statuses() {
        assert_eq!(MessageStatus::from(ReceiptType::Server), MessageStatus::Sent);
        assert_eq!(MessageStatus::from(ReceiptType::Delivered), MessageStatus::Delivered);
        assert_eq!(MessageStatus::from(ReceiptType::Read), MessageStatus::Read);
        assert_eq!(MessageStatus::from(ReceiptType::Played), MessageStatus::Read);
        assert_eq!(MessageStatus::from(ReceiptType::Error), MessageStatus::Failed);
    }

    #[test]
    fn test_normalize_phone() {
        let ok = |phone: &str, cc: Option<&str>| normalize_phone(phone, cc).unwrap().to_string();

        assert_eq!(ok("+55 (11) 98888-7777", None), "5511988887777@s.whatsapp.net");
        assert_eq!(ok("005511988887777", None), "5511988887777@s.whatsapp.net");
        assert_eq!(ok("011 98888-7777", Some("55")), "5511988887777@s.whatsapp.net");
        assert_eq!(ok("5511988887777@s.whatsapp.net", None), "5511988887777@s.whatsapp.net");
        assert_eq!(ok("5511988887777:4@s.whatsapp.net", None), "5511988887777@s.whatsapp.net");
    }

    #[test]
    fn test_normalize_phone_rejects_garbage() {
        for phone in ["", "12345", "1234567890123456", "call me", "120363@g.us", "+55 11 9888x7777"] {
            assert!(
                matches!(normalize_phone(phone, None), Err(SessionError::InvalidRecipient(_))),
                "{} should be rejected",
                phone
            );
        }
    }

    #[tokio::test]
    async fn test_router_forwards_normalized_receipts() {
        let tracker = Arc::new(MemoryTracker::new());
        let router = InboundRouter::new(tracker.clone());
        let account = AccountId::new("acct");

        router
            .receipt(
                &account,
                Receipt {
                    message_ids: vec!["A".into(), "B".into()],
                    chat: JID::from_phone("5511900001111"),
                    receipt_type: ReceiptType::Played,
                    timestamp: 1_700_000_000,
                },
            )
            .await;

        let events = tracker.inbound_events();
        assert_eq!(events.len(), 2);
        match &events[1].1 {
            InboundEvent::Status {
                provider_message_id,
                status,
                at,
                ..
            } => {
                assert_eq!(provider_message_id, "B");
                assert_eq!(*status, MessageStatus::Read);
                assert_eq!(at.timestamp(), 1_700_000_000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    struct BrokenTracker;

    #[async_trait]
    impl MessageTracker for BrokenTracker {
        async fn outbound(&self, _: &AccountId, _: &OutboundRecord) -> Result<(), TrackerError> {
            Err(TrackerError("down".into()))
        }

        async fn inbound(&self, _: &AccountId, _: &InboundEvent) -> Result<(), TrackerError> {
            Err(TrackerError("down".into()))
        }
    }

    async fn seed_registered(store: &MemoryCredentialStore, codec: &SessionCodec, account: &AccountId) {
        let mut auth = AuthState::generate();
        auth.apply(CredentialUpdate::Paired {
            me: JID::new_device("5511977776666", 2),
            platform: None,
            push_name: None,
        });
        store.put(account, &codec.encode(&auth).unwrap()).await.unwrap();
    }

    fn registry_with(
        tracker: Arc<dyn MessageTracker>,
    ) -> (SessionRegistry, LoopbackConnector, Arc<MemoryCredentialStore>, SessionCodec) {
        let config = SessionConfig::default().with_default_country_code("55");
        let codec = SessionCodec::from_secret(&config.encryption_secret);
        let peer = LoopbackConnector::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let registry =
            SessionRegistry::new(config, Arc::new(peer.clone()), store.clone(), tracker).unwrap();
        (registry, peer, store, codec)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_send_while_disconnected_makes_no_network_call() {
        let tracker = Arc::new(MemoryTracker::new());
        let (registry, peer, _store, _codec) = registry_with(tracker.clone());
        let gateway = MessageGateway::new(registry.clone());
        let account = AccountId::new("idle");

        let err = gateway.send_text(&account, "+5511900001111", "hi").await.unwrap_err();
        assert_eq!(err, SessionError::NotConnected);

        registry.get_or_create(&account);
        let err = gateway.send_text(&account, "+5511900001111", "hi").await.unwrap_err();
        assert_eq!(err, SessionError::NotConnected);

        assert_eq!(peer.opens(&account), 0);
        assert!(peer.sent(&account).is_empty());
        assert!(tracker.outbound_records().is_empty());
    }

    #[tokio::test]
    async fn test_send_and_receipts_reach_tracker() {
        let tracker = Arc::new(MemoryTracker::new());
        let (registry, peer, store, codec) = registry_with(tracker.clone());
        let gateway = MessageGateway::new(registry.clone());
        let account = AccountId::new("sender");
        seed_registered(&store, &codec, &account).await;

        let status = registry.connect(&account).await.unwrap();
        assert_eq!(status.state, ConnectionState::Connected);

        let receipt = gateway.send_text(&account, "011 90000-1111", "hello").await.unwrap();
        assert_eq!(receipt.recipient.user, "5511900001111");
        assert_eq!(peer.sent(&account)[0].id, receipt.provider_message_id);

        let outbound = tracker.outbound_records();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].1.message.correlation_id, receipt.correlation_id);
        assert_eq!(outbound[0].1.message.recipient_phone, "011 90000-1111");

        peer.receipt(
            &account,
            receipt.recipient.clone(),
            vec![receipt.provider_message_id.clone()],
            ReceiptType::Read,
        )
        .await
        .unwrap();
        peer.incoming(&account, receipt.recipient.clone(), "who is this?")
            .await
            .unwrap();

        wait_until(|| tracker.inbound_events().len() == 3).await;
        let statuses: Vec<MessageStatus> = tracker
            .inbound_events()
            .into_iter()
            .filter_map(|(_, event)| match event {
                InboundEvent::Status { status, .. } => Some(status),
                InboundEvent::Reply { .. } => None,
            })
            .collect();
        assert_eq!(statuses, vec![MessageStatus::Sent, MessageStatus::Read]);
        assert!(matches!(
            tracker.inbound_events()[2].1,
            InboundEvent::Reply { ref body, .. } if body == "who is this?"
        ));
    }

    #[tokio::test]
    async fn test_failed_send_is_reported_and_returned() {
        let tracker = Arc::new(MemoryTracker::new());
        let (registry, peer, store, codec) = registry_with(tracker.clone());
        let gateway = MessageGateway::new(registry.clone());
        let account = AccountId::new("flaky");
        seed_registered(&store, &codec, &account).await;
        registry.connect(&account).await.unwrap();

        peer.fail_sends(&account, true);
        let err = gateway.send_text(&account, "+5511900001111", "hi").await.unwrap_err();
        assert!(matches!(err, SessionError::SendFailed(_)));
        assert!(matches!(
            tracker.outbound_records()[0].1.outcome,
            OutboundOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_tracker_failure_does_not_fail_send() {
        let (registry, _peer, store, codec) = registry_with(Arc::new(BrokenTracker));
        let gateway = MessageGateway::new(registry.clone());
        let account = AccountId::new("untracked");
        seed_registered(&store, &codec, &account).await;
        registry.connect(&account).await.unwrap();

        assert!(gateway.send_text(&account, "+5511900001111", "hi").await.is_ok());
    }
}
