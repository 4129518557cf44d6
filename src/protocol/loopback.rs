//! In-process protocol peer.
//!
//! `LoopbackConnector` plays the server side of the protocol seam: it issues
//! pairing refs to unregistered devices, greets registered ones, echoes
//! server receipts for sent messages and lets the caller script failures.
//! Used by the test-suite and by the command line tool.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use tokio::sync::mpsc;

use crate::protocol::transport::{Connector, Link, TransportError};
use crate::store::{AuthState, CredentialUpdate};
use crate::types::{
    AccountId, DisconnectReason, IncomingText, MessageID, ProtocolEvent, Receipt, ReceiptType, JID,
};

const DEFAULT_PAIRING_REFS: usize = 3;
const GREETING_PRE_KEYS: u32 = 5;

/// What the next `open` for an account does.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenScript {
    /// Complete the handshake.
    Accept,
    /// Fail with the given transport error.
    Fail(TransportError),
    /// Reject with a server reason code.
    Reject(u16),
    /// Never answer.
    Hang,
}

/// A text message a link handed to the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct SentText {
    pub id: MessageID,
    pub to: JID,
    pub body: String,
}

#[derive(Default)]
struct PeerAccount {
    scripts: VecDeque<OpenScript>,
    opens: usize,
    closes: usize,
    link: Option<mpsc::Sender<ProtocolEvent>>,
    sent: Vec<SentText>,
    fail_sends: bool,
}

#[derive(Default)]
struct PeerState {
    accounts: HashMap<AccountId, PeerAccount>,
}

/// Scriptable in-process implementation of [`Connector`].
#[derive(Clone)]
pub struct LoopbackConnector {
    state: Arc<Mutex<PeerState>>,
    pairing_refs: usize,
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PeerState::default())),
            pairing_refs: DEFAULT_PAIRING_REFS,
        }
    }

    /// Number of pairing refs issued per open.
    pub fn with_pairing_refs(mut self, count: usize) -> Self {
        self.pairing_refs = count;
        self
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        lock(&self.state)
    }

    /// Queue open behaviours for an account. Opens past the end of the
    /// script are accepted.
    pub fn script(&self, account: &AccountId, scripts: impl IntoIterator<Item = OpenScript>) {
        let mut state = self.lock();
        state
            .accounts
            .entry(account.clone())
            .or_default()
            .scripts
            .extend(scripts);
    }

    /// Make every send on the account's links fail.
    pub fn fail_sends(&self, account: &AccountId, fail: bool) {
        self.lock().accounts.entry(account.clone()).or_default().fail_sends = fail;
    }

    /// How many times `open` was called for the account.
    pub fn opens(&self, account: &AccountId) -> usize {
        self.lock().accounts.get(account).map_or(0, |a| a.opens)
    }

    /// How many links of the account were closed by the client.
    pub fn closes(&self, account: &AccountId) -> usize {
        self.lock().accounts.get(account).map_or(0, |a| a.closes)
    }

    /// Messages the account sent, oldest first.
    pub fn sent(&self, account: &AccountId) -> Vec<SentText> {
        self.lock()
            .accounts
            .get(account)
            .map(|a| a.sent.clone())
            .unwrap_or_default()
    }

    /// Whether the account currently has an open link.
    pub fn is_linked(&self, account: &AccountId) -> bool {
        self.lock()
            .accounts
            .get(account)
            .map_or(false, |a| a.link.is_some())
    }

    fn link_events(&self, account: &AccountId) -> Result<mpsc::Sender<ProtocolEvent>, TransportError> {
        self.lock()
            .accounts
            .get(account)
            .and_then(|a| a.link.clone())
            .ok_or(TransportError::Closed)
    }

    async fn push(&self, account: &AccountId, events: Vec<ProtocolEvent>) -> Result<(), TransportError> {
        send_all(self.link_events(account)?, events).await
    }

    /// Push events that end the current link. The link is detached first so
    /// a reconnect racing with the push registers cleanly.
    async fn push_final(&self, account: &AccountId, events: Vec<ProtocolEvent>) -> Result<(), TransportError> {
        let tx = self
            .lock()
            .accounts
            .get_mut(account)
            .and_then(|a| a.link.take())
            .ok_or(TransportError::Closed)?;
        send_all(tx, events).await
    }

    /// Simulate the phone scanning the current pairing challenge.
    ///
    /// The peer confirms the pairing, assigns `me` and then asks the client
    /// to restart the connection, like the real server does.
    pub async fn scan(&self, account: &AccountId, me: JID) -> Result<(), TransportError> {
        debug!("[{}] loopback: pairing accepted as {}", account, me);
        self.push_final(
            account,
            vec![
                ProtocolEvent::PairSuccess,
                ProtocolEvent::CredentialsUpdated(CredentialUpdate::Paired {
                    me,
                    platform: Some("android".to_string()),
                    push_name: None,
                }),
                ProtocolEvent::Closed(DisconnectReason::RestartRequired),
            ],
        )
        .await
    }

    /// Push a credential update on the live link.
    pub async fn update(&self, account: &AccountId, update: CredentialUpdate) -> Result<(), TransportError> {
        self.push(account, vec![ProtocolEvent::CredentialsUpdated(update)]).await
    }

    /// Close the live link from the server side.
    pub async fn drop_link(&self, account: &AccountId, reason: DisconnectReason) -> Result<(), TransportError> {
        self.push_final(account, vec![ProtocolEvent::Closed(reason)]).await
    }

    /// Deliver a receipt for messages the account sent.
    pub async fn receipt(
        &self,
        account: &AccountId,
        chat: JID,
        message_ids: Vec<MessageID>,
        receipt_type: ReceiptType,
    ) -> Result<(), TransportError> {
        self.push(
            account,
            vec![ProtocolEvent::Receipt(Receipt {
                message_ids,
                chat,
                receipt_type,
                timestamp: Utc::now().timestamp(),
            })],
        )
        .await
    }

    /// Deliver a text message from a contact.
    pub async fn incoming(&self, account: &AccountId, from: JID, body: &str) -> Result<MessageID, TransportError> {
        let id = crate::protocol::generate_message_id();
        self.push(
            account,
            vec![ProtocolEvent::Message(IncomingText {
                id: id.clone(),
                from,
                body: body.to_string(),
                timestamp: Utc::now().timestamp(),
            })],
        )
        .await?;
        Ok(id)
    }

    fn greeting(&self, auth: &AuthState) -> Vec<ProtocolEvent> {
        if !auth.is_registered() {
            let refs = (0..self.pairing_refs)
                .map(|_| format!("2@{}", hex::encode(rand::random::<[u8; 16]>())))
                .collect();
            return vec![ProtocolEvent::PairingRefs(refs)];
        }

        let mut events = Vec::new();
        if auth.unuploaded_pre_key_count() == 0 {
            let keys = auth.generate_pre_keys(GREETING_PRE_KEYS);
            let up_to = keys.last().map(|pk| pk.key_id);
            events.push(ProtocolEvent::CredentialsUpdated(CredentialUpdate::PreKeys(keys)));
            if let Some(up_to) = up_to {
                events.push(ProtocolEvent::CredentialsUpdated(
                    CredentialUpdate::PreKeysUploaded { up_to },
                ));
            }
        }
        events.push(ProtocolEvent::Open);
        events
    }
}

async fn send_all(tx: mpsc::Sender<ProtocolEvent>, events: Vec<ProtocolEvent>) -> Result<(), TransportError> {
    for event in events {
        tx.send(event).await.map_err(|_| TransportError::Closed)?;
    }
    Ok(())
}

fn lock(state: &Mutex<PeerState>) -> MutexGuard<'_, PeerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(
        &self,
        account: &AccountId,
        auth: &AuthState,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Result<Box<dyn Link>, TransportError> {
        let script = {
            let mut state = self.lock();
            let peer = state.accounts.entry(account.clone()).or_default();
            peer.opens += 1;
            peer.scripts.pop_front().unwrap_or(OpenScript::Accept)
        };
        debug!("[{}] loopback: open -> {:?}", account, script);

        match script {
            OpenScript::Accept => {}
            OpenScript::Fail(err) => return Err(err),
            OpenScript::Reject(code) => return Err(TransportError::Rejected(code)),
            OpenScript::Hang => futures::future::pending::<()>().await,
        }

        self.lock()
            .accounts
            .entry(account.clone())
            .or_default()
            .link = Some(events.clone());

        let greeting = self.greeting(auth);
        let tx = events.clone();
        tokio::spawn(async move {
            for event in greeting {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(LoopbackLink {
            account: account.clone(),
            state: Arc::clone(&self.state),
            events,
            closed: false,
        }))
    }
}

struct LoopbackLink {
    account: AccountId,
    state: Arc<Mutex<PeerState>>,
    events: mpsc::Sender<ProtocolEvent>,
    closed: bool,
}

#[async_trait]
impl Link for LoopbackLink {
    async fn send_text(&mut self, to: &JID, body: &str, message_id: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        {
            let mut state = lock(&self.state);
            let peer = state.accounts.entry(self.account.clone()).or_default();
            if peer.fail_sends {
                return Err(TransportError::SendFailed("peer refused the message".to_string()));
            }
            peer.sent.push(SentText {
                id: message_id.to_string(),
                to: to.clone(),
                body: body.to_string(),
            });
        }

        let ack = ProtocolEvent::Receipt(Receipt {
            message_ids: vec![message_id.to_string()],
            chat: to.clone(),
            receipt_type: ReceiptType::Server,
            timestamp: Utc::now().timestamp(),
        });
        if self.events.try_send(ack).is_err() {
            debug!("[{}] loopback: server ack for {} dropped", self.account, message_id);
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = lock(&self.state);
        if let Some(peer) = state.accounts.get_mut(&self.account) {
            peer.closes += 1;
            if peer.link.as_ref().map_or(false, |tx| tx.same_channel(&self.events)) {
                peer.link = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountId {
        AccountId::new("acct-1")
    }

    fn registered() -> AuthState {
        let mut auth = AuthState::generate();
        auth.apply(CredentialUpdate::Paired {
            me: JID::new_device("5511988887777", 3),
            platform: None,
            push_name: None,
        });
        auth
    }

    #[tokio::test]
    async fn test_unregistered_open_issues_pairing_refs() {
        let peer = LoopbackConnector::new().with_pairing_refs(2);
        let (tx, mut rx) = mpsc::channel(8);

        let _link = peer.open(&account(), &AuthState::generate(), tx).await.unwrap();
        match rx.recv().await {
            Some(ProtocolEvent::PairingRefs(refs)) => assert_eq!(refs.len(), 2),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(peer.opens(&account()), 1);
        assert!(peer.is_linked(&account()));
    }

    #[tokio::test]
    async fn test_registered_open_uploads_pre_keys_then_opens() {
        let peer = LoopbackConnector::new();
        let (tx, mut rx) = mpsc::channel(8);

        let _link = peer.open(&account(), &registered(), tx).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ProtocolEvent::CredentialsUpdated(CredentialUpdate::PreKeys(_)))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ProtocolEvent::CredentialsUpdated(CredentialUpdate::PreKeysUploaded { up_to: 5 }))
        ));
        assert!(matches!(rx.recv().await, Some(ProtocolEvent::Open)));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let peer = LoopbackConnector::new();
        peer.script(
            &account(),
            [OpenScript::Fail(TransportError::Timeout), OpenScript::Reject(401)],
        );
        let (tx, _rx) = mpsc::channel(8);

        let first = peer.open(&account(), &registered(), tx.clone()).await;
        assert_eq!(first.err(), Some(TransportError::Timeout));
        let second = peer.open(&account(), &registered(), tx.clone()).await;
        assert_eq!(second.err(), Some(TransportError::Rejected(401)));
        assert!(peer.open(&account(), &registered(), tx).await.is_ok());
        assert_eq!(peer.opens(&account()), 3);
    }

    #[tokio::test]
    async fn test_send_records_and_acks() {
        let peer = LoopbackConnector::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut link = peer.open(&account(), &registered(), tx).await.unwrap();
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        let to = JID::from_phone("5511900001111");
        link.send_text(&to, "hello", "3EB0AA").await.unwrap();

        assert_eq!(peer.sent(&account())[0].body, "hello");
        match rx.recv().await {
            Some(ProtocolEvent::Receipt(receipt)) => {
                assert_eq!(receipt.receipt_type, ReceiptType::Server);
                assert_eq!(receipt.message_ids, vec!["3EB0AA".to_string()]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        link.close().await;
        link.close().await;
        assert_eq!(peer.closes(&account()), 1);
        assert!(!peer.is_linked(&account()));
        assert_eq!(link.send_text(&to, "again", "3EB0AB").await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_drop_link_without_link_fails() {
        let peer = LoopbackConnector::new();
        let result = peer.drop_link(&account(), DisconnectReason::ConnectionLost).await;
        assert_eq!(result, Err(TransportError::Closed));
    }
}
