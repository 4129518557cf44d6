use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use log::info;

use crate::config::{ConfigError, SessionConfig};
use crate::error::SessionError;
use crate::gateway::{InboundRouter, MessageTracker};
use crate::protocol::Connector;
use crate::session::manager::{SessionContext, SessionHandle};
use crate::session::state::SessionStatus;
use crate::store::{CredentialStore, SessionCodec};
use crate::types::AccountId;

struct RegistryInner {
    sessions: DashMap<AccountId, SessionHandle>,
    config: Arc<SessionConfig>,
    connector: Arc<dyn Connector>,
    store: Arc<dyn CredentialStore>,
    codec: SessionCodec,
    router: InboundRouter,
}

/// Process-wide map from account to its session actor.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn CredentialStore>,
        tracker: Arc<dyn MessageTracker>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let codec = SessionCodec::from_secret(&config.encryption_secret);

        Ok(Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                config: Arc::new(config),
                connector,
                store,
                codec,
                router: InboundRouter::new(tracker),
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) fn router(&self) -> &InboundRouter {
        &self.inner.router
    }

    fn spawn(&self, account: &AccountId) -> SessionHandle {
        SessionHandle::spawn(SessionContext {
            account: account.clone(),
            config: Arc::clone(&self.inner.config),
            connector: Arc::clone(&self.inner.connector),
            store: Arc::clone(&self.inner.store),
            codec: self.inner.codec.clone(),
            router: self.inner.router.clone(),
        })
    }

    /// Return the account's live session, creating it if needed.
    ///
    /// Concurrent callers for the same account get the same actor. A
    /// terminated actor is replaced.
    pub fn get_or_create(&self, account: &AccountId) -> SessionHandle {
        match self.inner.sessions.entry(account.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    info!("[{}] replacing terminated session", account);
                    entry.insert(self.spawn(account));
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(self.spawn(account)).value().clone(),
        }
    }

    /// The account's live session, without creating one.
    pub fn get(&self, account: &AccountId) -> Option<SessionHandle> {
        self.inner
            .sessions
            .get(account)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    pub async fn connect(&self, account: &AccountId) -> Result<SessionStatus, SessionError> {
        self.get_or_create(account).connect().await
    }

    /// Current status; a terminated session keeps reporting its last one.
    ///
    /// Reading never creates a session: an account without one reports a
    /// fresh `DISCONNECTED` status, which is exactly what a new session
    /// would publish.
    pub fn status(&self, account: &AccountId) -> SessionStatus {
        self.inner
            .sessions
            .get(account)
            .map(|entry| entry.value().status())
            .unwrap_or_else(|| SessionStatus::new(account.clone()))
    }

    /// Like [`SessionRegistry::status`], this never creates a session.
    pub fn is_connected(&self, account: &AccountId) -> bool {
        self.get(account).map_or(false, |handle| handle.is_connected())
    }

    /// Disconnect the account. Without a live session only the credential
    /// removal (if requested) is performed.
    pub async fn disconnect(&self, account: &AccountId, delete_credentials: bool) -> Result<(), SessionError> {
        match self.get(account) {
            Some(handle) => handle.disconnect(delete_credentials).await,
            None if delete_credentials => Ok(self.inner.store.delete(account).await?),
            None => Ok(()),
        }
    }

    /// Drop the account's session and stop its actor.
    pub async fn remove(&self, account: &AccountId) {
        if let Some((_, handle)) = self.inner.sessions.remove(account) {
            handle.shutdown().await;
        }
    }

    /// Disconnect, delete credentials and forget the session.
    pub async fn logout(&self, account: &AccountId) -> Result<(), SessionError> {
        let result = self.disconnect(account, true).await;
        self.remove(account).await;
        result
    }

    /// Stop every session.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.sessions.clear();
        join_all(handles.iter().map(|handle| handle.shutdown())).await;
    }

    pub fn accounts(&self) -> Vec<AccountId> {
        self.inner.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}
