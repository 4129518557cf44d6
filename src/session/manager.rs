//! Connection manager: one actor task per account.
//!
//! The actor owns the account's protocol link, its in-memory [`AuthState`]
//! and its timers. Callers talk to it through a [`SessionHandle`]; the
//! actor publishes every state change on a watch channel, so reading the
//! status never waits on the actor.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::gateway::InboundRouter;
use crate::protocol::{generate_message_id, Connector, Link, PairingRotation, TransportError};
use crate::session::state::{ConnectionState, SessionFailure, SessionStatus};
use crate::store::{AuthState, CredentialStore, SessionCodec, StoreError};
use crate::types::{AccountId, DisconnectAction, DisconnectReason, MessageID, ProtocolEvent, JID};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Connect(Reply<SessionStatus>),
    Disconnect {
        delete_credentials: bool,
        reply: Reply<()>,
    },
    SendText {
        to: JID,
        body: String,
        message_id: MessageID,
        reply: Reply<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Everything a session actor needs from its registry.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub account: AccountId,
    pub config: Arc<SessionConfig>,
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn CredentialStore>,
    pub codec: SessionCodec,
    pub router: InboundRouter,
}

/// Cheap, cloneable handle to one account's session actor.
#[derive(Clone)]
pub struct SessionHandle {
    account: AccountId,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Spawn the actor for `ctx.account` on the current runtime.
    pub(crate) fn spawn(ctx: SessionContext) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(ctx.config.command_buffer);
        let (status_tx, status_rx) = watch::channel(SessionStatus::new(ctx.account.clone()));
        let account = ctx.account.clone();

        let actor = SessionActor {
            ctx,
            commands: commands_rx,
            status: status_tx,
            auth: None,
            ignore_stored: false,
            dirty: false,
            link: None,
            events: None,
            waiters: Vec::new(),
            retry: None,
            restart_allowed: false,
            pairing: None,
            pairing_round: 0,
            challenge_seq: 0,
        };
        tokio::spawn(actor.run());

        Self {
            account,
            commands: commands_tx,
            status: status_rx,
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Start or join a connection attempt.
    ///
    /// Resolves once the session is `CONNECTED`, or `AWAITING_PAIRING` with
    /// a challenge to display.
    pub async fn connect(&self) -> Result<SessionStatus, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Connect(reply), rx).await
    }

    /// Close the link and cancel any pending work. Stored credentials are
    /// removed only when `delete_credentials` is set.
    pub async fn disconnect(&self, delete_credentials: bool) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Disconnect {
                delete_credentials,
                reply,
            },
            rx,
        )
        .await
    }

    /// Send a text message over the live link; returns the provider id.
    pub async fn send_text(&self, to: JID, body: String) -> Result<MessageID, SessionError> {
        let message_id = generate_message_id();
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::SendText {
                to,
                body,
                message_id: message_id.clone(),
                reply,
            },
            rx,
        )
        .await?;
        Ok(message_id)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Wait until the status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> Result<SessionStatus, SessionError> {
        let mut status = self.status.clone();
        let result = status
            .wait_for(|s| predicate(s))
            .await
            .map(|s| s.clone())
            .map_err(|_| SessionError::Closed);
        result
    }

    /// Stop the actor, closing its link. Credentials are kept.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
        self.commands.closed().await;
    }

    /// Whether the actor has terminated.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

struct RetryState {
    attempt: u32,
    started: Instant,
    next_at: Instant,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

struct SessionActor {
    ctx: SessionContext,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SessionStatus>,
    auth: Option<AuthState>,
    /// The stored blob failed to decode; start over instead of loading it.
    ignore_stored: bool,
    /// The latest credential update has not reached the store.
    dirty: bool,
    link: Option<Box<dyn Link>>,
    events: Option<mpsc::Receiver<ProtocolEvent>>,
    waiters: Vec<Reply<SessionStatus>>,
    retry: Option<RetryState>,
    /// One restart request after a pairing or an open skips the backoff.
    restart_allowed: bool,
    pairing: Option<PairingRotation>,
    pairing_round: u32,
    challenge_seq: u32,
}

impl SessionActor {
    async fn run(mut self) {
        debug!("[{}] session actor started", self.ctx.account);
        loop {
            let deadline = self.next_deadline();
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.stop().await;
                        Flow::Stop
                    }
                },
                event = next_event(&mut self.events) => self.on_event(event).await,
                _ = sleep_until(deadline) => self.on_timer().await,
            };
            if flow == Flow::Stop {
                break;
            }
        }
        debug!("[{}] session actor stopped", self.ctx.account);
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn publish(&self, update: impl FnOnce(&mut SessionStatus)) {
        self.status.send_modify(|status| {
            update(status);
            status.updated_at = Utc::now();
        });
    }

    /// A pending reconnect only waits while there is no link; a live link
    /// only has the pairing rotation to time out.
    fn next_deadline(&self) -> Option<Instant> {
        if self.link.is_none() {
            return self.retry.as_ref().map(|retry| retry.next_at);
        }
        self.pairing.as_ref().map(|rotation| rotation.expires_at())
    }

    fn resolve_waiters(&mut self, result: Result<SessionStatus, SessionError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Settle in `state` with a diagnostic and fail every pending connect.
    fn fail(&mut self, state: ConnectionState, err: SessionError) {
        let failure = SessionFailure::from(&err);
        self.settle(state, err, failure);
    }

    fn settle(&mut self, state: ConnectionState, err: SessionError, failure: SessionFailure) {
        self.retry = None;
        self.restart_allowed = false;
        self.pairing = None;
        self.publish(|s| {
            s.state = state;
            s.pairing = None;
            s.reconnect_attempt = 0;
            s.error = Some(failure);
        });
        self.resolve_waiters(Err(err));
    }

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect(reply) => match self.state() {
                ConnectionState::Connected | ConnectionState::AwaitingPairing => {
                    let _ = reply.send(Ok(self.status.borrow().clone()));
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    self.waiters.push(reply);
                }
                ConnectionState::Disconnected | ConnectionState::LoggedOut => {
                    self.waiters.push(reply);
                    return self.start_connect().await;
                }
            },
            Command::Disconnect {
                delete_credentials,
                reply,
            } => {
                let _ = reply.send(self.disconnect(delete_credentials).await);
            }
            Command::SendText {
                to,
                body,
                message_id,
                reply,
            } => {
                let _ = reply.send(self.send_text(&to, &body, &message_id).await);
            }
            Command::Shutdown(reply) => {
                self.stop().await;
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn send_text(&mut self, to: &JID, body: &str, message_id: &str) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let link = self.link.as_mut().ok_or(SessionError::NotConnected)?;
        link.send_text(to, body, message_id)
            .await
            .map_err(|e| SessionError::SendFailed(e.to_string()))?;
        debug!("[{}] sent {} to {}", self.ctx.account, message_id, to);
        Ok(())
    }

    async fn start_connect(&mut self) -> Flow {
        self.retry = None;
        self.restart_allowed = false;
        self.pairing_round = 0;
        self.challenge_seq = 0;
        self.publish(|s| {
            s.error = None;
            s.reconnect_attempt = 0;
        });

        if self.auth.is_none() {
            match self.load_auth().await {
                Ok(auth) => {
                    self.publish(|s| s.me = auth.me.clone());
                    self.auth = Some(auth);
                }
                Err(err) => {
                    warn!("[{}] cannot load credentials: {}", self.ctx.account, err);
                    self.fail(ConnectionState::Disconnected, err);
                    return Flow::Continue;
                }
            }
        }
        self.open_link().await
    }

    async fn load_auth(&mut self) -> Result<AuthState, SessionError> {
        let stored = if self.ignore_stored {
            None
        } else {
            match self.ctx.store.get(&self.ctx.account).await {
                Err(StoreError::SerializationError(detail)) => {
                    self.ignore_stored = true;
                    return Err(SessionError::CorruptCredential(detail));
                }
                result => result?,
            }
        };

        match stored {
            Some(row) => match self.ctx.codec.decode(&row.blob) {
                Ok(auth) => {
                    info!("[{}] resuming stored session", self.ctx.account);
                    Ok(auth)
                }
                Err(err) => {
                    self.ignore_stored = true;
                    Err(err.into())
                }
            },
            None => {
                info!("[{}] no usable credentials, starting fresh", self.ctx.account);
                let mut auth = AuthState::generate();
                auth.push_name = self.ctx.config.push_name.clone();
                Ok(auth)
            }
        }
    }

    /// Open a link with the current AuthState.
    ///
    /// Commands keep flowing while the connector works; a disconnect or
    /// shutdown drops the pending open.
    async fn open_link(&mut self) -> Flow {
        let Some(auth) = self.auth.clone() else {
            self.fail(ConnectionState::Disconnected, SessionError::Cancelled);
            return Flow::Continue;
        };
        self.publish(|s| s.state = ConnectionState::Connecting);

        let (events_tx, events_rx) = mpsc::channel(self.ctx.config.event_buffer);
        let connector = Arc::clone(&self.ctx.connector);
        let account = self.ctx.account.clone();
        let timeout = self.ctx.config.connect_timeout();
        let open = async move {
            tokio::time::timeout(timeout, connector.open(&account, &auth, events_tx))
                .await
                .unwrap_or(Err(TransportError::Timeout))
        };
        tokio::pin!(open);

        let result = loop {
            tokio::select! {
                result = &mut open => break result,
                command = self.commands.recv() => match command {
                    Some(Command::Connect(reply)) => self.waiters.push(reply),
                    Some(Command::SendText { reply, .. }) => {
                        let _ = reply.send(Err(SessionError::NotConnected));
                    }
                    Some(Command::Disconnect { delete_credentials, reply }) => {
                        let _ = reply.send(self.disconnect(delete_credentials).await);
                        return Flow::Continue;
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.stop().await;
                        let _ = reply.send(());
                        return Flow::Stop;
                    }
                    None => {
                        self.stop().await;
                        return Flow::Stop;
                    }
                },
            }
        };

        match result {
            Ok(link) => {
                debug!("[{}] link open, waiting for handshake", self.ctx.account);
                self.link = Some(link);
                self.events = Some(events_rx);
                Flow::Continue
            }
            Err(TransportError::Rejected(code)) => {
                self.on_disconnect(DisconnectReason::from_code(code)).await
            }
            Err(err) => {
                self.on_disconnect(DisconnectReason::Network(err.to_string()))
                    .await
            }
        }
    }

    async fn on_event(&mut self, event: ProtocolEvent) -> Flow {
        let account = self.ctx.account.clone();
        match event {
            ProtocolEvent::PairingRefs(refs) => self.start_pairing(refs).await,
            ProtocolEvent::PairSuccess => {
                info!("[{}] pairing accepted by phone", account);
                self.pairing = None;
                self.restart_allowed = true;
                self.publish(|s| {
                    s.state = ConnectionState::Connecting;
                    s.pairing = None;
                });
                Flow::Continue
            }
            ProtocolEvent::CredentialsUpdated(update) => {
                let Some(auth) = self.auth.as_mut() else {
                    return Flow::Continue;
                };
                auth.apply(update);
                let me = auth.me.clone();
                self.publish(|s| s.me = me);
                if let Err(err) = self.persist().await {
                    self.dirty = true;
                    warn!("[{}] credential update not persisted yet: {}", account, err);
                }
                Flow::Continue
            }
            ProtocolEvent::Open => self.on_open().await,
            ProtocolEvent::Receipt(receipt) => {
                self.ctx.router.receipt(&account, receipt).await;
                Flow::Continue
            }
            ProtocolEvent::Message(message) => {
                self.ctx.router.message(&account, message).await;
                Flow::Continue
            }
            ProtocolEvent::Closed(reason) => self.on_disconnect(reason).await,
        }
    }

    async fn start_pairing(&mut self, refs: Vec<String>) -> Flow {
        let Some(auth) = self.auth.as_ref() else {
            return Flow::Continue;
        };
        let window = self.ctx.config.pairing_initial_timeout();
        let Some(rotation) =
            PairingRotation::start(refs, auth, self.challenge_seq + 1, window, Instant::now())
        else {
            return self
                .on_disconnect(DisconnectReason::Network("server sent no pairing refs".to_string()))
                .await;
        };

        self.pairing_round += 1;
        self.retry = None;
        let challenge = rotation.current().clone();
        self.challenge_seq = challenge.sequence;
        self.pairing = Some(rotation);
        info!(
            "[{}] awaiting pairing (round {}, challenge {})",
            self.ctx.account, self.pairing_round, challenge.sequence
        );

        self.publish(|s| {
            s.state = ConnectionState::AwaitingPairing;
            s.pairing = Some(challenge);
            s.reconnect_attempt = 0;
        });
        let status = self.status.borrow().clone();
        self.resolve_waiters(Ok(status));
        Flow::Continue
    }

    async fn on_open(&mut self) -> Flow {
        if let Err(err) = self.persist().await {
            error!("[{}] cannot persist credentials: {}", self.ctx.account, err);
            self.close_link().await;
            self.fail(ConnectionState::Disconnected, err);
            return Flow::Continue;
        }

        self.ignore_stored = false;
        self.retry = None;
        self.restart_allowed = true;
        self.pairing = None;
        self.pairing_round = 0;
        let me = self.auth.as_ref().and_then(|auth| auth.me.clone());
        info!("[{}] connected as {:?}", self.ctx.account, me);

        self.publish(|s| {
            s.state = ConnectionState::Connected;
            s.pairing = None;
            s.error = None;
            s.me = me;
            s.reconnect_attempt = 0;
        });
        let status = self.status.borrow().clone();
        self.resolve_waiters(Ok(status));
        Flow::Continue
    }

    async fn on_disconnect(&mut self, reason: DisconnectReason) -> Flow {
        self.close_link().await;
        self.pairing = None;

        match reason.action() {
            DisconnectAction::Retry => {
                self.schedule_retry(&reason);
                Flow::Continue
            }
            DisconnectAction::Logout => self.logged_out(&reason).await,
            DisconnectAction::Fatal => {
                error!("[{}] disconnected: {}", self.ctx.account, reason);
                self.fail(ConnectionState::Disconnected, SessionError::Fatal(reason.to_string()));
                Flow::Continue
            }
        }
    }

    fn schedule_retry(&mut self, reason: &DisconnectReason) {
        let now = Instant::now();
        // The server asks for one restart after pairing or login. Any
        // further 515 before the next open counts as a failed attempt.
        let restart =
            *reason == DisconnectReason::RestartRequired && std::mem::take(&mut self.restart_allowed);
        let policy = &self.ctx.config.backoff;
        let retry = self.retry.get_or_insert(RetryState {
            attempt: 0,
            started: now,
            next_at: now,
        });
        let expired = now.duration_since(retry.started) >= policy.overall_timeout();

        if restart && !expired {
            info!("[{}] restart requested, reconnecting", self.ctx.account);
            retry.next_at = now;
            self.publish(|s| s.state = ConnectionState::Reconnecting);
            return;
        }

        retry.attempt += 1;
        let attempt = retry.attempt;
        if attempt > policy.max_attempts || expired {
            let attempts = attempt - 1;
            warn!(
                "[{}] giving up after {} reconnect attempts: {}",
                self.ctx.account, attempts, reason
            );
            self.fail(ConnectionState::Disconnected, SessionError::ConnectionLost { attempts });
            return;
        }

        let delay = policy.delay(attempt);
        retry.next_at = now + delay;
        warn!(
            "[{}] {}; reconnect attempt {} in {:?}",
            self.ctx.account, reason, attempt, delay
        );
        self.publish(|s| {
            s.state = ConnectionState::Reconnecting;
            s.reconnect_attempt = attempt;
        });
    }

    async fn logged_out(&mut self, reason: &DisconnectReason) -> Flow {
        warn!("[{}] logged out by server: {}", self.ctx.account, reason);
        self.auth = None;
        self.dirty = false;
        self.ignore_stored = false;

        let mut failure = SessionFailure::from(&SessionError::LoggedOut);
        if let Err(err) = self.ctx.store.delete(&self.ctx.account).await {
            error!("[{}] cannot delete credentials after logout: {}", self.ctx.account, err);
            failure.message = format!("{}; stored credentials were not removed: {}", failure.message, err);
        }
        self.publish(|s| s.me = None);
        self.settle(ConnectionState::LoggedOut, SessionError::LoggedOut, failure);
        Flow::Stop
    }

    async fn on_timer(&mut self) -> Flow {
        let now = Instant::now();
        if self.link.is_none() {
            let due = self.retry.as_ref().map_or(false, |retry| retry.next_at <= now);
            if due {
                return self.open_link().await;
            }
            return Flow::Continue;
        }

        let window = self.ctx.config.pairing_timeout();
        let Some(rotation) = self.pairing.as_mut() else {
            return Flow::Continue;
        };
        if rotation.expires_at() > now {
            return Flow::Continue;
        }

        if let Some(challenge) = rotation.advance(window, now).cloned() {
            debug!("[{}] pairing challenge {} issued", self.ctx.account, challenge.sequence);
            self.challenge_seq = challenge.sequence;
            self.publish(|s| s.pairing = Some(challenge));
            return Flow::Continue;
        }

        self.pairing = None;
        self.close_link().await;
        if self.pairing_round >= self.ctx.config.pairing_rounds {
            info!("[{}] pairing expired", self.ctx.account);
            self.fail(ConnectionState::Disconnected, SessionError::PairingExpired);
            return Flow::Continue;
        }
        debug!("[{}] pairing refs exhausted, requesting new ones", self.ctx.account);
        self.open_link().await
    }

    async fn disconnect(&mut self, delete_credentials: bool) -> Result<(), SessionError> {
        info!(
            "[{}] disconnect requested (delete credentials: {})",
            self.ctx.account, delete_credentials
        );
        self.close_link().await;
        self.retry = None;
        self.restart_allowed = false;
        self.pairing = None;
        self.pairing_round = 0;
        self.resolve_waiters(Err(SessionError::Cancelled));

        let result = if delete_credentials {
            self.ignore_stored = false;
            self.dirty = false;
            self.ctx.store.delete(&self.ctx.account).await.map_err(SessionError::from)
        } else {
            self.flush().await;
            Ok(())
        };
        self.auth = None;

        self.publish(|s| {
            s.state = ConnectionState::Disconnected;
            s.pairing = None;
            s.error = None;
            s.reconnect_attempt = 0;
            if delete_credentials {
                s.me = None;
            }
        });
        result
    }

    async fn stop(&mut self) {
        self.close_link().await;
        self.retry = None;
        self.pairing = None;
        self.resolve_waiters(Err(SessionError::Cancelled));
        self.flush().await;
        if self.state() != ConnectionState::LoggedOut {
            self.publish(|s| {
                s.state = ConnectionState::Disconnected;
                s.pairing = None;
            });
        }
    }

    async fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        if let Err(err) = self.persist().await {
            error!("[{}] unsaved credential changes lost: {}", self.ctx.account, err);
        }
    }

    /// Encode the whole AuthState and upsert it.
    async fn persist(&mut self) -> Result<(), SessionError> {
        let Some(auth) = self.auth.as_ref() else {
            return Ok(());
        };
        let blob = self.ctx.codec.encode(auth)?;
        self.ctx.store.put(&self.ctx.account, &blob).await?;
        self.dirty = false;
        Ok(())
    }

    async fn close_link(&mut self) {
        self.events = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<ProtocolEvent>>) -> ProtocolEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or_else(|| {
            ProtocolEvent::Closed(DisconnectReason::Network("event stream ended".to_string()))
        }),
        None => futures::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
