//! wa-session: WhatsApp session lifecycle management
//!
//! Keeps one long-lived, end-to-end encrypted messaging session per account:
//! QR pairing, encrypted credential persistence, reconnects with backoff and
//! a gateway for outbound text and inbound receipts.
//!
//! ## Modules
//!
//! - `types` - Account ids, JIDs, protocol events and disconnect reasons
//! - `crypto` - Key pairs, HKDF and the credential blob cipher
//! - `store` - Authentication state, session codec and credential stores
//! - `protocol` - Connector/link seam, WebSocket connector, pairing challenges, loopback peer
//! - `session` - Per-account connection actors and the session registry
//! - `gateway` - Outbound text and inbound receipt normalization
//! - `config` - Configuration management

pub mod types;
pub mod crypto;
pub mod store;
pub mod protocol;
pub mod session;
pub mod gateway;
pub mod config;
pub mod error;

pub use config::{ConfigError, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use gateway::{
    InboundEvent, MemoryTracker, MessageGateway, MessageStatus, MessageTracker, NullTracker,
    OutboundMessage, OutboundRecord, SendReceipt,
};
pub use protocol::{
    Connector, Link, LoopbackConnector, PairingChallenge, TransportError, WebSocketConnector,
};
pub use session::{
    BackoffPolicy, ConnectionState, FailureKind, SessionFailure, SessionHandle, SessionRegistry,
    SessionStatus,
};
pub use store::{
    AuthState, CredentialStore, FileCredentialStore, MemoryCredentialStore, SessionCodec,
    StoredCredential,
};
pub use types::{AccountId, MessageID, JID};
