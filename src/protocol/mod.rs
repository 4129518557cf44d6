//! Protocol module: the seam to the real-time messaging protocol.
//!
//! Contains the connector/link traits, QR pairing challenges, message ids,
//! the WhatsApp web socket connector and an in-process loopback peer.

mod transport;
mod qr;
mod message;
pub mod loopback;
pub mod binary;
pub mod noise;
pub mod handshake;
pub mod websocket;

pub use transport::{Connector, Link, TransportError};
pub use qr::{PairingChallenge, PairingRotation, QRError};
pub use message::generate_message_id;
pub use loopback::{LoopbackConnector, OpenScript, SentText};
pub use websocket::WebSocketConnector;
