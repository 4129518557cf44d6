//! Handshake messages, frame splitting and the client side of Noise XX.
//!
//! The first frame on a socket is the `WA` header followed by a 3-byte
//! big-endian length and a `HandshakeMessage`; every later frame is just the
//! length and its payload.

use futures::{Sink, SinkExt, Stream, StreamExt};
use prost::Message as ProstMessage;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::crypto::KeyPair;
use crate::protocol::noise::{FrameCipher, NoiseError, NoiseState, WA_HEADER};
use crate::protocol::TransportError;
use crate::store::AuthState;

const MAX_FRAME: usize = 1 << 24;

#[derive(Clone, PartialEq, prost::Message)]
pub struct HandshakeMessage {
    #[prost(message, optional, tag = "2")]
    pub client_hello: Option<ClientHello>,
    #[prost(message, optional, tag = "3")]
    pub server_hello: Option<ServerHello>,
    #[prost(message, optional, tag = "4")]
    pub client_finish: Option<ClientFinish>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServerHello {
    #[prost(bytes, optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientFinish {
    #[prost(bytes, optional, tag = "1")]
    pub r#static: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
}

/// Login or registration payload, encrypted in the last handshake message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ClientPayload {
    #[prost(uint64, optional, tag = "1")]
    pub username: Option<u64>,
    #[prost(bool, optional, tag = "3")]
    pub passive: Option<bool>,
    #[prost(message, optional, tag = "5")]
    pub user_agent: Option<UserAgent>,
    #[prost(message, optional, tag = "6")]
    pub web_info: Option<WebInfo>,
    #[prost(string, optional, tag = "7")]
    pub push_name: Option<String>,
    #[prost(int32, optional, tag = "12")]
    pub connect_type: Option<i32>,
    #[prost(int32, optional, tag = "13")]
    pub connect_reason: Option<i32>,
    #[prost(uint32, optional, tag = "18")]
    pub device: Option<u32>,
    #[prost(message, optional, tag = "19")]
    pub device_pairing_data: Option<DevicePairingData>,
    #[prost(bool, optional, tag = "33")]
    pub pull: Option<bool>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserAgent {
    #[prost(int32, optional, tag = "1")]
    pub platform: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub app_version: Option<AppVersion>,
    #[prost(string, optional, tag = "3")]
    pub mcc: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub mnc: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub os_version: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub manufacturer: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub device: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub os_build_number: Option<String>,
    #[prost(int32, optional, tag = "10")]
    pub release_channel: Option<i32>,
    #[prost(string, optional, tag = "11")]
    pub locale_language: Option<String>,
    #[prost(string, optional, tag = "12")]
    pub locale_country: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AppVersion {
    #[prost(uint32, optional, tag = "1")]
    pub primary: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub secondary: Option<u32>,
    #[prost(uint32, optional, tag = "3")]
    pub tertiary: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WebInfo {
    #[prost(string, optional, tag = "1")]
    pub ref_token: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub version: Option<String>,
    #[prost(int32, optional, tag = "4")]
    pub web_sub_platform: Option<i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DevicePairingData {
    #[prost(bytes, optional, tag = "1")]
    pub e_regid: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "2")]
    pub e_keytype: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "3")]
    pub e_ident: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "4")]
    pub e_skey_id: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "5")]
    pub e_skey_val: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "6")]
    pub e_skey_sig: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "7")]
    pub build_hash: Option<Vec<u8>>,
    #[prost(bytes, optional, tag = "8")]
    pub device_props: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceProps {
    #[prost(string, optional, tag = "1")]
    pub os: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub version: Option<AppVersion>,
    #[prost(int32, optional, tag = "3")]
    pub platform_type: Option<i32>,
}

pub mod constants {
    pub const PLATFORM_WEB: i32 = 14;
    pub const RELEASE_CHANNEL_RELEASE: i32 = 0;
    pub const WEB_SUB_PLATFORM_BROWSER: i32 = 0;
    pub const CONNECT_TYPE_WIFI: i32 = 1;
    pub const CONNECT_REASON_USER_ACTIVATED: i32 = 1;
    pub const PLATFORM_TYPE_CHROME: i32 = 1;
    pub const KEY_TYPE_DJB: u8 = 5;
    pub const APP_VERSION: (u32, u32, u32) = (2, 3000, 1012170356);
    pub const DEVICE_OS: &str = "wa-session";
}

use constants::*;

fn app_version() -> AppVersion {
    AppVersion {
        primary: Some(APP_VERSION.0),
        secondary: Some(APP_VERSION.1),
        tertiary: Some(APP_VERSION.2),
    }
}

/// Build the payload: a login for registered devices, a registration with
/// our public key material otherwise.
pub fn client_payload(auth: &AuthState) -> ClientPayload {
    let mut payload = ClientPayload {
        user_agent: Some(UserAgent {
            platform: Some(PLATFORM_WEB),
            app_version: Some(app_version()),
            mcc: Some("000".to_string()),
            mnc: Some("000".to_string()),
            os_version: Some("0.1".to_string()),
            manufacturer: Some(String::new()),
            device: Some("Desktop".to_string()),
            os_build_number: Some("0.1".to_string()),
            release_channel: Some(RELEASE_CHANNEL_RELEASE),
            locale_language: Some("en".to_string()),
            locale_country: Some("US".to_string()),
        }),
        web_info: Some(WebInfo {
            web_sub_platform: Some(WEB_SUB_PLATFORM_BROWSER),
            ..Default::default()
        }),
        push_name: auth.push_name.clone(),
        connect_type: Some(CONNECT_TYPE_WIFI),
        connect_reason: Some(CONNECT_REASON_USER_ACTIVATED),
        ..Default::default()
    };

    match &auth.me {
        Some(me) => {
            payload.username = me.user.parse().ok();
            payload.device = Some(me.device as u32);
            payload.passive = Some(true);
            payload.pull = Some(true);
        }
        None => {
            payload.passive = Some(false);
            payload.pull = Some(false);
            payload.device_pairing_data = Some(pairing_data(auth));
        }
    }
    payload
}

fn pairing_data(auth: &AuthState) -> DevicePairingData {
    let props = DeviceProps {
        os: Some(DEVICE_OS.to_string()),
        version: Some(app_version()),
        platform_type: Some(PLATFORM_TYPE_CHROME),
    };
    let signed = &auth.signed_pre_key;

    DevicePairingData {
        e_regid: Some(auth.registration_id.to_be_bytes().to_vec()),
        e_keytype: Some(vec![KEY_TYPE_DJB]),
        e_ident: Some(auth.identity_key.public.to_vec()),
        e_skey_id: Some(signed.key_id.to_be_bytes()[1..].to_vec()),
        e_skey_val: Some(signed.key_pair.public.to_vec()),
        e_skey_sig: Some(signed.signature.map(|sig| sig.to_vec()).unwrap_or_default()),
        build_hash: None,
        device_props: Some(props.encode_to_vec()),
    }
}

/// Prefix `payload` with its 3-byte length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if payload.len() >= MAX_FRAME {
        return Err(TransportError::SendFailed(format!(
            "frame of {} bytes is too large",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reassembles length-prefixed frames from websocket messages.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 3 {
            return None;
        }
        let len = u32::from_be_bytes([0, self.buf[0], self.buf[1], self.buf[2]]) as usize;
        if self.buf.len() < 3 + len {
            return None;
        }
        let frame = self.buf[3..3 + len].to_vec();
        self.buf.drain(..3 + len);
        Some(frame)
    }
}

/// Next complete frame, or why the socket ended.
pub async fn read_frame<S>(socket: &mut S, frames: &mut FrameBuffer) -> Result<Vec<u8>, String>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        if let Some(frame) = frames.next_frame() {
            return Ok(frame);
        }
        match socket.next().await {
            Some(Ok(Message::Binary(data))) => frames.push(&data),
            Some(Ok(Message::Close(frame))) => {
                return Err(match frame {
                    Some(frame) => format!(
                        "socket closed by server: {} {}",
                        u16::from(frame.code),
                        frame.reason
                    ),
                    None => "socket closed by server".to_string(),
                })
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.to_string()),
            None => return Err("socket closed".to_string()),
        }
    }
}

fn handshake_failed(err: impl std::fmt::Display) -> TransportError {
    TransportError::HandshakeFailed(err.to_string())
}

fn public_key(bytes: Option<Vec<u8>>, what: &str) -> Result<[u8; 32], TransportError> {
    bytes
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .ok_or_else(|| handshake_failed(format!("{} is missing or not 32 bytes", what)))
}

/// Run the initiator side of Noise XX, authenticating with the account's
/// noise key. Returns the `(write, read)` transport ciphers.
pub async fn client_handshake<S>(
    socket: &mut S,
    frames: &mut FrameBuffer,
    auth: &AuthState,
) -> Result<(FrameCipher, FrameCipher), TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let ephemeral = KeyPair::generate();
    let mut noise = NoiseState::new(&WA_HEADER);

    // -> e
    noise.authenticate(&ephemeral.public);
    let hello = HandshakeMessage {
        client_hello: Some(ClientHello {
            ephemeral: Some(ephemeral.public.to_vec()),
        }),
        ..Default::default()
    };
    let mut first = WA_HEADER.to_vec();
    first.extend(encode_frame(&hello.encode_to_vec())?);
    socket
        .send(Message::Binary(first))
        .await
        .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;

    // <- e, ee, s, es
    let reply = read_frame(socket, frames).await.map_err(handshake_failed)?;
    let server_hello = HandshakeMessage::decode(reply.as_slice())
        .map_err(handshake_failed)?
        .server_hello
        .ok_or_else(|| handshake_failed("reply carries no server hello"))?;
    let server_ephemeral = public_key(server_hello.ephemeral, "server ephemeral key")?;

    noise.authenticate(&server_ephemeral);
    noise.mix_shared_secret(&ephemeral.private, &server_ephemeral);
    let server_static = noise
        .decrypt(&server_hello.r#static.unwrap_or_default())
        .map_err(|err: NoiseError| handshake_failed(format!("server static key: {}", err)))?;
    let server_static = public_key(Some(server_static), "server static key")?;
    noise.mix_shared_secret(&ephemeral.private, &server_static);
    // TODO: verify the decrypted certificate chain against the WhatsApp root key.
    noise
        .decrypt(&server_hello.payload.unwrap_or_default())
        .map_err(|err| handshake_failed(format!("server certificate: {}", err)))?;

    // -> s, se
    let static_ciphertext = noise.encrypt(&auth.noise_key.public).map_err(handshake_failed)?;
    noise.mix_shared_secret(&auth.noise_key.private, &server_ephemeral);
    let payload_ciphertext = noise
        .encrypt(&client_payload(auth).encode_to_vec())
        .map_err(handshake_failed)?;
    let finish = HandshakeMessage {
        client_finish: Some(ClientFinish {
            r#static: Some(static_ciphertext),
            payload: Some(payload_ciphertext),
        }),
        ..Default::default()
    };
    socket
        .send(Message::Binary(encode_frame(&finish.encode_to_vec())?))
        .await
        .map_err(|err| TransportError::ConnectionFailed(err.to_string()))?;

    Ok(noise.split())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JID;

    #[test]
    fn test_frame_buffer_splits_and_joins_messages() {
        let mut frames = FrameBuffer::default();
        let mut joined = encode_frame(b"one").unwrap();
        joined.extend(encode_frame(b"two").unwrap());

        frames.push(&joined[..5]);
        assert_eq!(frames.next_frame(), None);
        frames.push(&joined[5..]);
        assert_eq!(frames.next_frame().as_deref(), Some(&b"one"[..]));
        assert_eq!(frames.next_frame().as_deref(), Some(&b"two"[..]));
        assert_eq!(frames.next_frame(), None);
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        assert!(matches!(
            encode_frame(&vec![0u8; MAX_FRAME]),
            Err(TransportError::SendFailed(_))
        ));
    }

    #[test]
    fn test_unregistered_payload_registers_keys() {
        let auth = AuthState::generate();
        let payload = client_payload(&auth);

        assert_eq!(payload.passive, Some(false));
        assert_eq!(payload.username, None);
        let pairing = payload.device_pairing_data.unwrap();
        assert_eq!(pairing.e_regid, Some(auth.registration_id.to_be_bytes().to_vec()));
        assert_eq!(pairing.e_ident, Some(auth.identity_key.public.to_vec()));
        assert_eq!(pairing.e_skey_id, Some(vec![0, 0, 1]));
        assert_eq!(pairing.e_skey_sig.map(|sig| sig.len()), Some(64));
    }

    #[test]
    fn test_registered_payload_logs_in() {
        let mut auth = AuthState::generate();
        auth.me = Some(JID::new_device("5511999887766", 7));
        let payload = client_payload(&auth);

        assert_eq!(payload.username, Some(5511999887766));
        assert_eq!(payload.device, Some(7));
        assert_eq!(payload.passive, Some(true));
        assert!(payload.device_pairing_data.is_none());

        let decoded = ClientPayload::decode(payload.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, payload);
    }
}
