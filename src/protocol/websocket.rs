//! WebSocket connector for the WhatsApp web endpoint.
//!
//! Opens the socket, runs the Noise handshake with the account's noise key,
//! then splits the socket into a reader task that turns stanzas into
//! [`ProtocolEvent`]s and a writer task for protocol replies.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::ORIGIN, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::protocol::binary::{decode, pack, unpack, Node};
use crate::protocol::handshake::{client_handshake, encode_frame, read_frame, FrameBuffer};
use crate::protocol::noise::FrameCipher;
use crate::protocol::{Connector, Link, TransportError};
use crate::store::{AuthState, CredentialUpdate};
use crate::types::{AccountId, DisconnectReason, ProtocolEvent, Receipt, ReceiptType, JID};

/// WhatsApp WebSocket endpoints
pub mod endpoints {
    pub const URL: &str = "wss://web.whatsapp.com/ws/chat";
    pub const ORIGIN: &str = "https://web.whatsapp.com";
}

const OUTGOING_BUFFER: usize = 32;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connects to the WhatsApp web socket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    origin: String,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(endpoints::URL)
    }
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: endpoints::ORIGIN.to_string(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(
        &self,
        account: &AccountId,
        auth: &AuthState,
        events: mpsc::Sender<ProtocolEvent>,
    ) -> Result<Box<dyn Link>, TransportError> {
        let connection_failed = |err: WsError| TransportError::ConnectionFailed(err.to_string());

        let mut request = self.url.as_str().into_client_request().map_err(connection_failed)?;
        let origin = HeaderValue::from_str(&self.origin)
            .map_err(|err| TransportError::ConnectionFailed(format!("bad origin: {}", err)))?;
        request.headers_mut().insert(ORIGIN, origin);

        debug!("[{}] dialing {}", account, self.url);
        let (mut socket, _) = connect_async(request).await.map_err(connection_failed)?;

        let mut frames = FrameBuffer::default();
        let (write, read) = client_handshake(&mut socket, &mut frames, auth).await?;
        info!("[{}] noise handshake complete with {}", account, self.url);

        let (sink, stream) = socket.split();
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        let writer = tokio::spawn(write_loop(account.clone(), sink, write, outgoing_rx));
        let reader = tokio::spawn(read_loop(
            account.clone(),
            stream,
            frames,
            read,
            outgoing.clone(),
            events,
        ));

        Ok(Box::new(WebSocketLink {
            account: account.clone(),
            outgoing,
            reader,
            writer,
            closed: false,
        }))
    }
}

enum Outgoing {
    Node(Node),
    Close,
}

struct WebSocketLink {
    account: AccountId,
    outgoing: mpsc::Sender<Outgoing>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send_text(&mut self, to: &JID, _body: &str, message_id: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        warn!("[{}] message {} to {} not sent: no signal session", self.account, message_id, to);
        Err(TransportError::SendFailed(
            "end-to-end encrypted messages are not supported on the websocket transport".to_string(),
        ))
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.reader.abort();
        if self.outgoing.send(Outgoing::Close).await.is_ok() {
            let _ = tokio::time::timeout(CLOSE_GRACE, &mut self.writer).await;
        }
        self.writer.abort();
        debug!("[{}] websocket link closed", self.account);
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn seal_node(cipher: &mut FrameCipher, node: &Node) -> Result<Vec<u8>, String> {
    let plaintext = pack(node).map_err(|err| err.to_string())?;
    let ciphertext = cipher.seal(&plaintext).map_err(|err| err.to_string())?;
    encode_frame(&ciphertext).map_err(|err| err.to_string())
}

async fn write_loop<S>(
    account: AccountId,
    mut sink: S,
    mut cipher: FrameCipher,
    mut outgoing: mpsc::Receiver<Outgoing>,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(Outgoing::Node(node)) = outgoing.recv().await {
        let frame = match seal_node(&mut cipher, &node) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("[{}] dropping <{}>: {}", account, node.tag, err);
                continue;
            }
        };
        if let Err(err) = sink.send(Message::Binary(frame)).await {
            debug!("[{}] websocket write failed: {}", account, err);
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(
    account: AccountId,
    mut stream: S,
    mut frames: FrameBuffer,
    mut cipher: FrameCipher,
    outgoing: mpsc::Sender<Outgoing>,
    events: mpsc::Sender<ProtocolEvent>,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        let frame = match read_frame(&mut stream, &mut frames).await {
            Ok(frame) => frame,
            Err(why) => break DisconnectReason::Network(why),
        };
        // Counters are out of step after a failed open; nothing later can decrypt.
        let plaintext = match cipher.open(&frame) {
            Ok(plaintext) => plaintext,
            Err(err) => break DisconnectReason::Network(format!("frame decryption failed: {}", err)),
        };
        let node = match unpack(&plaintext).and_then(|data| decode(&data)) {
            Ok(node) => node,
            Err(err) => {
                warn!("[{}] skipping undecodable stanza: {}", account, err);
                continue;
            }
        };
        debug!("[{}] <- <{}>", account, node.tag);

        let handled = handle_node(&node);
        if let Some(reply) = handled.reply {
            if outgoing.send(Outgoing::Node(reply)).await.is_err() {
                break DisconnectReason::Network("websocket writer stopped".to_string());
            }
        }
        for event in handled.events {
            if events.send(event).await.is_err() {
                return;
            }
        }
        if let Some(reason) = handled.closed {
            break reason;
        }
    };

    info!("[{}] websocket closed: {}", account, reason);
    let _ = events.send(ProtocolEvent::Closed(reason)).await;
}

/// What one inbound stanza amounts to.
#[derive(Debug, Default)]
struct Handled {
    events: Vec<ProtocolEvent>,
    reply: Option<Node>,
    closed: Option<DisconnectReason>,
}

impl Handled {
    fn closed(reason: DisconnectReason) -> Self {
        Self {
            closed: Some(reason),
            ..Default::default()
        }
    }
}

fn handle_node(node: &Node) -> Handled {
    match node.tag.as_str() {
        "success" => Handled {
            events: vec![ProtocolEvent::Open],
            ..Default::default()
        },
        "failure" => Handled::closed(match node.get_attr("reason").and_then(|r| r.parse().ok()) {
            Some(code) => DisconnectReason::from_code(code),
            None => DisconnectReason::Network("login failure without a reason".to_string()),
        }),
        "stream:error" => Handled::closed(stream_error(node)),
        "xmlstreamend" => Handled::closed(DisconnectReason::Network("stream ended".to_string())),
        "iq" => handle_iq(node),
        "receipt" => handle_receipt(node),
        other => {
            debug!("unhandled <{}> stanza", other);
            Handled::default()
        }
    }
}

fn stream_error(node: &Node) -> DisconnectReason {
    if let Some(code) = node.get_attr("code").and_then(|code| code.parse().ok()) {
        return DisconnectReason::from_code(code);
    }
    match node.child("conflict").and_then(|conflict| conflict.get_attr("type")) {
        Some("replaced") => DisconnectReason::ConnectionReplaced,
        Some("device_removed") => DisconnectReason::LoggedOut,
        _ => DisconnectReason::Network("stream error without a code".to_string()),
    }
}

fn iq_result(id: &str, to: &str) -> Node {
    Node::new("iq").attr("id", id).attr("to", to).attr("type", "result")
}

fn handle_iq(node: &Node) -> Handled {
    let (Some(id), Some(from)) = (node.get_attr("id"), node.get_attr("from")) else {
        return Handled::default();
    };
    let Some(first) = node.child_nodes().first() else {
        return Handled::default();
    };

    match (node.get_attr("type"), first.tag.as_str()) {
        (Some("get"), "ping") => Handled {
            reply: Some(iq_result(id, from)),
            ..Default::default()
        },
        (Some("set"), "pair-device") => {
            let refs = first
                .child_nodes()
                .iter()
                .filter(|child| child.tag == "ref")
                .filter_map(|child| child.content_bytes())
                .filter_map(|bytes| String::from_utf8(bytes.to_vec()).ok())
                .collect();
            Handled {
                events: vec![ProtocolEvent::PairingRefs(refs)],
                reply: Some(iq_result(id, from)),
                ..Default::default()
            }
        }
        (Some("set"), "pair-success") => {
            let me = first
                .child("device")
                .and_then(|device| device.get_attr("jid"))
                .and_then(|jid| jid.parse::<JID>().ok());
            let Some(me) = me else {
                warn!("pair-success without a usable device jid");
                return Handled::default();
            };
            let platform = first
                .child("platform")
                .and_then(|platform| platform.get_attr("name"))
                .map(String::from);
            Handled {
                events: vec![
                    ProtocolEvent::PairSuccess,
                    ProtocolEvent::CredentialsUpdated(CredentialUpdate::Paired {
                        me,
                        platform,
                        push_name: None,
                    }),
                ],
                reply: Some(iq_result(id, from)),
                ..Default::default()
            }
        }
        _ => Handled::default(),
    }
}

fn handle_receipt(node: &Node) -> Handled {
    let (Some(id), Some(from)) = (node.get_attr("id"), node.get_attr("from")) else {
        return Handled::default();
    };
    let mut ack = Node::new("ack").attr("class", "receipt").attr("id", id).attr("to", from);
    if let Some(kind) = node.get_attr("type") {
        ack = ack.attr("type", kind);
    }

    let receipt_type = match node.get_attr("type") {
        None | Some("") | Some("delivery") => Some(ReceiptType::Delivered),
        Some("read") | Some("read-self") => Some(ReceiptType::Read),
        Some("played") | Some("played-self") => Some(ReceiptType::Played),
        Some("retry") => Some(ReceiptType::Error),
        Some(_) => None,
    };
    let (Some(receipt_type), Ok(chat)) = (receipt_type, from.parse::<JID>()) else {
        return Handled {
            reply: Some(ack),
            ..Default::default()
        };
    };

    let mut message_ids = vec![id.to_string()];
    if let Some(list) = node.child("list") {
        message_ids.extend(
            list.child_nodes()
                .iter()
                .filter(|item| item.tag == "item")
                .filter_map(|item| item.get_attr("id"))
                .map(String::from),
        );
    }
    let timestamp = node
        .get_attr("t")
        .and_then(|t| t.parse().ok())
        .unwrap_or_else(|| Utc::now().timestamp());

    Handled {
        events: vec![ProtocolEvent::Receipt(Receipt {
            message_ids,
            chat: chat.to_non_ad(),
            receipt_type,
            timestamp,
        })],
        reply: Some(ack),
        closed: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::protocol::handshake::{ClientPayload, HandshakeMessage, ServerHello};
    use crate::protocol::noise::{NoiseState, WA_HEADER};
    use prost::Message as ProstMessage;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    /// Server end of one accepted connection, past the handshake.
    struct Server {
        socket: WebSocketStream<TcpStream>,
        frames: FrameBuffer,
        read: FrameCipher,
        write: FrameCipher,
        client_static: [u8; 32],
        payload: ClientPayload,
    }

    impl Server {
        async fn send(&mut self, node: Node) {
            let frame = seal_node(&mut self.write, &node).unwrap();
            self.socket.send(Message::Binary(frame)).await.unwrap();
        }

        async fn recv(&mut self) -> Node {
            let frame = read_frame(&mut self.socket, &mut self.frames).await.unwrap();
            decode(&unpack(&self.read.open(&frame).unwrap()).unwrap()).unwrap()
        }
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/chat", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> Server {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(tcp).await.unwrap();

        let first = match socket.next().await.unwrap().unwrap() {
            Message::Binary(data) => data,
            other => panic!("expected a binary hello, got {:?}", other),
        };
        assert_eq!(first[..4], WA_HEADER);
        let mut frames = FrameBuffer::default();
        frames.push(&first[4..]);
        let hello = HandshakeMessage::decode(frames.next_frame().unwrap().as_slice())
            .unwrap()
            .client_hello
            .unwrap();
        let client_eph: [u8; 32] = hello.ephemeral.unwrap().try_into().unwrap();

        let server_eph = KeyPair::generate();
        let server_static = KeyPair::generate();
        let mut noise = NoiseState::new(&WA_HEADER);
        noise.authenticate(&client_eph);
        noise.authenticate(&server_eph.public);
        noise.mix_shared_secret(&server_eph.private, &client_eph);
        let static_ciphertext = noise.encrypt(&server_static.public).unwrap();
        noise.mix_shared_secret(&server_static.private, &client_eph);
        let certificate = noise.encrypt(b"certificate").unwrap();

        let reply = HandshakeMessage {
            server_hello: Some(ServerHello {
                ephemeral: Some(server_eph.public.to_vec()),
                r#static: Some(static_ciphertext),
                payload: Some(certificate),
            }),
            ..Default::default()
        };
        socket
            .send(Message::Binary(encode_frame(&reply.encode_to_vec()).unwrap()))
            .await
            .unwrap();

        let finish = read_frame(&mut socket, &mut frames).await.unwrap();
        let finish = HandshakeMessage::decode(finish.as_slice()).unwrap().client_finish.unwrap();
        let client_static: [u8; 32] =
            noise.decrypt(&finish.r#static.unwrap()).unwrap().try_into().unwrap();
        noise.mix_shared_secret(&server_eph.private, &client_static);
        let payload = noise.decrypt(&finish.payload.unwrap()).unwrap();
        let payload = ClientPayload::decode(payload.as_slice()).unwrap();

        let (read, write) = noise.split();
        Server {
            socket,
            frames,
            read,
            write,
            client_static,
            payload,
        }
    }

    async fn connect(
        auth: &AuthState,
    ) -> (Box<dyn Link>, Server, mpsc::Receiver<ProtocolEvent>) {
        let (listener, url) = listen().await;
        let (tx, rx) = mpsc::channel(16);
        let connector = WebSocketConnector::new(url);
        let account = AccountId::new("ws-test");
        let (link, server) = tokio::join!(connector.open(&account, auth, tx), accept(&listener));
        (link.unwrap(), server, rx)
    }

    #[tokio::test]
    async fn test_handshake_authenticates_with_noise_key() {
        let auth = AuthState::generate();
        let (mut link, mut server, mut rx) = connect(&auth).await;

        assert_eq!(server.client_static, auth.noise_key.public);
        assert!(server.payload.device_pairing_data.is_some());

        server.send(Node::new("success").attr("t", "1700000000")).await;
        assert!(matches!(rx.recv().await, Some(ProtocolEvent::Open)));

        server.send(Node::new("stream:error").attr("code", "515")).await;
        assert!(matches!(
            rx.recv().await,
            Some(ProtocolEvent::Closed(DisconnectReason::RestartRequired))
        ));
        link.close().await;
    }

    #[tokio::test]
    async fn test_pairing_stanzas_become_events_and_are_acked() {
        let auth = AuthState::generate();
        let (mut link, mut server, mut rx) = connect(&auth).await;

        server
            .send(
                Node::new("iq")
                    .attr("id", "pair-1")
                    .attr("from", "s.whatsapp.net")
                    .attr("type", "set")
                    .children(vec![Node::new("pair-device").children(vec![
                        Node::new("ref").bytes(b"2@ref-one".to_vec()),
                        Node::new("ref").bytes(b"2@ref-two".to_vec()),
                    ])]),
            )
            .await;
        match rx.recv().await {
            Some(ProtocolEvent::PairingRefs(refs)) => assert_eq!(refs, vec!["2@ref-one", "2@ref-two"]),
            other => panic!("expected pairing refs, got {:?}", other),
        }
        let ack = server.recv().await;
        assert_eq!(ack.tag, "iq");
        assert_eq!(ack.get_attr("id"), Some("pair-1"));
        assert_eq!(ack.get_attr("type"), Some("result"));

        server
            .send(
                Node::new("iq")
                    .attr("id", "pair-2")
                    .attr("from", "s.whatsapp.net")
                    .attr("type", "set")
                    .children(vec![Node::new("pair-success").children(vec![
                        Node::new("device").attr("jid", "5511999887766:3@s.whatsapp.net"),
                        Node::new("platform").attr("name", "android"),
                    ])]),
            )
            .await;
        assert!(matches!(rx.recv().await, Some(ProtocolEvent::PairSuccess)));
        match rx.recv().await {
            Some(ProtocolEvent::CredentialsUpdated(CredentialUpdate::Paired { me, platform, .. })) => {
                assert_eq!(me, JID::new_device("5511999887766", 3));
                assert_eq!(platform.as_deref(), Some("android"));
            }
            other => panic!("expected paired credentials, got {:?}", other),
        }
        assert_eq!(server.recv().await.get_attr("id"), Some("pair-2"));
        link.close().await;
    }

    #[tokio::test]
    async fn test_pings_are_answered_and_receipts_forwarded() {
        let mut auth = AuthState::generate();
        auth.me = Some(JID::new_device("5511999887766", 3));
        let (mut link, mut server, mut rx) = connect(&auth).await;
        assert_eq!(server.payload.username, Some(5511999887766));

        server
            .send(
                Node::new("iq")
                    .attr("id", "ping-1")
                    .attr("from", "s.whatsapp.net")
                    .attr("type", "get")
                    .children(vec![Node::new("ping")]),
            )
            .await;
        let pong = server.recv().await;
        assert_eq!(pong.get_attr("id"), Some("ping-1"));
        assert_eq!(pong.get_attr("type"), Some("result"));

        server
            .send(
                Node::new("receipt")
                    .attr("id", "3EB0AA")
                    .attr("from", "5511888777666:2@s.whatsapp.net")
                    .attr("type", "read")
                    .attr("t", "1700000100")
                    .children(vec![Node::new("list")
                        .children(vec![Node::new("item").attr("id", "3EB0BB")])]),
            )
            .await;
        match rx.recv().await {
            Some(ProtocolEvent::Receipt(receipt)) => {
                assert_eq!(receipt.message_ids, vec!["3EB0AA", "3EB0BB"]);
                assert_eq!(receipt.chat, JID::from_phone("5511888777666"));
                assert_eq!(receipt.receipt_type, ReceiptType::Read);
                assert_eq!(receipt.timestamp, 1700000100);
            }
            other => panic!("expected a receipt, got {:?}", other),
        }
        let ack = server.recv().await;
        assert_eq!(ack.tag, "ack");
        assert_eq!(ack.get_attr("class"), Some("receipt"));

        let sent = link.send_text(&JID::from_phone("5511888777666"), "hi", "3EB0CC").await;
        assert!(matches!(sent, Err(TransportError::SendFailed(_))));
        link.close().await;
    }

    #[tokio::test]
    async fn test_server_close_is_reported_as_network_loss() {
        let auth = AuthState::generate();
        let (_link, mut server, mut rx) = connect(&auth).await;

        server.socket.close(None).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ProtocolEvent::Closed(DisconnectReason::Network(_)))
        ));
    }

    #[tokio::test]
    async fn test_login_failure_maps_its_reason() {
        let mut auth = AuthState::generate();
        auth.me = Some(JID::new_device("5511999887766", 3));
        let (_link, mut server, mut rx) = connect(&auth).await;

        server.send(Node::new("failure").attr("reason", "401")).await;
        assert!(matches!(
            rx.recv().await,
            Some(ProtocolEvent::Closed(DisconnectReason::LoggedOut))
        ));
    }

    #[tokio::test]
    async fn test_close_ends_the_socket() {
        let auth = AuthState::generate();
        let (mut link, mut server, _rx) = connect(&auth).await;

        link.close().await;
        link.close().await;
        assert!(read_frame(&mut server.socket, &mut server.frames).await.is_err());
        assert!(matches!(
            link.send_text(&JID::from_phone("1"), "x", "id").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_fails_open() {
        let (listener, url) = listen().await;
        drop(listener);
        let (tx, _rx) = mpsc::channel(1);

        let result = WebSocketConnector::new(url)
            .open(&AccountId::new("ws-test"), &AuthState::generate(), tx)
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_socket_dropped_mid_handshake_fails_open() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(tcp).await.unwrap();
            let _hello = socket.next().await;
            socket.close(None).await.unwrap();
        });
        let (tx, _rx) = mpsc::channel(1);

        let result = WebSocketConnector::new(url)
            .open(&AccountId::new("ws-test"), &AuthState::generate(), tx)
            .await;
        assert!(matches!(result, Err(TransportError::HandshakeFailed(_))));
        server.await.unwrap();
    }
}
