//! Binary XML stanzas as the WhatsApp web socket carries them.
//!
//! Decrypted frames start with a flag byte (bit 2 set means zlib) followed by
//! one encoded node. Strings are either single-byte dictionary tokens, packed
//! nibbles/hex, JIDs or raw length-prefixed bytes.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::ZlibDecoder;
use thiserror::Error;

use crate::types::{servers, JID};

const LIST_EMPTY: u8 = 0;
const LAST_TOKEN: u8 = 235;
const DICTIONARY_0: u8 = 236;
const DICTIONARY_3: u8 = 239;
const AD_JID: u8 = 247;
const LIST_8: u8 = 248;
const LIST_16: u8 = 249;
const JID_PAIR: u8 = 250;
const HEX_8: u8 = 251;
const BINARY_8: u8 = 252;
const BINARY_20: u8 = 253;
const BINARY_32: u8 = 254;
const NIBBLE_8: u8 = 255;

const FLAG_COMPRESSED: u8 = 2;

/// Errors decoding a stanza.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BinaryError {
    #[error("frame ended early")]
    Truncated,
    #[error("empty frame")]
    Empty,
    #[error("unexpected marker {0}")]
    InvalidMarker(u8),
    #[error("double-byte token {dictionary}/{index} is not in the dictionary")]
    UnknownToken { dictionary: u8, index: u8 },
    #[error("{0} trailing bytes after the node")]
    Trailing(usize),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("node too large to encode")]
    TooLarge,
}

/// Node payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Content {
    #[default]
    None,
    Nodes(Vec<Node>),
    Bytes(Vec<u8>),
}

/// One stanza: a tag, string attributes and optional content.
///
/// JID-valued attributes are kept in their string form (`user:device@server`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub content: Content,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn children(mut self, children: Vec<Node>) -> Self {
        self.content = Content::Nodes(children);
        self
    }

    pub fn bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = Content::Bytes(bytes.into());
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn child_nodes(&self) -> &[Node] {
        match &self.content {
            Content::Nodes(nodes) => nodes,
            _ => &[],
        }
    }

    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.child_nodes().iter().find(|node| node.tag == tag)
    }

    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            Content::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Strip the flag byte of a decrypted frame, inflating it when compressed.
pub fn unpack(frame: &[u8]) -> Result<Vec<u8>, BinaryError> {
    let (&flags, data) = frame.split_first().ok_or(BinaryError::Empty)?;
    if flags & FLAG_COMPRESSED == 0 {
        return Ok(data.to_vec());
    }
    let mut inflated = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut inflated)
        .map_err(|err| BinaryError::Decompress(err.to_string()))?;
    Ok(inflated)
}

/// Encode a node behind an uncompressed flag byte.
pub fn pack(node: &Node) -> Result<Vec<u8>, BinaryError> {
    let mut writer = Writer { out: vec![0] };
    writer.write_node(node)?;
    Ok(writer.out)
}

/// Decode exactly one node.
pub fn decode(data: &[u8]) -> Result<Node, BinaryError> {
    let mut reader = Reader { data, pos: 0 };
    let node = reader.read_node()?;
    match data.len() - reader.pos {
        0 => Ok(node),
        rest => Err(BinaryError::Trailing(rest)),
    }
}

fn token_index(value: &str) -> Option<u8> {
    TOKENS
        .iter()
        .skip(1)
        .position(|token| *token == value)
        .map(|index| index as u8 + 1)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn read_u8(&mut self) -> Result<u8, BinaryError> {
        let byte = *self.data.get(self.pos).ok_or(BinaryError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_uint(&mut self, width: usize) -> Result<usize, BinaryError> {
        let mut value = 0usize;
        for _ in 0..width {
            value = (value << 8) | self.read_u8()? as usize;
        }
        Ok(value)
    }

    fn read_raw(&mut self, len: usize) -> Result<&[u8], BinaryError> {
        let end = self.pos.checked_add(len).ok_or(BinaryError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(BinaryError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn read_list_size(&mut self, marker: u8) -> Result<usize, BinaryError> {
        match marker {
            LIST_EMPTY => Ok(0),
            LIST_8 => self.read_uint(1),
            LIST_16 => self.read_uint(2),
            other => Err(BinaryError::InvalidMarker(other)),
        }
    }

    fn read_node(&mut self) -> Result<Node, BinaryError> {
        let marker = self.read_u8()?;
        let size = self.read_list_size(marker)?;
        if size == 0 {
            return Err(BinaryError::InvalidMarker(marker));
        }

        let tag_marker = self.read_u8()?;
        let tag = self.read_string(tag_marker)?;

        let mut node = Node::new(tag);
        for _ in 0..(size - 1) / 2 {
            let key_marker = self.read_u8()?;
            let key = self.read_string(key_marker)?;
            let value_marker = self.read_u8()?;
            let value = self.read_string(value_marker)?;
            node.attrs.insert(key, value);
        }

        if size % 2 == 0 {
            let marker = self.read_u8()?;
            node.content = match marker {
                LIST_EMPTY => Content::None,
                LIST_8 | LIST_16 => {
                    let count = self.read_list_size(marker)?;
                    let mut children = Vec::with_capacity(count);
                    for _ in 0..count {
                        children.push(self.read_node()?);
                    }
                    Content::Nodes(children)
                }
                other => Content::Bytes(self.read_value(other)?),
            };
        }
        Ok(node)
    }

    fn read_string(&mut self, marker: u8) -> Result<String, BinaryError> {
        let value = self.read_value(marker)?;
        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    fn read_value(&mut self, marker: u8) -> Result<Vec<u8>, BinaryError> {
        match marker {
            LIST_EMPTY => Ok(Vec::new()),
            DICTIONARY_0..=DICTIONARY_3 => {
                let index = self.read_u8()?;
                Err(BinaryError::UnknownToken {
                    dictionary: marker - DICTIONARY_0,
                    index,
                })
            }
            1..=LAST_TOKEN => Ok(TOKENS[marker as usize].as_bytes().to_vec()),
            BINARY_8 => {
                let len = self.read_uint(1)?;
                Ok(self.read_raw(len)?.to_vec())
            }
            BINARY_20 => {
                let len = self.read_uint(3)? & 0x0f_ffff;
                Ok(self.read_raw(len)?.to_vec())
            }
            BINARY_32 => {
                let len = self.read_uint(4)?;
                Ok(self.read_raw(len)?.to_vec())
            }
            NIBBLE_8 | HEX_8 => self.read_packed(marker).map(String::into_bytes),
            JID_PAIR => {
                let user_marker = self.read_u8()?;
                let user = self.read_string(user_marker)?;
                let server_marker = self.read_u8()?;
                let server = self.read_string(server_marker)?;
                Ok(JID::new(user, server).to_string().into_bytes())
            }
            AD_JID => {
                let agent = self.read_u8()?;
                let device = self.read_u8()?;
                let user_marker = self.read_u8()?;
                let user = self.read_string(user_marker)?;
                let server = if agent == 0 {
                    servers::DEFAULT_USER
                } else {
                    servers::HIDDEN_USER
                };
                let jid = JID {
                    user,
                    device: device as u16,
                    server: server.to_string(),
                };
                Ok(jid.to_string().into_bytes())
            }
            other => Err(BinaryError::InvalidMarker(other)),
        }
    }

    fn read_packed(&mut self, marker: u8) -> Result<String, BinaryError> {
        let start = self.read_u8()?;
        let mut out = String::new();
        for _ in 0..(start & 0x7f) {
            let byte = self.read_u8()?;
            out.push(unpack_nibble(marker, byte >> 4)?);
            out.push(unpack_nibble(marker, byte & 0x0f)?);
        }
        // High bit: odd length, last half-byte is padding.
        if start & 0x80 != 0 {
            out.pop();
        }
        Ok(out)
    }
}

fn unpack_nibble(marker: u8, value: u8) -> Result<char, BinaryError> {
    match (marker, value) {
        (_, 0..=9) => Ok((b'0' + value) as char),
        (NIBBLE_8, 10) => Ok('-'),
        (NIBBLE_8, 11) => Ok('.'),
        (NIBBLE_8, 15) => Ok('\0'),
        (HEX_8, 10..=15) => Ok((b'A' + value - 10) as char),
        _ => Err(BinaryError::InvalidMarker(marker)),
    }
}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn write_list_start(&mut self, size: usize) -> Result<(), BinaryError> {
        match size {
            0 => self.out.push(LIST_EMPTY),
            1..=0xff => self.out.extend_from_slice(&[LIST_8, size as u8]),
            0x100..=0xffff => {
                self.out.push(LIST_16);
                self.out.extend_from_slice(&(size as u16).to_be_bytes());
            }
            _ => return Err(BinaryError::TooLarge),
        }
        Ok(())
    }

    fn write_node(&mut self, node: &Node) -> Result<(), BinaryError> {
        let has_content = !matches!(node.content, Content::None);
        self.write_list_start(1 + 2 * node.attrs.len() + has_content as usize)?;
        self.write_string(&node.tag)?;
        for (key, value) in &node.attrs {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        match &node.content {
            Content::None => {}
            Content::Bytes(bytes) => self.write_bytes(bytes)?,
            Content::Nodes(children) => {
                self.write_list_start(children.len())?;
                for child in children {
                    self.write_node(child)?;
                }
            }
        }
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<(), BinaryError> {
        if let Some(index) = token_index(value) {
            self.out.push(index);
            return Ok(());
        }
        if value.contains('@') {
            if let Ok(jid) = value.parse::<JID>() {
                return self.write_jid(&jid);
            }
        }
        self.write_bytes(value.as_bytes())
    }

    fn write_jid(&mut self, jid: &JID) -> Result<(), BinaryError> {
        if jid.device > 0 && jid.server == servers::DEFAULT_USER {
            self.out.extend_from_slice(&[AD_JID, 0, jid.device as u8]);
            return self.write_string(&jid.user);
        }
        self.out.push(JID_PAIR);
        if jid.user.is_empty() {
            self.out.push(LIST_EMPTY);
        } else {
            self.write_string(&jid.user)?;
        }
        self.write_string(&jid.server)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BinaryError> {
        let len = bytes.len();
        match len {
            0..=0xff => self.out.extend_from_slice(&[BINARY_8, len as u8]),
            0x100..=0x0f_ffff => {
                self.out.push(BINARY_20);
                self.out.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
            }
            _ => {
                self.out.push(BINARY_32);
                let len = u32::try_from(len).map_err(|_| BinaryError::TooLarge)?;
                self.out.extend_from_slice(&len.to_be_bytes());
            }
        }
        self.out.extend_from_slice(bytes);
        Ok(())
    }
}

/// Single-byte dictionary, indexed by token byte.
const TOKENS: [&str; 236] = [
    "", "xmlstreamstart", "xmlstreamend", "s.whatsapp.net", "type", "participant", "from",
    "receipt", "id", "notification", "disappearing_mode", "status", "jid", "broadcast", "user",
    "devices", "device_hash", "to", "offline", "message", "result", "class", "xmlns",
    "duration", "notify", "iq", "t", "ack", "g.us", "enc", "urn:xmpp:whatsapp:push", "presence",
    "config_value", "picture", "verified_name", "config_code", "key-index-list", "contact",
    "mediatype", "routing_info", "edge_routing", "get", "read", "urn:xmpp:ping",
    "fallback_hostname", "0", "chatstate", "business_hours_config", "unavailable",
    "download_buckets", "skmsg", "verified_level", "composing", "handshake", "device-list",
    "media", "text", "fallback_ip4", "media_conn", "device", "creation", "location", "config",
    "item", "fallback_ip6", "count", "w:profile:picture", "image", "business", "2", "hostname",
    "call-creator", "display_name", "relaylatency", "platform", "abprops", "success", "msg",
    "offline_preview", "prop", "key-index", "v", "day_of_week", "pkmsg", "version", "1", "ping",
    "w:p", "download", "video", "set", "specific_hours", "props", "primary", "unknown", "hash",
    "commerce_experience", "last", "subscribe", "max_buckets", "call", "profile",
    "member_since_text", "close_time", "call-id", "sticker", "mode", "participants", "value",
    "query", "profile_options", "open_time", "code", "list", "host", "ts", "contacts", "upload",
    "lid", "preview", "update", "usync", "w:stats", "delivery", "auth_ttl", "context", "fail",
    "cart_enabled", "appdata", "category", "atn", "direct_connection", "decrypt-fail",
    "relay_id", "mmg-fallback.whatsapp.net", "target", "available", "name", "last_id",
    "mmg.whatsapp.net", "categories", "401", "is_new", "index", "tctoken", "ip4", "token_id",
    "latency", "recipient", "edit", "ip6", "add", "thumbnail-document", "26", "paused", "true",
    "identity", "stream:error", "key", "sidelist", "background", "audio", "3",
    "thumbnail-image", "biz-cover-photo", "cat", "gcm", "thumbnail-video", "error", "auth",
    "deny", "serial", "in", "registration", "thumbnail-link", "remove", "00", "gif",
    "thumbnail-gif", "tag", "capability", "multicast", "item-not-found", "description",
    "business_hours", "config_expo_key", "md-app-state", "expiration", "fallback", "ttl", "300",
    "md-msg-hist", "device_orientation", "out", "w:m", "open_24h", "side_list", "token",
    "inactive", "01", "document", "te2", "played", "encrypt", "msgr", "hide", "direct_path",
    "12", "state", "not-authorized", "url", "terminate", "signature", "status-revoke-delay",
    "02", "te", "linked_accounts", "trusted_contact", "timezone", "ptt", "kyc-id",
    "privacy_token", "readreceipts", "appointment_only", "address", "expected_ts", "privacy",
    "7", "android", "interactive", "device-identity", "enabled", "attribute_padding", "1080",
    "03", "screen_height",
];

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_stanza_survives_encoding() {
        let node = Node::new("iq")
            .attr("id", "abc.123")
            .attr("to", "s.whatsapp.net")
            .attr("from", "5511999887766:7@s.whatsapp.net")
            .attr("type", "set")
            .children(vec![
                Node::new("pair-device").children(vec![
                    Node::new("ref").bytes(b"2@first".to_vec()),
                    Node::new("ref").bytes(vec![0u8; 300]),
                ]),
                Node::new("ping"),
            ]);

        let packed = pack(&node).unwrap();
        assert_eq!(packed[0], 0);
        assert_eq!(decode(&unpack(&packed).unwrap()).unwrap(), node);
    }

    #[test]
    fn test_decodes_tokens_and_packed_digits() {
        // <iq id="123"/>, the id nibble-packed with an odd length.
        let data = [LIST_8, 3, 25, 8, NIBBLE_8, 0x82, 0x12, 0x3f];
        let node = decode(&data).unwrap();
        assert_eq!(node.tag, "iq");
        assert_eq!(node.get_attr("id"), Some("123"));
        assert_eq!(node.content, Content::None);
    }

    #[test]
    fn test_decodes_device_jid() {
        let data = [LIST_8, 3, 19, 6, AD_JID, 0, 2, BINARY_8, 3, b'1', b'2', b'3'];
        let node = decode(&data).unwrap();
        assert_eq!(node.get_attr("from"), Some("123:2@s.whatsapp.net"));

        let jid: JID = node.get_attr("from").unwrap().parse().unwrap();
        assert_eq!(jid.device, 2);
    }

    #[test]
    fn test_unpack_inflates_compressed_frames() {
        let plain = pack(&Node::new("success").attr("t", "1700000000")).unwrap();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain[1..]).unwrap();
        let mut frame = vec![FLAG_COMPRESSED];
        frame.extend(encoder.finish().unwrap());

        let node = decode(&unpack(&frame).unwrap()).unwrap();
        assert_eq!(node.tag, "success");
        assert_eq!(node.get_attr("t"), Some("1700000000"));
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert_eq!(unpack(&[]), Err(BinaryError::Empty));
        assert_eq!(decode(&[LIST_8, 3, 25, 8]), Err(BinaryError::Truncated));
        assert_eq!(decode(&[LIST_8, 1, 25, 0]), Err(BinaryError::Trailing(1)));
        assert_eq!(
            decode(&[LIST_8, 1, DICTIONARY_0, 4]),
            Err(BinaryError::UnknownToken { dictionary: 0, index: 4 })
        );
        assert!(matches!(
            unpack(&[FLAG_COMPRESSED, 1, 2, 3]),
            Err(BinaryError::Decompress(_))
        ));
    }
}
