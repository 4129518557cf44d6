//! WhatsApp JID (Jabber ID) types.
//!
//! JIDs address users, devices and groups on WhatsApp. The session core only
//! needs user addresses (for outbound text) and device addresses (the `me`
//! identity assigned at pairing time).

use std::fmt;
use std::str::FromStr;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

/// Known JID servers on WhatsApp
pub mod servers {
    pub const DEFAULT_USER: &str = "s.whatsapp.net";
    pub const GROUP: &str = "g.us";
    pub const LEGACY_USER: &str = "c.us";
    pub const BROADCAST: &str = "broadcast";
    pub const HIDDEN_USER: &str = "lid";
}

/// MessageID is the internal ID of a WhatsApp message.
pub type MessageID = String;

/// JID represents a WhatsApp address.
///
/// Regular JIDs carry a user and a server; device JIDs additionally carry the
/// device number of a linked companion (`user:device@server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct JID {
    pub user: String,
    pub device: u16,
    pub server: String,
}

impl JID {
    /// Creates a new regular JID.
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            device: 0,
        }
    }

    /// Creates a device JID on the default user server.
    pub fn new_device(user: impl Into<String>, device: u16) -> Self {
        Self {
            user: user.into(),
            device,
            server: servers::DEFAULT_USER.to_string(),
        }
    }

    /// Creates a user JID from an already-normalized phone number.
    pub fn from_phone(digits: &str) -> Self {
        Self::new(digits, servers::DEFAULT_USER)
    }

    /// Returns a version of the JID without the device part.
    pub fn to_non_ad(&self) -> Self {
        Self::new(self.user.clone(), self.server.clone())
    }

    /// Whether this JID addresses a person (phone number or hidden user id).
    pub fn is_user(&self) -> bool {
        !self.user.is_empty()
            && matches!(
                self.server.as_str(),
                servers::DEFAULT_USER | servers::LEGACY_USER | servers::HIDDEN_USER
            )
    }

    /// Returns true if the JID is empty (no server).
    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

/// Error type for JID parsing
#[derive(Debug, Clone, PartialEq)]
pub struct ParseJIDError(pub String);

impl fmt::Display for ParseJIDError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse JID: {}", self.0)
    }
}

impl std::error::Error for ParseJIDError {}

impl FromStr for JID {
    type Err = ParseJIDError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((user_part, server)) = s.split_once('@') else {
            return Ok(JID::new("", s));
        };
        if server.contains('@') {
            return Err(ParseJIDError("unexpected number of @ in JID".to_string()));
        }

        // Agent suffixes (`user.agent:device`) are accepted and dropped.
        let user_part = match user_part.split_once('.') {
            Some((user, ad)) if ad.split(':').next().is_some_and(|a| a.parse::<u8>().is_ok()) => {
                match ad.split_once(':') {
                    Some((_, device)) => format!("{}:{}", user, device),
                    None => user.to_string(),
                }
            }
            Some(_) => return Err(ParseJIDError("failed to parse agent from JID".to_string())),
            None => user_part.to_string(),
        };

        let (user, device) = match user_part.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse()
                    .map_err(|_| ParseJIDError("failed to parse device from JID".to_string()))?;
                (user.to_string(), device)
            }
            None => (user_part, 0),
        };

        Ok(JID {
            user,
            device,
            server: server.to_string(),
        })
    }
}

impl Serialize for JID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_jid() {
        let jid: JID = "1234567890@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.server, servers::DEFAULT_USER);
        assert_eq!(jid.device, 0);
        assert!(jid.is_user());
    }

    #[test]
    fn test_parse_device_jid() {
        let jid: JID = "1234567890:2@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.device, 2);
        assert_eq!(jid.to_non_ad().to_string(), "1234567890@s.whatsapp.net");
    }

    #[test]
    fn test_parse_ad_jid_drops_agent() {
        let jid: JID = "1234567890.0:1@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.device, 1);
    }

    #[test]
    fn test_parse_rejects_bad_device() {
        assert!("123:x@s.whatsapp.net".parse::<JID>().is_err());
        assert!("a@b@c".parse::<JID>().is_err());
    }

    #[test]
    fn test_group_jid_is_not_user() {
        let jid: JID = "123456789-1234567890@g.us".parse().unwrap();
        assert_eq!(jid.server, servers::GROUP);
        assert!(!jid.is_user());
    }

    #[test]
    fn test_jid_serde_as_string() {
        let jid = JID::new_device("5511999999999", 7);
        let json = serde_json::to_string(&jid).unwrap();
        assert_eq!(json, "\"5511999999999:7@s.whatsapp.net\"");
        let back: JID = serde_json::from_str(&json).unwrap();
        assert_eq!(back, jid);
    }
}
