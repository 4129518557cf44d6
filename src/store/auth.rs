//! Authentication state for one WhatsApp device session.
//!
//! Holds the identity, keys and registration data required to resume a
//! connection without pairing again.

use serde::{Deserialize, Serialize};

use crate::crypto::{KeyPair, PreKey};
use crate::types::JID;

/// Registration ids are 14-bit values.
const REGISTRATION_ID_MASK: u32 = 0x3FFF;

/// In-memory authentication state of a device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    /// Noise Protocol static key pair
    pub noise_key: KeyPair,
    /// Signal identity key pair
    pub identity_key: KeyPair,
    /// Signed pre-key for Signal Protocol
    pub signed_pre_key: PreKey,
    /// Registration ID
    pub registration_id: u32,
    /// Advertisement secret key, shown in the pairing QR code
    #[serde(with = "crate::crypto::b64")]
    pub adv_secret_key: [u8; 32],
    /// One-time pre-keys generated and not yet consumed
    #[serde(default)]
    pub pre_keys: Vec<PreKey>,
    /// Id the next generated one-time pre-key receives
    pub next_pre_key_id: u32,
    /// Lowest pre-key id that has not been uploaded to the server
    pub first_unuploaded_pre_key_id: u32,
    /// Device JID, assigned when pairing succeeds
    #[serde(default)]
    pub me: Option<JID>,
    /// Platform of the primary phone
    #[serde(default)]
    pub platform: Option<String>,
    /// Push name
    #[serde(default)]
    pub push_name: Option<String>,
    /// Server-assigned routing metadata
    #[serde(default, with = "routing_info")]
    pub routing_info: Option<Vec<u8>>,
}

/// An incremental change the protocol layer made to the authentication state.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialUpdate {
    /// Pairing completed and the server assigned our device identity.
    Paired {
        me: JID,
        platform: Option<String>,
        push_name: Option<String>,
    },
    /// New one-time pre-keys were generated.
    PreKeys(Vec<PreKey>),
    /// Pre-keys up to and including this id were uploaded.
    PreKeysUploaded { up_to: u32 },
    /// The signed pre-key was rotated.
    SignedPreKey(PreKey),
    /// The server sent new routing metadata.
    RoutingInfo(Vec<u8>),
    /// The push name changed.
    PushName(String),
}

impl AuthState {
    /// Create a fresh, unregistered state with newly generated keys.
    pub fn generate() -> Self {
        let identity_key = KeyPair::generate();
        let signed_pre_key = PreKey::new_signed(1, &identity_key);

        Self {
            noise_key: KeyPair::generate(),
            identity_key,
            signed_pre_key,
            registration_id: (rand::random::<u32>() & REGISTRATION_ID_MASK).max(1),
            adv_secret_key: rand::random(),
            pre_keys: Vec::new(),
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            me: None,
            platform: None,
            push_name: None,
            routing_info: None,
        }
    }

    /// Check if the device is registered (has a JID).
    pub fn is_registered(&self) -> bool {
        self.me.is_some()
    }

    /// Generate `count` one-time pre-keys continuing the id sequence.
    ///
    /// The keys are returned, not stored; feed them back through
    /// [`CredentialUpdate::PreKeys`] once the protocol has accepted them.
    pub fn generate_pre_keys(&self, count: u32) -> Vec<PreKey> {
        PreKey::batch(self.next_pre_key_id, count)
    }

    /// Number of generated pre-keys the server does not know about yet.
    pub fn unuploaded_pre_key_count(&self) -> usize {
        self.pre_keys
            .iter()
            .filter(|pk| pk.key_id >= self.first_unuploaded_pre_key_id)
            .count()
    }

    /// Apply an incremental update.
    pub fn apply(&mut self, update: CredentialUpdate) {
        match update {
            CredentialUpdate::Paired {
                me,
                platform,
                push_name,
            } => {
                self.me = Some(me);
                self.platform = platform;
                if push_name.is_some() {
                    self.push_name = push_name;
                }
            }
            CredentialUpdate::PreKeys(keys) => {
                if let Some(max_id) = keys.iter().map(|pk| pk.key_id).max() {
                    self.next_pre_key_id = self.next_pre_key_id.max(max_id.saturating_add(1));
                }
                self.pre_keys.retain(|existing| keys.iter().all(|pk| pk.key_id != existing.key_id));
                self.pre_keys.extend(keys);
                self.pre_keys.sort_by_key(|pk| pk.key_id);
            }
            CredentialUpdate::PreKeysUploaded { up_to } => {
                self.first_unuploaded_pre_key_id =
                    self.first_unuploaded_pre_key_id.max(up_to.saturating_add(1));
            }
            CredentialUpdate::SignedPreKey(pre_key) => self.signed_pre_key = pre_key,
            CredentialUpdate::RoutingInfo(info) => self.routing_info = Some(info),
            CredentialUpdate::PushName(name) => self.push_name = Some(name),
        }
    }

    /// Check the invariants a resumable session needs.
    pub fn validate(&self) -> Result<(), String> {
        if !self.noise_key.is_consistent() {
            return Err("noise key pair is inconsistent".to_string());
        }
        if !self.identity_key.is_consistent() {
            return Err("identity key pair is inconsistent".to_string());
        }
        let signature = self
            .signed_pre_key
            .signature
            .ok_or_else(|| "signed pre-key has no signature".to_string())?;
        if !self.identity_key.verify(&self.signed_pre_key.key_pair, &signature) {
            return Err("signed pre-key signature does not verify".to_string());
        }
        if self.registration_id == 0 || self.registration_id > REGISTRATION_ID_MASK {
            return Err(format!("registration id {} out of range", self.registration_id));
        }
        if self.next_pre_key_id == 0 {
            return Err("pre-key id sequence must start at 1".to_string());
        }
        Ok(())
    }
}

mod routing_info {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(info: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match info {
            Some(bytes) => crate::crypto::b64::vec::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        use serde::de::Error as _;

        Option::<String>::deserialize(deserializer)?
            .map(|raw| STANDARD.decode(raw.as_bytes()).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_state_is_valid_and_unregistered() {
        let state = AuthState::generate();
        assert!(state.validate().is_ok());
        assert!(!state.is_registered());
        assert!(state.registration_id > 0 && state.registration_id <= REGISTRATION_ID_MASK);
    }

    #[test]
    fn test_paired_update_registers() {
        let mut state = AuthState::generate();
        state.apply(CredentialUpdate::Paired {
            me: JID::new_device("5511999999999", 3),
            platform: Some("android".into()),
            push_name: None,
        });
        assert!(state.is_registered());
        assert_eq!(state.platform.as_deref(), Some("android"));
    }

    #[test]
    fn test_pre_key_updates_advance_counters() {
        let mut state = AuthState::generate();
        let keys = state.generate_pre_keys(5);
        state.apply(CredentialUpdate::PreKeys(keys));
        assert_eq!(state.next_pre_key_id, 6);
        assert_eq!(state.unuploaded_pre_key_count(), 5);

        state.apply(CredentialUpdate::PreKeysUploaded { up_to: 3 });
        assert_eq!(state.first_unuploaded_pre_key_id, 4);
        assert_eq!(state.unuploaded_pre_key_count(), 2);

        // Uploading an older watermark never moves it backwards.
        state.apply(CredentialUpdate::PreKeysUploaded { up_to: 1 });
        assert_eq!(state.first_unuploaded_pre_key_id, 4);
    }

    #[test]
    fn test_rotated_signed_pre_key_must_be_signed_by_identity() {
        let mut state = AuthState::generate();
        state.apply(CredentialUpdate::SignedPreKey(PreKey::new_signed(2, &state.identity_key.clone())));
        assert!(state.validate().is_ok());

        state.apply(CredentialUpdate::SignedPreKey(PreKey::new_signed(3, &KeyPair::generate())));
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_preserves_state() {
        let mut state = AuthState::generate();
        state.apply(CredentialUpdate::RoutingInfo(vec![1, 2, 3]));
        state.apply(CredentialUpdate::PushName("Leads Bot".into()));

        let json = serde_json::to_vec(&state).unwrap();
        let back: AuthState = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, state);
    }
}
