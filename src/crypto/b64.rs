//! Serde helpers storing key material as base64 strings.
//!
//! Use with `#[serde(with = "crate::crypto::b64")]` on fixed-size byte arrays,
//! or the `option` / `vec` submodules.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer, const N: usize>(
    bytes: &[u8; N],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
    deserializer: D,
) -> Result<[u8; N], D::Error> {
    let raw = String::deserialize(deserializer)?;
    to_array::<D::Error, N>(&raw)
}

fn to_array<E: serde::de::Error, const N: usize>(raw: &str) -> Result<[u8; N], E> {
    let decoded = STANDARD.decode(raw.as_bytes()).map_err(E::custom)?;
    <[u8; N]>::try_from(decoded.as_slice())
        .map_err(|_| E::custom(format!("expected {} bytes, got {}", N, decoded.len())))
}

pub mod option {
    use super::*;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &Option<[u8; N]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<Option<[u8; N]>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => to_array::<D::Error, N>(&raw).map(Some),
            None => Ok(None),
        }
    }
}

pub mod vec {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "crate::crypto::b64")]
        key: [u8; 4],
        #[serde(default, with = "crate::crypto::b64::option")]
        sig: Option<[u8; 2]>,
        #[serde(with = "crate::crypto::b64::vec")]
        blob: Vec<u8>,
    }

    #[test]
    fn encodes_as_base64_strings() {
        let sample = Sample {
            key: [1, 2, 3, 4],
            sig: None,
            blob: b"hi".to_vec(),
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert_eq!(json, r#"{"key":"AQIDBA==","sig":null,"blob":"aGk="}"#);
        assert_eq!(serde_json::from_str::<Sample>(&json).unwrap(), sample);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = serde_json::from_str::<Sample>(r#"{"key":"AQID","blob":""}"#).unwrap_err();
        assert!(err.to_string().contains("expected 4 bytes"));
    }
}
