//! HKDF-SHA256 for the credential blob key and the Noise key schedule.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length is unrestricted");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Derive a 256-bit symmetric key from a secret.
///
/// One HMAC-SHA256 block covers the whole output, so expand runs once with
/// counter 1.
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let prk = hmac(salt, &[secret]);
    hmac(&prk, &[info, &[1u8]])
}

/// Derive two 256-bit keys from a secret with empty info.
///
/// This is the 64-byte expand the Noise handshake uses to mix in a shared
/// secret and to split the transport keys.
pub fn derive_key_pair(secret: &[u8], salt: &[u8]) -> ([u8; 32], [u8; 32]) {
    let prk = hmac(salt, &[secret]);
    let first = hmac(&prk, &[&[1u8]]);
    let second = hmac(&prk, &[&first, &[2u8]]);
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_rfc5869_case_1_prefix() {
        let ikm = [0x0b; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();

        assert_eq!(
            hex::encode(derive_key(&ikm, &salt, &info)),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf"
        );
    }

    #[test]
    fn test_derive_key_depends_on_every_input() {
        let base = derive_key(b"secret", b"salt", b"info");
        assert_eq!(base, derive_key(b"secret", b"salt", b"info"));
        assert_ne!(base, derive_key(b"secret2", b"salt", b"info"));
        assert_ne!(base, derive_key(b"secret", b"salt2", b"info"));
        assert_ne!(base, derive_key(b"secret", b"salt", b"info2"));
    }

    #[test]
    fn test_key_pair_matches_rfc5869_case_3() {
        // Empty salt and info, 42 bytes of output.
        let (first, second) = derive_key_pair(&[0x0b; 22], &[]);
        assert_eq!(
            hex::encode(first),
            "8da4e775a563c18f715f802a063c5a31b8a11f5c5ee1879ec3454e5f3c738d2d"
        );
        assert!(hex::encode(second).starts_with("9d201395faa4b61a96c8"));
    }
}
