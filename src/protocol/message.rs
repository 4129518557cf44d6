//! Message identifiers.

use rand::Rng;

use crate::types::MessageID;

/// Prefix the web client uses for ids it generates.
const WEB_ID_PREFIX: &str = "3EB0";

/// Generate a unique outbound message ID.
pub fn generate_message_id() -> MessageID {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    format!("{}{}", WEB_ID_PREFIX, hex::encode_upper(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_message_id() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();

        assert!(id1.starts_with("3EB0"));
        assert_eq!(id1.len(), 20);
        assert_ne!(id1, id2);
    }
}
