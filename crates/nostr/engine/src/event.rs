//! NIP-01 event types as they travel through the engine.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// NIP-42 client authentication event kind.
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// Contact list kind.
pub const KIND_CONTACTS: u16 = 3;

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex sha256 of the serialized event data
    pub id: String,
    /// 32-byte lowercase hex public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Tags
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-byte lowercase hex schnorr signature
    pub sig: String,
}

/// An event that still needs an id and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// Canonical NIP-01 serialization: `[0, pubkey, created_at, kind, tags, content]`.
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&(
            0,
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
    }

    /// Hex sha256 of the canonical serialization.
    pub fn compute_id(&self) -> Result<String, serde_json::Error> {
        let serialized = self.serialize()?;
        Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
    }
}

impl Event {
    /// The unsigned part of this event.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }

    /// The `d` tag of an addressable event, empty when absent.
    pub fn identifier(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }
}

/// The cheap shape decoded from an EVENT frame before the full event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MinimalEvent {
    pub id: String,
    pub kind: u16,
    pub pubkey: String,
}

/// Kind classification per NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Regular,
    Replaceable,
    Ephemeral,
    Addressable,
}

/// Classify an event kind.
pub fn classify_kind(kind: u16) -> KindClass {
    match kind {
        0 | 3 | 10000..=19999 => KindClass::Replaceable,
        20000..=29999 => KindClass::Ephemeral,
        30000..=39999 => KindClass::Addressable,
        _ => KindClass::Regular,
    }
}

/// Replaceable kinds keep only the newest event per author and kind.
pub fn is_replaceable_kind(kind: u16) -> bool {
    classify_kind(kind) == KindClass::Replaceable
}

/// Addressable kinds keep only the newest event per author, kind and `d` tag.
pub fn is_addressable_kind(kind: u16) -> bool {
    classify_kind(kind) == KindClass::Addressable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_kind() {
        assert_eq!(classify_kind(1), KindClass::Regular);
        assert_eq!(classify_kind(0), KindClass::Replaceable);
        assert_eq!(classify_kind(3), KindClass::Replaceable);
        assert_eq!(classify_kind(10002), KindClass::Replaceable);
        assert_eq!(classify_kind(KIND_CLIENT_AUTH), KindClass::Ephemeral);
        assert_eq!(classify_kind(30023), KindClass::Addressable);
    }

    #[test]
    fn test_serialize_matches_nip01_layout() {
        let unsigned = UnsignedEvent {
            pubkey: "ab".to_string(),
            created_at: 1700000000,
            kind: 1,
            tags: vec![vec!["t".to_string(), "nostr".to_string()]],
            content: "hi\n".to_string(),
        };

        assert_eq!(
            unsigned.serialize().unwrap(),
            r#"[0,"ab",1700000000,1,[["t","nostr"]],"hi\n"]"#
        );
        assert_eq!(unsigned.compute_id().unwrap().len(), 64);
    }

    #[test]
    fn test_minimal_event_ignores_other_fields() {
        let json = r#"{"id":"e1","pubkey":"pk","created_at":1,"kind":7,"tags":[],"content":"","sig":"s"}"#;
        let minimal: MinimalEvent = serde_json::from_str(json).unwrap();

        assert_eq!(minimal.id, "e1");
        assert_eq!(minimal.kind, 7);
        assert_eq!(minimal.pubkey, "pk");
    }

    #[test]
    fn test_identifier_defaults_to_empty() {
        let mut event = Event {
            id: "id".to_string(),
            pubkey: "pk".to_string(),
            created_at: 1,
            kind: 30023,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(event.identifier(), "");

        event.tags.push(vec!["d".to_string(), "post".to_string()]);
        assert_eq!(event.identifier(), "post");
    }
}
