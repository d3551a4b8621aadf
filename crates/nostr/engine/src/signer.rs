//! Signing seam used for NIP-42 authentication.

use crate::event::{Event, KIND_CLIENT_AUTH, UnsignedEvent};
use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Signer error type
#[derive(Error, Debug, Clone)]
pub enum SignerError {
    /// The signer did not answer in time
    #[error("signer timed out after {0:?}")]
    Timeout(Duration),

    /// The signer refused or failed
    #[error("signing failed: {0}")]
    Failed(String),
}

/// Produces signed events. Local keys answer immediately; remote signers may
/// take a while, so callers bound every call with a timeout.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key the signer signs for.
    fn public_key(&self) -> String;

    async fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError>;
}

/// Sign with an upper bound on how long the signer may take.
pub async fn sign_with_timeout(
    signer: &dyn Signer,
    unsigned: UnsignedEvent,
    limit: Duration,
) -> Result<Event, SignerError> {
    match tokio::time::timeout(limit, signer.sign(unsigned)).await {
        Ok(result) => result,
        Err(_) => Err(SignerError::Timeout(limit)),
    }
}

/// Unsigned NIP-42 auth event answering `challenge` for `relay_url`.
pub fn auth_event(pubkey: String, relay_url: &str, challenge: &str) -> UnsignedEvent {
    UnsignedEvent {
        pubkey,
        created_at: unix_now(),
        kind: KIND_CLIENT_AUTH,
        tags: vec![
            vec!["relay".to_string(), relay_url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        content: String::new(),
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowSigner;

    #[async_trait]
    impl Signer for SlowSigner {
        fn public_key(&self) -> String {
            "pk".to_string()
        }

        async fn sign(&self, _unsigned: UnsignedEvent) -> Result<Event, SignerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(SignerError::Failed("unreachable".to_string()))
        }
    }

    #[test]
    fn test_auth_event_tags() {
        let unsigned = auth_event("pk".to_string(), "wss://relay.example", "c-123");

        assert_eq!(unsigned.kind, KIND_CLIENT_AUTH);
        assert_eq!(unsigned.tags[0], vec!["relay", "wss://relay.example"]);
        assert_eq!(unsigned.tags[1], vec!["challenge", "c-123"]);
        assert!(unsigned.content.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_with_timeout_expires() {
        let unsigned = auth_event("pk".to_string(), "wss://relay.example", "c");
        let result = sign_with_timeout(&SlowSigner, unsigned, Duration::from_secs(10)).await;

        match result {
            Err(SignerError::Timeout(limit)) => assert_eq!(limit, Duration::from_secs(10)),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }
}
