//! Admission policies applied during ingest: signature checks and trust filtering.

use crate::event::Event;

/// Checks an event's integrity before it is persisted.
pub trait Verifier: Send + Sync {
    fn verify(&self, event: &Event) -> bool;
}

/// Recomputes the NIP-01 id and rejects events whose id does not commit to
/// their content. Schnorr signature checks plug in through [`Verifier`].
#[derive(Debug, Clone, Copy, Default)]
pub struct IdHashVerifier;

impl Verifier for IdHashVerifier {
    fn verify(&self, event: &Event) -> bool {
        match event.unsigned().compute_id() {
            Ok(id) => id == event.id,
            Err(_) => false,
        }
    }
}

/// Subscription prefixes the trust filter applies to by default.
pub const TRUST_FILTERED_PREFIXES: [&str; 4] = ["Following", "CATCHUP-", "RESUME-", "PAGE-"];

/// Web-of-trust admission, computed elsewhere and consulted here.
pub trait TrustPolicy: Send + Sync {
    /// Whether frames for this subscription are filtered at all.
    fn applies_to(&self, subscription_id: &str) -> bool {
        TRUST_FILTERED_PREFIXES
            .iter()
            .any(|prefix| subscription_id.starts_with(prefix))
    }

    fn is_trusted(&self, pubkey: &str) -> bool;
}

/// Admits everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustEveryone;

impl TrustPolicy for TrustEveryone {
    fn applies_to(&self, _subscription_id: &str) -> bool {
        false
    }

    fn is_trusted(&self, _pubkey: &str) -> bool {
        true
    }
}
