//! Subscription ids and per-relay subscription bookkeeping.

use crate::importer::PRIORITY_PREFIX;
use crate::message::Filter;
use std::collections::HashSet;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Generate a subscription ID, optionally prefixed and optionally routed to the priority lane.
pub fn generate_prefixed_id(prefix: Option<&str>, priority: bool) -> String {
    let base = match prefix {
        Some(prefix) => format!("{}{}", prefix, generate_subscription_id()),
        None => generate_subscription_id(),
    };
    if priority && !base.starts_with(PRIORITY_PREFIX) {
        format!("{}{}", PRIORITY_PREFIX, base)
    } else {
        base
    }
}

/// Tracks which relays carry a subscription and how each one answered.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    /// Subscription ID
    pub id: String,
    /// Filters for this subscription
    pub filters: Vec<Filter>,
    /// Relays the REQ was routed to
    pub relays: HashSet<String>,
    /// Relays that have sent EOSE
    pub eose_relays: HashSet<String>,
    /// Relays that refused or closed the subscription
    pub closed_relays: HashSet<String>,
    /// Whether every relay sent EOSE
    pub all_eose: bool,
}

impl SubscriptionTracker {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
            relays: HashSet::new(),
            eose_relays: HashSet::new(),
            closed_relays: HashSet::new(),
            all_eose: false,
        }
    }

    /// Add a relay to this subscription. A relay that comes back is no longer closed.
    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        let relay_url = relay_url.into();
        self.closed_relays.remove(&relay_url);
        self.relays.insert(relay_url);
        self.update_all_eose();
    }

    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
        self.eose_relays.remove(relay_url);
        self.closed_relays.remove(relay_url);
        self.update_all_eose();
    }

    /// Mark EOSE received from a relay. Returns true when this completed the set.
    pub fn mark_eose(&mut self, relay_url: impl Into<String>) -> bool {
        let before = self.all_eose;
        self.eose_relays.insert(relay_url.into());
        self.update_all_eose();
        !before && self.all_eose
    }

    /// Mark the subscription closed by a relay.
    pub fn mark_closed(&mut self, relay_url: impl Into<String>) {
        self.closed_relays.insert(relay_url.into());
    }

    /// Every relay the subscription went to has closed it.
    pub fn all_closed(&self) -> bool {
        !self.relays.is_empty() && self.relays.iter().all(|r| self.closed_relays.contains(r))
    }

    fn update_all_eose(&mut self) {
        self.all_eose = !self.relays.is_empty()
            && self.relays.iter().all(|r| self.eose_relays.contains(r));
    }

    pub fn has_relay(&self, relay_url: &str) -> bool {
        self.relays.contains(relay_url)
    }

    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }
}
