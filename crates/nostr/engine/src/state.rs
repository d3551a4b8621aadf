//! Per-event-id dedup state owned by the ingest context.

use std::collections::{BTreeSet, HashMap};

/// Relay URLs that delivered an event.
pub type RelaySet = BTreeSet<String>;

/// Space-separated relay attribution, as persisted.
pub fn join_relays(relays: &RelaySet) -> String {
    relays.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

/// How far an event id has progressed through ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventStatus {
    /// Seen on the wire, not fully decoded yet
    Received,
    /// Decoded and waiting in a lane
    Parsed,
    /// Persisted (or settled by the store)
    Saved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventState {
    pub status: EventStatus,
    pub relays: RelaySet,
    /// The last copy failed to decode, verify or save; the next copy is decoded again
    pub retry: bool,
}

/// Dedup cache keyed by event id.
///
/// Status only moves forward and attribution only grows. A copy that fails
/// after it was observed leaves its status in place and sets the retry flag
/// instead. The cache is a plain value: the ingest task owns it and nothing
/// else touches it.
#[derive(Debug, Default)]
pub struct EventStateCache {
    states: HashMap<String, EventState>,
}

impl EventStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark ids that are already persisted.
    pub fn preload(&mut self, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            self.advance(&id, EventStatus::Saved);
        }
    }

    pub fn get(&self, id: &str) -> Option<&EventState> {
        self.states.get(id)
    }

    pub fn status(&self, id: &str) -> Option<EventStatus> {
        self.states.get(id).map(|state| state.status)
    }

    /// Insert `{Received, {relay}}` for an unseen id. Returns false if the id was known.
    pub fn observe(&mut self, id: &str, relay: &str) -> bool {
        if self.states.contains_key(id) {
            return false;
        }
        self.states.insert(
            id.to_string(),
            EventState {
                status: EventStatus::Received,
                relays: RelaySet::from([relay.to_string()]),
                retry: false,
            },
        );
        true
    }

    /// Move `id` to `status` unless it is already at or past it.
    pub fn advance(&mut self, id: &str, status: EventStatus) -> EventStatus {
        let state = self
            .states
            .entry(id.to_string())
            .or_insert_with(|| EventState {
                status,
                relays: RelaySet::new(),
                retry: false,
            });
        if status == EventStatus::Saved {
            state.retry = false;
        }
        if status > state.status {
            state.status = status;
        }
        state.status
    }

    /// Add `relay` to the attribution of `id`. Returns true when it was new.
    pub fn add_relay(&mut self, id: &str, relay: &str) -> bool {
        match self.states.get_mut(id) {
            Some(state) => state.relays.insert(relay.to_string()),
            None => false,
        }
    }

    /// A copy of `id` was dropped before it was saved. Saved ids are left alone.
    pub fn mark_failed(&mut self, id: &str) {
        if let Some(state) = self.states.get_mut(id)
            && state.status < EventStatus::Saved
        {
            state.retry = true;
        }
    }

    /// Clear the retry flag of `id`. Returns whether it was set.
    pub fn take_retry(&mut self, id: &str) -> bool {
        match self.states.get_mut(id) {
            Some(state) => std::mem::take(&mut state.retry),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_inserts_received() {
        let mut cache = EventStateCache::new();

        assert!(cache.observe("e1", "wss://a"));
        assert!(!cache.observe("e1", "wss://b"));

        let state = cache.get("e1").unwrap();
        assert_eq!(state.status, EventStatus::Received);
        assert_eq!(join_relays(&state.relays), "wss://a");
    }

    #[test]
    fn test_status_never_regresses() {
        let mut cache = EventStateCache::new();
        cache.observe("e1", "wss://a");

        assert_eq!(cache.advance("e1", EventStatus::Saved), EventStatus::Saved);
        assert_eq!(cache.advance("e1", EventStatus::Parsed), EventStatus::Saved);
        assert_eq!(cache.advance("e1", EventStatus::Received), EventStatus::Saved);
    }

    #[test]
    fn test_relays_only_grow() {
        let mut cache = EventStateCache::new();
        cache.observe("e1", "wss://b");

        assert!(cache.add_relay("e1", "wss://a"));
        assert!(!cache.add_relay("e1", "wss://b"));
        assert!(!cache.add_relay("missing", "wss://a"));
        assert_eq!(join_relays(&cache.get("e1").unwrap().relays), "wss://a wss://b");
    }

    #[test]
    fn test_preload_marks_saved() {
        let mut cache = EventStateCache::new();
        cache.preload(vec!["e1".to_string(), "e2".to_string()]);

        assert_eq!(cache.status("e1"), Some(EventStatus::Saved));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_copy_keeps_status_and_relays() {
        let mut cache = EventStateCache::new();
        cache.observe("e1", "wss://a");
        cache.advance("e1", EventStatus::Parsed);

        cache.mark_failed("e1");
        let state = cache.get("e1").unwrap();
        assert_eq!(state.status, EventStatus::Parsed);
        assert!(state.retry);
        assert_eq!(join_relays(&state.relays), "wss://a");

        assert!(cache.take_retry("e1"));
        assert!(!cache.take_retry("e1"));
        assert!(!cache.take_retry("missing"));
        assert_eq!(cache.status("e1"), Some(EventStatus::Parsed));
    }

    #[test]
    fn test_saved_ids_are_never_marked_failed() {
        let mut cache = EventStateCache::new();
        cache.observe("e1", "wss://a");
        cache.mark_failed("e1");
        cache.advance("e1", EventStatus::Saved);
        assert!(!cache.get("e1").unwrap().retry);

        cache.mark_failed("e1");
        assert!(!cache.take_retry("e1"));
        assert_eq!(cache.status("e1"), Some(EventStatus::Saved));
    }
}
