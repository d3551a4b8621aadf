//! Persistence seam and an in-memory store.
//!
//! The engine only needs a handful of operations from persistence: lookup by id,
//! lookup by filter, save with relay attribution, and attribution updates. Any
//! database can sit behind [`EventStore`]; [`MemoryStore`] keeps everything in
//! process and applies the NIP-01 replaceable rules.

use crate::event::{Event, is_addressable_kind, is_replaceable_kind};
use crate::message::Filter;
use crate::state::RelaySet;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Store error type
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend failure
    #[error("backend error: {0}")]
    Backend(String),

    /// Event not found
    #[error("event not found: {0}")]
    NotFound(String),
}

/// A persisted event together with the relays that delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event: Event,
    pub relays: RelaySet,
}

/// Result of a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// New row
    Inserted,
    /// New row that dropped an older replaceable event
    Replaced { previous: String },
    /// Not stored because a newer replaceable event exists
    Superseded,
    /// Already stored; attribution merged
    Existing,
}

/// Persistence operations the engine relies on.
///
/// Calls happen on the ingest task, so implementations should be quick.
pub trait EventStore: Send + Sync {
    fn fetch_by_id(&self, id: &str) -> Result<Option<StoredEvent>, StoreError>;

    /// Events matching `filter`, newest first, honouring `limit`.
    fn fetch(&self, filter: &Filter) -> Result<Vec<StoredEvent>, StoreError>;

    /// Persist an event. For replaceable kinds the newer `created_at` wins.
    fn save(&self, event: &Event, relays: &RelaySet) -> Result<SaveOutcome, StoreError>;

    fn update_relay_attribution(&self, id: &str, relay: &str) -> Result<(), StoreError>;

    /// Ids already persisted, used to warm the dedup cache.
    fn saved_ids(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
struct Inner {
    events: HashMap<String, StoredEvent>,
    by_kind: HashMap<u16, HashSet<String>>,
    replaceable: HashMap<(String, u16), String>,
    addressable: HashMap<(String, u16, String), String>,
}

impl Inner {
    fn remove(&mut self, id: &str) {
        if let Some(stored) = self.events.remove(id)
            && let Some(ids) = self.by_kind.get_mut(&stored.event.kind)
        {
            ids.remove(id);
        }
    }

    /// Returns the id to drop, or `Err(())` when `event` is older than what is stored.
    fn resolve_replacement(&self, event: &Event) -> Result<Option<String>, ()> {
        let existing = if is_replaceable_kind(event.kind) {
            self.replaceable
                .get(&(event.pubkey.clone(), event.kind))
                .cloned()
        } else if is_addressable_kind(event.kind) {
            self.addressable
                .get(&(
                    event.pubkey.clone(),
                    event.kind,
                    event.identifier().to_string(),
                ))
                .cloned()
        } else {
            None
        };

        match existing.and_then(|id| self.events.get(&id)) {
            Some(old) if old.event.id == event.id => Ok(None),
            Some(old) if old.event.created_at >= event.created_at => Err(()),
            Some(old) => Ok(Some(old.event.id.clone())),
            None => Ok(None),
        }
    }
}

/// In-memory [`EventStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventStore for MemoryStore {
    fn fetch_by_id(&self, id: &str) -> Result<Option<StoredEvent>, StoreError> {
        Ok(self.inner.read().events.get(id).cloned())
    }

    fn fetch(&self, filter: &Filter) -> Result<Vec<StoredEvent>, StoreError> {
        let inner = self.inner.read();
        let mut found: Vec<StoredEvent> = match &filter.kinds {
            Some(kinds) => kinds
                .iter()
                .filter_map(|kind| inner.by_kind.get(kind))
                .flatten()
                .filter_map(|id| inner.events.get(id))
                .filter(|stored| filter.matches(&stored.event))
                .cloned()
                .collect(),
            None => inner
                .events
                .values()
                .filter(|stored| filter.matches(&stored.event))
                .cloned()
                .collect(),
        };

        found.sort_by(|a, b| b.event.created_at.cmp(&a.event.created_at));
        if let Some(limit) = filter.limit {
            found.truncate(limit as usize);
        }
        Ok(found)
    }

    fn save(&self, event: &Event, relays: &RelaySet) -> Result<SaveOutcome, StoreError> {
        let mut inner = self.inner.write();

        if let Some(stored) = inner.events.get_mut(&event.id) {
            stored.relays.extend(relays.iter().cloned());
            return Ok(SaveOutcome::Existing);
        }

        let previous = match inner.resolve_replacement(event) {
            Ok(previous) => previous,
            Err(()) => return Ok(SaveOutcome::Superseded),
        };
        if let Some(ref old_id) = previous {
            inner.remove(old_id);
        }

        if is_replaceable_kind(event.kind) {
            inner
                .replaceable
                .insert((event.pubkey.clone(), event.kind), event.id.clone());
        } else if is_addressable_kind(event.kind) {
            inner.addressable.insert(
                (
                    event.pubkey.clone(),
                    event.kind,
                    event.identifier().to_string(),
                ),
                event.id.clone(),
            );
        }

        inner
            .by_kind
            .entry(event.kind)
            .or_default()
            .insert(event.id.clone());
        inner.events.insert(
            event.id.clone(),
            StoredEvent {
                event: event.clone(),
                relays: relays.clone(),
            },
        );

        Ok(match previous {
            Some(previous) => SaveOutcome::Replaced { previous },
            None => SaveOutcome::Inserted,
        })
    }

    fn update_relay_attribution(&self, id: &str, relay: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let stored = inner
            .events
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        stored.relays.insert(relay.to_string());
        Ok(())
    }

    fn saved_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().events.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(id: &str, pubkey: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn relays(urls: &[&str]) -> RelaySet {
        urls.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_save_and_fetch_by_id() {
        let store = MemoryStore::new();
        let outcome = store
            .save(&make_event("e1", "pk", 1, 100), &relays(&["wss://a"]))
            .unwrap();

        assert_eq!(outcome, SaveOutcome::Inserted);
        let stored = store.fetch_by_id("e1").unwrap().unwrap();
        assert_eq!(stored.relays, relays(&["wss://a"]));
        assert!(store.fetch_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_replaceable_newer_wins() {
        let store = MemoryStore::new();
        store
            .save(&make_event("old", "pk", 3, 100), &RelaySet::new())
            .unwrap();

        let outcome = store
            .save(&make_event("new", "pk", 3, 200), &RelaySet::new())
            .unwrap();
        assert_eq!(
            outcome,
            SaveOutcome::Replaced {
                previous: "old".to_string()
            }
        );
        assert!(store.fetch_by_id("old").unwrap().is_none());

        let outcome = store
            .save(&make_event("older", "pk", 3, 50), &RelaySet::new())
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Superseded);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_addressable_keyed_by_identifier() {
        let store = MemoryStore::new();
        let mut a = make_event("a", "pk", 30023, 100);
        a.tags.push(vec!["d".to_string(), "one".to_string()]);
        let mut b = make_event("b", "pk", 30023, 100);
        b.tags.push(vec!["d".to_string(), "two".to_string()]);

        store.save(&a, &RelaySet::new()).unwrap();
        assert_eq!(store.save(&b, &RelaySet::new()).unwrap(), SaveOutcome::Inserted);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_fetch_by_filter_newest_first() {
        let store = MemoryStore::new();
        store.save(&make_event("e1", "pk", 1, 100), &RelaySet::new()).unwrap();
        store.save(&make_event("e2", "pk", 1, 300), &RelaySet::new()).unwrap();
        store.save(&make_event("e3", "pk", 7, 200), &RelaySet::new()).unwrap();

        let found = store.fetch(&Filter::new().kinds([1]).limit(1)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event.id, "e2");

        let all = store.fetch(&Filter::new().authors(["pk"])).unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.event.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e3", "e1"]);
    }

    #[test]
    fn test_update_relay_attribution() {
        let store = MemoryStore::new();
        store
            .save(&make_event("e1", "pk", 1, 100), &relays(&["wss://a"]))
            .unwrap();

        store.update_relay_attribution("e1", "wss://b").unwrap();
        let stored = store.fetch_by_id("e1").unwrap().unwrap();
        assert_eq!(stored.relays, relays(&["wss://a", "wss://b"]));

        match store.update_relay_attribution("missing", "wss://b") {
            Err(StoreError::NotFound(_)) => {}
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }
}
