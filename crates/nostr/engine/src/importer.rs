//! Import lanes and the drain that persists them.
//!
//! Decoded events wait in one of two FIFO lanes. A drain pops them in order,
//! verifies, persists and marks them SAVED, and reports which subscriptions
//! were touched every `batch_size` items. Drains run in bounded chunks so the
//! ingest task keeps decoding frames between them; a drain requested while one
//! is running only sets a flag, and the running drain makes another pass.

use crate::decoder::ParsedMessage;
use crate::event::Event;
use crate::policy::Verifier;
use crate::state::{EventStateCache, EventStatus, RelaySet};
use crate::store::{EventStore, SaveOutcome};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Subscription ids with this prefix are served by the priority lane.
pub const PRIORITY_PREFIX: &str = "prio-";

/// One of the two import queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Normal,
    Priority,
}

impl Lane {
    pub fn for_subscription(subscription_id: &str) -> Self {
        if subscription_id.starts_with(PRIORITY_PREFIX) {
            Lane::Priority
        } else {
            Lane::Normal
        }
    }
}

/// The two FIFO queues of decoded events.
#[derive(Debug, Default)]
pub struct Lanes {
    normal: VecDeque<ParsedMessage>,
    priority: VecDeque<ParsedMessage>,
}

impl Lanes {
    fn queue(&mut self, lane: Lane) -> &mut VecDeque<ParsedMessage> {
        match lane {
            Lane::Normal => &mut self.normal,
            Lane::Priority => &mut self.priority,
        }
    }

    pub fn push(&mut self, lane: Lane, message: ParsedMessage) {
        self.queue(lane).push_back(message);
    }

    pub fn pop(&mut self, lane: Lane) -> Option<ParsedMessage> {
        self.queue(lane).pop_front()
    }

    pub fn len(&self, lane: Lane) -> usize {
        match lane {
            Lane::Normal => self.normal.len(),
            Lane::Priority => self.priority.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.priority.is_empty()
    }

    /// Fold another delivery of a queued event into the queued copy.
    ///
    /// Returns the event when `subscription_id` is a priority subscription and
    /// the copy waits in the normal lane, so the caller can notify it at once.
    pub fn merge_duplicate(
        &mut self,
        id: &str,
        relay: &str,
        subscription_id: &str,
    ) -> Option<Event> {
        let lane = Lane::for_subscription(subscription_id);
        for (queued_lane, queue) in [
            (Lane::Priority, &mut self.priority),
            (Lane::Normal, &mut self.normal),
        ] {
            let Some(message) = queue
                .iter_mut()
                .find(|m| m.event.as_ref().is_some_and(|e| e.id == id))
            else {
                continue;
            };

            message.relays.insert(relay.to_string());
            if message.subscription_id.as_deref() != Some(subscription_id) {
                message
                    .also_delivered_to
                    .insert(subscription_id.to_string());
            }
            if lane == Lane::Priority && queued_lane == Lane::Normal {
                return message.event.clone();
            }
            return None;
        }
        None
    }
}

#[derive(Debug, Default)]
struct LaneState {
    draining: bool,
    needs_pass: bool,
    touched: HashSet<String>,
    since_notify: usize,
}

/// Output of one drain chunk.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Subscriptions to notify as imported
    pub imported: Vec<HashSet<String>>,
    /// Priority subscription and the event imported for it
    pub priority: Vec<(String, Event)>,
    pub processed: usize,
    /// The lane is idle again
    pub finished: bool,
}

/// Persists lane contents and tracks drain state per lane.
pub struct ImportPipeline {
    store: Arc<dyn EventStore>,
    verifier: Option<Arc<dyn Verifier>>,
    batch_size: usize,
    normal: LaneState,
    priority: LaneState,
}

impl ImportPipeline {
    /// `verifier` is applied to every event when present.
    pub fn new(
        store: Arc<dyn EventStore>,
        verifier: Option<Arc<dyn Verifier>>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            verifier,
            batch_size: batch_size.max(1),
            normal: LaneState::default(),
            priority: LaneState::default(),
        }
    }

    fn lane_state(&mut self, lane: Lane) -> &mut LaneState {
        match lane {
            Lane::Normal => &mut self.normal,
            Lane::Priority => &mut self.priority,
        }
    }

    pub fn is_draining(&self, lane: Lane) -> bool {
        match lane {
            Lane::Normal => self.normal.draining,
            Lane::Priority => self.priority.draining,
        }
    }

    /// Start a drain, or ask the running one for another pass. Returns true if a drain started.
    pub fn request_drain(&mut self, lane: Lane) -> bool {
        let state = self.lane_state(lane);
        if state.draining {
            state.needs_pass = true;
            false
        } else {
            state.draining = true;
            true
        }
    }

    /// Process up to `batch_size` messages of a draining lane.
    pub fn drain_chunk(
        &mut self,
        lane: Lane,
        cache: &mut EventStateCache,
        lanes: &mut Lanes,
    ) -> DrainReport {
        let mut report = DrainReport::default();
        if !self.is_draining(lane) {
            report.finished = true;
            return report;
        }

        while report.processed < self.batch_size {
            let Some(message) = lanes.pop(lane) else {
                break;
            };
            report.processed += 1;
            self.import_one(lane, message, cache, &mut report);

            let batch_size = self.batch_size;
            let state = self.lane_state(lane);
            state.since_notify += 1;
            if state.since_notify >= batch_size {
                state.since_notify = 0;
                if !state.touched.is_empty() {
                    report.imported.push(std::mem::take(&mut state.touched));
                }
            }
        }

        if lanes.len(lane) == 0 {
            let state = self.lane_state(lane);
            if !state.touched.is_empty() {
                report.imported.push(std::mem::take(&mut state.touched));
            }
            state.since_notify = 0;
            if state.needs_pass {
                // trampoline: stay draining for one more pass
                state.needs_pass = false;
            } else {
                state.draining = false;
                report.finished = true;
            }
        }

        report
    }

    fn import_one(
        &mut self,
        lane: Lane,
        message: ParsedMessage,
        cache: &mut EventStateCache,
        report: &mut DrainReport,
    ) {
        let subscriptions: Vec<String> = message.subscription_ids().cloned().collect();
        let Some(event) = message.event else {
            return;
        };

        if let Some(verifier) = &self.verifier
            && !verifier.verify(&event)
        {
            warn!("Dropping event {} with invalid signature", event.id);
            cache.mark_failed(&event.id);
            return;
        }

        if cache.status(&event.id) == Some(EventStatus::Saved) {
            // queued relays are in the cache already but not yet in the store
            for relay in &message.relays {
                cache.add_relay(&event.id, relay);
                if let Err(e) = self.store.update_relay_attribution(&event.id, relay) {
                    warn!("Failed to attribute {} to {}: {}", event.id, relay, e);
                }
            }
        } else {
            let mut relays: RelaySet = message.relays;
            if let Some(state) = cache.get(&event.id) {
                relays.extend(state.relays.iter().cloned());
            }

            match self.store.save(&event, &relays) {
                Ok(SaveOutcome::Superseded) => {
                    debug!("Event {} superseded by a newer replaceable event", event.id);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to save event {}: {}", event.id, e);
                    cache.mark_failed(&event.id);
                    return;
                }
            }
            for relay in &relays {
                cache.add_relay(&event.id, relay);
            }
            cache.advance(&event.id, EventStatus::Saved);
        }

        let state = self.lane_state(lane);
        state.touched.extend(subscriptions.iter().cloned());

        if lane == Lane::Priority {
            for subscription_id in subscriptions {
                if subscription_id.starts_with(PRIORITY_PREFIX) {
                    report.priority.push((subscription_id, event.clone()));
                }
            }
        }
    }
}
