//! The ingest context.
//!
//! One task owns the dedup cache and both import lanes. It decodes every frame
//! the relays produce, hands control messages to the pool, drains the lanes in
//! bounded chunks when their coalescers fire, and forwards import notices to the
//! correlator and to subscribers.

use crate::backlog::Backlog;
use crate::coalesce::Coalescer;
use crate::config::ImportConfig;
use crate::decoder::{Decoded, FrameDecoder, FrameError, MessageType, ParsedMessage};
use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::importer::{ImportPipeline, Lane, Lanes};
use crate::policy::{TrustPolicy, Verifier};
use crate::pool::ConnectionPool;
use crate::relay::RawFrame;
use crate::state::{EventStateCache, EventStatus};
use crate::store::EventStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Notices published by the ingest context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    /// Subscriptions that received newly imported or already known events
    Imported(HashSet<String>),
    /// A single event for a priority subscription
    PriorityImported {
        subscription_id: String,
        event: Event,
    },
}

enum IngestCommand {
    Drain(Lane),
    Status {
        id: String,
        reply: oneshot::Sender<Option<EventStatus>>,
    },
}

/// Queries answered by the ingest context in order with the frames it decodes.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::UnboundedSender<IngestCommand>,
}

impl IngestHandle {
    /// How far `id` has progressed, or `None` if it was never seen.
    pub async fn event_status(&self, id: &str) -> Result<Option<EventStatus>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(IngestCommand::Status {
                id: id.to_string(),
                reply,
            })
            .map_err(|_| ClientError::ChannelClosed("ingest"))?;
        rx.await.map_err(|_| ClientError::ChannelClosed("ingest"))
    }
}

/// Collaborators the ingest context needs.
pub(crate) struct IngestParts {
    pub config: ImportConfig,
    pub store: Arc<dyn EventStore>,
    pub verifier: Option<Arc<dyn Verifier>>,
    pub trust: Option<Arc<dyn TrustPolicy>>,
    pub pool: Arc<ConnectionPool>,
    pub backlog: Backlog,
    pub events_tx: broadcast::Sender<IngestEvent>,
}

struct IngestContext {
    cache: EventStateCache,
    lanes: Lanes,
    decoder: FrameDecoder,
    importer: ImportPipeline,
    store: Arc<dyn EventStore>,
    pool: Arc<ConnectionPool>,
    backlog: Backlog,
    events_tx: broadcast::Sender<IngestEvent>,
    normal_trigger: Coalescer<()>,
    priority_trigger: Coalescer<()>,
    delivered: Coalescer<String>,
}

/// Start the ingest task and its coalescers. The cache is warmed from the store first.
pub(crate) fn spawn_ingest(
    parts: IngestParts,
    frames_rx: mpsc::UnboundedReceiver<RawFrame>,
) -> Result<(IngestHandle, Vec<JoinHandle<()>>)> {
    let mut cache = EventStateCache::new();
    let saved = parts.store.saved_ids()?;
    info!("Warming dedup cache with {} saved events", saved.len());
    cache.preload(saved);

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = IngestHandle { tx: cmd_tx.clone() };
    let normal_tx = cmd_tx.clone();
    let (normal_trigger, normal_task) = Coalescer::<()>::spawn(parts.config.normal_lane, move |_| {
        let _ = normal_tx.send(IngestCommand::Drain(Lane::Normal));
    });
    let (priority_trigger, priority_task) = Coalescer::<()>::spawn(parts.config.priority_lane, move |_| {
        let _ = cmd_tx.send(IngestCommand::Drain(Lane::Priority));
    });

    let backlog = parts.backlog.clone();
    let events_tx = parts.events_tx.clone();
    let (delivered, delivered_task) = Coalescer::spawn(parts.config.delivered, move |ids: Vec<String>| {
        let ids: HashSet<String> = ids.into_iter().collect();
        backlog.imported(ids.clone());
        let _ = events_tx.send(IngestEvent::Imported(ids));
    });

    let verifier = if parts.config.verify_signatures {
        parts.verifier
    } else {
        None
    };
    let trust = if parts.config.trust_filter {
        parts.trust
    } else {
        None
    };

    let context = IngestContext {
        cache,
        lanes: Lanes::default(),
        decoder: FrameDecoder::new(trust),
        importer: ImportPipeline::new(Arc::clone(&parts.store), verifier, parts.config.batch_size),
        store: parts.store,
        pool: parts.pool,
        backlog: parts.backlog,
        events_tx: parts.events_tx,
        normal_trigger,
        priority_trigger,
        delivered,
    };
    let main = tokio::spawn(context.run(frames_rx, cmd_rx));

    Ok((handle, vec![main, normal_task, priority_task, delivered_task]))
}

impl IngestContext {
    async fn run(
        mut self,
        mut frames_rx: mpsc::UnboundedReceiver<RawFrame>,
        mut cmd_rx: mpsc::UnboundedReceiver<IngestCommand>,
    ) {
        loop {
            let draining =
                self.importer.is_draining(Lane::Priority) || self.importer.is_draining(Lane::Normal);

            tokio::select! {
                Some(command) = cmd_rx.recv() => match command {
                    IngestCommand::Drain(lane) => {
                        self.importer.request_drain(lane);
                    }
                    IngestCommand::Status { id, reply } => {
                        let _ = reply.send(self.cache.status(&id));
                    }
                },
                frame = frames_rx.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => break,
                },
                _ = std::future::ready(()), if draining => {
                    self.drain_step();
                    tokio::task::yield_now().await;
                }
            }
        }

        debug!("Ingest context stopped");
    }

    fn on_frame(&mut self, frame: RawFrame) {
        match self.decoder.decode(&frame, &mut self.cache, &mut self.lanes) {
            Ok(Decoded::Queued { lane, id, .. }) => {
                trace!("Queued {} from {} on {:?} lane", id, frame.relay, lane);
                match lane {
                    Lane::Normal => self.normal_trigger.push(()),
                    Lane::Priority => self.priority_trigger.push(()),
                };
            }
            Ok(Decoded::Control(message)) => self.on_control(&frame.relay, message),
            Err(FrameError::DuplicateAlreadySaved {
                id,
                subscription_id,
                relay,
                new_relay,
            }) => {
                if new_relay && let Err(e) = self.store.update_relay_attribution(&id, &relay) {
                    warn!("Failed to attribute {} to {}: {}", id, relay, e);
                }
                if Lane::for_subscription(&subscription_id) == Lane::Priority {
                    match self.store.fetch_by_id(&id) {
                        Ok(Some(stored)) => self.notify_priority(subscription_id, stored.event),
                        Ok(None) => debug!("Saved event {} missing from store", id),
                        Err(e) => warn!("Failed to load {}: {}", id, e),
                    }
                } else {
                    self.delivered.push(subscription_id);
                }
            }
            Err(FrameError::DuplicateAlreadyParsed {
                subscription_id,
                early_event: Some(event),
                ..
            }) => self.notify_priority(subscription_id, *event),
            Err(e) if e.is_duplicate() => trace!("{} from {}", e, frame.relay),
            Err(e @ FrameError::PolicyRejected { .. }) => debug!("{}", e),
            Err(e) => warn!("Dropping frame from {}: {}", frame.relay, e),
        }
    }

    fn on_control(&mut self, relay: &str, message: ParsedMessage) {
        if message.kind == MessageType::Ok
            && message.success == Some(true)
            && let Some(id) = message.id.as_deref()
            && self.cache.status(id) == Some(EventStatus::Saved)
            && self.cache.add_relay(id, relay)
            && let Err(e) = self.store.update_relay_attribution(id, relay)
        {
            warn!("Failed to attribute {} to {}: {}", id, relay, e);
        }

        if let Some(subscription_id) = self.pool.handle_relay_message(relay, &message) {
            self.backlog.subscription_failed(subscription_id);
        }
    }

    fn drain_step(&mut self) {
        let lane = if self.importer.is_draining(Lane::Priority) {
            Lane::Priority
        } else {
            Lane::Normal
        };
        let report = self
            .importer
            .drain_chunk(lane, &mut self.cache, &mut self.lanes);

        for ids in report.imported {
            debug!("Imported for {} subscriptions", ids.len());
            self.backlog.imported(ids.clone());
            let _ = self.events_tx.send(IngestEvent::Imported(ids));
        }
        for (subscription_id, event) in report.priority {
            self.notify_priority(subscription_id, event);
        }
    }

    fn notify_priority(&self, subscription_id: String, event: Event) {
        self.backlog
            .priority_event(subscription_id.clone(), event.clone());
        let _ = self.events_tx.send(IngestEvent::PriorityImported {
            subscription_id,
            event,
        });
    }
}
