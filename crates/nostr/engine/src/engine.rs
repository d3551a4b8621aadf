//! Service wiring.
//!
//! [`Engine::start`] builds the pool, the correlator and the ingest context
//! once and connects them by handle. Everything the engine spawns is stopped
//! by [`Engine::shutdown`].

use crate::backlog::{Backlog, ReqTask, TaskHandle, TaskOutcome};
use crate::config::EngineConfig;
use crate::descriptor::FetchDescriptor;
use crate::error::Result;
use crate::event::Event;
use crate::ingest::{IngestEvent, IngestHandle, IngestParts, spawn_ingest};
use crate::message::ClientMessage;
use crate::policy::{TrustPolicy, Verifier};
use crate::pool::{ConnectionPool, SendOptions};
use crate::signer::Signer;
use crate::state::EventStatus;
use crate::store::EventStore;
use crate::transport::Connector;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running relay engine.
pub struct Engine {
    pool: Arc<ConnectionPool>,
    backlog: Backlog,
    ingest: IngestHandle,
    store: Arc<dyn EventStore>,
    events_tx: broadcast::Sender<IngestEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Validate `config`, spawn the background tasks and add the configured relays.
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn EventStore>,
        signer: Option<Arc<dyn Signer>>,
        verifier: Option<Arc<dyn Verifier>>,
        trust: Option<Arc<dyn TrustPolicy>>,
    ) -> Result<Self> {
        config.validate()?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let pool = ConnectionPool::new(config.pool.clone(), connector, signer, frames_tx);
        let (backlog, backlog_task) = Backlog::spawn(config.backlog.clone());
        let (events_tx, _) = broadcast::channel(config.import.event_capacity.max(1));

        let (ingest, mut tasks) = spawn_ingest(
            IngestParts {
                config: config.import.clone(),
                store: Arc::clone(&store),
                verifier,
                trust,
                pool: Arc::clone(&pool),
                backlog: backlog.clone(),
                events_tx: events_tx.clone(),
            },
            frames_rx,
        )?;
        tasks.push(backlog_task);
        tasks.push(pool.spawn_keepalive());

        let engine = Self {
            pool,
            backlog,
            ingest,
            store,
            events_tx,
            tasks: Mutex::new(tasks),
        };
        for endpoint in config.relays {
            engine.pool.add_connection(endpoint)?;
        }
        info!("Engine started with {} relays", engine.pool.relay_urls().len());
        Ok(engine)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Dedup status of an event id as the ingest context sees it.
    pub async fn event_status(&self, id: &str) -> Result<Option<EventStatus>> {
        self.ingest.event_status(id).await
    }

    /// Import notices: batched subscription ids and priority events.
    pub fn subscribe_imported(&self) -> broadcast::Receiver<IngestEvent> {
        self.events_tx.subscribe()
    }

    pub fn submit(&self, task: ReqTask) -> Result<TaskHandle> {
        self.backlog.submit(task)
    }

    pub async fn request(&self, task: ReqTask) -> Result<TaskOutcome> {
        self.backlog.request(task).await
    }

    /// A task that sends `descriptor` as a REQ when submitted. Add callbacks,
    /// timeout or priority before submitting it.
    pub fn fetch_task(&self, descriptor: FetchDescriptor) -> ReqTask {
        let pool = Arc::clone(&self.pool);
        ReqTask::new(move |subscription_id| {
            let options = SendOptions {
                relays: descriptor.relays.clone(),
                ..SendOptions::default()
            };
            if let Err(e) = pool.send(&descriptor.request(subscription_id), &options) {
                warn!("Failed to send {}: {}", subscription_id, e);
            }
        })
    }

    /// Run `descriptor` as a one-shot request and close its subscription afterwards.
    pub async fn fetch(&self, descriptor: FetchDescriptor) -> Result<TaskOutcome> {
        let outcome = self.request(self.fetch_task(descriptor)).await?;
        let subscription_id = match &outcome {
            TaskOutcome::Response(response) => &response.subscription_id,
            TaskOutcome::TimedOut { subscription_id } => subscription_id,
        };
        self.pool.close_subscription(subscription_id)?;
        Ok(outcome)
    }

    /// Publish to every write relay that does not exclude the author.
    pub fn publish(&self, event: Event) -> Result<Vec<String>> {
        self.pool
            .send(&ClientMessage::Event(event), &SendOptions::default())
    }

    pub fn close(&self, subscription_id: &str) -> Result<Vec<String>> {
        self.pool.close_subscription(subscription_id)
    }

    /// Drop pending tasks, disconnect every relay and stop the background tasks.
    pub fn shutdown(&self) {
        let _ = self.backlog.clear();
        self.pool.disconnect_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
