//! Shared setup for engine integration tests.

#![allow(dead_code)]

use nostr_engine::testing::{MockConnector, MockRelay, RecordingStore, StaticSigner, init_tracing, settle};
use nostr_engine::{
    ClientMessage, Engine, EngineConfig, Filter, IdHashVerifier, IngestEvent, RelayEndpoint, ReqTask,
    SendOptions, Signer,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

pub struct Harness {
    pub engine: Engine,
    pub connector: Arc<MockConnector>,
    pub store: Arc<RecordingStore>,
}

impl Harness {
    pub fn relay(&self, url: &str) -> MockRelay {
        self.connector.relay(url)
    }
}

/// Start an engine over mock relays and let every relay connect.
pub async fn start(endpoints: Vec<RelayEndpoint>) -> Harness {
    start_with(endpoints, RecordingStore::new(), None).await
}

pub async fn start_with(
    endpoints: Vec<RelayEndpoint>,
    store: Arc<RecordingStore>,
    signer: Option<Arc<dyn Signer>>,
) -> Harness {
    init_tracing();
    let connector = MockConnector::new();
    for endpoint in &endpoints {
        connector.relay(&endpoint.url);
    }
    let config = EngineConfig {
        relays: endpoints,
        ..EngineConfig::default()
    };

    let engine = Engine::start(
        config,
        connector.clone(),
        store.clone(),
        signer,
        Some(Arc::new(IdHashVerifier)),
        None,
    )
    .unwrap();
    settle().await;

    Harness {
        engine,
        connector,
        store,
    }
}

pub fn signer() -> Option<Arc<dyn Signer>> {
    Some(Arc::new(StaticSigner::new("me")))
}

pub fn kind1_req(subscription_id: &str) -> ClientMessage {
    ClientMessage::Req {
        subscription_id: subscription_id.to_string(),
        filters: vec![Filter::new().kinds([1])],
    }
}

/// Callback counters for one task.
#[derive(Clone, Default)]
pub struct Outcomes {
    pub responses: Arc<AtomicUsize>,
    pub timeouts: Arc<AtomicUsize>,
}

impl Outcomes {
    pub fn responses(&self) -> usize {
        self.responses.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::SeqCst)
    }
}

/// A task that sends a kind-1 REQ under `subscription_id` to every read relay.
pub fn kind1_task(harness: &Harness, subscription_id: &str) -> (ReqTask, Outcomes) {
    let outcomes = Outcomes::default();
    let pool = Arc::clone(harness.engine.pool());
    let responses = outcomes.responses.clone();
    let timeouts = outcomes.timeouts.clone();

    let task = ReqTask::new(move |id| {
        pool.send(&kind1_req(id), &SendOptions::default()).unwrap();
    })
    .with_subscription_id(subscription_id)
    .on_response(move |_| {
        responses.fetch_add(1, Ordering::SeqCst);
    })
    .on_timeout(move |_| {
        timeouts.fetch_add(1, Ordering::SeqCst);
    });
    (task, outcomes)
}

/// Every `Imported` notice received so far.
pub fn imported_notices(rx: &mut broadcast::Receiver<IngestEvent>) -> Vec<HashSet<String>> {
    let mut notices = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let IngestEvent::Imported(ids) = event {
            notices.push(ids);
        }
    }
    notices
}
