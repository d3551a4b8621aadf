//! In-memory collaborators for tests.
//!
//! [`MockConnector`] hands out scripted sockets: each [`MockRelay`] records what
//! the engine writes to it and lets a test push frames back. The rest are small
//! stand-ins for the store and signer seams.

use crate::error::{ClientError, Result};
use crate::event::{Event, UnsignedEvent};
use crate::message::Filter;
use crate::signer::{Signer, SignerError, unix_now};
use crate::state::RelaySet;
use crate::store::{EventStore, MemoryStore, SaveOutcome, StoreError, StoredEvent};
use crate::transport::{Connector, SocketFrame, SocketPair, SocketSink, SocketStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

static TRACING: Once = Once::new();

/// Install a fmt subscriber once per test binary. Honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Let spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct RelayState {
    sent: Mutex<Vec<String>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Result<SocketFrame>>>>,
    refuse: AtomicBool,
    connects: AtomicUsize,
    pings: AtomicUsize,
    ignore_pings: AtomicBool,
    saw_close: AtomicBool,
}

/// One scripted relay.
#[derive(Clone, Default)]
pub struct MockRelay {
    state: Arc<RelayState>,
}

impl MockRelay {
    /// Every text frame written to this relay, across reconnects.
    pub fn sent_texts(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    /// Refuse new connections.
    pub fn set_refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Deliver a text frame on the open socket.
    pub fn push(&self, text: &str) -> bool {
        self.inject(Ok(SocketFrame::Text(text.to_string())))
    }

    /// Break the open socket with an error.
    pub fn fail(&self, error: &str) -> bool {
        self.inject(Err(ClientError::WebSocket(error.to_string())))
    }

    /// Stop answering pings; [`pong`](Self::pong) answers by hand.
    pub fn set_ignore_pings(&self, ignore: bool) {
        self.state.ignore_pings.store(ignore, Ordering::SeqCst);
    }

    /// Deliver a pong on the open socket.
    pub fn pong(&self) -> bool {
        self.inject(Ok(SocketFrame::Pong(Vec::new())))
    }

    /// Close the open socket cleanly.
    pub fn close(&self) -> bool {
        self.inject(Ok(SocketFrame::Close))
    }

    fn inject(&self, frame: Result<SocketFrame>) -> bool {
        match self.state.inbound.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn saw_close(&self) -> bool {
        self.state.saw_close.load(Ordering::SeqCst)
    }
}

/// Connector over [`MockRelay`]s, keyed by URL.
#[derive(Default)]
pub struct MockConnector {
    relays: Mutex<HashMap<String, MockRelay>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The relay at `url`, created on first use.
    pub fn relay(&self, url: &str) -> MockRelay {
        self.relays.lock().entry(url.to_string()).or_default().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<SocketPair> {
        let relay = self
            .relays
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| ClientError::Connection(format!("no mock relay at {}", url)))?;
        if relay.state.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::Connection("connection refused".to_string()));
        }

        relay.state.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *relay.state.inbound.lock() = Some(tx);
        Ok((
            Box::new(MockSink {
                state: Arc::clone(&relay.state),
            }),
            Box::new(MockStream { rx }),
        ))
    }
}

struct MockSink {
    state: Arc<RelayState>,
}

#[async_trait]
impl SocketSink for MockSink {
    async fn send(&mut self, frame: SocketFrame) -> Result<()> {
        match frame {
            SocketFrame::Text(text) => self.state.sent.lock().push(text),
            SocketFrame::Ping(data) => {
                self.state.pings.fetch_add(1, Ordering::SeqCst);
                if self.state.ignore_pings.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if let Some(tx) = self.state.inbound.lock().as_ref() {
                    let _ = tx.send(Ok(SocketFrame::Pong(data)));
                }
            }
            SocketFrame::Pong(_) => {}
            SocketFrame::Close => {
                self.state.saw_close.store(true, Ordering::SeqCst);
                self.state.inbound.lock().take();
            }
        }
        Ok(())
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<SocketFrame>>,
}

#[async_trait]
impl SocketStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<SocketFrame>> {
        self.rx.recv().await
    }
}

/// [`MemoryStore`] that counts saves and can be told to fail them.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl EventStore for RecordingStore {
    fn fetch_by_id(&self, id: &str) -> std::result::Result<Option<StoredEvent>, StoreError> {
        self.inner.fetch_by_id(id)
    }

    fn fetch(&self, filter: &Filter) -> std::result::Result<Vec<StoredEvent>, StoreError> {
        self.inner.fetch(filter)
    }

    fn save(&self, event: &Event, relays: &RelaySet) -> std::result::Result<SaveOutcome, StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(event, relays)
    }

    fn update_relay_attribution(&self, id: &str, relay: &str) -> std::result::Result<(), StoreError> {
        self.inner.update_relay_attribution(id, relay)
    }

    fn saved_ids(&self) -> std::result::Result<Vec<String>, StoreError> {
        self.inner.saved_ids()
    }
}

/// Signer that fills in a valid id and a placeholder signature.
pub struct StaticSigner {
    pubkey: String,
}

impl StaticSigner {
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
        }
    }
}

#[async_trait]
impl Signer for StaticSigner {
    fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    async fn sign(&self, unsigned: UnsignedEvent) -> std::result::Result<Event, SignerError> {
        finish(unsigned).map_err(|e| SignerError::Failed(e.to_string()))
    }
}

fn finish(unsigned: UnsignedEvent) -> std::result::Result<Event, serde_json::Error> {
    let id = unsigned.compute_id()?;
    Ok(Event {
        sig: format!("sig-{}", &id[..8]),
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
    })
}

/// An event whose id matches its content.
pub fn signed_event(pubkey: &str, kind: u16, content: &str) -> Event {
    signed_event_with(pubkey, kind, content, unix_now(), vec![])
}

pub fn signed_event_with(
    pubkey: &str,
    kind: u16,
    content: &str,
    created_at: u64,
    tags: Vec<Vec<String>>,
) -> Event {
    let unsigned = UnsignedEvent {
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content: content.to_string(),
    };
    match finish(unsigned) {
        Ok(event) => event,
        Err(e) => panic!("test event failed to serialize: {}", e),
    }
}

/// `["EVENT", sub, event]` as a relay would send it.
pub fn event_frame(subscription_id: &str, event: &Event) -> String {
    serde_json::json!(["EVENT", subscription_id, event]).to_string()
}
