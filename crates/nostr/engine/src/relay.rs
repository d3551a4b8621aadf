//! Single relay connection management
//!
//! A [`RelayConnection`] owns one socket and heals itself: routing and the
//! keepalive tick call [`RelayConnection::connect`], which is gated by a
//! skip-slot backoff instead of a reconnect timer. Each open socket is driven by
//! its own task, which forwards text frames to the ingest channel and writes
//! whatever the pool queues for it.

use crate::backoff::ReconnectBackoff;
use crate::config::PoolConfig;
use crate::decoder::sniff_subscription_id;
use crate::error::{ClientError, Result};
use crate::pool::PoolEvent;
use crate::stats::RelayStats;
use crate::transport::{Connector, SocketFrame};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};
use url::Url;

/// A relay as configured: where it is and what it is used for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEndpoint {
    pub url: String,
    #[serde(default = "enabled")]
    pub read: bool,
    #[serde(default = "enabled")]
    pub write: bool,
    /// Serves search requests (NIP-50)
    #[serde(default)]
    pub search: bool,
    /// Answer auth challenges from this relay
    #[serde(default)]
    pub auth: bool,
    /// Publishers whose events are never sent here
    #[serde(default)]
    pub excluded_pubkeys: HashSet<String>,
}

fn enabled() -> bool {
    true
}

impl RelayEndpoint {
    /// Read/write endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            read: true,
            write: true,
            search: false,
            auth: false,
            excluded_pubkeys: HashSet::new(),
        }
    }

    pub fn read_only(mut self) -> Self {
        self.write = false;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.read = false;
        self
    }

    pub fn with_search(mut self) -> Self {
        self.search = true;
        self
    }

    pub fn with_auth(mut self) -> Self {
        self.auth = true;
        self
    }

    pub fn excluding(mut self, pubkey: impl Into<String>) -> Self {
        self.excluded_pubkeys.insert(pubkey.into());
        self
    }

    /// Whether the pool keeps this relay connected on its own.
    pub fn should_connect(&self) -> bool {
        self.read || self.write || self.search
    }
}

/// Canonical relay URL: lowercase, `ws`/`wss` only, no trailing slash on a bare host.
pub fn normalize_relay_url(raw: &str) -> Result<String> {
    let lowered = raw.trim().to_lowercase();
    let url = Url::parse(&lowered)?;

    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(ClientError::InvalidUrl(format!("missing host: {}", raw)));
    }

    let mut normalized = url.to_string();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        normalized.pop();
    }
    Ok(normalized)
}

/// A text frame as it came off a relay socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub relay: String,
    pub text: String,
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub url: String,
    pub connected: bool,
    pub connecting: bool,
    pub backoff: u32,
    pub skipped: u32,
    pub active_subscriptions: usize,
    pub queued_frames: usize,
    pub last_message_at: Option<Instant>,
}

struct QueuedFrame {
    text: String,
    /// Set for REQ frames
    subscription_id: Option<String>,
}

struct ConnectionState {
    connected: bool,
    connecting: bool,
    /// Bumped on every attempt and teardown; callbacks from older drivers are ignored
    generation: u64,
    backoff: ReconnectBackoff,
    /// Active subscription id -> REQ frame that opened it
    active: HashMap<String, String>,
    last_message_at: Option<Instant>,
    outbound: Option<mpsc::UnboundedSender<SocketFrame>>,
    queue: VecDeque<QueuedFrame>,
    /// Frames that go out once the relay answers a ping
    after_pong: VecDeque<QueuedFrame>,
    challenge: Option<String>,
    /// Set by `disconnect`; keepalive leaves such connections alone
    parked: bool,
}

impl ConnectionState {
    /// The socket is gone. Unsent frames wait in the queue and only their REQs stay active.
    fn drop_socket(&mut self) {
        self.connected = false;
        self.connecting = false;
        self.outbound = None;
        while let Some(frame) = self.after_pong.pop_back() {
            self.queue.push_front(frame);
        }
        self.active.clear();
        for frame in &self.queue {
            if let Some(id) = &frame.subscription_id {
                self.active.insert(id.clone(), frame.text.clone());
            }
        }
    }

    fn is_unsent(&self, subscription_id: &str) -> bool {
        let matches = |frame: &QueuedFrame| frame.subscription_id.as_deref() == Some(subscription_id);
        self.queue.iter().any(matches) || self.after_pong.iter().any(matches)
    }
}

/// One relay socket and its subscription bookkeeping.
pub struct RelayConnection {
    url: String,
    endpoint: RwLock<RelayEndpoint>,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    frames: mpsc::UnboundedSender<RawFrame>,
    events: broadcast::Sender<PoolEvent>,
    state: Mutex<ConnectionState>,
    stats: Mutex<RelayStats>,
}

impl RelayConnection {
    /// Create a connection (does not connect yet). The endpoint URL must already be canonical.
    pub fn new(
        endpoint: RelayEndpoint,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        frames: mpsc::UnboundedSender<RawFrame>,
        events: broadcast::Sender<PoolEvent>,
    ) -> Arc<Self> {
        let backoff = ReconnectBackoff::new(config.max_backoff);
        Arc::new(Self {
            url: endpoint.url.clone(),
            endpoint: RwLock::new(endpoint),
            config,
            connector,
            frames,
            events,
            state: Mutex::new(ConnectionState {
                connected: false,
                connecting: false,
                generation: 0,
                backoff,
                active: HashMap::new(),
                last_message_at: None,
                outbound: None,
                queue: VecDeque::new(),
                after_pong: VecDeque::new(),
                challenge: None,
                parked: false,
            }),
            stats: Mutex::new(RelayStats::default()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn endpoint(&self) -> RelayEndpoint {
        self.endpoint.read().clone()
    }

    /// Replace capability flags. The URL cannot change.
    pub fn set_endpoint(&self, mut endpoint: RelayEndpoint) {
        endpoint.url = self.url.clone();
        *self.endpoint.write() = endpoint;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state.lock().connecting
    }

    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_subscription(&self, subscription_id: &str) -> bool {
        self.state.lock().active.contains_key(subscription_id)
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.state.lock();
        ConnectionStatus {
            url: self.url.clone(),
            connected: state.connected,
            connecting: state.connecting,
            backoff: state.backoff.counter(),
            skipped: state.backoff.skipped(),
            active_subscriptions: state.active.len(),
            queued_frames: state.queue.len(),
            last_message_at: state.last_message_at,
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().clone()
    }

    pub(crate) fn record_condition(&self, message: &str) {
        self.stats.lock().record_condition(message);
    }

    pub(crate) fn record_notice(&self) {
        self.stats.lock().notices += 1;
    }

    pub fn challenge(&self) -> Option<String> {
        self.state.lock().challenge.clone()
    }

    pub(crate) fn set_challenge(&self, challenge: String) {
        self.state.lock().challenge = Some(challenge);
    }

    /// Start a connection attempt if the backoff allows it. Returns whether one started.
    pub fn connect(self: &Arc<Self>, force: bool) -> bool {
        let generation = {
            let mut state = self.state.lock();
            state.parked = false;
            if state.connected || state.connecting {
                return false;
            }
            if !state.backoff.try_attempt(force) {
                debug!(
                    "Skipping connect to {} (backoff {}, skipped {})",
                    self.url,
                    state.backoff.counter(),
                    state.backoff.skipped()
                );
                return false;
            }
            state.connecting = true;
            state.generation += 1;
            state.generation
        };

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(generation).await });
        true
    }

    /// Connect unless already connected or connecting.
    pub(crate) fn ensure_connected(self: &Arc<Self>) {
        let idle = {
            let state = self.state.lock();
            !state.connected && !state.connecting
        };
        if idle {
            self.connect(false);
        }
    }

    /// Send a WebSocket ping, or reconnect if there is no socket yet.
    pub fn ping(self: &Arc<Self>) {
        let sent = {
            let state = self.state.lock();
            match &state.outbound {
                Some(tx) => tx.send(SocketFrame::Ping(Vec::new())).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.connect(false);
        }
    }

    /// Liveness check run on every keepalive tick.
    pub(crate) fn keepalive(self: &Arc<Self>, now: Instant) {
        enum Action {
            Nothing,
            Ping,
            Connect,
        }

        let action = {
            let state = self.state.lock();
            if state.parked || state.connecting || !self.endpoint.read().should_connect() {
                Action::Nothing
            } else if state.outbound.is_none() {
                Action::Connect
            } else {
                match state.last_message_at {
                    Some(at) if now.duration_since(at) < self.config.stale_after => Action::Nothing,
                    _ => Action::Ping,
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Ping => {
                debug!("Pinging quiet relay {}", self.url);
                self.ping();
            }
            Action::Connect => {
                self.connect(false);
            }
        }
    }

    /// Register `subscription_id` and send its REQ. Returns false if it was already active.
    pub(crate) fn send_request(&self, subscription_id: &str, text: String) -> bool {
        let mut state = self.state.lock();
        if state.active.contains_key(subscription_id) {
            return false;
        }
        state
            .active
            .insert(subscription_id.to_string(), text.clone());
        self.push_locked(&mut state, text, Some(subscription_id.to_string()));
        true
    }

    /// Send CLOSE for an active subscription and forget it. Returns false if it was not active.
    pub(crate) fn send_close(&self, subscription_id: &str, text: String) -> bool {
        let mut state = self.state.lock();
        if state.active.remove(subscription_id).is_none() {
            return false;
        }
        if state.outbound.is_some() && !state.is_unsent(subscription_id) {
            self.push_locked(&mut state, text, None);
        } else {
            // never sent; drop the waiting REQ instead
            let keep = |frame: &QueuedFrame| frame.subscription_id.as_deref() != Some(subscription_id);
            state.queue.retain(keep);
            state.after_pong.retain(keep);
        }
        true
    }

    /// Ping first and send `text` once the pong arrives. With `subscription_id` set this
    /// registers a REQ like [`send_request`](Self::send_request) and returns false if it
    /// was already active. Without a socket the frame is queued and a connect is started.
    pub(crate) fn send_after_ping(self: &Arc<Self>, text: String, subscription_id: Option<&str>) -> bool {
        let idle = {
            let mut state = self.state.lock();
            if let Some(id) = subscription_id {
                if state.active.contains_key(id) {
                    return false;
                }
                state.active.insert(id.to_string(), text.clone());
            }
            let subscription_id = subscription_id.map(str::to_string);

            let pinged = match &state.outbound {
                Some(tx) => tx.send(SocketFrame::Ping(Vec::new())).is_ok(),
                None => false,
            };
            if pinged {
                state.after_pong.push_back(QueuedFrame {
                    text,
                    subscription_id,
                });
            } else {
                state.outbound = None;
                self.enqueue_locked(&mut state, text, subscription_id);
            }
            !state.connected && !state.connecting
        };

        if idle {
            self.connect(false);
        }
        true
    }

    /// Drop a subscription the relay closed on its side. Returns the REQ that opened it.
    pub(crate) fn forget_subscription(&self, subscription_id: &str) -> Option<String> {
        self.state.lock().active.remove(subscription_id)
    }

    /// Send any other frame (EVENT, AUTH).
    pub(crate) fn send_text(&self, text: String) {
        let mut state = self.state.lock();
        self.push_locked(&mut state, text, None);
    }

    fn push_locked(&self, state: &mut ConnectionState, text: String, subscription_id: Option<String>) {
        if let Some(tx) = &state.outbound {
            match tx.send(SocketFrame::Text(text)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => {
                    let SocketFrame::Text(text) = frame else {
                        return;
                    };
                    state.outbound = None;
                    self.enqueue_locked(state, text, subscription_id);
                }
            }
        } else {
            self.enqueue_locked(state, text, subscription_id);
        }
    }

    fn enqueue_locked(&self, state: &mut ConnectionState, text: String, subscription_id: Option<String>) {
        while state.queue.len() >= self.config.max_queued_frames.max(1) {
            if let Some(dropped) = state.queue.pop_front()
                && let Some(id) = dropped.subscription_id
            {
                state.active.remove(&id);
            }
            warn!("Outbound queue full for {}, dropping oldest frame", self.url);
        }
        state.queue.push_back(QueuedFrame {
            text,
            subscription_id,
        });
    }

    /// Close the socket and reset backoff and subscriptions. Keepalive will not reopen it.
    pub fn disconnect(&self) {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = state.connected || state.connecting;
            if let Some(tx) = state.outbound.take() {
                let _ = tx.send(SocketFrame::Close);
            }
            state.generation += 1;
            state.connected = false;
            state.connecting = false;
            state.backoff.reset();
            state.active.clear();
            state.queue.clear();
            state.after_pong.clear();
            state.last_message_at = None;
            state.parked = true;
            was_open
        };

        if was_open {
            info!("Disconnected from relay: {}", self.url);
            let _ = self.events.send(PoolEvent::Disconnected {
                relay_url: self.url.clone(),
                error: None,
            });
        }
    }

    async fn drive(self: Arc<Self>, generation: u64) {
        info!("Connecting to relay: {}", self.url);
        let started = Instant::now();

        let attempt = timeout(self.config.connect_timeout, self.connector.connect(&self.url)).await;
        let (mut sink, mut stream) = match attempt {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.on_failure(generation, e.to_string());
                return;
            }
            Err(_) => {
                self.on_failure(
                    generation,
                    format!("Connection timeout after {:?}", self.config.connect_timeout),
                );
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        if !self.on_open(generation, tx) {
            let _ = sink.send(SocketFrame::Close).await;
            return;
        }
        info!("Connected to relay: {} (took {:?})", self.url, started.elapsed());

        loop {
            tokio::select! {
                incoming = stream.next_frame() => match incoming {
                    Some(Ok(SocketFrame::Text(text))) => self.on_text(generation, text),
                    Some(Ok(SocketFrame::Ping(data))) => {
                        self.touch(generation);
                        if let Err(e) = sink.send(SocketFrame::Pong(data)).await {
                            self.on_failure(generation, e.to_string());
                            break;
                        }
                    }
                    Some(Ok(SocketFrame::Pong(_))) => self.on_pong(generation),
                    Some(Ok(SocketFrame::Close)) | None => {
                        self.on_closed(generation);
                        break;
                    }
                    Some(Err(e)) => {
                        self.on_failure(generation, e.to_string());
                        break;
                    }
                },
                outgoing = rx.recv() => match outgoing {
                    Some(SocketFrame::Close) | None => {
                        let _ = sink.send(SocketFrame::Close).await;
                        break;
                    }
                    Some(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            self.on_failure(generation, e.to_string());
                            break;
                        }
                    }
                },
            }
        }
    }

    fn on_open(&self, generation: u64, tx: mpsc::UnboundedSender<SocketFrame>) -> bool {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            state.connected = true;
            state.connecting = false;
            state.backoff.reset();
            state.active.clear();
            state.last_message_at = Some(Instant::now());

            // flush in order; queued REQs become the active set
            while let Some(frame) = state.queue.pop_front() {
                if let Some(id) = frame.subscription_id {
                    state.active.insert(id, frame.text.clone());
                }
                let _ = tx.send(SocketFrame::Text(frame.text));
            }
            state.outbound = Some(tx);
        }

        self.stats.lock().connects += 1;
        let _ = self.events.send(PoolEvent::Connected {
            relay_url: self.url.clone(),
        });
        true
    }

    fn on_text(&self, generation: u64, text: String) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.last_message_at = Some(Instant::now());

            if let Some(subscription_id) = sniff_subscription_id(&text)
                && !state.active.contains_key(subscription_id)
            {
                debug!(
                    "Dropping frame for inactive subscription {} from {}",
                    subscription_id, self.url
                );
                return;
            }
        }

        self.stats.lock().messages += 1;
        let frame = RawFrame {
            relay: self.url.clone(),
            text,
        };
        if self.frames.send(frame).is_err() {
            debug!("Ingest channel closed, dropping frame from {}", self.url);
        }
    }

    fn touch(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.last_message_at = Some(Instant::now());
        }
    }

    fn on_pong(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.last_message_at = Some(Instant::now());
        while let Some(frame) = state.after_pong.pop_front() {
            self.push_locked(&mut state, frame.text, frame.subscription_id);
        }
    }

    fn on_failure(&self, generation: u64, error: String) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.drop_socket();
            state.backoff.record_failure();
        }

        warn!("Relay {} failed: {}", self.url, error);
        self.stats.lock().record_error(error.clone());
        let _ = self.events.send(PoolEvent::Disconnected {
            relay_url: self.url.clone(),
            error: Some(error),
        });
    }

    fn on_closed(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.drop_socket();
            state.backoff.reset();
        }

        info!("Relay {} closed connection", self.url);
        let _ = self.events.send(PoolEvent::Disconnected {
            relay_url: self.url.clone(),
            error: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, settle};
    use std::time::Duration;

    fn connection(connector: &Arc<MockConnector>) -> (Arc<RelayConnection>, mpsc::UnboundedReceiver<RawFrame>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(16);
        let conn = RelayConnection::new(
            RelayEndpoint::new("wss://relay.one"),
            PoolConfig::default(),
            connector.clone(),
            frames_tx,
            events_tx,
        );
        (conn, frames_rx)
    }

    #[test]
    fn test_normalize_relay_url() {
        assert_eq!(normalize_relay_url("wss://Relay.Example.com/").unwrap(), "wss://relay.example.com");
        assert_eq!(normalize_relay_url(" ws://relay.example.com ").unwrap(), "ws://relay.example.com");
        assert_eq!(normalize_relay_url("wss://relay.example.com/inbox").unwrap(), "wss://relay.example.com/inbox");
    }

    #[test]
    fn test_invalid_url_scheme() {
        match normalize_relay_url("https://relay.example.com") {
            Err(ClientError::InvalidUrl(_)) => {}
            other => panic!("Expected InvalidUrl error, got {:?}", other),
        }
        assert!(normalize_relay_url("not a url").is_err());
    }

    #[test]
    fn test_endpoint_deserialize_defaults() {
        let endpoint: RelayEndpoint = serde_json::from_str(r#"{"url":"wss://r"}"#).unwrap();
        assert!(endpoint.read && endpoint.write);
        assert!(!endpoint.search && !endpoint.auth);
        assert!(endpoint.should_connect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_resets_and_flushes_queue() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);

        assert!(conn.send_request("s1", r#"["REQ","s1",{}]"#.to_string()));
        assert!(!conn.send_request("s1", r#"["REQ","s1",{}]"#.to_string()));
        assert_eq!(conn.status().queued_frames, 1);

        assert!(conn.connect(false));
        settle().await;

        let status = conn.status();
        assert!(status.connected);
        assert_eq!(status.backoff, 0);
        assert_eq!(status.queued_frames, 0);
        assert!(status.last_message_at.is_some());
        assert_eq!(conn.active_subscriptions(), vec!["s1".to_string()]);
        assert_eq!(relay.sent_texts(), vec![r#"["REQ","s1",{}]"#.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_of_queued_request_sends_nothing() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);

        conn.send_request("s1", r#"["REQ","s1",{}]"#.to_string());
        assert!(conn.send_close("s1", r#"["CLOSE","s1"]"#.to_string()));
        assert!(!conn.send_close("s1", r#"["CLOSE","s1"]"#.to_string()));

        conn.connect(false);
        settle().await;
        assert!(relay.sent_texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects_back_off() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        relay.set_refuse(true);
        let (conn, _frames) = connection(&connector);

        assert!(conn.connect(false));
        settle().await;
        assert_eq!(conn.status().backoff, 1);
        assert!(!conn.is_connected());

        assert!(conn.connect(false));
        settle().await;
        assert_eq!(conn.status().backoff, 2);

        // backoff 2: two ticks are skipped, the third attempts
        assert!(!conn.connect(false));
        assert!(!conn.connect(false));
        assert!(conn.connect(false));
        settle().await;
        assert_eq!(conn.status().backoff, 4);
        assert_eq!(conn.stats().errors, 3);

        relay.set_refuse(false);
        assert!(conn.connect(true));
        settle().await;
        assert!(conn.is_connected());
        assert_eq!(conn.status().backoff, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_error_clears_subscriptions() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);

        conn.connect(false);
        settle().await;
        conn.send_request("s1", r#"["REQ","s1",{}]"#.to_string());
        assert!(conn.has_subscription("s1"));

        relay.fail("connection reset");
        settle().await;

        assert!(!conn.is_connected());
        assert!(conn.active_subscriptions().is_empty());
        assert_eq!(conn.status().backoff, 1);
        assert_eq!(conn.stats().recent_errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_failed_connect_drops_queued_request() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        relay.set_refuse(true);
        let (conn, _frames) = connection(&connector);

        conn.send_request("s1", r#"["REQ","s1",{}]"#.to_string());
        conn.connect(false);
        settle().await;
        assert!(!conn.is_connected());
        assert!(conn.has_subscription("s1"));
        assert_eq!(conn.status().queued_frames, 1);

        assert!(conn.send_close("s1", r#"["CLOSE","s1"]"#.to_string()));
        assert_eq!(conn.status().queued_frames, 0);

        relay.set_refuse(false);
        assert!(conn.connect(true));
        settle().await;
        assert!(conn.is_connected());
        assert!(relay.sent_texts().is_empty());
        assert!(conn.active_subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_request_after_failed_connect_sends_once() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        relay.set_refuse(true);
        let (conn, _frames) = connection(&connector);

        assert!(conn.send_request("s1", r#"["REQ","s1",{}]"#.to_string()));
        conn.connect(false);
        settle().await;
        assert!(!conn.send_request("s1", r#"["REQ","s1",{}]"#.to_string()));

        relay.set_refuse(false);
        conn.connect(true);
        settle().await;
        assert_eq!(relay.sent_texts(), vec![r#"["REQ","s1",{}]"#.to_string()]);
        assert_eq!(conn.active_subscriptions(), vec!["s1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_clean_close_drops_queued_request() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);

        conn.connect(false);
        settle().await;
        relay.close();
        settle().await;
        assert!(!conn.is_connected());

        conn.send_request("s1", r#"["REQ","s1",{}]"#.to_string());
        relay.set_refuse(true);
        conn.connect(true);
        settle().await;
        assert!(conn.has_subscription("s1"));

        assert!(conn.send_close("s1", r#"["CLOSE","s1"]"#.to_string()));
        relay.set_refuse(false);
        conn.connect(true);
        settle().await;
        assert!(conn.is_connected());
        assert!(relay.sent_texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_ping_waits_for_pong() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);
        conn.connect(false);
        settle().await;

        relay.set_ignore_pings(true);
        assert!(conn.send_after_ping(r#"["EVENT",{"id":"a"}]"#.to_string(), None));
        assert!(conn.send_after_ping(r#"["REQ","s1",{}]"#.to_string(), Some("s1")));
        assert!(!conn.send_after_ping(r#"["REQ","s1",{}]"#.to_string(), Some("s1")));
        settle().await;
        assert_eq!(relay.pings(), 2);
        assert!(relay.sent_texts().is_empty());
        assert!(conn.has_subscription("s1"));

        relay.pong();
        settle().await;
        assert_eq!(
            relay.sent_texts(),
            vec![r#"["EVENT",{"id":"a"}]"#.to_string(), r#"["REQ","s1",{}]"#.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_ping_without_socket_queues_and_connects() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);

        assert!(conn.send_after_ping(r#"["REQ","s1",{}]"#.to_string(), Some("s1")));
        assert!(conn.is_connecting());
        settle().await;

        assert!(conn.is_connected());
        assert_eq!(relay.sent_texts(), vec![r#"["REQ","s1",{}]"#.to_string()]);
        assert_eq!(relay.pings(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_waiting_on_pong_survive_socket_error() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);
        conn.connect(false);
        settle().await;

        relay.set_ignore_pings(true);
        conn.send_after_ping(r#"["REQ","s1",{}]"#.to_string(), Some("s1"));
        conn.send_after_ping(r#"["REQ","s2",{}]"#.to_string(), Some("s2"));
        settle().await;
        relay.fail("connection reset");
        settle().await;

        assert_eq!(conn.status().queued_frames, 2);
        assert_eq!(conn.active_subscriptions(), vec!["s1".to_string(), "s2".to_string()]);

        // closing one before the reconnect means its REQ never goes out
        assert!(conn.send_close("s2", r#"["CLOSE","s2"]"#.to_string()));
        conn.connect(true);
        settle().await;
        assert_eq!(relay.sent_texts(), vec![r#"["REQ","s1",{}]"#.to_string()]);
        assert_eq!(conn.active_subscriptions(), vec!["s1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_waiting_on_pong_sends_nothing() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);
        conn.connect(false);
        settle().await;

        relay.set_ignore_pings(true);
        conn.send_after_ping(r#"["REQ","s1",{}]"#.to_string(), Some("s1"));
        assert!(conn.send_close("s1", r#"["CLOSE","s1"]"#.to_string()));
        relay.pong();
        settle().await;

        assert!(relay.sent_texts().is_empty());
        assert!(!conn.has_subscription("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_for_inactive_subscription_are_dropped() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, mut frames) = connection(&connector);

        conn.connect(false);
        settle().await;
        conn.send_request("live", r#"["REQ","live",{}]"#.to_string());
        settle().await;

        relay.push(r#"["EVENT","gone",{"id":"x"}]"#);
        relay.push(r#"["EVENT","live",{"id":"y"}]"#);
        relay.push(r#"["NOTICE","hello"]"#);
        settle().await;

        let first = frames.recv().await.unwrap();
        assert!(first.text.contains("\"live\""));
        assert_eq!(first.relay, "wss://relay.one");
        let second = frames.recv().await.unwrap();
        assert!(second.text.contains("NOTICE"));
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_stale_and_reconnects_idle() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);

        conn.keepalive(Instant::now());
        settle().await;
        assert!(conn.is_connected());
        assert_eq!(relay.connects(), 1);

        conn.keepalive(Instant::now());
        settle().await;
        assert_eq!(relay.pings(), 0);

        tokio::time::sleep(Duration::from_secs(46)).await;
        conn.keepalive(Instant::now());
        settle().await;
        assert_eq!(relay.pings(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_parks_connection() {
        let connector = MockConnector::new();
        let relay = connector.relay("wss://relay.one");
        let (conn, _frames) = connection(&connector);

        conn.connect(false);
        settle().await;
        conn.send_request("s1", r#"["REQ","s1",{}]"#.to_string());
        conn.disconnect();
        settle().await;

        assert!(!conn.is_connected());
        assert!(conn.active_subscriptions().is_empty());
        assert!(conn.status().last_message_at.is_none());
        assert!(relay.saw_close());

        conn.keepalive(Instant::now());
        settle().await;
        assert_eq!(relay.connects(), 1);
    }
}
