//! Relay pool: owns every connection and routes outbound messages.
//!
//! Routing is synchronous. A message is written to each eligible connection's
//! outbound channel (or its queue while the socket is still opening), and any
//! idle connection touched by routing starts connecting. One relay failing never
//! affects routing to the others.

use crate::config::PoolConfig;
use crate::decoder::{MessageType, ParsedMessage};
use crate::error::{ClientError, Result};
use crate::event::Event;
use crate::message::ClientMessage;
use crate::relay::{RawFrame, RelayConnection, RelayEndpoint, normalize_relay_url};
use crate::signer::{Signer, auth_event, sign_with_timeout};
use crate::stats::RelayCondition;
use crate::subscription::SubscriptionTracker;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, info, warn};

/// Published events kept for re-sending after authentication.
const RECENT_PUBLISHES: usize = 100;

/// Events emitted by the relay pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A relay connected
    Connected { relay_url: String },
    /// A relay disconnected; `error` is set unless the close was clean
    Disconnected {
        relay_url: String,
        error: Option<String>,
    },
    /// EOSE received for a subscription on a relay
    Eose {
        relay_url: String,
        subscription_id: String,
    },
    /// All relays have sent EOSE for a subscription
    AllEose { subscription_id: String },
    /// OK response for a published event
    Ok {
        relay_url: String,
        event_id: String,
        success: bool,
        message: String,
    },
    /// A relay closed a subscription
    Closed {
        relay_url: String,
        subscription_id: String,
        message: String,
    },
    /// Notice from a relay
    Notice { relay_url: String, message: String },
    /// An AUTH answer went out to a relay
    AuthSent { relay_url: String },
}

/// Which capability a REQ needs when no relay subset is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestTarget {
    #[default]
    Read,
    Search,
}

/// Routing options for [`ConnectionPool::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Only these relays; capability flags are not consulted
    pub relays: Option<HashSet<String>>,
    /// Publisher key checked against excluded pubkeys; defaults to the event author
    pub publisher: Option<String>,
    pub target: RequestTarget,
    /// Ping each relay first and write the frame only after its pong
    pub ping_first: bool,
}

impl SendOptions {
    pub fn to_relays(relays: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            relays: Some(relays.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn search() -> Self {
        Self {
            target: RequestTarget::Search,
            ..Self::default()
        }
    }

    pub fn after_ping(mut self) -> Self {
        self.ping_first = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AuthTrigger {
    Subscription(String),
    Event(String),
}

/// A pool of Nostr relay connections.
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn crate::transport::Connector>,
    /// Connections indexed by canonical URL
    connections: RwLock<HashMap<String, Arc<RelayConnection>>>,
    /// Subscription trackers indexed by subscription ID
    subscriptions: RwLock<HashMap<String, SubscriptionTracker>>,
    recent_publishes: Mutex<VecDeque<Event>>,
    auth_attempts: Mutex<HashSet<(String, AuthTrigger)>>,
    signer: Option<Arc<dyn Signer>>,
    frames_tx: mpsc::UnboundedSender<RawFrame>,
    events_tx: broadcast::Sender<PoolEvent>,
}

impl ConnectionPool {
    /// Create an empty pool. Text frames from every relay go to `frames_tx`.
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn crate::transport::Connector>,
        signer: Option<Arc<dyn Signer>>,
        frames_tx: mpsc::UnboundedSender<RawFrame>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new(Self {
            config,
            connector,
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            recent_publishes: Mutex::new(VecDeque::new()),
            auth_attempts: Mutex::new(HashSet::new()),
            signer,
            frames_tx,
            events_tx,
        })
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    /// Add a relay, or return the existing connection for it. Connects right
    /// away when the endpoint is read, write or search capable.
    pub fn add_connection(&self, endpoint: RelayEndpoint) -> Result<Arc<RelayConnection>> {
        let url = normalize_relay_url(&endpoint.url)?;
        let conn = {
            let mut conns = self.connections.write();
            if let Some(existing) = conns.get(&url) {
                return Ok(Arc::clone(existing));
            }

            info!("Adding relay to pool: {}", url);
            let endpoint = RelayEndpoint { url: url.clone(), ..endpoint };
            let conn = RelayConnection::new(
                endpoint,
                self.config.clone(),
                Arc::clone(&self.connector),
                self.frames_tx.clone(),
                self.events_tx.clone(),
            );
            conns.insert(url, Arc::clone(&conn));
            conn
        };

        if conn.endpoint().should_connect() {
            conn.connect(false);
        }
        Ok(conn)
    }

    /// Remove a relay from the pool and close its socket.
    pub fn remove_connection(&self, url: &str) -> bool {
        let key = canonical(url);
        let Some(conn) = self.connections.write().remove(&key) else {
            return false;
        };
        info!("Removing relay from pool: {}", key);
        conn.disconnect();

        for tracker in self.subscriptions.write().values_mut() {
            tracker.remove_relay(&key);
        }
        self.auth_attempts.lock().retain(|(relay, _)| relay != &key);
        true
    }

    pub fn connection(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.connections.read().get(&canonical(url)).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<RelayConnection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.connections.read().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Toggle capability flags of a known relay.
    pub fn set_capabilities(&self, endpoint: RelayEndpoint) -> Result<()> {
        let conn = self
            .connection(&endpoint.url)
            .ok_or_else(|| ClientError::InvalidRequest(format!("unknown relay: {}", endpoint.url)))?;
        conn.set_endpoint(endpoint);

        if conn.endpoint().should_connect() {
            conn.ensure_connected();
        } else {
            conn.disconnect();
        }
        Ok(())
    }

    /// Connect every relay that should be connected, ignoring backoff.
    pub fn connect_all(&self) {
        for conn in self.connections() {
            if conn.endpoint().should_connect() {
                conn.connect(true);
            }
        }
    }

    pub fn disconnect_all(&self) {
        for conn in self.connections() {
            conn.disconnect();
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    pub fn is_connected(&self, url: &str) -> bool {
        self.connection(url).is_some_and(|c| c.is_connected())
    }

    pub fn subscription(&self, subscription_id: &str) -> Option<SubscriptionTracker> {
        self.subscriptions.read().get(subscription_id).cloned()
    }

    /// Route a message. Returns the relays it was written or queued to.
    pub fn send(&self, message: &ClientMessage, options: &SendOptions) -> Result<Vec<String>> {
        let subset = options
            .relays
            .as_ref()
            .map(|relays| relays.iter().map(|r| canonical(r)).collect::<HashSet<String>>());
        let in_subset = |url: &str| subset.as_ref().is_none_or(|s| s.contains(url));
        let text = message.to_json()?;
        let mut sent = Vec::new();

        match message {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                for conn in self.connections() {
                    if !in_subset(conn.url()) {
                        continue;
                    }
                    if subset.is_none() {
                        let endpoint = conn.endpoint();
                        let capable = match options.target {
                            RequestTarget::Read => endpoint.read,
                            RequestTarget::Search => endpoint.search,
                        };
                        if !capable {
                            continue;
                        }
                    }

                    let sent_now = if options.ping_first {
                        conn.send_after_ping(text.clone(), Some(subscription_id))
                    } else {
                        conn.ensure_connected();
                        conn.send_request(subscription_id, text.clone())
                    };
                    if sent_now {
                        sent.push(conn.url().to_string());
                    } else {
                        debug!("{} already active on {}", subscription_id, conn.url());
                    }
                }

                let mut subs = self.subscriptions.write();
                let tracker = subs
                    .entry(subscription_id.clone())
                    .or_insert_with(|| SubscriptionTracker::new(subscription_id.clone(), filters.clone()));
                for url in &sent {
                    tracker.add_relay(url.clone());
                }
            }
            ClientMessage::Close { subscription_id } => {
                for conn in self.connections() {
                    if in_subset(conn.url()) && conn.send_close(subscription_id, text.clone()) {
                        sent.push(conn.url().to_string());
                    }
                }

                let mut subs = self.subscriptions.write();
                match &subset {
                    Some(subset) => {
                        if let Some(tracker) = subs.get_mut(subscription_id) {
                            for url in subset {
                                tracker.remove_relay(url);
                            }
                            if tracker.relays.is_empty() {
                                subs.remove(subscription_id);
                            }
                        }
                    }
                    None => {
                        subs.remove(subscription_id);
                    }
                }
            }
            ClientMessage::Event(event) => {
                let publisher = options.publisher.as_deref().unwrap_or(&event.pubkey);
                for conn in self.connections() {
                    if !in_subset(conn.url()) {
                        continue;
                    }
                    let endpoint = conn.endpoint();
                    if subset.is_none() && !endpoint.write {
                        continue;
                    }
                    if endpoint.excluded_pubkeys.contains(publisher) {
                        debug!("Not publishing {} to {}: publisher excluded", event.id, conn.url());
                        continue;
                    }

                    if options.ping_first {
                        conn.send_after_ping(text.clone(), None);
                    } else {
                        conn.ensure_connected();
                        conn.send_text(text.clone());
                    }
                    sent.push(conn.url().to_string());
                }
                self.remember_publish(event);
            }
            ClientMessage::Auth(_) => {
                if subset.is_none() {
                    return Err(ClientError::InvalidRequest(
                        "AUTH must name the relays it answers".to_string(),
                    ));
                }
                for conn in self.connections() {
                    if in_subset(conn.url()) {
                        if options.ping_first {
                            conn.send_after_ping(text.clone(), None);
                        } else {
                            conn.send_text(text.clone());
                        }
                        sent.push(conn.url().to_string());
                    }
                }
            }
        }

        Ok(sent)
    }

    /// Close a subscription on every relay that has it.
    pub fn close_subscription(&self, subscription_id: &str) -> Result<Vec<String>> {
        self.send(
            &ClientMessage::Close {
                subscription_id: subscription_id.to_string(),
            },
            &SendOptions::default(),
        )
    }

    /// Send through a short-lived connection to a relay outside the pool.
    /// The connection is removed after the ephemeral lifetime.
    pub fn send_ephemeral(self: &Arc<Self>, message: &ClientMessage, url: &str) -> Result<()> {
        let url = normalize_relay_url(url)?;
        if self.connection(&url).is_some() {
            self.send(message, &SendOptions::to_relays([url]))?;
            return Ok(());
        }

        let mut endpoint = RelayEndpoint::new(url.clone());
        endpoint.read = false;
        endpoint.write = false;
        let conn = self.add_connection(endpoint)?;
        conn.connect(true);
        self.send(message, &SendOptions::to_relays([url.clone()]))?;

        let pool = Arc::downgrade(self);
        let lifetime = self.config.ephemeral_lifetime;
        tokio::spawn(async move {
            sleep(lifetime).await;
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let same = pool
                .connection(&url)
                .is_some_and(|current| Arc::ptr_eq(&current, &conn));
            if same {
                debug!("Ephemeral connection to {} expired", url);
                pool.remove_connection(&url);
            }
        });
        Ok(())
    }

    fn remember_publish(&self, event: &Event) {
        let mut recent = self.recent_publishes.lock();
        if recent.iter().any(|e| e.id == event.id) {
            return;
        }
        if recent.len() == RECENT_PUBLISHES {
            recent.pop_front();
        }
        recent.push_back(event.clone());
    }

    /// One liveness pass over every connection.
    pub fn keepalive_tick(&self) {
        let now = Instant::now();
        for conn in self.connections() {
            conn.keepalive(now);
        }
    }

    /// Run the keepalive tick on the configured interval until the pool is dropped.
    pub fn spawn_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.keepalive_tick();
            }
        })
    }

    /// Apply a control message from `relay`. Returns a subscription id when
    /// every relay it was sent to has now closed it.
    pub(crate) fn handle_relay_message(
        self: &Arc<Self>,
        relay: &str,
        message: &ParsedMessage,
    ) -> Option<String> {
        let conn = self.connection(relay);

        match message.kind {
            MessageType::Eose => {
                let subscription_id = message.subscription_id.clone()?;
                let all_eose = self
                    .subscriptions
                    .write()
                    .get_mut(&subscription_id)
                    .is_some_and(|t| t.mark_eose(relay));
                let _ = self.events_tx.send(PoolEvent::Eose {
                    relay_url: relay.to_string(),
                    subscription_id: subscription_id.clone(),
                });
                if all_eose {
                    let _ = self.events_tx.send(PoolEvent::AllEose { subscription_id });
                }
            }
            MessageType::Notice => {
                if let Some(conn) = &conn {
                    conn.record_notice();
                }
                info!("Notice from {}: {}", relay, message.message);
                let _ = self.events_tx.send(PoolEvent::Notice {
                    relay_url: relay.to_string(),
                    message: message.message.clone(),
                });
            }
            MessageType::Ok => {
                let event_id = message.id.clone()?;
                let success = message.success.unwrap_or(false);
                let condition = RelayCondition::parse(&message.message);
                if let Some(conn) = &conn {
                    conn.record_condition(&message.message);
                }
                if !success {
                    warn!("{} rejected {}: {}", relay, event_id, message.message);
                }
                let _ = self.events_tx.send(PoolEvent::Ok {
                    relay_url: relay.to_string(),
                    event_id: event_id.clone(),
                    success,
                    message: message.message.clone(),
                });

                if !success && condition == Some(RelayCondition::AuthRequired) {
                    self.authenticate(relay, AuthTrigger::Event(event_id));
                }
            }
            MessageType::Closed => {
                let subscription_id = message.subscription_id.clone()?;
                let condition = RelayCondition::parse(&message.message);
                if let Some(conn) = &conn {
                    conn.forget_subscription(&subscription_id);
                    conn.record_condition(&message.message);
                }
                warn!("Subscription {} closed by {}: {}", subscription_id, relay, message.message);
                let _ = self.events_tx.send(PoolEvent::Closed {
                    relay_url: relay.to_string(),
                    subscription_id: subscription_id.clone(),
                    message: message.message.clone(),
                });

                if condition == Some(RelayCondition::AuthRequired)
                    && self.authenticate(relay, AuthTrigger::Subscription(subscription_id.clone()))
                {
                    return None;
                }

                let mut subs = self.subscriptions.write();
                if let Some(tracker) = subs.get_mut(&subscription_id) {
                    tracker.mark_closed(relay);
                    if tracker.all_closed() {
                        return Some(subscription_id);
                    }
                }
            }
            MessageType::Auth => {
                if let Some(conn) = &conn {
                    debug!("Auth challenge from {}", relay);
                    conn.set_challenge(message.message.clone());
                }
            }
            MessageType::Event => {}
        }
        None
    }

    /// Answer the relay's challenge once per trigger, then retry the original
    /// send after the retry delay. Returns whether an attempt started.
    fn authenticate(self: &Arc<Self>, relay: &str, trigger: AuthTrigger) -> bool {
        let Some(conn) = self.connection(relay) else {
            return false;
        };
        if !conn.endpoint().auth {
            return false;
        }
        let Some(signer) = self.signer.clone() else {
            debug!("No signer, ignoring auth request from {}", relay);
            return false;
        };
        let Some(challenge) = conn.challenge() else {
            warn!("{} requires auth but sent no challenge", relay);
            return false;
        };
        if !self
            .auth_attempts
            .lock()
            .insert((conn.url().to_string(), trigger.clone()))
        {
            return false;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let unsigned = auth_event(signer.public_key(), conn.url(), &challenge);
            let event = match sign_with_timeout(signer.as_ref(), unsigned, pool.config.sign_timeout).await {
                Ok(event) => event,
                Err(e) => {
                    warn!("Could not sign auth for {}: {}", conn.url(), e);
                    return;
                }
            };
            let text = match ClientMessage::Auth(event).to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Could not encode auth for {}: {}", conn.url(), e);
                    return;
                }
            };

            info!("Authenticating with {}", conn.url());
            conn.send_text(text);
            let _ = pool.events_tx.send(PoolEvent::AuthSent {
                relay_url: conn.url().to_string(),
            });

            sleep(pool.config.auth_retry_delay).await;
            pool.retry_after_auth(&conn, trigger);
        });
        true
    }

    fn retry_after_auth(&self, conn: &Arc<RelayConnection>, trigger: AuthTrigger) {
        match trigger {
            AuthTrigger::Subscription(subscription_id) => {
                let filters = match self.subscriptions.read().get(&subscription_id) {
                    Some(tracker) => tracker.filters.clone(),
                    None => {
                        debug!("{} was closed before auth completed", subscription_id);
                        return;
                    }
                };
                let request = ClientMessage::Req {
                    subscription_id: subscription_id.clone(),
                    filters,
                };
                match request.to_json() {
                    Ok(text) => {
                        conn.send_request(&subscription_id, text);
                    }
                    Err(e) => warn!("Could not encode {}: {}", subscription_id, e),
                }
            }
            AuthTrigger::Event(event_id) => {
                let event = self
                    .recent_publishes
                    .lock()
                    .iter()
                    .find(|e| e.id == event_id)
                    .cloned();
                let Some(event) = event else {
                    debug!("{} is no longer in the publish history", event_id);
                    return;
                };
                match ClientMessage::Event(event).to_json() {
                    Ok(text) => conn.send_text(text),
                    Err(e) => warn!("Could not encode {}: {}", event_id, e),
                }
            }
        }
    }
}

fn canonical(url: &str) -> String {
    normalize_relay_url(url).unwrap_or_else(|_| url.to_string())
}
