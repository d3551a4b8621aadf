//! Relay connection and subscription engine for Nostr clients.
//!
//! This crate provides:
//! - A self-healing connection per relay with skip-slot reconnect backoff
//! - A pool that routes REQ, CLOSE, EVENT and AUTH to the right relays
//! - Frame decoding with duplicate suppression before full parsing
//! - Two import lanes that persist events in batches
//! - A correlator that gives every request exactly one response or timeout
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_engine::{
//!     Engine, EngineConfig, FetchDescriptor, MemoryStore, RelayEndpoint, TaskOutcome,
//!     WsConnector,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nostr_engine::Result<()> {
//!     let config = EngineConfig {
//!         relays: vec![RelayEndpoint::new("wss://relay.damus.io")],
//!         ..EngineConfig::default()
//!     };
//!     let engine = Engine::start(
//!         config,
//!         Arc::new(WsConnector),
//!         Arc::new(MemoryStore::new()),
//!         None,
//!         None,
//!         None,
//!     )?;
//!
//!     let descriptor = FetchDescriptor::new().kinds([1]).limit(20);
//!     match engine.fetch(descriptor).await? {
//!         TaskOutcome::Response(response) => println!("imported for {}", response.subscription_id),
//!         TaskOutcome::TimedOut { .. } => println!("no relay answered"),
//!     }
//!
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

mod backlog;
mod backoff;
mod coalesce;
mod config;
mod decoder;
mod descriptor;
mod engine;
mod error;
mod event;
mod importer;
mod ingest;
mod message;
mod policy;
mod pool;
mod relay;
mod signer;
mod state;
mod stats;
mod store;
mod subscription;
mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export main types
pub use backlog::{Backlog, ReqTask, TaskHandle, TaskOutcome, TaskResponse};
pub use backoff::ReconnectBackoff;
pub use coalesce::{CoalesceWindow, Coalescer};
pub use config::{BacklogConfig, EngineConfig, ImportConfig, PoolConfig};
pub use decoder::{
    Decoded, FrameDecoder, FrameError, MessageType, ParsedMessage, parse_control, sniff_type,
};
pub use descriptor::{FetchDescriptor, MAX_AUTHORS};
pub use engine::Engine;
pub use error::{ClientError, Result};
pub use event::{
    Event, KIND_CLIENT_AUTH, KIND_CONTACTS, KindClass, MinimalEvent, UnsignedEvent,
    classify_kind, is_addressable_kind, is_replaceable_kind,
};
pub use importer::{DrainReport, ImportPipeline, Lane, Lanes, PRIORITY_PREFIX};
pub use ingest::{IngestEvent, IngestHandle};
pub use message::{ClientMessage, Filter};
pub use policy::{IdHashVerifier, TRUST_FILTERED_PREFIXES, TrustEveryone, TrustPolicy, Verifier};
pub use pool::{ConnectionPool, PoolEvent, RequestTarget, SendOptions};
pub use relay::{ConnectionStatus, RawFrame, RelayConnection, RelayEndpoint, normalize_relay_url};
pub use signer::{Signer, SignerError, auth_event, sign_with_timeout};
pub use state::{EventState, EventStateCache, EventStatus, RelaySet, join_relays};
pub use stats::{RelayCondition, RelayStats};
pub use store::{EventStore, MemoryStore, SaveOutcome, StoreError, StoredEvent};
pub use subscription::{SubscriptionTracker, generate_prefixed_id, generate_subscription_id};
pub use transport::{Connector, SocketFrame, SocketPair, SocketSink, SocketStream, WsConnector};
