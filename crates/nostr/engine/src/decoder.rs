//! Relay frame decoding with early duplicate rejection.
//!
//! Frames are classified by a prefix sniff before any JSON work. EVENT frames
//! are decoded twice: first into the minimal `{id, kind, pubkey}` shape, which
//! is enough to consult the trust policy and the dedup cache, and only then in
//! full. Control frames (EOSE, OK, NOTICE, CLOSED, AUTH) go straight to a
//! `ParsedMessage`.

use crate::event::{Event, MinimalEvent};
use crate::importer::{Lane, Lanes};
use crate::policy::TrustPolicy;
use crate::relay::RawFrame;
use crate::state::{EventStatus, EventStateCache, RelaySet};
use serde::de::IgnoredAny;
use serde_json::Value;
use serde_json::value::RawValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Frame decoding outcomes that stop a frame from being imported.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("failed to parse frame: {0}")]
    Parse(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("EVENT frame carries no event")]
    MissingEvent,

    /// Already persisted. `new_relay` is set when this relay was not yet attributed.
    #[error("event {id} already saved")]
    DuplicateAlreadySaved {
        id: String,
        subscription_id: String,
        relay: String,
        new_relay: bool,
    },

    /// Queued for import; the relay was merged into the queued copy.
    /// `early_event` is set when a priority subscription found its event queued
    /// in the normal lane.
    #[error("event {id} already queued")]
    DuplicateAlreadyParsed {
        id: String,
        subscription_id: String,
        early_event: Option<Box<Event>>,
    },

    #[error("event {0} already received")]
    DuplicateAlreadyReceived(String),

    #[error("invalid signature on event {0}")]
    SignatureInvalid(String),

    #[error("pubkey {pubkey} rejected for {subscription_id}")]
    PolicyRejected {
        pubkey: String,
        subscription_id: String,
    },
}

impl FrameError {
    /// Duplicates are expected traffic, not failures.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            FrameError::DuplicateAlreadySaved { .. }
                | FrameError::DuplicateAlreadyParsed { .. }
                | FrameError::DuplicateAlreadyReceived(_)
        )
    }
}

/// Relay-to-client message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Event,
    Eose,
    Notice,
    Ok,
    Closed,
    Auth,
}

/// A decoded relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub kind: MessageType,
    pub subscription_id: Option<String>,
    pub event: Option<Event>,
    /// Relays that delivered this message; grows while an EVENT waits in a lane
    pub relays: RelaySet,
    /// Event id of an OK
    pub id: Option<String>,
    /// Success flag of an OK
    pub success: Option<bool>,
    /// NOTICE/OK/CLOSED text, or the AUTH challenge
    pub message: String,
    /// Other subscriptions that delivered the same event while it was queued
    pub also_delivered_to: BTreeSet<String>,
}

impl ParsedMessage {
    fn control(kind: MessageType, relay: &str) -> Self {
        Self {
            kind,
            subscription_id: None,
            event: None,
            relays: RelaySet::from([relay.to_string()]),
            id: None,
            success: None,
            message: String::new(),
            also_delivered_to: BTreeSet::new(),
        }
    }

    /// Every subscription id that should hear about this message.
    pub fn subscription_ids(&self) -> impl Iterator<Item = &String> {
        self.subscription_id.iter().chain(self.also_delivered_to.iter())
    }
}

/// What a successfully decoded frame turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A new event, now PARSED and waiting in `lane`
    Queued {
        lane: Lane,
        id: String,
        subscription_id: String,
    },
    /// Any non-EVENT frame
    Control(ParsedMessage),
}

const PREFIXES: [(&str, MessageType); 6] = [
    ("[\"EVENT\"", MessageType::Event),
    ("[\"EOSE\"", MessageType::Eose),
    ("[\"OK\"", MessageType::Ok),
    ("[\"NOTICE\"", MessageType::Notice),
    ("[\"CLOSED\"", MessageType::Closed),
    ("[\"AUTH\"", MessageType::Auth),
];

/// Classify a frame from its first bytes.
pub fn sniff_type(text: &str) -> Result<MessageType, FrameError> {
    let text = text.trim_start();
    for (prefix, kind) in PREFIXES {
        if text.starts_with(prefix) {
            return Ok(kind);
        }
    }

    // name the unknown type if the frame is at least array-shaped
    let label = text
        .strip_prefix("[\"")
        .and_then(|rest| rest.split('"').next())
        .filter(|label| !label.is_empty());
    match label {
        Some(label) => Err(FrameError::UnknownMessageType(label.to_string())),
        None => Err(FrameError::Parse(format!(
            "not a relay message: {}",
            text.chars().take(32).collect::<String>()
        ))),
    }
}

/// Subscription id of an EVENT frame, read without parsing the event.
///
/// Returns `None` for other frames and for ids that would need unescaping.
pub fn sniff_subscription_id(text: &str) -> Option<&str> {
    let rest = text.trim_start().strip_prefix("[\"EVENT\"")?;
    let rest = rest.trim_start().strip_prefix(',')?;
    let rest = rest.trim_start().strip_prefix('"')?;
    let end = rest.find('"')?;
    let id = &rest[..end];
    if id.contains('\\') {
        return None;
    }
    Some(id)
}

/// Decodes frames and runs them through the dedup cache.
pub struct FrameDecoder {
    trust: Option<Arc<dyn TrustPolicy>>,
}

impl FrameDecoder {
    /// `trust` is consulted only when present.
    pub fn new(trust: Option<Arc<dyn TrustPolicy>>) -> Self {
        Self { trust }
    }

    pub fn decode(
        &self,
        frame: &RawFrame,
        cache: &mut EventStateCache,
        lanes: &mut Lanes,
    ) -> Result<Decoded, FrameError> {
        match sniff_type(&frame.text)? {
            MessageType::Event => self.decode_event(frame, cache, lanes),
            kind => parse_control(kind, frame).map(Decoded::Control),
        }
    }

    fn decode_event(
        &self,
        frame: &RawFrame,
        cache: &mut EventStateCache,
        lanes: &mut Lanes,
    ) -> Result<Decoded, FrameError> {
        let (_, subscription_id, raw): (IgnoredAny, String, &RawValue) =
            serde_json::from_str(&frame.text).map_err(|e| FrameError::Parse(e.to_string()))?;
        if raw.get() == "null" {
            return Err(FrameError::MissingEvent);
        }

        let minimal: MinimalEvent =
            serde_json::from_str(raw.get()).map_err(|e| FrameError::Parse(e.to_string()))?;

        if let Some(trust) = &self.trust
            && trust.applies_to(&subscription_id)
            && !trust.is_trusted(&minimal.pubkey)
        {
            return Err(FrameError::PolicyRejected {
                pubkey: minimal.pubkey,
                subscription_id,
            });
        }

        let relay = frame.relay.as_str();
        match cache.status(&minimal.id) {
            None => {
                cache.observe(&minimal.id, relay);
            }
            Some(_) if cache.take_retry(&minimal.id) => {
                // the previous copy was dropped; decode this one in its place
                cache.add_relay(&minimal.id, relay);
            }
            Some(EventStatus::Saved) => {
                let new_relay = cache.add_relay(&minimal.id, relay);
                return Err(FrameError::DuplicateAlreadySaved {
                    id: minimal.id,
                    subscription_id,
                    relay: relay.to_string(),
                    new_relay,
                });
            }
            Some(EventStatus::Parsed) => {
                cache.add_relay(&minimal.id, relay);
                let early_event = lanes
                    .merge_duplicate(&minimal.id, relay, &subscription_id)
                    .map(Box::new);
                return Err(FrameError::DuplicateAlreadyParsed {
                    id: minimal.id,
                    subscription_id,
                    early_event,
                });
            }
            Some(EventStatus::Received) => {
                return Err(FrameError::DuplicateAlreadyReceived(minimal.id));
            }
        }

        let event: Event = match serde_json::from_str(raw.get()) {
            Ok(event) => event,
            Err(e) => {
                // a malformed copy must not block a good one from another relay
                cache.mark_failed(&minimal.id);
                return Err(FrameError::Parse(e.to_string()));
            }
        };

        cache.advance(&event.id, EventStatus::Parsed);
        let lane = Lane::for_subscription(&subscription_id);
        let id = event.id.clone();
        lanes.push(
            lane,
            ParsedMessage {
                kind: MessageType::Event,
                subscription_id: Some(subscription_id.clone()),
                event: Some(event),
                relays: RelaySet::from([relay.to_string()]),
                id: None,
                success: None,
                message: String::new(),
                also_delivered_to: BTreeSet::new(),
            },
        );

        Ok(Decoded::Queued {
            lane,
            id,
            subscription_id,
        })
    }
}

fn string_at(items: &[Value], index: usize) -> Option<String> {
    items.get(index).and_then(Value::as_str).map(str::to_string)
}

/// Parse a non-EVENT frame.
pub fn parse_control(kind: MessageType, frame: &RawFrame) -> Result<ParsedMessage, FrameError> {
    let items: Vec<Value> =
        serde_json::from_str(&frame.text).map_err(|e| FrameError::Parse(e.to_string()))?;
    let missing = |field: &str| FrameError::Parse(format!("{:?} frame missing {}", kind, field));
    let mut message = ParsedMessage::control(kind, &frame.relay);

    match kind {
        MessageType::Eose => {
            message.subscription_id = Some(string_at(&items, 1).ok_or_else(|| missing("subscription id"))?);
        }
        MessageType::Notice => {
            message.message = string_at(&items, 1).ok_or_else(|| missing("message"))?;
        }
        MessageType::Ok => {
            message.id = Some(string_at(&items, 1).ok_or_else(|| missing("event id"))?);
            message.success = Some(
                items
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| missing("success flag"))?,
            );
            message.message = string_at(&items, 3).unwrap_or_default();
        }
        MessageType::Closed => {
            message.subscription_id = Some(string_at(&items, 1).ok_or_else(|| missing("subscription id"))?);
            message.message = string_at(&items, 2).unwrap_or_default();
        }
        MessageType::Auth => {
            message.message = string_at(&items, 1).ok_or_else(|| missing("challenge"))?;
        }
        MessageType::Event => return Err(FrameError::MissingEvent),
    }

    Ok(message)
}
