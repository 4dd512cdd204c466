//! Federation events (PDUs).
//!
//! An event is a [`ProtoEvent`] plus the event id derived from its reference
//! hash. Events travel between servers in this JSON shape; the client API
//! exposes a reduced projection via [`Event::to_client_format`].
//!
//! Signatures and content hashes are not modelled.

mod spec;
mod state;

pub use spec::{initial_room_events, EventSpec};
pub use state::{auth_chain_for_events, build_event, select_auth_events, StateKey, StateMap};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ids::{EventId, RoomId, UserId};

pub const MEMBER: &str = "m.room.member";
pub const CREATE: &str = "m.room.create";
pub const POWER_LEVELS: &str = "m.room.power_levels";
pub const JOIN_RULES: &str = "m.room.join_rules";
pub const HISTORY_VISIBILITY: &str = "m.room.history_visibility";
pub const MESSAGE: &str = "m.room.message";

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event {0} has no {1}")]
    MissingField(String, &'static str),
}

/// Everything in an event except its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtoEvent {
    pub room_id: RoomId,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub sender: UserId,
    pub content: Value,
    pub origin_server_ts: i64,
    pub depth: u64,
    #[serde(default)]
    pub prev_events: Vec<EventId>,
    #[serde(default)]
    pub auth_events: Vec<EventId>,
}

impl ProtoEvent {
    /// Compute the reference hash and attach it as the event id.
    pub fn finalize(self) -> Result<Event, EventError> {
        let canonical = serde_json::to_vec(&serde_json::to_value(&self)?)?;
        let digest = Sha256::digest(&canonical);
        let event_id = EventId::from(format!("${}", URL_SAFE_NO_PAD.encode(digest)));
        Ok(Event {
            event_id,
            proto: self,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    #[serde(flatten)]
    proto: ProtoEvent,
}

impl std::ops::Deref for Event {
    type Target = ProtoEvent;

    fn deref(&self) -> &Self::Target {
        &self.proto
    }
}

impl Event {
    pub fn from_json(value: Value) -> Result<Self, EventError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Value {
        // Serializing a struct of plain fields cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn state_tuple(&self) -> Option<StateKey> {
        self.state_key
            .as_ref()
            .map(|key| (self.event_type.clone(), key.clone()))
    }

    /// `content.membership` for membership events.
    pub fn membership(&self) -> Option<&str> {
        if self.event_type != MEMBER {
            return None;
        }
        self.content.get("membership").and_then(Value::as_str)
    }

    /// Projection served by the client-server API.
    pub fn to_client_format(&self) -> Value {
        let mut value = json!({
            "event_id": self.event_id,
            "room_id": self.room_id,
            "type": self.event_type,
            "sender": self.sender,
            "content": self.content,
            "origin_server_ts": self.origin_server_ts,
        });
        if let Some(key) = &self.state_key {
            value["state_key"] = json!(key);
        }
        value
    }
}

pub fn event_ids(events: &[Event]) -> Vec<EventId> {
    events.iter().map(|e| e.event_id.clone()).collect()
}
