use serde_json::{json, Value};

use super::{CREATE, HISTORY_VISIBILITY, JOIN_RULES, MEMBER, MESSAGE, POWER_LEVELS};
use crate::ids::{RoomVersion, UserId};

/// Caller-supplied part of a new event; the room fills in the graph fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSpec {
    pub event_type: String,
    pub state_key: Option<String>,
    pub sender: UserId,
    pub content: Value,
}

impl EventSpec {
    pub fn create(creator: &UserId, version: &RoomVersion) -> Self {
        Self::state(
            CREATE,
            "",
            creator,
            json!({ "creator": creator, "room_version": version }),
        )
    }

    pub fn state(event_type: &str, state_key: &str, sender: &UserId, content: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            state_key: Some(state_key.to_string()),
            sender: sender.clone(),
            content,
        }
    }

    /// A self-targeted membership change, e.g. a join.
    pub fn membership(user: &UserId, membership: &str) -> Self {
        Self::state(
            MEMBER,
            user.as_str(),
            user,
            json!({ "membership": membership }),
        )
    }

    pub fn text_message(sender: &UserId, body: &str) -> Self {
        Self {
            event_type: MESSAGE.to_string(),
            state_key: None,
            sender: sender.clone(),
            content: json!({ "msgtype": "m.text", "body": body }),
        }
    }

    pub fn power_levels(creator: &UserId) -> Self {
        Self::state(
            POWER_LEVELS,
            "",
            creator,
            json!({
                "users": { creator.as_str(): 100 },
                "users_default": 0,
                "events_default": 0,
                "state_default": 50,
            }),
        )
    }

    pub fn join_rules(sender: &UserId, rule: &str) -> Self {
        Self::state(JOIN_RULES, "", sender, json!({ "join_rule": rule }))
    }

    pub fn history_visibility(sender: &UserId, visibility: &str) -> Self {
        Self::state(
            HISTORY_VISIBILITY,
            "",
            sender,
            json!({ "history_visibility": visibility }),
        )
    }
}

/// The events every fresh room starts with: create, the creator's join,
/// power levels, public join rules and shared history.
pub fn initial_room_events(version: &RoomVersion, creator: &UserId) -> Vec<EventSpec> {
    vec![
        EventSpec::create(creator, version),
        EventSpec::membership(creator, "join"),
        EventSpec::power_levels(creator),
        EventSpec::join_rules(creator, "public"),
        EventSpec::history_visibility(creator, "shared"),
    ]
}
