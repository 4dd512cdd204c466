//! `/sync` response assembly.

use std::collections::HashSet;

use psj_core::event::MEMBER;
use psj_core::sync::{is_lazy_loading, timeline_limit};
use psj_core::{Event, RoomId, UserId};
use serde_json::{json, Map, Value};

use super::store::{StoreInner, StoredRoom};

const DEFAULT_TIMELINE_LIMIT: usize = 10;

pub fn format_token(position: u64) -> String {
    format!("s{}", position)
}

pub fn parse_token(token: &str) -> Option<u64> {
    token.strip_prefix('s')?.parse().ok()
}

/// Parsed `/sync` parameters.
#[derive(Debug, Clone, Default)]
pub struct SyncParams {
    pub since: Option<u64>,
    pub filter: Value,
}

impl SyncParams {
    pub fn lazy_load_members(&self) -> bool {
        is_lazy_loading(&self.filter)
    }

    fn limit(&self) -> usize {
        timeline_limit(&self.filter).unwrap_or(DEFAULT_TIMELINE_LIMIT)
    }
}

/// Build the response for `user_id` from the current store contents.
pub fn build_sync_response(store: &StoreInner, user_id: &UserId, params: &SyncParams) -> Value {
    let mut joined = Map::new();
    for room_id in store.joined_rooms(user_id) {
        if let Some(room_json) = build_joined_room(store, &room_id, user_id, params) {
            joined.insert(room_id.to_string(), room_json);
        }
    }
    json!({
        "next_batch": format_token(store.stream_position()),
        "rooms": { "join": joined, "invite": {}, "leave": {} },
    })
}

fn build_joined_room(
    store: &StoreInner,
    room_id: &RoomId,
    user_id: &UserId,
    params: &SyncParams,
) -> Option<Value> {
    let room = store.room(room_id)?;
    let since = params.since.unwrap_or(0);
    let new_events: Vec<&Event> = room
        .timeline
        .iter()
        .filter(|(pos, _)| *pos > since)
        .filter_map(|(_, id)| store.event(id))
        .collect();

    let newly_joined = params.since.is_some()
        && own_join_position(store, room, room_id, user_id).is_some_and(|pos| pos > since);
    if params.since.is_some() && new_events.is_empty() && !newly_joined {
        return None;
    }

    let limit = params.limit();
    let limited = new_events.len() > limit;
    let timeline: Vec<&Event> = new_events[new_events.len().saturating_sub(limit)..].to_vec();

    let include_state = params.since.is_none() || newly_joined || limited;
    let state = if include_state {
        state_for_timeline(room, &timeline, params.lazy_load_members())
    } else {
        Vec::new()
    };

    let prev_batch = timeline
        .first()
        .and_then(|e| store.position_of(room_id, &e.event_id))
        .map(|pos| format_token(pos.saturating_sub(1)))
        .unwrap_or_else(|| format_token(since));

    Some(json!({
        "timeline": {
            "events": timeline.iter().map(|e| e.to_client_format()).collect::<Vec<_>>(),
            "limited": limited,
            "prev_batch": prev_batch,
        },
        "state": {
            "events": state.iter().map(|e| e.to_client_format()).collect::<Vec<_>>(),
        },
    }))
}

fn own_join_position(
    store: &StoreInner,
    room: &StoredRoom,
    room_id: &RoomId,
    user_id: &UserId,
) -> Option<u64> {
    let member = room.state.get(&(MEMBER.to_string(), user_id.to_string()))?;
    store.position_of(room_id, &member.event_id)
}

/// Current state minus what the timeline already carries. With lazy
/// loading, memberships are limited to the timeline's senders.
fn state_for_timeline<'a>(room: &'a StoredRoom, timeline: &[&Event], lazy: bool) -> Vec<&'a Event> {
    let in_timeline: HashSet<_> = timeline.iter().map(|e| &e.event_id).collect();
    let senders: HashSet<&str> = timeline.iter().map(|e| e.sender.as_str()).collect();

    room.state
        .values()
        .filter(|e| !in_timeline.contains(&e.event_id))
        .filter(|e| {
            !lazy
                || e.event_type != MEMBER
                || e.state_key.as_deref().is_some_and(|key| senders.contains(key))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use psj_core::event::initial_room_events;
    use psj_core::sync::lazy_loading_filter;
    use psj_core::{EventSpec, RoomVersion};

    struct Fixture {
        store: StoreInner,
        room_id: RoomId,
        alice: UserId,
        derek: UserId,
    }

    fn append(store: &mut StoreInner, room_id: &RoomId, spec: EventSpec) -> Event {
        store.append_new(room_id, &spec).unwrap()
    }

    fn fixture() -> Fixture {
        let mut store = StoreInner::default();
        let charlie = UserId::from("@charlie:remote");
        let derek = UserId::from("@derek:remote");
        let alice = UserId::from("@alice:hs1");
        let room_id = RoomId::from("!room:remote");
        store.create_room(room_id.clone(), RoomVersion::default());
        for spec in initial_room_events(&RoomVersion::default(), &charlie) {
            append(&mut store, &room_id, spec);
        }
        append(&mut store, &room_id, EventSpec::membership(&derek, "join"));
        append(&mut store, &room_id, EventSpec::membership(&alice, "join"));
        Fixture {
            store,
            room_id,
            alice,
            derek,
        }
    }

    fn room<'a>(response: &'a Value, room_id: &RoomId) -> &'a Value {
        &response["rooms"]["join"][room_id.as_str()]
    }

    #[test]
    fn test_tokens_roundtrip() {
        assert_eq!(parse_token(&format_token(42)), Some(42));
        assert_eq!(parse_token("42"), None);
    }

    #[test]
    fn test_initial_sync_includes_state_outside_timeline() {
        let f = fixture();
        let params = SyncParams {
            since: None,
            filter: json!({ "room": { "timeline": { "limit": 1 } } }),
        };

        let response = build_sync_response(&f.store, &f.alice, &params);
        let room = room(&response, &f.room_id);

        assert_eq!(response["next_batch"], "s7");
        assert_eq!(room["timeline"]["events"].as_array().unwrap().len(), 1);
        assert_eq!(room["timeline"]["limited"], true);
        assert_eq!(room["state"]["events"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn test_lazy_state_only_carries_timeline_senders() {
        let mut f = fixture();
        append(&mut f.store, &f.room_id, EventSpec::text_message(&f.derek, "hi"));
        let mut options = Map::new();
        options.insert("limit".to_string(), json!(1));
        let params = SyncParams {
            since: None,
            filter: serde_json::from_str(&lazy_loading_filter(Some(options))).unwrap(),
        };

        let response = build_sync_response(&f.store, &f.alice, &params);
        let members: Vec<&str> = room(&response, &f.room_id)["state"]["events"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["type"] == MEMBER)
            .filter_map(|e| e["state_key"].as_str())
            .collect();

        assert_eq!(members, vec![f.derek.as_str()]);
    }

    #[test]
    fn test_incremental_sync_skips_quiet_rooms() {
        let f = fixture();
        let params = SyncParams {
            since: Some(f.store.stream_position()),
            filter: Value::Null,
        };

        let response = build_sync_response(&f.store, &f.alice, &params);
        assert!(response["rooms"]["join"].as_object().unwrap().is_empty());
    }
}
