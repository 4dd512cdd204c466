use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::event::MEMBER;
use crate::ids::{EventId, RoomId, UserId};

/// A condition over one `/sync` response, evaluated for the syncing user.
pub type SyncCheck = Box<dyn Fn(&UserId, &Value) -> Result<()> + Send + Sync>;

fn joined_room<'a>(response: &'a Value, room_id: &RoomId) -> Option<&'a Value> {
    response
        .get("rooms")
        .and_then(|rooms| rooms.get("join"))
        .and_then(|join| join.get(room_id.as_str()))
}

fn section_events<'a>(room: &'a Value, section: &str) -> impl Iterator<Item = &'a Value> {
    room.get(section)
        .and_then(|s| s.get("events"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

/// Passes once a join of `user_id` to `room_id` shows up in timeline or state.
pub fn sync_joined_to(user_id: &UserId, room_id: &RoomId) -> SyncCheck {
    let user_id = user_id.clone();
    let room_id = room_id.clone();
    Box::new(move |_syncing_user, response| {
        let room = joined_room(response, &room_id)
            .ok_or_else(|| anyhow!("room {} not in rooms.join", room_id))?;
        let joined = section_events(room, "timeline")
            .chain(section_events(room, "state"))
            .any(|event| {
                event.get("type").and_then(Value::as_str) == Some(MEMBER)
                    && event.get("state_key").and_then(Value::as_str) == Some(user_id.as_str())
                    && event.pointer("/content/membership").and_then(Value::as_str)
                        == Some("join")
            });
        if joined {
            Ok(())
        } else {
            Err(anyhow!("no join for {} in room {}", user_id, room_id))
        }
    })
}

/// Passes once `event_id` appears in the room's timeline.
pub fn sync_timeline_has_event_id(room_id: &RoomId, event_id: &EventId) -> SyncCheck {
    let room_id = room_id.clone();
    let event_id = event_id.clone();
    Box::new(move |_syncing_user, response| {
        let room = joined_room(response, &room_id)
            .ok_or_else(|| anyhow!("room {} not in rooms.join", room_id))?;
        if section_events(room, "timeline")
            .any(|event| event.get("event_id").and_then(Value::as_str) == Some(event_id.as_str()))
        {
            Ok(())
        } else {
            Err(anyhow!("event {} not in timeline of {}", event_id, room_id))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(room: &str) -> Value {
        let mut join = serde_json::Map::new();
        join.insert(
            room.to_string(),
            json!({
                "timeline": { "events": [
                    { "event_id": "$join", "type": "m.room.member", "state_key": "@alice:hs1",
                      "content": { "membership": "join" } }
                ]},
                "state": { "events": [] }
            }),
        );
        json!({ "next_batch": "s5", "rooms": { "join": join } })
    }

    #[test]
    fn test_joined_to_finds_timeline_membership() {
        let room = RoomId::from("!r:127.0.0.1:9000");
        let alice = UserId::from("@alice:hs1");
        let check = sync_joined_to(&alice, &room);

        assert!(check(&alice, &response(room.as_str())).is_ok());
        assert!(check(&alice, &response("!other:hs1")).is_err());
        let bob = UserId::from("@bob:hs1");
        assert!(sync_joined_to(&bob, &room)(&alice, &response(room.as_str())).is_err());
    }

    #[test]
    fn test_timeline_has_event_id() {
        let room = RoomId::from("!r:hs1");
        let alice = UserId::from("@alice:hs1");

        assert!(sync_timeline_has_event_id(&room, &EventId::from("$join"))(&alice, &response("!r:hs1")).is_ok());
        assert!(sync_timeline_has_event_id(&room, &EventId::from("$x"))(&alice, &response("!r:hs1")).is_err());
    }
}
