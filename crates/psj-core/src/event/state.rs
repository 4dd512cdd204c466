use std::collections::{BTreeMap, HashSet, VecDeque};

use super::{Event, EventError, EventSpec, ProtoEvent, CREATE, JOIN_RULES, MEMBER, POWER_LEVELS};
use crate::ids::{EventId, RoomId};

/// `(event type, state key)`
pub type StateKey = (String, String);

/// Current room state, ordered so iteration is stable across runs.
pub type StateMap = BTreeMap<StateKey, Event>;

/// Pick the auth events a new event would cite given the current state.
pub fn select_auth_events(spec: &EventSpec, state: &StateMap) -> Vec<EventId> {
    if spec.event_type == CREATE {
        return Vec::new();
    }

    let mut wanted: Vec<StateKey> = vec![
        (CREATE.to_string(), String::new()),
        (POWER_LEVELS.to_string(), String::new()),
        (MEMBER.to_string(), spec.sender.to_string()),
    ];
    if spec.event_type == MEMBER {
        wanted.push((JOIN_RULES.to_string(), String::new()));
        if let Some(target) = &spec.state_key {
            wanted.push((MEMBER.to_string(), target.clone()));
        }
    }

    let mut seen = HashSet::new();
    wanted
        .iter()
        .filter_map(|key| state.get(key))
        .map(|event| event.event_id.clone())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Build the next event in a room whose latest event is `prev`.
pub fn build_event(
    room_id: &RoomId,
    spec: &EventSpec,
    state: &StateMap,
    prev: Option<&Event>,
) -> Result<Event, EventError> {
    ProtoEvent {
        room_id: room_id.clone(),
        event_type: spec.event_type.clone(),
        state_key: spec.state_key.clone(),
        sender: spec.sender.clone(),
        content: spec.content.clone(),
        origin_server_ts: chrono::Utc::now().timestamp_millis(),
        depth: prev.map(|p| p.depth + 1).unwrap_or(1),
        prev_events: prev.map(|p| vec![p.event_id.clone()]).unwrap_or_default(),
        auth_events: select_auth_events(spec, state),
    }
    .finalize()
}

/// Walk `auth_events` transitively from `events`.
///
/// Events `lookup` cannot resolve are skipped. The result is ordered by depth
/// then id.
pub fn auth_chain_for_events<F>(events: &[Event], lookup: F) -> Vec<Event>
where
    F: Fn(&EventId) -> Option<Event>,
{
    let mut seen: HashSet<EventId> = HashSet::new();
    let mut queue: VecDeque<EventId> = events
        .iter()
        .flat_map(|e| e.auth_events.iter().cloned())
        .collect();
    let mut chain = Vec::new();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(event) = lookup(&id) {
            queue.extend(event.auth_events.iter().cloned());
            chain.push(event);
        }
    }

    chain.sort_by(|a, b| {
        a.depth
            .cmp(&b.depth)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::initial_room_events;
    use crate::ids::{RoomVersion, UserId};
    use std::collections::HashMap;

    fn make_room() -> (RoomId, Vec<Event>, StateMap) {
        let room_id = RoomId::from("!r:remote");
        let creator = UserId::from("@charlie:remote");
        let mut timeline: Vec<Event> = Vec::new();
        let mut state = StateMap::new();
        for spec in initial_room_events(&RoomVersion::default(), &creator) {
            let event = build_event(&room_id, &spec, &state, timeline.last()).unwrap();
            state.insert(event.state_tuple().unwrap(), event.clone());
            timeline.push(event);
        }
        (room_id, timeline, state)
    }

    #[test]
    fn test_create_event_has_no_auth_events() {
        let (_, timeline, _) = make_room();
        assert!(timeline[0].auth_events.is_empty());
        assert_eq!(timeline[0].depth, 1);
        assert!(timeline[0].prev_events.is_empty());
    }

    #[test]
    fn test_join_cites_join_rules_and_creator_power() {
        let (room_id, timeline, state) = make_room();
        let derek = UserId::from("@derek:remote");
        let join = build_event(
            &room_id,
            &EventSpec::membership(&derek, "join"),
            &state,
            timeline.last(),
        )
        .unwrap();

        let join_rules = &state[&(JOIN_RULES.to_string(), String::new())];
        let create = &state[&(CREATE.to_string(), String::new())];
        assert!(join.auth_events.contains(&join_rules.event_id));
        assert!(join.auth_events.contains(&create.event_id));
        assert_eq!(join.prev_events, vec![timeline.last().unwrap().event_id.clone()]);
        assert_eq!(join.depth, timeline.len() as u64 + 1);
    }

    #[test]
    fn test_auth_chain_is_transitive_and_deduplicated() {
        let (_, timeline, state) = make_room();
        let by_id: HashMap<EventId, Event> = timeline
            .iter()
            .map(|e| (e.event_id.clone(), e.clone()))
            .collect();
        let current: Vec<Event> = state.values().cloned().collect();

        let chain = auth_chain_for_events(&current, |id| by_id.get(id).cloned());

        let ids: Vec<&str> = chain.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(ids, vec![CREATE, MEMBER, POWER_LEVELS]);
    }
}
