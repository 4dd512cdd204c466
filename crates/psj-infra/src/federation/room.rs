use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use psj_core::event::{auth_chain_for_events, build_event, MEMBER};
use psj_core::{Event, EventId, EventSpec, RoomId, RoomVersion, ServerName, StateMap, UserId};

#[derive(Default)]
struct RoomInner {
    timeline: Vec<Event>,
    state: StateMap,
    events: HashMap<EventId, Event>,
}

/// The mock peer's view of one room.
///
/// Shared between scenario code and request handlers, so all access goes
/// through `&self`.
pub struct ServerRoom {
    room_id: RoomId,
    version: RoomVersion,
    inner: RwLock<RoomInner>,
}

impl ServerRoom {
    pub fn new(room_id: RoomId, version: RoomVersion) -> Self {
        Self {
            room_id,
            version,
            inner: RwLock::new(RoomInner::default()),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn version(&self) -> &RoomVersion {
        &self.version
    }

    fn read(&self) -> RwLockReadGuard<'_, RoomInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RoomInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build an event on top of the current state and forward extremity
    /// without adding it.
    pub fn create_event(&self, spec: &EventSpec) -> Result<Event, psj_core::event::EventError> {
        let inner = self.read();
        build_event(&self.room_id, spec, &inner.state, inner.timeline.last())
    }

    /// Append to the timeline; state events update current state.
    ///
    /// An event already known as an outlier is promoted.
    pub fn add_event(&self, event: Event) {
        let mut inner = self.write();
        if inner.timeline.iter().any(|e| e.event_id == event.event_id) {
            return;
        }
        if let Some(key) = event.state_tuple() {
            inner.state.insert(key, event.clone());
        }
        inner.events.insert(event.event_id.clone(), event.clone());
        inner.timeline.push(event);
    }

    /// Remember an event without placing it in the timeline.
    pub fn add_outlier(&self, event: Event) {
        self.write()
            .events
            .entry(event.event_id.clone())
            .or_insert(event);
    }

    pub fn event(&self, event_id: &EventId) -> Option<Event> {
        self.read().events.get(event_id).cloned()
    }

    pub fn current_state(&self, event_type: &str, state_key: &str) -> Option<Event> {
        self.read()
            .state
            .get(&(event_type.to_string(), state_key.to_string()))
            .cloned()
    }

    pub fn all_current_state(&self) -> Vec<Event> {
        self.read().state.values().cloned().collect()
    }

    pub fn timeline(&self) -> Vec<Event> {
        self.read().timeline.clone()
    }

    pub fn latest_event(&self) -> Option<Event> {
        self.read().timeline.last().cloned()
    }

    pub fn auth_chain_for_events(&self, events: &[Event]) -> Vec<Event> {
        let inner = self.read();
        auth_chain_for_events(events, |id| inner.events.get(id).cloned())
    }

    pub fn joined_members(&self) -> Vec<UserId> {
        self.read()
            .state
            .values()
            .filter(|e| e.membership() == Some("join"))
            .filter_map(|e| e.state_key.as_deref().map(UserId::from))
            .collect()
    }

    /// Servers with at least one joined member, sorted.
    pub fn servers_in_room(&self) -> Vec<ServerName> {
        self.joined_members()
            .iter()
            .map(UserId::server_name)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Current state without membership events.
    pub fn non_member_state(&self) -> Vec<Event> {
        self.read()
            .state
            .values()
            .filter(|e| e.event_type != MEMBER)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psj_core::event::initial_room_events;

    fn room_with(creator: &UserId) -> ServerRoom {
        let room = ServerRoom::new(
            RoomId::generate(&creator.server_name()),
            RoomVersion::default(),
        );
        for spec in initial_room_events(room.version(), creator) {
            let event = room.create_event(&spec).unwrap();
            room.add_event(event);
        }
        room
    }

    #[test]
    fn test_add_event_updates_state_and_timeline() {
        let charlie = UserId::from("@charlie:127.0.0.1:9000");
        let room = room_with(&charlie);
        assert_eq!(room.timeline().len(), 5);
        assert_eq!(room.all_current_state().len(), 5);

        let message = room
            .create_event(&EventSpec::text_message(&charlie, "hi"))
            .unwrap();
        room.add_event(message.clone());
        room.add_event(message.clone());

        assert_eq!(room.timeline().len(), 6);
        assert_eq!(room.latest_event().unwrap().event_id, message.event_id);
        assert_eq!(room.all_current_state().len(), 5);
    }

    #[test]
    fn test_servers_in_room_follow_joined_members() {
        let charlie = UserId::from("@charlie:127.0.0.1:9000");
        let room = room_with(&charlie);
        let alice = UserId::from("@alice:hs1");
        let join = room
            .create_event(&EventSpec::membership(&alice, "join"))
            .unwrap();
        room.add_event(join);

        assert_eq!(
            room.servers_in_room(),
            vec![ServerName::from("127.0.0.1:9000"), ServerName::from("hs1")]
        );
        assert_eq!(room.non_member_state().len(), 4);
    }

    #[test]
    fn test_outliers_are_known_but_not_in_timeline() {
        let charlie = UserId::from("@charlie:127.0.0.1:9000");
        let room = room_with(&charlie);
        let other = room_with(&UserId::from("@zed:elsewhere"));
        let foreign = other.timeline()[0].clone();

        room.add_outlier(foreign.clone());

        assert!(room.event(&foreign.event_id).is_some());
        assert_eq!(room.timeline().len(), 5);
    }

    #[test]
    fn test_outlier_then_add_event_updates_state() {
        let origin = room_with(&UserId::from("@charlie:127.0.0.1:9000"));
        let alice = UserId::from("@alice:hs1");
        let join = origin
            .create_event(&EventSpec::membership(&alice, "join"))
            .unwrap();
        origin.add_event(join);

        let mirror = ServerRoom::new(origin.room_id().clone(), RoomVersion::default());
        for event in origin.timeline() {
            mirror.add_outlier(event);
        }
        for event in origin.timeline() {
            mirror.add_event(event);
        }

        assert_eq!(mirror.timeline().len(), 6);
        assert_eq!(mirror.all_current_state().len(), 6);
        assert_eq!(
            mirror.servers_in_room(),
            vec![ServerName::from("127.0.0.1:9000"), ServerName::from("hs1")]
        );
    }
}
