//! Persistent state of one simulated homeserver.
//!
//! The store outlives restarts: stopping a homeserver drops its listeners and
//! tasks but keeps this. Every write bumps a change counter that blocked
//! requests subscribe to.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use psj_core::event::{build_event, MEMBER};
use psj_core::{Event, EventId, EventSpec, RoomId, RoomVersion, ServerName, StateMap, UserId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::HomeserverError;

/// Bookkeeping for a room joined with partial state.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialState {
    /// Our join event; its predecessor is where state is fetched.
    pub join_event: EventId,
    /// Servers to resync from, in the order they are tried.
    pub servers: Vec<ServerName>,
}

#[derive(Debug, Clone)]
pub struct StoredRoom {
    pub version: RoomVersion,
    pub state: StateMap,
    /// Stream positions of events in the timeline, ascending.
    pub timeline: Vec<(u64, EventId)>,
    pub partial: Option<PartialState>,
}

impl StoredRoom {
    fn new(version: RoomVersion) -> Self {
        Self {
            version,
            state: StateMap::new(),
            timeline: Vec::new(),
            partial: None,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }

    pub fn membership_of(&self, user_id: &UserId) -> Option<&str> {
        self.state
            .get(&(MEMBER.to_string(), user_id.to_string()))
            .and_then(|e| e.membership())
    }

    pub fn is_joined(&self, user_id: &UserId) -> bool {
        self.membership_of(user_id) == Some("join")
    }

    /// Servers with at least one joined member, sorted.
    pub fn joined_servers(&self) -> Vec<ServerName> {
        let mut servers: Vec<ServerName> = self
            .state
            .values()
            .filter(|e| e.membership() == Some("join"))
            .filter_map(|e| e.state_key.as_deref())
            .map(|user| UserId::from(user).server_name())
            .collect();
        servers.sort();
        servers.dedup();
        servers
    }

    pub fn latest_event(&self) -> Option<&EventId> {
        self.timeline.last().map(|(_, id)| id)
    }
}

#[derive(Debug, Default)]
pub struct StoreInner {
    /// access token -> user
    tokens: HashMap<String, UserId>,
    events: HashMap<EventId, Event>,
    rooms: BTreeMap<RoomId, StoredRoom>,
    stream_position: u64,
}

impl StoreInner {
    pub fn register_user(&mut self, user_id: UserId, access_token: String) {
        self.tokens.insert(access_token, user_id);
    }

    pub fn user_for_token(&self, access_token: &str) -> Option<&UserId> {
        self.tokens.get(access_token)
    }

    pub fn token_for_user(&self, user_id: &UserId) -> Option<&str> {
        self.tokens
            .iter()
            .find(|(_, user)| *user == user_id)
            .map(|(token, _)| token.as_str())
    }

    pub fn event(&self, event_id: &EventId) -> Option<&Event> {
        self.events.get(event_id)
    }

    pub fn has_event(&self, event_id: &EventId) -> bool {
        self.events.contains_key(event_id)
    }

    /// Persist an event outside of any timeline (state and auth events
    /// learnt from other servers).
    pub fn store_outlier(&mut self, event: Event) {
        self.events.entry(event.event_id.clone()).or_insert(event);
    }

    pub fn room(&self, room_id: &RoomId) -> Option<&StoredRoom> {
        self.rooms.get(room_id)
    }

    pub fn room_mut(&mut self, room_id: &RoomId) -> Option<&mut StoredRoom> {
        self.rooms.get_mut(room_id)
    }

    pub fn create_room(&mut self, room_id: RoomId, version: RoomVersion) -> &mut StoredRoom {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| StoredRoom::new(version))
    }

    pub fn rooms(&self) -> impl Iterator<Item = (&RoomId, &StoredRoom)> {
        self.rooms.iter()
    }

    /// Position of the most recent timeline event.
    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    /// Append `event` to its room's timeline, applying it to current state.
    ///
    /// Returns the stream position, or `None` if the room is unknown or the
    /// event is already in the timeline.
    pub fn append(&mut self, event: Event) -> Option<u64> {
        let room = self.rooms.get_mut(&event.room_id)?;
        if room.timeline.iter().any(|(_, id)| *id == event.event_id) {
            return None;
        }
        self.stream_position += 1;
        let position = self.stream_position;
        room.timeline.push((position, event.event_id.clone()));
        if let Some(key) = event.state_tuple() {
            room.state.insert(key, event.clone());
        }
        self.events.insert(event.event_id.clone(), event);
        Some(position)
    }

    /// Build `spec` on top of a room's current state and latest event,
    /// without appending it.
    pub fn template_event(
        &self,
        room_id: &RoomId,
        spec: &EventSpec,
    ) -> Result<Event, HomeserverError> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| HomeserverError::NotFound(format!("unknown room {}", room_id)))?;
        let prev = room.latest_event().and_then(|id| self.events.get(id));
        Ok(build_event(room_id, spec, &room.state, prev)?)
    }

    /// Build a local event and append it.
    pub fn append_new(&mut self, room_id: &RoomId, spec: &EventSpec) -> Result<Event, HomeserverError> {
        let event = self.template_event(room_id, spec)?;
        self.append(event.clone());
        Ok(event)
    }

    pub fn position_of(&self, room_id: &RoomId, event_id: &EventId) -> Option<u64> {
        self.rooms
            .get(room_id)?
            .timeline
            .iter()
            .find(|(_, id)| id == event_id)
            .map(|(pos, _)| *pos)
    }

    pub fn joined_rooms(&self, user_id: &UserId) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|(_, room)| room.is_joined(user_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn partial_state_rooms(&self) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|(_, room)| room.is_partial())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn any_joined_room_partial(&self, user_id: &UserId) -> bool {
        self.rooms
            .values()
            .any(|room| room.is_joined(user_id) && room.is_partial())
    }

    /// Replace a partial-state room's state with `state` plus the state
    /// events of its timeline, and clear the partial flag.
    pub fn complete_partial_state(&mut self, room_id: &RoomId, state: Vec<Event>) -> bool {
        let Some(room) = self.rooms.get(room_id) else {
            return false;
        };
        let timeline_state: Vec<Event> = room
            .timeline
            .iter()
            .filter_map(|(_, id)| self.events.get(id))
            .filter(|e| e.is_state())
            .cloned()
            .collect();

        let mut new_state = StateMap::new();
        for event in state.into_iter().chain(timeline_state) {
            if let Some(key) = event.state_tuple() {
                new_state.insert(key, event.clone());
            }
            self.events.entry(event.event_id.clone()).or_insert(event);
        }

        match self.rooms.get_mut(room_id) {
            Some(room) => {
                room.state = new_state;
                room.partial = None;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
pub struct Store {
    inner: Mutex<StoreInner>,
    changes: watch::Sender<u64>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(StoreInner::default()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read<R>(&self, f: impl FnOnce(&StoreInner) -> R) -> R {
        f(&self.lock())
    }

    /// Mutate the store and wake everything blocked in [`Store::wait_until`].
    pub fn write<R>(&self, f: impl FnOnce(&mut StoreInner) -> R) -> R {
        let result = f(&mut self.lock());
        self.changes.send_modify(|n| *n += 1);
        result
    }

    /// Resolve once `condition` holds, re-checking after every write.
    ///
    /// Fails with [`HomeserverError::ShuttingDown`] when `shutdown` fires
    /// first, so a graceful stop never waits on a blocked request.
    pub async fn wait_until<F>(
        &self,
        shutdown: &CancellationToken,
        condition: F,
    ) -> Result<(), HomeserverError>
    where
        F: Fn(&StoreInner) -> bool,
    {
        let mut changes = self.changes.subscribe();
        loop {
            if self.read(&condition) {
                return Ok(());
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(HomeserverError::ShuttingDown);
                    }
                }
                _ = shutdown.cancelled() => return Err(HomeserverError::ShuttingDown),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psj_core::event::initial_room_events;
    use std::sync::Arc;
    use std::time::Duration;

    fn seed_room(store: &Store, creator: &UserId) -> (RoomId, Vec<Event>) {
        let room_id = RoomId::generate(&creator.server_name());
        let mut events = Vec::new();
        store.write(|s| {
            s.create_room(room_id.clone(), RoomVersion::default());
            for spec in initial_room_events(&RoomVersion::default(), creator) {
                events.push(s.append_new(&room_id, &spec).unwrap());
            }
        });
        (room_id, events)
    }

    #[test]
    fn test_append_assigns_increasing_positions_once() {
        let store = Store::new();
        let alice = UserId::from("@alice:hs1");
        let (room_id, events) = seed_room(&store, &alice);

        store.read(|s| {
            assert_eq!(s.stream_position(), 5);
            assert_eq!(s.position_of(&room_id, &events[0].event_id), Some(1));
            assert!(s.room(&room_id).unwrap().is_joined(&alice));
            assert_eq!(s.joined_rooms(&alice), vec![room_id.clone()]);
        });
        assert_eq!(store.write(|s| s.append(events[4].clone())), None);
    }

    #[test]
    fn test_complete_partial_state_reapplies_timeline_state() {
        let store = Store::new();
        let alice = UserId::from("@alice:hs1");
        let (room_id, events) = seed_room(&store, &alice);
        let bob = UserId::from("@bob:hs1");

        store.write(|s| {
            s.room_mut(&room_id).unwrap().partial = Some(PartialState {
                join_event: events[1].event_id.clone(),
                servers: vec![],
            });
            s.append_new(&room_id, &EventSpec::membership(&bob, "join"))
                .unwrap();
        });
        assert!(store.read(|s| s.any_joined_room_partial(&alice)));

        let fetched = vec![events[0].clone(), events[2].clone()];
        assert!(store.write(|s| s.complete_partial_state(&room_id, fetched)));

        store.read(|s| {
            let room = s.room(&room_id).unwrap();
            assert!(!room.is_partial());
            assert!(room.is_joined(&bob));
            assert!(room.is_joined(&alice));
            assert_eq!(room.state.len(), 6);
        });
    }

    #[tokio::test]
    async fn test_wait_until_wakes_on_write_and_on_shutdown() {
        let store = Arc::new(Store::new());
        let shutdown = CancellationToken::new();
        let alice = UserId::from("@alice:hs1");

        let waiter = {
            let store = store.clone();
            let shutdown = shutdown.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                store
                    .wait_until(&shutdown, |s| s.user_for_token("t") == Some(&alice))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.write(|s| s.register_user(alice.clone(), "t".to_string()));
        assert!(waiter.await.unwrap().is_ok());

        let blocked = {
            let store = store.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { store.wait_until(&shutdown, |_| false).await })
        };
        shutdown.cancel();
        assert!(matches!(
            blocked.await.unwrap(),
            Err(HomeserverError::ShuttingDown)
        ));
    }
}
