use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use psj_core::federation::{parse_x_matrix_origin, RespMakeJoin, RespSendJoin, Transaction};
use psj_core::ports::ServerDirectory;
use psj_core::{Event, EventId, EventSpec, Reporter, RoomId, RoomVersion, ServerName, UserId};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::mux::{decode_path, FederationRequest, Mux};
use super::room::ServerRoom;
use crate::http::{encode_path, matrix_error, spawn_server, FederationClient, FederationError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configures a [`Server`] before it listens, typically by registering routes.
pub type ServerOption = Box<dyn FnOnce(&Server) + Send>;

/// Rooms known to a mock peer, shared with its handlers.
#[derive(Clone, Default)]
pub struct Rooms(Arc<RwLock<HashMap<RoomId, Arc<ServerRoom>>>>);

impl Rooms {
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<ServerRoom>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .cloned()
    }

    pub fn insert(&self, room: Arc<ServerRoom>) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room.room_id().clone(), room);
    }

    /// Look an event up in every room.
    pub fn find_event(&self, event_id: &EventId) -> Option<Event> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find_map(|room| room.event(event_id))
    }
}

/// Stops a mock peer's listener. Cancelling twice is harmless; dropping the
/// handle cancels too.
#[derive(Debug)]
pub struct CancelListener {
    token: CancellationToken,
}

impl CancelListener {
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("cancelling mock listener");
            self.token.cancel();
        }
    }
}

impl Drop for CancelListener {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A mock federation peer driven by a scenario.
///
/// The socket is bound at construction so [`Server::server_name`] is known
/// before any route is registered; requests are served only after
/// [`Server::listen`].
pub struct Server {
    server_name: ServerName,
    mux: Arc<Mux>,
    rooms: Rooms,
    reporter: Reporter,
    client: FederationClient,
    listener: Mutex<Option<StdTcpListener>>,
}

#[derive(Clone)]
struct DispatchState {
    server_name: ServerName,
    mux: Arc<Mux>,
    reporter: Reporter,
}

impl Server {
    pub fn new(
        directory: Arc<dyn ServerDirectory>,
        reporter: Reporter,
        options: Vec<ServerOption>,
    ) -> Result<Self> {
        let listener =
            StdTcpListener::bind("127.0.0.1:0").context("Failed to bind mock federation server")?;
        listener
            .set_nonblocking(true)
            .context("Failed to make mock listener non-blocking")?;
        let addr: SocketAddr = listener.local_addr()?;
        let server_name = ServerName::from(addr.to_string());
        let client = FederationClient::new(server_name.clone(), directory, REQUEST_TIMEOUT)?;

        let server = Self {
            server_name,
            mux: Arc::new(Mux::new()),
            rooms: Rooms::default(),
            reporter,
            client,
            listener: Mutex::new(Some(listener)),
        };
        for option in options {
            option(&server);
        }
        tracing::info!(server = %server.server_name, routes = server.mux.len(), "mock federation server created");
        Ok(server)
    }

    pub fn server_name(&self) -> &ServerName {
        &self.server_name
    }

    pub fn user_id(&self, localpart: &str) -> UserId {
        UserId::new(localpart, &self.server_name)
    }

    pub fn mux(&self) -> &Mux {
        &self.mux
    }

    pub fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Start serving. Only the first call succeeds.
    pub fn listen(&self) -> Result<CancelListener> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("{} is already listening", self.server_name))?;
        let listener = tokio::net::TcpListener::from_std(listener)
            .context("Failed to register mock listener with the runtime")?;

        let state = DispatchState {
            server_name: self.server_name.clone(),
            mux: self.mux.clone(),
            reporter: self.reporter.clone(),
        };
        let router = Router::new().fallback(dispatch).with_state(state);
        let token = CancellationToken::new();
        spawn_server(self.server_name.as_str(), listener, router, token.clone())?;
        Ok(CancelListener { token })
    }

    /// Create a room owned by this server from `events`, in order.
    pub fn must_make_room(
        &self,
        version: RoomVersion,
        events: Vec<EventSpec>,
    ) -> Result<Arc<ServerRoom>> {
        let room = Arc::new(ServerRoom::new(RoomId::generate(&self.server_name), version));
        for spec in &events {
            let event = room
                .create_event(spec)
                .with_context(|| format!("Failed to build {} event", spec.event_type))?;
            room.add_event(event);
        }
        self.rooms.insert(room.clone());
        tracing::info!(room = %room.room_id(), events = events.len(), "mock room created");
        Ok(room)
    }

    /// Build an event on top of `room` without adding it.
    pub fn must_create_event(&self, room: &ServerRoom, spec: EventSpec) -> Result<Event> {
        room.create_event(&spec)
            .with_context(|| format!("Failed to build {} event in {}", spec.event_type, room.room_id()))
    }

    pub async fn must_send_transaction(
        &self,
        destination: &ServerName,
        pdus: Vec<Value>,
        edus: Vec<Value>,
    ) -> Result<()> {
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        let transaction = Transaction {
            origin: self.server_name.clone(),
            origin_server_ts: chrono::Utc::now().timestamp_millis(),
            pdus,
            edus,
        };
        let body = serde_json::to_value(&transaction)?;
        let path = encode_path(&["_matrix", "federation", "v1", "send", &txn_id]);
        let _: Value = self
            .client
            .put(destination, &path, &[], &body)
            .await
            .with_context(|| format!("Failed to send transaction {} to {}", txn_id, destination))?;
        tracing::debug!(%destination, %txn_id, pdus = transaction.pdus.len(), "transaction sent");
        Ok(())
    }

    /// Join `user_id` to a room resident on `destination` and track the room
    /// locally.
    pub async fn must_join_room(
        &self,
        destination: &ServerName,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Arc<ServerRoom>> {
        let path = encode_path(&[
            "_matrix",
            "federation",
            "v1",
            "make_join",
            room_id.as_str(),
            user_id.as_str(),
        ]);
        let version = RoomVersion::default();
        let make_join: RespMakeJoin = self
            .client
            .get(destination, &path, &[("ver", version.as_str())])
            .await
            .with_context(|| format!("make_join for {} in {} failed", user_id, room_id))?;

        let join = make_join.event.finalize()?;
        let path = encode_path(&[
            "_matrix",
            "federation",
            "v2",
            "send_join",
            room_id.as_str(),
            join.event_id.as_str(),
        ]);
        let send_join: RespSendJoin = self
            .client
            .put(destination, &path, &[], &join.to_json())
            .await
            .with_context(|| format!("send_join for {} in {} failed", user_id, room_id))?;

        let room = Arc::new(ServerRoom::new(room_id.clone(), make_join.room_version));
        for event in send_join.auth_chain {
            room.add_outlier(event);
        }
        let mut state = send_join.state;
        state.sort_by_key(|e| e.depth);
        for event in state {
            room.add_event(event);
        }
        room.add_event(join);
        self.rooms.insert(room.clone());
        tracing::info!(room = %room_id, user = %user_id, via = %destination, "mock joined room");
        Ok(room)
    }

    /// Arbitrary federation request to `destination`, decoded as `T`.
    pub async fn send_federation_request<T: DeserializeOwned>(
        &self,
        method: Method,
        destination: &ServerName,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FederationError> {
        self.client
            .request(method, destination, path, query, None)
            .await
    }
}

async fn dispatch(
    State(state): State<DispatchState>,
    method: Method,
    uri: Uri,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let segments = decode_path(uri.path());
    let origin = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_x_matrix_origin);

    let Some((handler, params)) = state.mux.find(&method, &segments, &query) else {
        state.reporter.error(format!(
            "{} received unexpected request {} {}",
            state.server_name,
            method,
            uri.path()
        ));
        return matrix_error(StatusCode::NOT_FOUND, "M_UNRECOGNIZED", "no route");
    };

    tracing::trace!(server = %state.server_name, %method, path = uri.path(), "dispatching");
    handler(FederationRequest {
        method,
        segments,
        params,
        query,
        origin,
        body,
    })
    .await
}
