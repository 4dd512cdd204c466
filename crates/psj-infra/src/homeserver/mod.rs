//! # Simulated homeserver
//!
//! The system under test: an in-process server implementing the slice of the
//! client-server and server-server APIs the partial-state join scenarios
//! drive.
//!
//! ## Lifecycle / 生命周期
//!
//! - [`Homeserver::start`] binds a fresh ephemeral port, serves both APIs and
//!   resumes resync for every partial-state room.
//! - [`Homeserver::stop`] cancels the run's token. Listeners shut down
//!   gracefully; blocked requests and resync tasks observe the same token.
//! - The [`Store`] survives both, so a stop/start pair is a restart.

mod client_api;
mod error;
mod federation_api;
mod membership;
mod resync;
mod store;
mod sync;

pub use error::HomeserverError;
pub use store::{PartialState, Store, StoreInner, StoredRoom};
pub use sync::{format_token, parse_token, SyncParams};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use axum::http::{header, HeaderMap};
use axum::Router;
use psj_core::config::HomeserverConfig;
use psj_core::ports::ServerDirectory;
use psj_core::{RoomId, ServerName, UserId};
use tokio_util::sync::CancellationToken;

use crate::http::{spawn_server, FederationClient};

/// Everything a request handler of one run needs.
#[derive(Clone)]
pub(crate) struct HsContext {
    pub name: ServerName,
    pub store: Arc<Store>,
    pub federation: FederationClient,
    pub config: HomeserverConfig,
    /// Cancelled when this run stops.
    pub shutdown: CancellationToken,
}

impl HsContext {
    /// Resolve the bearer token of a client request.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<UserId, HomeserverError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(HomeserverError::MissingToken)?;
        self.store
            .read(|s| s.user_for_token(token).cloned())
            .ok_or(HomeserverError::UnknownToken)
    }

    pub fn spawn_resync(&self, room_id: RoomId) {
        resync::spawn(self.clone(), room_id);
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

/// One simulated homeserver, e.g. `hs1`.
pub struct Homeserver {
    name: ServerName,
    store: Arc<Store>,
    directory: Arc<dyn ServerDirectory>,
    config: HomeserverConfig,
    running: Mutex<Option<Running>>,
}

impl Homeserver {
    pub fn new(
        name: ServerName,
        directory: Arc<dyn ServerDirectory>,
        config: HomeserverConfig,
    ) -> Self {
        Self {
            name,
            store: Arc::new(Store::new()),
            directory,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn server_name(&self) -> &ServerName {
        &self.name
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Register `@localpart:<name>` and return it with a fresh access token.
    pub fn register_user(&self, localpart: &str) -> (UserId, String) {
        let user_id = UserId::new(localpart, &self.name);
        let token = format!("syt_{}_{}", localpart, uuid::Uuid::new_v4().simple());
        self.store
            .write(|s| s.register_user(user_id.clone(), token.clone()));
        (user_id, token)
    }

    pub fn access_token(&self, user_id: &UserId) -> Option<String> {
        self.store
            .read(|s| s.token_for_user(user_id).map(str::to_string))
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.addr)
    }

    /// Serve on a new ephemeral port. Stops the previous run first.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.stop();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .with_context(|| format!("Failed to bind {}", self.name))?;
        let shutdown = CancellationToken::new();
        let ctx = HsContext {
            name: self.name.clone(),
            store: self.store.clone(),
            federation: FederationClient::new(
                self.name.clone(),
                self.directory.clone(),
                self.config.request_timeout(),
            )?,
            config: self.config.clone(),
            shutdown: shutdown.clone(),
        };

        let router = Router::new()
            .merge(client_api::router())
            .merge(federation_api::router())
            .with_state(ctx.clone());
        let addr = spawn_server(self.name.as_str(), listener, router, shutdown.clone())?;

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Running { addr, shutdown });

        let partial_rooms = self.store.read(|s| s.partial_state_rooms());
        tracing::info!(
            server = %self.name,
            %addr,
            partial_rooms = partial_rooms.len(),
            "homeserver started"
        );
        for room_id in partial_rooms {
            ctx.spawn_resync(room_id);
        }
        Ok(addr)
    }

    /// Stop serving; a no-op when not running.
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.shutdown.cancel();
            tracing::info!(server = %self.name, addr = %running.addr, "homeserver stopped");
        }
    }
}

impl Drop for Homeserver {
    fn drop(&mut self) {
        self.stop();
    }
}
