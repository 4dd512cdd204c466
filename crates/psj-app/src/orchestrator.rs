//! Partial-state join orchestrator
//!
//! 这个模块负责编排一次部分状态加入(partial-state join)场景:创建 mock 对端与房间,
//! 安装门控的 `/state_ids` 处理器,触发加入,并向场景暴露控制点。
//!
//! # Phases / 阶段
//!
//! ```text
//! NotStarted ──begin──> JoinRequested ──/join returns──> JoinAccepted
//!     ──await_state_ids_request──> StateFetchPending
//!     ──finish_state_request──> StateFetchReleased
//!     ──await_full_state──> StateSynced
//! ```
//!
//! The mock room is created by `charlie` and joined by `derek`, both on the
//! mock peer. The `/state_ids` handler is keyed to derek's join, the event
//! the joining homeserver's join builds on, so the resync that follows the
//! join is what gets gated.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use psj_core::config::WaitConfig;
use psj_core::event::initial_room_events;
use psj_core::sync::sync_joined_to;
use psj_core::{Event, EventSpec, HarnessConfig, Reporter, RoomId, ScenarioFailed, Waiter};
use psj_infra::federation::{
    handle_event_requests, handle_key_requests, handle_partial_state_make_send_join_requests,
    handle_transaction_requests, CancelListener, PduCallback, Server, ServerOption, ServerRoom,
};
use psj_infra::{CsApi, Deployment, SyncReq};
use tracing::Instrument;

use crate::gated_handler::{handle_state_ids_requests, handle_state_requests, Gate};

/// Where a partial-state join scenario currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioPhase {
    NotStarted,
    JoinRequested,
    /// `/join` returned; the homeserver holds partial state.
    JoinAccepted,
    /// The resync's `/state_ids` request is held by the gate.
    StateFetchPending,
    StateFetchReleased,
    /// A full sync shows the room.
    StateSynced,
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A mock peer with the stock handlers every scenario needs: keys, partial
/// make/send_join and event fetches. Any PDU pushed at it is a failure.
pub fn create_test_server(
    deployment: &Deployment,
    reporter: Reporter,
    extra_options: Vec<ServerOption>,
) -> Result<Server> {
    let pdu_reporter = reporter.clone();
    let on_pdu: PduCallback = Arc::new(move |event: Event| {
        pdu_reporter.error(format!("Received unexpected PDU: {}", event.to_json()));
    });

    let mut options = vec![
        handle_key_requests(),
        handle_partial_state_make_send_join_requests(),
        handle_event_requests(),
        handle_transaction_requests(Some(on_pdu), None),
    ];
    options.extend(extra_options);
    Server::new(deployment.directory(), reporter, options)
}

/// One partial-state join of `joining` into a room on a mock peer.
///
/// Dropping it tears it down; call [`destroy`](Self::destroy) to also see
/// what the mock's handlers recorded.
pub struct PartialStateJoin {
    joining: CsApi,
    server: Server,
    server_room: Arc<ServerRoom>,
    cancel_listener: CancelListener,
    state_ids_gate: Gate,
    state_ids_arrived: Waiter,
    state_ids_release: Waiter,
    reporter: Reporter,
    waits: WaitConfig,
    phase: Mutex<ScenarioPhase>,
    destroyed: AtomicBool,
}

impl PartialStateJoin {
    /// Build the mock room and have `joining` join it through the mock.
    pub async fn begin(
        deployment: &Deployment,
        joining: CsApi,
        reporter: Reporter,
        config: &HarnessConfig,
    ) -> Result<Self> {
        Self::begin_with(deployment, joining, reporter, config, Vec::new()).await
    }

    /// Like [`begin`](Self::begin), with extra routes on the mock peer.
    pub async fn begin_with(
        deployment: &Deployment,
        joining: CsApi,
        reporter: Reporter,
        config: &HarnessConfig,
        extra_options: Vec<ServerOption>,
    ) -> Result<Self> {
        let span = tracing::info_span!(
            "partial_state_join",
            scenario = %reporter.scenario(),
            user = %joining.user_id()
        );
        Self::setup(deployment, joining, reporter, config, extra_options)
            .instrument(span)
            .await
    }

    async fn setup(
        deployment: &Deployment,
        joining: CsApi,
        reporter: Reporter,
        config: &HarnessConfig,
        extra_options: Vec<ServerOption>,
    ) -> Result<Self> {
        let server = create_test_server(deployment, reporter.clone(), extra_options)?;
        let cancel_listener = server.listen()?;

        let version = joining
            .default_room_version()
            .await
            .context("Failed to read the default room version")?;
        let charlie = server.user_id("charlie");
        let server_room =
            server.must_make_room(version.clone(), initial_room_events(&version, &charlie))?;

        let derek = server.user_id("derek");
        let derek_join =
            server.must_create_event(&server_room, EventSpec::membership(&derek, "join"))?;
        server_room.add_event(derek_join.clone());

        let state_ids_arrived = Waiter::new();
        let state_ids_release = Waiter::new();
        let state_ids_gate = Gate::new(state_ids_arrived.clone(), state_ids_release.clone());
        let room_state = server_room.all_current_state();
        let release_bound = config.waits.release_bound();
        handle_state_ids_requests(
            &server,
            &server_room,
            &derek_join.event_id,
            &room_state,
            state_ids_gate.clone(),
            release_bound,
        );
        handle_state_requests(
            &server,
            &server_room,
            &derek_join.event_id,
            &room_state,
            Gate::open(),
            release_bound,
        );

        let psj = Self {
            joining,
            server,
            server_room,
            cancel_listener,
            state_ids_gate,
            state_ids_arrived,
            state_ids_release,
            reporter,
            waits: config.waits.clone(),
            phase: Mutex::new(ScenarioPhase::NotStarted),
            destroyed: AtomicBool::new(false),
        };

        psj.advance(ScenarioPhase::JoinRequested);
        let via = [psj.server.server_name().clone()];
        if let Err(err) = psj.joining.join_room(psj.room_id(), &via).await {
            if let Err(teardown) = psj.destroy() {
                tracing::warn!(error = %teardown, "handler failures while unwinding a failed join");
            }
            return Err(err);
        }
        psj.advance(ScenarioPhase::JoinAccepted);
        Ok(psj)
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_room(&self) -> &Arc<ServerRoom> {
        &self.server_room
    }

    pub fn room_id(&self) -> &RoomId {
        self.server_room.room_id()
    }

    pub fn joining_user(&self) -> &CsApi {
        &self.joining
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn phase(&self) -> ScenarioPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, next: ScenarioPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *phase, next);
        tracing::info!(room = %self.room_id(), from = %previous, to = %next, "scenario phase");
    }

    /// Block until the homeserver has sent the gated `/state_ids` request.
    pub async fn await_state_ids_request(&self) -> Result<()> {
        self.state_ids_arrived
            .waitf(self.waits.await_request(), "Waiting for /state_ids request")
            .await?;
        self.advance(ScenarioPhase::StateFetchPending);
        Ok(())
    }

    /// `/state_ids` requests that have reached the gate so far.
    pub fn state_ids_requests_received(&self) -> usize {
        self.state_ids_gate.arrivals()
    }

    /// Block until `count` `/state_ids` requests have reached the gate in
    /// total, e.g. a second one from a restarted homeserver.
    pub async fn await_state_ids_requests(&self, count: usize) -> Result<()> {
        self.state_ids_gate
            .await_arrivals(
                count,
                self.waits.await_request(),
                format!("Waiting for /state_ids request #{}", count),
            )
            .await?;
        Ok(())
    }

    /// Let every held `/state_ids` request answer.
    pub fn finish_state_request(&self) {
        self.state_ids_release.finish();
        self.advance(ScenarioPhase::StateFetchReleased);
    }

    /// Sync without lazy loading until the joined room shows up, which the
    /// homeserver allows only once its state is complete.
    pub async fn await_full_state(&self) -> Result<String> {
        let token = self
            .joining
            .sync_until(
                SyncReq::default(),
                sync_joined_to(self.joining.user_id(), self.room_id()),
            )
            .await
            .context("Room did not become fully synced")?;
        self.advance(ScenarioPhase::StateSynced);
        Ok(token)
    }

    /// Build a message from `localpart` on the mock peer and add it to the
    /// mock room.
    pub fn create_message_event(&self, localpart: &str, body: &str) -> Result<Event> {
        let sender = self.server.user_id(localpart);
        let event = self
            .server
            .must_create_event(&self.server_room, EventSpec::text_message(&sender, body))?;
        self.server_room.add_event(event.clone());
        Ok(event)
    }

    /// Release both waiters, stop the listener and report what the handlers
    /// recorded. Safe to call any number of times.
    pub fn destroy(&self) -> Result<(), ScenarioFailed> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.state_ids_arrived.finish();
            self.state_ids_release.finish();
            self.cancel_listener.cancel();
            tracing::info!(
                room = %self.room_id(),
                phase = %self.phase(),
                state_ids_requests = self.state_ids_requests_received(),
                "partial-state join torn down"
            );
        }
        self.reporter.check()
    }
}

impl Drop for PartialStateJoin {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            tracing::error!(error = %err, "partial-state join dropped with failures");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_displays_its_name() {
        assert_eq!(ScenarioPhase::StateFetchPending.to_string(), "StateFetchPending");
    }
}
