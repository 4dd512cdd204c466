//! Gated state-fetch handlers
//!
//! 门控处理器:在 mock 对端内部制造可控的暂停点。
//!
//! A gated handler answers one class of state-fetch request from the mock
//! peer. On every matching request it first reports the arrival, then holds
//! the response until the scenario releases it:
//!
//! ```text
//! request ──> arrivals += 1 ──> arrived.finish() ──> release.waitf(bound) ──> 200 + payload
//!                                                        │
//!                                                        └─ timeout ──> reporter.error, 500
//! ```
//!
//! Finishing `arrived` a second time is a no-op, so the same registration
//! keeps serving repeated requests (e.g. after the homeserver restarts).

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use psj_core::event::event_ids;
use psj_core::federation::{RespState, RespStateIds};
use psj_core::{Event, EventId, Reporter, RoomId, WaitError, Waiter};
use psj_infra::federation::{FederationRequest, Server, ServerRoom};
use psj_infra::http::matrix_error;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;

/// The pause point of one gated registration.
///
/// Either waiter may be absent: without `arrived` nothing is signalled,
/// without `release` the response goes out immediately. Every clone shares
/// the same arrival count.
#[derive(Debug, Clone)]
pub struct Gate {
    pub arrived: Option<Waiter>,
    pub release: Option<Waiter>,
    arrivals: Arc<watch::Sender<usize>>,
}

impl Gate {
    pub fn new(arrived: Waiter, release: Waiter) -> Self {
        Self {
            arrived: Some(arrived),
            release: Some(release),
            arrivals: Arc::new(watch::Sender::new(0)),
        }
    }

    /// A gate that never holds a request.
    pub fn open() -> Self {
        Self {
            arrived: None,
            release: None,
            arrivals: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Requests that have reached this gate so far.
    pub fn arrivals(&self) -> usize {
        *self.arrivals.borrow()
    }

    /// Wait until at least `count` requests have arrived.
    pub async fn await_arrivals(
        &self,
        count: usize,
        timeout: Duration,
        label: impl Into<String>,
    ) -> Result<(), WaitError> {
        let mut rx = self.arrivals.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count))
            .await
            .is_ok_and(|changed| changed.is_ok());
        if reached {
            Ok(())
        } else {
            Err(WaitError::TimedOut {
                label: label.into(),
                timeout,
            })
        }
    }

    /// Signal the arrival, then hold until released. `false` if the release
    /// never came within `bound`; the failure is already recorded.
    async fn pass(&self, label: &str, bound: Duration, reporter: &Reporter) -> bool {
        self.arrivals.send_modify(|n| *n += 1);
        if let Some(arrived) = &self.arrived {
            arrived.finish();
        }
        let Some(release) = &self.release else {
            return true;
        };
        match release.waitf(bound, label).await {
            Ok(()) => true,
            Err(err) => {
                reporter.error(format!("gated handler was never released: {}", err));
                false
            }
        }
    }
}

/// Serve `GET /_matrix/federation/v1/state_ids/{room}?event_id=<event_id>`
/// with the ids of `room_state` and of its auth chain, behind `gate`.
pub fn handle_state_ids_requests(
    server: &Server,
    room: &ServerRoom,
    event_id: &EventId,
    room_state: &[Event],
    gate: Gate,
    release_bound: Duration,
) {
    let auth_chain = room.auth_chain_for_events(room_state);
    let payload = RespStateIds {
        pdu_ids: event_ids(room_state),
        auth_chain_ids: event_ids(&auth_chain),
    };
    register_gated(
        server,
        "state_ids",
        room.room_id(),
        Some(event_id),
        payload,
        gate,
        release_bound,
    );
}

/// Serve `GET /_matrix/federation/v1/state/{room}?event_id=<event_id>` with
/// the full events of `room_state` and its auth chain, behind `gate`.
pub fn handle_state_requests(
    server: &Server,
    room: &ServerRoom,
    event_id: &EventId,
    room_state: &[Event],
    gate: Gate,
    release_bound: Duration,
) {
    let payload = RespState {
        pdus: room_state.to_vec(),
        auth_chain: room.auth_chain_for_events(room_state),
    };
    register_gated(
        server,
        "state",
        room.room_id(),
        Some(event_id),
        payload,
        gate,
        release_bound,
    );
}

/// Answer `state_ids` for any event in `room_id` with a well-formed but
/// empty `{}` body, so the requester has to go elsewhere for the state.
pub fn handle_malformed_state_ids_requests(
    server: &Server,
    room_id: &RoomId,
    gate: Gate,
    release_bound: Duration,
) {
    register_gated(
        server,
        "state_ids",
        room_id,
        None,
        json!({}),
        gate,
        release_bound,
    );
}

fn register_gated<T>(
    server: &Server,
    endpoint: &'static str,
    room_id: &RoomId,
    event_id: Option<&EventId>,
    payload: T,
    gate: Gate,
    release_bound: Duration,
) where
    T: Serialize + Send + Sync + 'static,
{
    let payload = Arc::new(payload);
    let reporter = server.reporter().clone();
    let label = match event_id {
        Some(event_id) => format!("Waiting to release /{} for {}", endpoint, event_id),
        None => format!("Waiting to release /{} in {}", endpoint, room_id),
    };

    let mut route = server
        .mux()
        .new_route()
        .methods(Method::GET)
        .path(&format!("/_matrix/federation/v1/{}/{}", endpoint, room_id));
    if let Some(event_id) = event_id {
        route = route.queries("event_id", event_id.as_str());
    }
    route.handler(move |req: FederationRequest| {
        let payload = payload.clone();
        let reporter = reporter.clone();
        let gate = gate.clone();
        let label = label.clone();
        async move {
            tracing::info!(
                endpoint,
                origin = ?req.origin,
                event_id = req.query_param("event_id").unwrap_or_default(),
                "incoming gated state request"
            );
            if !gate.pass(&label, release_bound, &reporter).await {
                return matrix_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "M_UNKNOWN",
                    "gate was not released",
                );
            }
            respond(endpoint, &*payload, &reporter)
        }
    });
}

fn respond<T: Serialize>(endpoint: &str, payload: &T, reporter: &Reporter) -> Response {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            tracing::debug!(endpoint, bytes = body.len(), "releasing gated response");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }
        Err(err) => {
            reporter.error(format!("Error writing /{} response: {}", endpoint, err));
            matrix_error(StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN", err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_gate_passes_without_waiting() {
        let gate = Gate::open();
        let reporter = Reporter::new("open_gate");

        assert!(gate.pass("open", Duration::from_millis(10), &reporter).await);
        assert_eq!(gate.arrivals(), 1);
        assert!(reporter.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreleased_gate_reports_timeout() {
        let gate = Gate::new(Waiter::new(), Waiter::new());
        let reporter = Reporter::new("stuck_gate");

        assert!(!gate.pass("stuck", Duration::from_secs(60), &reporter).await);

        assert!(gate.arrived.as_ref().is_some_and(Waiter::is_finished));
        let err = reporter.check().unwrap_err();
        assert!(err.failures[0].contains("never released"));
    }

    #[tokio::test]
    async fn test_repeated_arrivals_are_counted_and_idempotent() {
        let arrived = Waiter::new();
        let release = Waiter::new();
        release.finish();
        let gate = Gate::new(arrived.clone(), release);
        let reporter = Reporter::new("repeat");

        assert!(gate.pass("first", Duration::from_secs(1), &reporter).await);
        assert!(gate.clone().pass("second", Duration::from_secs(1), &reporter).await);

        assert_eq!(gate.arrivals(), 2);
        assert!(arrived.is_finished());
        assert!(gate
            .await_arrivals(2, Duration::from_millis(10), "two")
            .await
            .is_ok());
        assert!(reporter.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_arrivals_times_out_with_label() {
        let gate = Gate::open();

        let err = gate
            .await_arrivals(1, Duration::from_secs(5), "Waiting for a second /state_ids request")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("second /state_ids"));
    }
}
