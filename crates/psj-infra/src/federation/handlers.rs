//! Stock [`ServerOption`]s for the mock peer.
//!
//! Each option registers routes on the server's [`Mux`](super::Mux). Handler
//! failures are recorded on the scenario's reporter; the server keeps
//! answering.

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use psj_core::event::MEMBER;
use psj_core::federation::{RespEvent, RespEventAuth, RespMakeJoin, RespSendJoin, Transaction};
use psj_core::{Event, EventId, EventSpec, Reporter, RoomId, ServerName, UserId};
use serde_json::{json, Value};

use super::mux::FederationRequest;
use super::room::ServerRoom;
use super::server::{Rooms, Server, ServerOption};
use crate::http::matrix_error;

/// Called for every PDU in an inbound transaction.
pub type PduCallback = Arc<dyn Fn(Event) + Send + Sync>;
/// Called for every EDU in an inbound transaction.
pub type EduCallback = Arc<dyn Fn(Value) + Send + Sync>;

fn room_not_found(room_id: &str) -> Response {
    matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", format!("unknown room {}", room_id))
}

fn lookup_room(rooms: &Rooms, req: &FederationRequest) -> Result<Arc<ServerRoom>, Response> {
    let room_id = req.param("roomId").unwrap_or_default();
    rooms
        .get(&RoomId::from(room_id))
        .ok_or_else(|| room_not_found(room_id))
}

/// Answer `/_matrix/key/v2/server` with an unsigned key document.
pub fn handle_key_requests() -> ServerOption {
    Box::new(|server: &Server| {
        let server_name = server.server_name().clone();
        server
            .mux()
            .new_route()
            .methods(Method::GET)
            .path("/_matrix/key/v2/server")
            .handler(move |_req| {
                let server_name = server_name.clone();
                async move {
                    let valid_until = chrono::Utc::now().timestamp_millis() + 3_600_000;
                    Json(json!({
                        "server_name": server_name,
                        "valid_until_ts": valid_until,
                        "verify_keys": {},
                        "old_verify_keys": {},
                    }))
                    .into_response()
                }
            });
    })
}

/// `make_join` and `send_join` (v2) that answer a join with partial state:
/// member events are omitted and `servers_in_room` lists this server first.
pub fn handle_partial_state_make_send_join_requests() -> ServerOption {
    Box::new(|server: &Server| {
        let rooms = server.rooms().clone();
        let reporter = server.reporter().clone();
        server
            .mux()
            .new_route()
            .methods(Method::GET)
            .path("/_matrix/federation/v1/make_join/{roomId}/{userId}")
            .handler(move |req| {
                let rooms = rooms.clone();
                let reporter = reporter.clone();
                async move { make_join(&rooms, &reporter, req) }
            });

        let rooms = server.rooms().clone();
        let reporter = server.reporter().clone();
        let server_name = server.server_name().clone();
        server
            .mux()
            .new_route()
            .methods(Method::PUT)
            .path("/_matrix/federation/v2/send_join/{roomId}/{eventId}")
            .handler(move |req| {
                let rooms = rooms.clone();
                let reporter = reporter.clone();
                let server_name = server_name.clone();
                async move { partial_send_join(&rooms, &reporter, &server_name, req) }
            });
    })
}

fn make_join(rooms: &Rooms, reporter: &Reporter, req: FederationRequest) -> Response {
    let room = match lookup_room(rooms, &req) {
        Ok(room) => room,
        Err(response) => return response,
    };
    let user_id = UserId::from(req.param("userId").unwrap_or_default());
    let template = match room.create_event(&EventSpec::membership(&user_id, "join")) {
        Ok(event) => event,
        Err(err) => {
            reporter.error(format!("make_join: cannot build join for {}: {}", user_id, err));
            return matrix_error(StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN", err.to_string());
        }
    };
    tracing::debug!(room = %room.room_id(), user = %user_id, "make_join");
    Json(RespMakeJoin {
        room_version: room.version().clone(),
        event: (*template).clone(),
    })
    .into_response()
}

fn partial_send_join(
    rooms: &Rooms,
    reporter: &Reporter,
    server_name: &ServerName,
    req: FederationRequest,
) -> Response {
    let room = match lookup_room(rooms, &req) {
        Ok(room) => room,
        Err(response) => return response,
    };
    let join: Event = match req.json() {
        Ok(event) => event,
        Err(err) => {
            reporter.error(format!("send_join: malformed join event: {}", err));
            return matrix_error(StatusCode::BAD_REQUEST, "M_BAD_JSON", err.to_string());
        }
    };

    room.add_event(join.clone());

    let state: Vec<Event> = room
        .all_current_state()
        .into_iter()
        .filter(|e| e.event_type != MEMBER)
        .collect();
    let mut auth_targets = state.clone();
    auth_targets.push(join.clone());
    let auth_chain = room.auth_chain_for_events(&auth_targets);

    let mut servers_in_room = vec![server_name.clone()];
    servers_in_room.extend(
        room.servers_in_room()
            .into_iter()
            .filter(|s| s != server_name),
    );

    tracing::info!(
        room = %room.room_id(),
        sender = %join.sender,
        state = state.len(),
        auth_chain = auth_chain.len(),
        "partial-state send_join"
    );
    Json(RespSendJoin {
        origin: server_name.clone(),
        state,
        auth_chain,
        event: Some(join),
        members_omitted: true,
        servers_in_room,
    })
    .into_response()
}

/// Serve `/_matrix/federation/v1/event/{eventId}` from any known room.
pub fn handle_event_requests() -> ServerOption {
    Box::new(|server: &Server| {
        let rooms = server.rooms().clone();
        let server_name = server.server_name().clone();
        server
            .mux()
            .new_route()
            .methods(Method::GET)
            .path("/_matrix/federation/v1/event/{eventId}")
            .handler(move |req| {
                let rooms = rooms.clone();
                let server_name = server_name.clone();
                async move {
                    let event_id = EventId::from(req.param("eventId").unwrap_or_default());
                    match rooms.find_event(&event_id) {
                        Some(event) => Json(RespEvent {
                            origin: server_name,
                            origin_server_ts: chrono::Utc::now().timestamp_millis(),
                            pdus: vec![event],
                        })
                        .into_response(),
                        None => matrix_error(
                            StatusCode::NOT_FOUND,
                            "M_NOT_FOUND",
                            format!("unknown event {}", event_id),
                        ),
                    }
                }
            });
    })
}

/// Serve `/_matrix/federation/v1/event_auth/{roomId}/{eventId}`.
pub fn handle_event_auth_requests() -> ServerOption {
    Box::new(|server: &Server| {
        let rooms = server.rooms().clone();
        server
            .mux()
            .new_route()
            .methods(Method::GET)
            .path("/_matrix/federation/v1/event_auth/{roomId}/{eventId}")
            .handler(move |req| {
                let rooms = rooms.clone();
                async move {
                    let room = match lookup_room(&rooms, &req) {
                        Ok(room) => room,
                        Err(response) => return response,
                    };
                    let event_id = EventId::from(req.param("eventId").unwrap_or_default());
                    let Some(event) = room.event(&event_id) else {
                        return matrix_error(
                            StatusCode::NOT_FOUND,
                            "M_NOT_FOUND",
                            format!("unknown event {}", event_id),
                        );
                    };
                    tracing::debug!(room = %room.room_id(), event = %event_id, "event_auth");
                    Json(RespEventAuth {
                        auth_chain: room.auth_chain_for_events(&[event]),
                    })
                    .into_response()
                }
            });
    })
}

/// Accept `/_matrix/federation/v1/send/{txnId}`, handing each PDU and EDU to
/// the callbacks. A missing callback ignores that kind.
pub fn handle_transaction_requests(
    on_pdu: Option<PduCallback>,
    on_edu: Option<EduCallback>,
) -> ServerOption {
    Box::new(move |server: &Server| {
        let reporter = server.reporter().clone();
        server
            .mux()
            .new_route()
            .methods(Method::PUT)
            .path("/_matrix/federation/v1/send/{txnId}")
            .handler(move |req| {
                let reporter = reporter.clone();
                let on_pdu = on_pdu.clone();
                let on_edu = on_edu.clone();
                async move {
                    let transaction: Transaction = match req.json() {
                        Ok(txn) => txn,
                        Err(err) => {
                            reporter.error(format!("malformed transaction: {}", err));
                            return matrix_error(StatusCode::BAD_REQUEST, "M_BAD_JSON", err.to_string());
                        }
                    };
                    let mut results = serde_json::Map::new();
                    for pdu in transaction.pdus {
                        match Event::from_json(pdu) {
                            Ok(event) => {
                                results.insert(event.event_id.to_string(), json!({}));
                                if let Some(callback) = &on_pdu {
                                    callback(event);
                                }
                            }
                            Err(err) => reporter.error(format!(
                                "transaction from {} carried a malformed PDU: {}",
                                transaction.origin, err
                            )),
                        }
                    }
                    if let Some(callback) = &on_edu {
                        for edu in transaction.edus {
                            callback(edu);
                        }
                    }
                    Json(json!({ "pdus": results })).into_response()
                }
            });
    })
}
