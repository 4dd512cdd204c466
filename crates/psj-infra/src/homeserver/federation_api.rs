//! Server-server API (`/_matrix/federation`).
//!
//! Requests carry an unsigned `X-Matrix` origin; nothing is verified beyond
//! its presence.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::routing::{get, put};
use axum::{Json, Router};
use psj_core::event::{auth_chain_for_events, event_ids, MEMBER};
use psj_core::federation::{
    parse_x_matrix_origin, RespEvent, RespEventAuth, RespMakeJoin, RespSendJoin, RespState,
    RespStateIds, Transaction,
};
use psj_core::{Event, EventId, EventSpec, RoomId, ServerName, UserId};
use serde_json::{json, Value};

use super::error::HomeserverError;
use super::store::StoreInner;
use super::HsContext;
use crate::http::encode_path;

pub(super) fn router() -> Router<HsContext> {
    Router::new()
        .route(
            "/_matrix/federation/v1/make_join/{room_id}/{user_id}",
            get(make_join),
        )
        .route(
            "/_matrix/federation/v2/send_join/{room_id}/{event_id}",
            put(send_join),
        )
        .route("/_matrix/federation/v1/send/{txn_id}", put(send_transaction))
        .route("/_matrix/federation/v1/state_ids/{room_id}", get(state_ids))
        .route("/_matrix/federation/v1/state/{room_id}", get(state))
        .route("/_matrix/federation/v1/event/{event_id}", get(event))
        .route(
            "/_matrix/federation/v1/event_auth/{room_id}/{event_id}",
            get(event_auth),
        )
}

fn origin(headers: &HeaderMap) -> Result<ServerName, HomeserverError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_x_matrix_origin)
        .ok_or(HomeserverError::MissingOrigin)
}

fn unknown_room(room_id: &RoomId) -> HomeserverError {
    HomeserverError::NotFound(format!("unknown room {}", room_id))
}

/// Auth chain of `events` from locally stored events.
fn auth_chain(store: &StoreInner, events: &[Event]) -> Vec<Event> {
    auth_chain_for_events(events, |id| store.event(id).cloned())
}

/// Rooms we only hold partial state for cannot vouch for it.
fn require_full_state(store: &StoreInner, room_id: &RoomId) -> Result<(), HomeserverError> {
    let room = store.room(room_id).ok_or_else(|| unknown_room(room_id))?;
    if room.is_partial() {
        return Err(HomeserverError::Forbidden(format!(
            "state of {} is not yet complete",
            room_id
        )));
    }
    Ok(())
}

async fn make_join(
    State(ctx): State<HsContext>,
    Path((room_id, user_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<RespMakeJoin>, HomeserverError> {
    let origin = origin(&headers)?;
    let room_id = RoomId::from(room_id);
    let user_id = UserId::from(user_id);

    ctx.store.read(|s| {
        require_full_state(s, &room_id)?;
        let template = s.template_event(&room_id, &EventSpec::membership(&user_id, "join"))?;
        let version = s
            .room(&room_id)
            .map(|r| r.version.clone())
            .unwrap_or_default();
        tracing::debug!(server = %ctx.name, %origin, room = %room_id, user = %user_id, "make_join");
        Ok(Json(RespMakeJoin {
            room_version: version,
            event: (*template).clone(),
        }))
    })
}

async fn send_join(
    State(ctx): State<HsContext>,
    Path((room_id, event_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<RespSendJoin>, HomeserverError> {
    let origin = origin(&headers)?;
    let room_id = RoomId::from(room_id);
    let join = Event::from_json(body)?;
    if join.room_id != room_id || join.event_id.as_str() != event_id {
        return Err(HomeserverError::BadJson(
            "join event does not match the request path".to_string(),
        ));
    }
    let omit_members = query.get("omit_members").is_some_and(|v| v == "true");

    let response = ctx.store.write(|s| {
        require_full_state(s, &room_id)?;
        let mut state: Vec<Event> = s
            .room(&room_id)
            .map(|r| r.state.values().cloned().collect())
            .unwrap_or_default();
        let mut targets = state.clone();
        targets.push(join.clone());
        let auth_chain = auth_chain(s, &targets);

        s.append(join.clone());

        if omit_members {
            state.retain(|e| e.event_type != MEMBER);
        }
        let mut servers_in_room = vec![ctx.name.clone()];
        servers_in_room.extend(
            s.room(&room_id)
                .map(|r| r.joined_servers())
                .unwrap_or_default()
                .into_iter()
                .filter(|server| *server != ctx.name),
        );
        Ok::<_, HomeserverError>(RespSendJoin {
            origin: ctx.name.clone(),
            state,
            auth_chain,
            event: Some(join.clone()),
            members_omitted: omit_members,
            servers_in_room,
        })
    })?;

    tracing::info!(
        server = %ctx.name,
        %origin,
        room = %room_id,
        sender = %join.sender,
        omit_members,
        "accepted send_join"
    );
    Ok(Json(response))
}

async fn send_transaction(
    State(ctx): State<HsContext>,
    Path(txn_id): Path<String>,
    headers: HeaderMap,
    Json(transaction): Json<Transaction>,
) -> Result<Json<Value>, HomeserverError> {
    let origin = origin(&headers)?;
    tracing::debug!(server = %ctx.name, %origin, %txn_id, pdus = transaction.pdus.len(), "transaction received");

    let task_ctx = ctx.clone();
    tokio::spawn(async move {
        let shutdown = task_ctx.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => {}
            () = process_transaction(&task_ctx, origin, transaction) => {}
        }
    });
    Ok(Json(json!({ "pdus": {} })))
}

async fn process_transaction(ctx: &HsContext, origin: ServerName, transaction: Transaction) {
    for raw in transaction.pdus {
        let event = match Event::from_json(raw) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(server = %ctx.name, %origin, error = %err, "dropping malformed PDU");
                continue;
            }
        };
        let partial = ctx
            .store
            .read(|s| s.room(&event.room_id).map(|r| r.is_partial()));
        let Some(partial) = partial else {
            tracing::debug!(server = %ctx.name, room = %event.room_id, "PDU for unknown room");
            continue;
        };

        if partial {
            if let Err(err) = fetch_auth_chain(ctx, &origin, &event).await {
                tracing::warn!(server = %ctx.name, %origin, event = %event.event_id, error = %err, "could not fetch auth chain");
            }
        }

        let event_id = event.event_id.clone();
        let position = ctx.store.write(|s| s.append(event));
        tracing::info!(server = %ctx.name, %origin, event = %event_id, ?position, partial, "PDU persisted");
    }
}

async fn fetch_auth_chain(
    ctx: &HsContext,
    origin: &ServerName,
    event: &Event,
) -> Result<(), HomeserverError> {
    let path = encode_path(&[
        "_matrix",
        "federation",
        "v1",
        "event_auth",
        event.room_id.as_str(),
        event.event_id.as_str(),
    ]);
    let response: RespEventAuth = ctx.federation.get(origin, &path, &[]).await?;
    ctx.store.write(|s| {
        for auth_event in response.auth_chain {
            s.store_outlier(auth_event);
        }
    });
    Ok(())
}

/// Current state of a room for `origin`, which must have a joined member.
fn state_for_origin(
    store: &StoreInner,
    origin: &ServerName,
    room_id: &RoomId,
    at: Option<&str>,
) -> Result<Vec<Event>, HomeserverError> {
    require_full_state(store, room_id)?;
    let room = store.room(room_id).ok_or_else(|| unknown_room(room_id))?;
    if !room.joined_servers().contains(origin) {
        return Err(HomeserverError::Forbidden(format!(
            "{} has no joined member in {}",
            origin, room_id
        )));
    }
    let at = at.ok_or_else(|| HomeserverError::BadJson("missing event_id".to_string()))?;
    if !store.has_event(&EventId::from(at)) {
        return Err(HomeserverError::NotFound(format!("unknown event {}", at)));
    }
    Ok(room.state.values().cloned().collect())
}

async fn state_ids(
    State(ctx): State<HsContext>,
    Path(room_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<RespStateIds>, HomeserverError> {
    let origin = origin(&headers)?;
    let room_id = RoomId::from(room_id);
    let at = query.get("event_id").map(String::as_str);

    let response = ctx.store.read(|s| {
        let state = state_for_origin(s, &origin, &room_id, at)?;
        let auth_chain = auth_chain(s, &state);
        Ok::<_, HomeserverError>(RespStateIds {
            pdu_ids: event_ids(&state),
            auth_chain_ids: event_ids(&auth_chain),
        })
    })?;
    tracing::debug!(server = %ctx.name, %origin, room = %room_id, state = response.pdu_ids.len(), "served state_ids");
    Ok(Json(response))
}

async fn state(
    State(ctx): State<HsContext>,
    Path(room_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<RespState>, HomeserverError> {
    let origin = origin(&headers)?;
    let room_id = RoomId::from(room_id);
    let at = query.get("event_id").map(String::as_str);

    let response = ctx.store.read(|s| {
        let state = state_for_origin(s, &origin, &room_id, at)?;
        let auth_chain = auth_chain(s, &state);
        Ok::<_, HomeserverError>(RespState {
            pdus: state,
            auth_chain,
        })
    })?;
    tracing::debug!(server = %ctx.name, %origin, room = %room_id, state = response.pdus.len(), "served state");
    Ok(Json(response))
}

async fn event(
    State(ctx): State<HsContext>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RespEvent>, HomeserverError> {
    origin(&headers)?;
    let event_id = EventId::from(event_id);
    let event = ctx
        .store
        .read(|s| s.event(&event_id).cloned())
        .ok_or_else(|| HomeserverError::NotFound(format!("unknown event {}", event_id)))?;
    Ok(Json(RespEvent {
        origin: ctx.name.clone(),
        origin_server_ts: chrono::Utc::now().timestamp_millis(),
        pdus: vec![event],
    }))
}

async fn event_auth(
    State(ctx): State<HsContext>,
    Path((room_id, event_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<RespEventAuth>, HomeserverError> {
    origin(&headers)?;
    let room_id = RoomId::from(room_id);
    let event_id = EventId::from(event_id);
    ctx.store.read(|s| {
        s.room(&room_id).ok_or_else(|| unknown_room(&room_id))?;
        let event = s
            .event(&event_id)
            .filter(|e| e.room_id == room_id)
            .ok_or_else(|| HomeserverError::NotFound(format!("unknown event {}", event_id)))?;
        Ok(Json(RespEventAuth {
            auth_chain: auth_chain(s, std::slice::from_ref(event)),
        }))
    })
}
