//! Client-server API (`/_matrix/client/v3`).

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use psj_core::event::MEMBER;
use psj_core::{EventId, EventSpec, RoomId, RoomVersion, ServerName};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::HomeserverError;
use super::membership;
use super::sync::{build_sync_response, parse_token, SyncParams};
use super::HsContext;

pub(super) fn router() -> Router<HsContext> {
    Router::new()
        .route("/_matrix/client/v3/capabilities", get(capabilities))
        .route("/_matrix/client/v3/createRoom", post(create_room))
        .route("/_matrix/client/v3/join/{room_id}", post(join_room))
        .route("/_matrix/client/v3/sync", get(sync))
        .route("/_matrix/client/v3/rooms/{room_id}/members", get(members))
        .route(
            "/_matrix/client/v3/rooms/{room_id}/event/{event_id}",
            get(room_event),
        )
}

async fn capabilities(
    State(ctx): State<HsContext>,
    headers: HeaderMap,
) -> Result<Json<Value>, HomeserverError> {
    ctx.authenticate(&headers)?;
    let version = &ctx.config.default_room_version;
    Ok(Json(json!({
        "capabilities": {
            "m.room_versions": {
                "default": version,
                "available": { version.as_str(): "stable" },
            }
        }
    })))
}

async fn create_room(
    State(ctx): State<HsContext>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, HomeserverError> {
    let user_id = ctx.authenticate(&headers)?;
    let version = body
        .get("room_version")
        .and_then(Value::as_str)
        .map(RoomVersion::from)
        .unwrap_or_else(|| RoomVersion::from(ctx.config.default_room_version.as_str()));
    let join_rule = match body.get("preset").and_then(Value::as_str) {
        Some("public_chat") => "public",
        _ => "invite",
    };

    let room_id = RoomId::generate(&ctx.name);
    let specs = [
        EventSpec::create(&user_id, &version),
        EventSpec::membership(&user_id, "join"),
        EventSpec::power_levels(&user_id),
        EventSpec::join_rules(&user_id, join_rule),
        EventSpec::history_visibility(&user_id, "shared"),
    ];
    ctx.store.write(|s| {
        s.create_room(room_id.clone(), version.clone());
        specs
            .iter()
            .try_for_each(|spec| s.append_new(&room_id, spec).map(|_| ()))
    })?;

    tracing::info!(server = %ctx.name, room = %room_id, creator = %user_id, join_rule, "room created");
    Ok(Json(json!({ "room_id": room_id })))
}

async fn join_room(
    State(ctx): State<HsContext>,
    Path(room_id): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Json<Value>, HomeserverError> {
    let user_id = ctx.authenticate(&headers)?;
    let room_id = RoomId::from(room_id);
    let via: Vec<ServerName> = query
        .into_iter()
        .filter(|(key, _)| key == "server_name")
        .map(|(_, value)| ServerName::from(value))
        .collect();

    membership::join(&ctx, &room_id, &user_id, &via).await?;
    Ok(Json(json!({ "room_id": room_id })))
}

#[derive(Debug, Deserialize)]
struct SyncQuery {
    filter: Option<String>,
    since: Option<String>,
    timeout: Option<u64>,
}

async fn sync(
    State(ctx): State<HsContext>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, HomeserverError> {
    let user_id = ctx.authenticate(&headers)?;
    let filter = match &query.filter {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| HomeserverError::BadJson(format!("invalid filter: {}", e)))?,
        None => Value::Null,
    };
    let since = match &query.since {
        Some(token) => Some(
            parse_token(token)
                .ok_or_else(|| HomeserverError::BadJson(format!("invalid since token {}", token)))?,
        ),
        None => None,
    };
    let params = SyncParams { since, filter };

    if !params.lazy_load_members() {
        if ctx.store.read(|s| s.any_joined_room_partial(&user_id)) {
            tracing::debug!(server = %ctx.name, user = %user_id, "sync waiting for partial-state rooms");
        }
        ctx.store
            .wait_until(&ctx.shutdown, |s| !s.any_joined_room_partial(&user_id))
            .await?;
    }

    if let Some(since) = since {
        let timeout = Duration::from_millis(query.timeout.unwrap_or(0));
        let new_data = ctx
            .store
            .wait_until(&ctx.shutdown, |s| s.stream_position() > since);
        if let Ok(Err(err)) = tokio::time::timeout(timeout, new_data).await {
            return Err(err);
        }
    }

    Ok(Json(
        ctx.store
            .read(|s| build_sync_response(s, &user_id, &params)),
    ))
}

/// Members from current state. `at` is accepted but not honoured; the
/// request waits until the room's state is complete.
async fn members(
    State(ctx): State<HsContext>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, HomeserverError> {
    let user_id = ctx.authenticate(&headers)?;
    let room_id = RoomId::from(room_id);
    let joined = ctx
        .store
        .read(|s| s.room(&room_id).map(|r| r.is_joined(&user_id)));
    match joined {
        None => return Err(HomeserverError::NotFound(format!("unknown room {}", room_id))),
        Some(false) => {
            return Err(HomeserverError::Forbidden(format!(
                "{} is not in {}",
                user_id, room_id
            )))
        }
        Some(true) => {}
    }

    ctx.store
        .wait_until(&ctx.shutdown, |s| {
            s.room(&room_id).is_some_and(|r| !r.is_partial())
        })
        .await?;

    let chunk: Vec<Value> = ctx.store.read(|s| {
        s.room(&room_id)
            .map(|room| {
                room.state
                    .values()
                    .filter(|e| e.event_type == MEMBER)
                    .map(|e| e.to_client_format())
                    .collect()
            })
            .unwrap_or_default()
    });
    Ok(Json(json!({ "chunk": chunk })))
}

async fn room_event(
    State(ctx): State<HsContext>,
    Path((room_id, event_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, HomeserverError> {
    let user_id = ctx.authenticate(&headers)?;
    let room_id = RoomId::from(room_id);
    let event_id = EventId::from(event_id);

    ctx.store.read(|s| {
        let room = s
            .room(&room_id)
            .ok_or_else(|| HomeserverError::NotFound(format!("unknown room {}", room_id)))?;
        if !room.is_joined(&user_id) {
            return Err(HomeserverError::Forbidden(format!(
                "{} is not in {}",
                user_id, room_id
            )));
        }
        s.position_of(&room_id, &event_id)
            .and_then(|_| s.event(&event_id))
            .map(|event| Json(event.to_client_format()))
            .ok_or_else(|| HomeserverError::NotFound(format!("event {} not found", event_id)))
    })
}
