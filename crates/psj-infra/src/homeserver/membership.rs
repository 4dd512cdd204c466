//! Joining rooms, locally or over federation.

use psj_core::federation::{RespMakeJoin, RespSendJoin};
use psj_core::{EventSpec, RoomId, ServerName, StateMap, UserId};

use super::error::HomeserverError;
use super::store::PartialState;
use super::HsContext;
use crate::http::encode_path;

/// Join `user_id` to `room_id`, over federation via `via` unless the room is
/// already known here.
pub async fn join(
    ctx: &HsContext,
    room_id: &RoomId,
    user_id: &UserId,
    via: &[ServerName],
) -> Result<(), HomeserverError> {
    let known = ctx.store.read(|s| s.room(room_id).map(|r| r.is_joined(user_id)));
    match known {
        Some(true) => Ok(()),
        Some(false) => {
            let event = ctx
                .store
                .write(|s| s.append_new(room_id, &EventSpec::membership(user_id, "join")))?;
            tracing::info!(server = %ctx.name, room = %room_id, user = %user_id, event = %event.event_id, "local join");
            Ok(())
        }
        None => remote_join(ctx, room_id, user_id, via).await,
    }
}

async fn remote_join(
    ctx: &HsContext,
    room_id: &RoomId,
    user_id: &UserId,
    via: &[ServerName],
) -> Result<(), HomeserverError> {
    let mut last_error = HomeserverError::NotFound(format!("no server to join {} via", room_id));
    for server in via.iter().filter(|s| **s != ctx.name) {
        match join_via(ctx, server, room_id, user_id).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(server = %ctx.name, via = %server, room = %room_id, error = %err, "join attempt failed");
                last_error = err;
            }
        }
    }
    Err(last_error)
}

async fn join_via(
    ctx: &HsContext,
    server: &ServerName,
    room_id: &RoomId,
    user_id: &UserId,
) -> Result<(), HomeserverError> {
    let path = encode_path(&[
        "_matrix",
        "federation",
        "v1",
        "make_join",
        room_id.as_str(),
        user_id.as_str(),
    ]);
    let make_join: RespMakeJoin = ctx
        .federation
        .get(server, &path, &[("ver", ctx.config.default_room_version.as_str())])
        .await?;

    let mut proto = make_join.event;
    proto.origin_server_ts = chrono::Utc::now().timestamp_millis();
    let join = proto.finalize()?;

    let path = encode_path(&[
        "_matrix",
        "federation",
        "v2",
        "send_join",
        room_id.as_str(),
        join.event_id.as_str(),
    ]);
    let send_join: RespSendJoin = ctx
        .federation
        .put(server, &path, &[("omit_members", "true")], &join.to_json())
        .await?;

    let partial = send_join.members_omitted.then(|| PartialState {
        join_event: join.event_id.clone(),
        servers: resync_candidates(server, &send_join.servers_in_room, &ctx.name),
    });
    let is_partial = partial.is_some();
    let state_size = send_join.state.len();

    ctx.store.write(|s| {
        let mut state = StateMap::new();
        for event in send_join.auth_chain {
            s.store_outlier(event);
        }
        for event in send_join.state {
            if let Some(key) = event.state_tuple() {
                state.insert(key, event.clone());
            }
            s.store_outlier(event);
        }
        let room = s.create_room(room_id.clone(), make_join.room_version.clone());
        room.state = state;
        room.partial = partial;
        s.append(join);
    });

    tracing::info!(
        server = %ctx.name,
        room = %room_id,
        user = %user_id,
        via = %server,
        state = state_size,
        partial = is_partial,
        "joined over federation"
    );
    if is_partial {
        ctx.spawn_resync(room_id.clone());
    }
    Ok(())
}

/// The server we joined through first, then the other resident servers.
fn resync_candidates(
    via: &ServerName,
    servers_in_room: &[ServerName],
    own_name: &ServerName,
) -> Vec<ServerName> {
    let mut candidates = vec![via.clone()];
    for server in servers_in_room {
        if server != own_name && !candidates.contains(server) {
            candidates.push(server.clone());
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_candidates_put_via_first_and_skip_self() {
        let mock = ServerName::from("127.0.0.1:9000");
        let hs1 = ServerName::from("hs1");
        let hs2 = ServerName::from("hs2");

        let candidates =
            resync_candidates(&mock, &[hs1.clone(), mock.clone(), hs2.clone()], &hs2);

        assert_eq!(candidates, vec![mock, hs1]);
    }
}
