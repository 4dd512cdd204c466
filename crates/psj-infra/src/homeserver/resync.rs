//! Background resync of partial-state rooms.
//!
//! Asks each candidate server in turn for the state at our join's
//! predecessor. A failed or malformed answer moves on to the next server;
//! after a full round the task backs off and starts over. It ends when the
//! state is complete or the run shuts down.

use std::collections::HashSet;

use psj_core::federation::{RespEvent, RespState, RespStateIds};
use psj_core::{Event, EventId, RoomId, ServerName};
use tracing::Instrument;

use super::error::HomeserverError;
use super::HsContext;
use crate::http::encode_path;

pub(super) fn spawn(ctx: HsContext, room_id: RoomId) {
    let span = tracing::info_span!("resync", server = %ctx.name, room = %room_id);
    tokio::spawn(
        async move {
            let shutdown = ctx.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => tracing::debug!("resync interrupted by shutdown"),
                () = resync_room(&ctx, &room_id) => {}
            }
        }
        .instrument(span),
    );
}

async fn resync_room(ctx: &HsContext, room_id: &RoomId) {
    let target = ctx.store.read(|s| {
        let partial = s.room(room_id)?.partial.clone()?;
        let at = s.event(&partial.join_event)?.prev_events.first()?.clone();
        Some((at, partial.servers))
    });
    let Some((at, servers)) = target else {
        tracing::warn!("room has no resumable partial state");
        return;
    };
    if servers.is_empty() {
        tracing::warn!("no servers to resync from");
        return;
    }

    let mut round = 0u32;
    loop {
        round += 1;
        for server in &servers {
            match fetch_state(ctx, server, room_id, &at).await {
                Ok(state) => {
                    let size = state.len();
                    ctx.store
                        .write(|s| s.complete_partial_state(room_id, state));
                    tracing::info!(%server, state = size, round, "partial state resolved");
                    return;
                }
                Err(err) => {
                    tracing::warn!(%server, round, error = %err, "state fetch failed, trying next server");
                }
            }
        }
        tokio::time::sleep(ctx.config.resync_retry_backoff()).await;
    }
}

/// State at `at` according to `server`, with every event persisted locally.
async fn fetch_state(
    ctx: &HsContext,
    server: &ServerName,
    room_id: &RoomId,
    at: &EventId,
) -> Result<Vec<Event>, HomeserverError> {
    let path = encode_path(&["_matrix", "federation", "v1", "state_ids", room_id.as_str()]);
    let ids: RespStateIds = ctx
        .federation
        .get(server, &path, &[("event_id", at.as_str())])
        .await?;
    tracing::debug!(%server, state = ids.pdu_ids.len(), auth_chain = ids.auth_chain_ids.len(), "received state ids");

    let missing: Vec<EventId> = ctx.store.read(|s| {
        let mut seen = HashSet::new();
        ids.pdu_ids
            .iter()
            .chain(&ids.auth_chain_ids)
            .filter(|id| !s.has_event(id) && seen.insert(*id))
            .cloned()
            .collect()
    });

    if missing.len() > ctx.config.resync_event_fetch_limit {
        tracing::debug!(%server, missing = missing.len(), "fetching full state");
        let path = encode_path(&["_matrix", "federation", "v1", "state", room_id.as_str()]);
        let state: RespState = ctx
            .federation
            .get(server, &path, &[("event_id", at.as_str())])
            .await?;
        ctx.store.write(|s| {
            for event in state.pdus.into_iter().chain(state.auth_chain) {
                s.store_outlier(event);
            }
        });
    } else {
        for event_id in &missing {
            let path = encode_path(&["_matrix", "federation", "v1", "event", event_id.as_str()]);
            let response: RespEvent = ctx.federation.get(server, &path, &[]).await?;
            let event = response
                .pdus
                .into_iter()
                .find(|e| e.event_id == *event_id)
                .ok_or_else(|| {
                    HomeserverError::NotFound(format!("{} did not return {}", server, event_id))
                })?;
            ctx.store.write(|s| s.store_outlier(event));
        }
    }

    ctx.store.read(|s| {
        ids.pdu_ids
            .iter()
            .map(|id| {
                s.event(id).cloned().ok_or_else(|| {
                    HomeserverError::NotFound(format!("state event {} still missing", id))
                })
            })
            .collect()
    })
}
