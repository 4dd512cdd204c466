//! Lazy-loading syncs around a partial-state join.

use anyhow::{anyhow, bail, Result};
use psj_core::matching::{
    event_id_of, get_path, json_check_off, json_check_off_allow_unwanted, type_and_state_key,
};
use psj_core::sync::{lazy_loading_filter, sync_joined_to};
use psj_core::{HarnessConfig, Reporter};
use psj_infra::{Blueprint, Deployment, SyncReq};
use serde_json::{json, Map, Value};

use super::{await_event_arrival, conclude};
use crate::orchestrator::PartialStateJoin;

/// A lazy-loading sync does not wait for the resync.
pub async fn can_lazy_loading_sync_during_partial_state_join(config: HarnessConfig) -> Result<()> {
    let deployment = Deployment::deploy(Blueprint::alice(), &config).await?;
    let alice = deployment.client("hs1", "@alice:hs1")?;
    let psj = PartialStateJoin::begin(
        &deployment,
        alice.clone(),
        Reporter::new("can_lazy_loading_sync_during_partial_state_join"),
        &config,
    )
    .await?;

    let outcome = async {
        alice
            .sync_until(
                SyncReq::with_filter(lazy_loading_filter(None)),
                sync_joined_to(alice.user_id(), psj.room_id()),
            )
            .await?;
        tracing::info!(phase = %psj.phase(), "lazy-loading sync completed");
        psj.finish_state_request();
        Ok::<_, anyhow::Error>(())
    }
    .await;
    conclude(&psj, outcome)
}

/// After the resync, a gappy lazy-loading sync from a token taken during
/// the partial-state window shows only the newest event and brings in the
/// membership of its sender.
pub async fn gappy_sync_after_partial_state_synced(config: HarnessConfig) -> Result<()> {
    let deployment = Deployment::deploy(Blueprint::alice(), &config).await?;
    let alice = deployment.client("hs1", "@alice:hs1")?;
    let psj = PartialStateJoin::begin(
        &deployment,
        alice.clone(),
        Reporter::new("gappy_sync_after_partial_state_synced"),
        &config,
    )
    .await?;

    let outcome = async {
        let sync_token = alice
            .sync_until(
                SyncReq::with_filter(lazy_loading_filter(None)),
                sync_joined_to(alice.user_id(), psj.room_id()),
            )
            .await?;

        psj.finish_state_request();
        psj.await_full_state().await?;

        let event1 = psj.create_message_event("derek", "Message 1")?;
        let event2 = psj.create_message_event("derek", "Message 2")?;
        psj.server()
            .must_send_transaction(
                alice.server_name(),
                vec![event1.to_json(), event2.to_json()],
                Vec::new(),
            )
            .await?;
        await_event_arrival(&alice, psj.room_id(), &event2.event_id, &config).await?;

        let mut timeline_options = Map::new();
        timeline_options.insert("limit".to_string(), json!(1));
        let (response, _) = alice
            .sync(&SyncReq {
                filter: Some(lazy_loading_filter(Some(timeline_options))),
                since: Some(sync_token),
                timeout_ms: None,
            })
            .await?;

        let room = response
            .get("rooms")
            .and_then(|rooms| rooms.get("join"))
            .and_then(|join| join.get(psj.room_id().as_str()))
            .ok_or_else(|| anyhow!("room {} missing from gappy sync", psj.room_id()))?;

        let derek = psj.server().user_id("derek");
        json_check_off_allow_unwanted(
            room,
            "state.events",
            vec![json!(format!("m.room.member|{}", derek))],
            type_and_state_key,
        )?;

        if get_path(room, "timeline.limited").and_then(Value::as_bool) != Some(true) {
            bail!("gappy sync timeline is not limited: {}", room);
        }
        json_check_off(
            room,
            "timeline.events",
            vec![json!(event2.event_id)],
            event_id_of,
        )?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    conclude(&psj, outcome)
}
