//! Client requests that must wait for the resync.

use anyhow::Result;
use psj_core::matching::{check_off_all, json_check_off, type_and_state_key};
use psj_core::sync::{lazy_loading_filter, sync_joined_to};
use psj_core::{HarnessConfig, Reporter};
use psj_infra::{Blueprint, Deployment, SyncReq};
use reqwest::Method;
use serde_json::{json, Value};

use super::{conclude, spawn_sync, synced_members};
use crate::orchestrator::PartialStateJoin;
use crate::probe::Probe;

/// A full `/sync` blocks while the joined room has partial state and
/// returns every member once the resync completes.
pub async fn sync_blocks_during_partial_state_join(config: HarnessConfig) -> Result<()> {
    let deployment = Deployment::deploy(Blueprint::alice(), &config).await?;
    let alice = deployment.client("hs1", "@alice:hs1")?;
    let psj = PartialStateJoin::begin(
        &deployment,
        alice.clone(),
        Reporter::new("sync_blocks_during_partial_state_join"),
        &config,
    )
    .await?;

    let outcome = async {
        let mut sync = spawn_sync(&alice, SyncReq::default());

        psj.await_state_ids_request().await?;
        sync.assert_pending()?;

        psj.finish_state_request();
        let (response, _) = sync.await_within(config.waits.probe_bound()).await??;

        let members: Vec<String> = synced_members(&response, psj.room_id())?
            .into_iter()
            .collect();
        check_off_all(
            &members,
            &[
                alice.user_id().to_string(),
                psj.server().user_id("charlie").to_string(),
                psj.server().user_id("derek").to_string(),
            ],
        )?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    conclude(&psj, outcome)
}

/// `/members?at=<token>` with a token from before the resync blocks until
/// the resync completes, then lists every member.
pub async fn members_request_blocks_during_partial_state_join(config: HarnessConfig) -> Result<()> {
    let deployment = Deployment::deploy(Blueprint::alice(), &config).await?;
    let alice = deployment.client("hs1", "@alice:hs1")?;
    let psj = PartialStateJoin::begin(
        &deployment,
        alice.clone(),
        Reporter::new("members_request_blocks_during_partial_state_join"),
        &config,
    )
    .await?;

    let outcome = async {
        let token = alice
            .sync_until(
                SyncReq::with_filter(lazy_loading_filter(None)),
                sync_joined_to(alice.user_id(), psj.room_id()),
            )
            .await?;

        let client = alice.clone();
        let room_id = psj.room_id().clone();
        let mut members = Probe::spawn("/members", async move {
            client
                .must_do_request(
                    Method::GET,
                    &["_matrix", "client", "v3", "rooms", room_id.as_str(), "members"],
                    &[("at", token.as_str())],
                    None,
                )
                .await
        });

        psj.await_state_ids_request().await?;
        members.assert_pending()?;

        psj.finish_state_request();
        let response: Value = members.await_within(config.waits.probe_bound()).await??;

        json_check_off(
            &response,
            "chunk",
            vec![
                json!(format!("m.room.member|{}", alice.user_id())),
                json!(format!("m.room.member|{}", psj.server().user_id("charlie"))),
                json!(format!("m.room.member|{}", psj.server().user_id("derek"))),
            ],
            type_and_state_key,
        )?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    conclude(&psj, outcome)
}
