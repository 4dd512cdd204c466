//! Events pushed over federation while the resync is pending.

use anyhow::{Context, Result};
use psj_core::event::event_ids;
use psj_core::federation::RespStateIds;
use psj_core::matching::check_off_all;
use psj_core::sync::sync_timeline_has_event_id;
use psj_core::{HarnessConfig, Reporter};
use psj_infra::federation::handle_event_auth_requests;
use psj_infra::http::encode_path;
use psj_infra::{Blueprint, Deployment, SyncReq};
use reqwest::Method;

use super::{await_event_arrival, conclude};
use crate::orchestrator::PartialStateJoin;

/// A message received during the partial-state window can be fetched by id
/// before the resync finishes. Afterwards the homeserver's state at that
/// message matches the mock room's.
pub async fn can_receive_events_during_partial_state_join(config: HarnessConfig) -> Result<()> {
    let deployment = Deployment::deploy(Blueprint::alice(), &config).await?;
    let alice = deployment.client("hs1", "@alice:hs1")?;
    let psj = PartialStateJoin::begin_with(
        &deployment,
        alice.clone(),
        Reporter::new("can_receive_events_during_partial_state_join"),
        &config,
        vec![handle_event_auth_requests()],
    )
    .await?;

    let outcome = async {
        let event = psj.create_message_event("derek", "Message during the resync")?;
        psj.server()
            .must_send_transaction(alice.server_name(), vec![event.to_json()], Vec::new())
            .await?;
        await_event_arrival(&alice, psj.room_id(), &event.event_id, &config)
            .await
            .context("event sent during the resync was not fetchable")?;

        psj.finish_state_request();
        psj.await_full_state().await?;
        alice
            .sync_until(
                SyncReq::default(),
                sync_timeline_has_event_id(psj.room_id(), &event.event_id),
            )
            .await
            .context("received event missing from the synced timeline")?;

        let path = encode_path(&[
            "_matrix",
            "federation",
            "v1",
            "state_ids",
            psj.room_id().as_str(),
        ]);
        let state_ids: RespStateIds = psj
            .server()
            .send_federation_request(
                Method::GET,
                alice.server_name(),
                &path,
                &[("event_id", event.event_id.as_str())],
            )
            .await
            .with_context(|| format!("/state_ids at {} failed", event.event_id))?;

        let expected = event_ids(&psj.server_room().all_current_state());
        check_off_all(&state_ids.pdu_ids, &expected)
            .context("state at the received event differs from the mock room")?;
        Ok::<_, anyhow::Error>(())
    }
    .await;
    conclude(&psj, outcome)
}
