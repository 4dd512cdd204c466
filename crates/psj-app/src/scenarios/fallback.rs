use anyhow::{anyhow, Context, Result};
use psj_core::event::MEMBER;
use psj_core::sync::sync_joined_to;
use psj_core::{HarnessConfig, Reporter, ServerName, Waiter};
use psj_infra::{Blueprint, Deployment, SyncReq};
use serde_json::json;

use super::spawn_sync;
use crate::gated_handler::{handle_malformed_state_ids_requests, Gate};
use crate::orchestrator::create_test_server;

const SCENARIO: &str = "partial_state_join_syncs_using_other_homeservers";

/// hs2 joins a room through the mock peer, which then answers hs2's
/// `/state_ids` with an empty body. hs2 has to fetch the state from hs1
/// instead and its sync eventually shows charlie joined.
///
/// The room lives on hs1 (created by alice); the mock peer joined it as
/// `derek` and serves as the relay hs2 joins through.
pub async fn partial_state_join_syncs_using_other_homeservers(config: HarnessConfig) -> Result<()> {
    let deployment = Deployment::deploy(Blueprint::federation_two_local_one_remote(), &config).await?;
    let alice = deployment.client("hs1", "@alice:hs1")?;
    let charlie = deployment.client("hs2", "@charlie:hs2")?;
    let reporter = Reporter::new(SCENARIO);

    let server = create_test_server(&deployment, reporter.clone(), Vec::new())?;
    let cancel_listener = server.listen()?;

    let arrived = Waiter::new();
    let release = Waiter::new();

    let outcome = async {
        let room_id = alice.create_room(json!({ "preset": "public_chat" })).await?;
        let hs1 = ServerName::from("hs1");
        let server_room = server
            .must_join_room(&hs1, &room_id, &server.user_id("derek"))
            .await?;

        handle_malformed_state_ids_requests(
            &server,
            &room_id,
            Gate::new(arrived.clone(), release.clone()),
            config.waits.release_bound(),
        );

        charlie
            .join_room(&room_id, &[server.server_name().clone()])
            .await?;

        // Only the mock saw charlie's join; hs1 needs it to serve hs2.
        let charlie_join = server_room
            .current_state(MEMBER, charlie.user_id().as_str())
            .ok_or_else(|| anyhow!("mock room has no join for {}", charlie.user_id()))?;
        server
            .must_send_transaction(&hs1, vec![charlie_join.to_json()], Vec::new())
            .await?;
        alice
            .sync_until(SyncReq::default(), sync_joined_to(charlie.user_id(), &room_id))
            .await
            .context("hs1 never saw charlie join")?;

        arrived
            .waitf(config.waits.await_request(), "Waiting for /state_ids request")
            .await?;

        let mut sync = spawn_sync(&charlie, SyncReq::default());
        sync.assert_pending()?;

        release.finish();
        let (response, _) = sync.await_within(config.waits.sync_until()).await??;
        sync_joined_to(charlie.user_id(), &room_id)(charlie.user_id(), &response)
            .context("charlie's sync after the fallback resync")?;
        Ok::<_, anyhow::Error>(())
    }
    .await;

    arrived.finish();
    release.finish();
    cancel_listener.cancel();
    outcome?;
    reporter.check()?;
    Ok(())
}
