use anyhow::{Context, Result};
use psj_core::matching::check_off_all;
use psj_core::{HarnessConfig, Reporter};
use psj_infra::{Blueprint, Deployment, SyncReq};

use super::{conclude, spawn_sync, synced_members};
use crate::orchestrator::PartialStateJoin;

/// Restarting the homeserver mid-resync resumes the resync: a fresh
/// `/state_ids` request reaches the still-registered gate and the blocked
/// sync completes once it is released.
pub async fn partial_state_join_continues_after_restart(config: HarnessConfig) -> Result<()> {
    let deployment = Deployment::deploy(Blueprint::alice(), &config).await?;
    let alice = deployment.client("hs1", "@alice:hs1")?;
    let psj = PartialStateJoin::begin(
        &deployment,
        alice.clone(),
        Reporter::new("partial_state_join_continues_after_restart"),
        &config,
    )
    .await?;

    let outcome = async {
        psj.await_state_ids_request().await?;
        let before_restart = psj.state_ids_requests_received();

        deployment.restart().await.context("Failed to restart hs1")?;

        let mut sync = spawn_sync(&alice, SyncReq::default());

        // The arrival waiter is single-use; a new request shows up as one
        // more arrival at the same gate.
        psj.await_state_ids_requests(before_restart + 1).await?;
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
