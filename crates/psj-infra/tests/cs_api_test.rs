use anyhow::anyhow;
use psj_core::HarnessConfig;
use psj_infra::{Blueprint, Deployment, SyncReq};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_until_timeout_reports_last_check_failure() {
    let mut config = HarnessConfig::default();
    config.waits.sync_until_ms = 1_500;
    let deployment = Deployment::deploy(Blueprint::alice(), &config).await.unwrap();
    let alice = deployment.client("hs1", "@alice:hs1").unwrap();

    let err = alice
        .sync_until(
            SyncReq::default(),
            Box::new(|_, _| Err(anyhow!("room !never:hs1 is not joined yet"))),
        )
        .await
        .unwrap_err();

    let message = format!("{err:#}");
    assert!(message.contains("did not pass within"), "{message}");
    assert!(message.contains("room !never:hs1 is not joined yet"), "{message}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_until_returns_token_once_check_passes() {
    let config = HarnessConfig::default();
    let deployment = Deployment::deploy(Blueprint::alice(), &config).await.unwrap();
    let alice = deployment.client("hs1", "@alice:hs1").unwrap();

    let token = alice
        .sync_until(SyncReq::default(), Box::new(|_, _| Ok(())))
        .await
        .unwrap();
    assert!(!token.is_empty());
}
