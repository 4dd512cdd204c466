use std::io::Write;

use psj_harness_lib::runner;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runs_selected_scenario_with_file_config() {
    let file = write_config(
        r#"
[waits]
probe_bound_ms = 2000
sync_until_ms = 8000
"#,
    );
    let config = psj_infra::config::load_config(Some(file.path())).unwrap();
    assert_eq!(config.waits.probe_bound_ms, 2000);

    let selected =
        runner::select(&["can_lazy_loading_sync_during_partial_state_join".to_string()]).unwrap();
    let outcomes = runner::run_all(&selected, &config).await;

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].passed(), "{}", outcomes[0]);
}

#[test]
fn test_unknown_scenario_is_rejected_before_running() {
    let err = runner::select(&["does_not_exist".to_string()]).unwrap_err();
    assert!(err.to_string().contains("does_not_exist"));
}
