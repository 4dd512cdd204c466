use std::sync::{Arc, Mutex};

use axum::http::{Method, StatusCode};
use psj_core::event::MEMBER;
use psj_core::{HarnessConfig, Reporter, RoomId, RoomVersion, ServerName};
use psj_infra::deployment::Network;
use psj_infra::federation::{handle_event_requests, handle_key_requests, Server};
use psj_infra::http::matrix_error;
use psj_infra::{Blueprint, Deployment};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_joined_room_state_includes_resident_members() {
    let config = HarnessConfig::default();
    let deployment = Deployment::deploy(Blueprint::alice(), &config).await.unwrap();
    let alice = deployment.client("hs1", "@alice:hs1").unwrap();
    let reporter = Reporter::new("joined_room_state_includes_resident_members");
    let server = Server::new(
        deployment.directory(),
        reporter.clone(),
        vec![handle_key_requests(), handle_event_requests()],
    )
    .unwrap();
    let _listener = server.listen().unwrap();

    let room_id = alice
        .create_room(json!({ "preset": "public_chat" }))
        .await
        .unwrap();
    let derek = server.user_id("derek");
    let room = server
        .must_join_room(&ServerName::from("hs1"), &room_id, &derek)
        .await
        .unwrap();

    // alice's membership also arrives in the auth chain; it must still
    // count as current state.
    assert!(room.current_state(MEMBER, alice.user_id().as_str()).is_some());
    assert!(room.current_state(MEMBER, derek.as_str()).is_some());
    assert_eq!(
        room.servers_in_room(),
        {
            let mut expected = vec![ServerName::from("hs1"), server.server_name().clone()];
            expected.sort();
            expected
        }
    );
    assert!(!reporter.has_failed(), "{:?}", reporter.failures());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_make_join_advertises_default_room_version() {
    let network = Arc::new(Network::new());
    let resident = Server::new(network.clone(), Reporter::new("resident"), Vec::new()).unwrap();
    let seen_versions = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = seen_versions.clone();
    resident
        .mux()
        .new_route()
        .methods(Method::GET)
        .path("/_matrix/federation/v1/make_join/{room_id}/{user_id}")
        .handler(move |req| {
            let recorder = recorder.clone();
            async move {
                if let Some(ver) = req.query_param("ver") {
                    recorder.lock().unwrap().push(ver.to_string());
                }
                matrix_error(StatusCode::BAD_REQUEST, "M_FORBIDDEN", "not accepting joins")
            }
        });
    let _listener = resident.listen().unwrap();

    let joiner = Server::new(network, Reporter::new("joiner"), Vec::new()).unwrap();
    let room_id = RoomId::from(format!("!room:{}", resident.server_name()));
    let result = joiner
        .must_join_room(resident.server_name(), &room_id, &joiner.user_id("derek"))
        .await;

    assert!(result.is_err());
    assert_eq!(
        *seen_versions.lock().unwrap(),
        vec![RoomVersion::default().as_str().to_string()]
    );
}
