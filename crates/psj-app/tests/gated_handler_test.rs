use std::sync::Arc;
use std::time::Duration;

use psj_app::gated_handler::{
    handle_malformed_state_ids_requests, handle_state_ids_requests, Gate,
};
use psj_app::testing::init_test_tracing;
use psj_app::Probe;
use psj_core::event::{event_ids, initial_room_events};
use psj_core::federation::RespStateIds;
use psj_core::{EventSpec, Reporter, RoomVersion, Waiter};
use psj_infra::deployment::Network;
use psj_infra::federation::{CancelListener, Server, ServerRoom};
use psj_infra::http::encode_path;
use serde_json::Value;

struct Fixture {
    server: Server,
    room: Arc<ServerRoom>,
    _listener: CancelListener,
}

fn fixture(scenario: &str) -> Fixture {
    init_test_tracing();
    let server = Server::new(Arc::new(Network::new()), Reporter::new(scenario), Vec::new()).unwrap();
    let version = RoomVersion::from("10");
    let charlie = server.user_id("charlie");
    let room = server
        .must_make_room(version.clone(), initial_room_events(&version, &charlie))
        .unwrap();
    let derek_join = server
        .must_create_event(&room, EventSpec::membership(&server.user_id("derek"), "join"))
        .unwrap();
    room.add_event(derek_join);
    let listener = server.listen().unwrap();
    Fixture {
        server,
        room,
        _listener: listener,
    }
}

fn state_ids_url(server: &Server, room: &ServerRoom, event_id: &str) -> String {
    let path = encode_path(&["_matrix", "federation", "v1", "state_ids", room.room_id().as_str()]);
    let query = psj_infra::http::path_segment(event_id);
    format!("http://{}{}?event_id={}", server.server_name(), path, query)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_response_is_held_until_release() {
    let fx = fixture("held_until_release");
    let latest = fx.room.latest_event().unwrap();
    let state = fx.room.all_current_state();
    let arrived = Waiter::new();
    let release = Waiter::new();
    handle_state_ids_requests(
        &fx.server,
        &fx.room,
        &latest.event_id,
        &state,
        Gate::new(arrived.clone(), release.clone()),
        Duration::from_secs(30),
    );

    let url = state_ids_url(&fx.server, &fx.room, latest.event_id.as_str());
    let mut request = Probe::spawn("state_ids", async move {
        let response = reqwest::get(url).await?;
        let status = response.status();
        let body: RespStateIds = response.json().await?;
        Ok::<_, reqwest::Error>((status, body))
    });

    arrived
        .waitf(Duration::from_secs(5), "Waiting for /state_ids request")
        .await
        .unwrap();
    request.assert_pending().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    request.assert_pending().unwrap();

    release.finish();
    let (status, body) = request
        .await_within(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    assert!(status.is_success());
    assert_eq!(body.pdu_ids, event_ids(&state));
    assert!(!body.auth_chain_ids.is_empty());
    assert!(fx.server.reporter().check().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_other_event_id_is_an_unexpected_request() {
    let fx = fixture("unexpected_event_id");
    let latest = fx.room.latest_event().unwrap();
    let state = fx.room.all_current_state();
    handle_state_ids_requests(
        &fx.server,
        &fx.room,
        &latest.event_id,
        &state,
        Gate::open(),
        Duration::from_secs(30),
    );

    let url = state_ids_url(&fx.server, &fx.room, "$somewhere-else");
    let response = reqwest::get(url).await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let failures = fx.server.reporter().check().unwrap_err().failures;
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("unexpected request"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registrations_for_different_events_do_not_interfere() {
    let fx = fixture("two_registrations");
    let first = fx.room.latest_event().unwrap();
    let first_state = fx.room.all_current_state();
    let held = Waiter::new();
    handle_state_ids_requests(
        &fx.server,
        &fx.room,
        &first.event_id,
        &first_state,
        Gate::new(Waiter::new(), held.clone()),
        Duration::from_secs(30),
    );

    let message = fx
        .server
        .must_create_event(&fx.room, EventSpec::text_message(&fx.server.user_id("derek"), "hi"))
        .unwrap();
    fx.room.add_event(message.clone());
    handle_state_ids_requests(
        &fx.server,
        &fx.room,
        &message.event_id,
        &fx.room.all_current_state(),
        Gate::open(),
        Duration::from_secs(30),
    );

    let url = state_ids_url(&fx.server, &fx.room, message.event_id.as_str());
    let response = tokio::time::timeout(Duration::from_secs(1), reqwest::get(url))
        .await
        .expect("open registration must not wait on the held one")
        .unwrap();

    assert!(response.status().is_success());
    assert!(!held.is_finished());
    held.finish();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_handler_answers_empty_object_for_any_event() {
    let fx = fixture("malformed");
    let gate = Gate::open();
    handle_malformed_state_ids_requests(
        &fx.server,
        fx.room.room_id(),
        gate.clone(),
        Duration::from_secs(30),
    );

    for event_id in ["$one", "$two"] {
        let url = state_ids_url(&fx.server, &fx.room, event_id);
        let response = reqwest::get(url).await.unwrap();
        assert!(response.status().is_success());
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, serde_json::json!({}));
    }
    assert_eq!(gate.arrivals(), 2);
    assert!(fx.server.reporter().check().is_ok());
}
