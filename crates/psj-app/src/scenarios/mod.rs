//! Partial-state join scenarios
//!
//! Each scenario deploys its own homeservers, runs to an assertion and tears
//! everything down again. They are plain async functions so both the
//! integration tests and the `psj-runner` CLI can drive them.

mod blocking;
mod fallback;
mod lazy_loading;
mod receive;
mod restart;

pub use blocking::{
    members_request_blocks_during_partial_state_join, sync_blocks_during_partial_state_join,
};
pub use fallback::partial_state_join_syncs_using_other_homeservers;
pub use lazy_loading::{
    can_lazy_loading_sync_during_partial_state_join, gappy_sync_after_partial_state_synced,
};
pub use receive::can_receive_events_during_partial_state_join;
pub use restart::partial_state_join_continues_after_restart;

use std::collections::BTreeSet;

use anyhow::{anyhow, bail, Result};
use futures::future::{BoxFuture, FutureExt};
use psj_core::event::MEMBER;
use psj_core::{EventId, HarnessConfig, RoomId};
use psj_infra::{CsApi, SyncReq};
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::orchestrator::PartialStateJoin;
use crate::probe::Probe;

pub type ScenarioFn = fn(HarnessConfig) -> BoxFuture<'static, Result<()>>;

/// A named, runnable scenario.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub run: ScenarioFn,
}

/// Every scenario, in the order they are run.
pub fn all() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "sync_blocks_during_partial_state_join",
            run: |config| sync_blocks_during_partial_state_join(config).boxed(),
        },
        Scenario {
            name: "can_lazy_loading_sync_during_partial_state_join",
            run: |config| can_lazy_loading_sync_during_partial_state_join(config).boxed(),
        },
        Scenario {
            name: "can_receive_events_during_partial_state_join",
            run: |config| can_receive_events_during_partial_state_join(config).boxed(),
        },
        Scenario {
            name: "members_request_blocks_during_partial_state_join",
            run: |config| members_request_blocks_during_partial_state_join(config).boxed(),
        },
        Scenario {
            name: "partial_state_join_continues_after_restart",
            run: |config| partial_state_join_continues_after_restart(config).boxed(),
        },
        Scenario {
            name: "partial_state_join_syncs_using_other_homeservers",
            run: |config| partial_state_join_syncs_using_other_homeservers(config).boxed(),
        },
        Scenario {
            name: "gappy_sync_after_partial_state_synced",
            run: |config| gappy_sync_after_partial_state_synced(config).boxed(),
        },
    ]
}

pub fn find(name: &str) -> Option<Scenario> {
    all().into_iter().find(|s| s.name == name)
}

/// Tear `psj` down and combine the body's outcome with what the mock's
/// handlers recorded. A body failure takes precedence.
fn conclude(psj: &PartialStateJoin, outcome: Result<()>) -> Result<()> {
    let teardown = psj.destroy();
    outcome?;
    teardown?;
    Ok(())
}

/// Run a `/sync` for `client` on its own task.
fn spawn_sync(client: &CsApi, req: SyncReq) -> Probe<Result<(Value, String)>> {
    let client = client.clone();
    let label = format!("/sync for {}", client.user_id());
    Probe::spawn(label, async move { client.sync(&req).await })
}

/// Poll `/rooms/{room}/event/{event}` until the event is visible to
/// `client`, retrying on `404 M_NOT_FOUND`.
async fn await_event_arrival(
    client: &CsApi,
    room_id: &RoomId,
    event_id: &EventId,
    config: &HarnessConfig,
) -> Result<()> {
    let path = [
        "_matrix",
        "client",
        "v3",
        "rooms",
        room_id.as_str(),
        "event",
        event_id.as_str(),
    ];
    let poll = async {
        loop {
            let response = client.do_request(Method::GET, &path, &[], None).await?;
            let status = response.status();
            if status.is_success() {
                return Ok::<_, anyhow::Error>(());
            }
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let errcode = body.get("errcode").and_then(Value::as_str);
            if status != StatusCode::NOT_FOUND || errcode != Some("M_NOT_FOUND") {
                bail!("GET event {} returned {}: {}", event_id, status, body);
            }
            tracing::trace!(event = %event_id, "event not visible yet");
            tokio::time::sleep(config.waits.event_poll_interval()).await;
        }
    };
    tokio::time::timeout(config.waits.event_poll_bound(), poll)
        .await
        .map_err(|_| {
            anyhow!(
                "event {} did not arrive within {:?}",
                event_id,
                config.waits.event_poll_bound()
            )
        })?
}

/// State keys of every membership event the sync response carries for
/// `room_id`, in timeline and state.
fn synced_members(response: &Value, room_id: &RoomId) -> Result<BTreeSet<String>> {
    let room = response
        .get("rooms")
        .and_then(|rooms| rooms.get("join"))
        .and_then(|join| join.get(room_id.as_str()))
        .ok_or_else(|| anyhow!("room {} missing from sync response", room_id))?;

    let events = ["timeline", "state"]
        .into_iter()
        .filter_map(|section| room.get(section)?.get("events")?.as_array())
        .flatten();
    Ok(events
        .filter(|e| e.get("type").and_then(Value::as_str) == Some(MEMBER))
        .filter_map(|e| e.get("state_key").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scenario_names_are_unique() {
        let names: BTreeSet<_> = all().iter().map(|s| s.name).collect();
        assert_eq!(names.len(), all().len());
        assert!(find("partial_state_join_continues_after_restart").is_some());
        assert!(find("no_such_scenario").is_none());
    }

    #[test]
    fn test_synced_members_reads_timeline_and_state() {
        let room = RoomId::from("!r:127.0.0.1:9000");
        let response = json!({
            "rooms": { "join": { "!r:127.0.0.1:9000": {
                "timeline": { "events": [
                    { "type": "m.room.member", "state_key": "@alice:hs1" },
                    { "type": "m.room.message", "sender": "@alice:hs1" }
                ]},
                "state": { "events": [
                    { "type": "m.room.member", "state_key": "@charlie:127.0.0.1:9000" },
                    { "type": "m.room.create", "state_key": "" }
                ]}
            }}}
        });

        let members = synced_members(&response, &room).unwrap();

        assert_eq!(
            members.into_iter().collect::<Vec<_>>(),
            vec!["@alice:hs1", "@charlie:127.0.0.1:9000"]
        );
        assert!(synced_members(&response, &RoomId::from("!other:hs1")).is_err());
    }
}
