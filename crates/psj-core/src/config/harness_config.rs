use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Harness configuration
///
/// Every bound a scenario waits on lives here so a slow CI machine can
/// stretch them without touching scenario code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    /// Wait bounds used by scenarios and gated handlers
    pub waits: WaitConfig,

    /// Behaviour of the simulated homeservers
    pub homeserver: HomeserverConfig,
}

/// Wait bounds, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// How long a scenario waits for a gated request to arrive
    pub await_request_ms: u64,
    /// How long a gated handler holds a request before giving up; covers a
    /// whole scenario, not a network round trip
    pub release_bound_ms: u64,
    /// How long a released probe may take to complete
    pub probe_bound_ms: u64,
    /// Overall bound when polling for an event to become visible
    pub event_poll_bound_ms: u64,
    /// Pause between polls
    pub event_poll_interval_ms: u64,
    /// Overall bound for `sync_until`
    pub sync_until_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            await_request_ms: 5_000,
            release_bound_ms: 60_000,
            probe_bound_ms: 1_000,
            event_poll_bound_ms: 1_000,
            event_poll_interval_ms: 100,
            sync_until_ms: 5_000,
        }
    }
}

impl WaitConfig {
    pub fn await_request(&self) -> Duration {
        Duration::from_millis(self.await_request_ms)
    }

    pub fn release_bound(&self) -> Duration {
        Duration::from_millis(self.release_bound_ms)
    }

    pub fn probe_bound(&self) -> Duration {
        Duration::from_millis(self.probe_bound_ms)
    }

    pub fn event_poll_bound(&self) -> Duration {
        Duration::from_millis(self.event_poll_bound_ms)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    pub fn sync_until(&self) -> Duration {
        Duration::from_millis(self.sync_until_ms)
    }
}

/// Simulated homeserver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeserverConfig {
    /// Advertised by `/capabilities` and used for new rooms
    pub default_room_version: String,
    /// Above this many missing events a resync fetches `/state` in one
    /// request instead of one `/event` per id
    pub resync_event_fetch_limit: usize,
    /// Pause after every candidate server failed once
    pub resync_retry_backoff_ms: u64,
    /// Timeout for outbound federation requests
    pub request_timeout_ms: u64,
}

impl Default for HomeserverConfig {
    fn default() -> Self {
        Self {
            default_room_version: "10".to_string(),
            resync_event_fetch_limit: 10,
            resync_retry_backoff_ms: 200,
            request_timeout_ms: 30_000,
        }
    }
}

impl HomeserverConfig {
    pub fn resync_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.resync_retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_scenario_bounds() {
        let config = HarnessConfig::default();

        assert_eq!(config.waits.await_request(), Duration::from_secs(5));
        assert_eq!(config.waits.release_bound(), Duration::from_secs(60));
        assert_eq!(config.waits.probe_bound(), Duration::from_secs(1));
        assert_eq!(config.homeserver.default_room_version, "10");
    }

    #[test]
    fn test_partial_json_keeps_other_defaults() {
        let config: HarnessConfig =
            serde_json::from_str(r#"{ "waits": { "probe_bound_ms": 2500 } }"#).unwrap();

        assert_eq!(config.waits.probe_bound_ms, 2500);
        assert_eq!(config.waits.await_request_ms, 5_000);
        assert_eq!(config.homeserver, HomeserverConfig::default());
    }
}
