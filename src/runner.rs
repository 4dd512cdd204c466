//! Scenario selection and execution for `psj-runner`.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use psj_app::scenarios::{self, Scenario};
use psj_core::HarnessConfig;
use tracing::{error, info, info_span, Instrument};

/// Result of a single scenario run.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: &'static str,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "PASS {} ({:.2?})", self.name, self.elapsed),
            Some(err) => write!(f, "FAIL {} ({:.2?}): {}", self.name, self.elapsed, err),
        }
    }
}

/// Resolve scenario names; an empty list selects every scenario.
///
/// Unknown names are reported together rather than one at a time.
pub fn select(names: &[String]) -> Result<Vec<Scenario>> {
    if names.is_empty() {
        return Ok(scenarios::all());
    }

    let mut selected = Vec::with_capacity(names.len());
    let mut unknown = Vec::new();
    for name in names {
        match scenarios::find(name) {
            Some(scenario) => selected.push(scenario),
            None => unknown.push(name.as_str()),
        }
    }
    if !unknown.is_empty() {
        bail!(
            "unknown scenario(s): {} (use `psj-runner list`)",
            unknown.join(", ")
        );
    }
    Ok(selected)
}

/// Run scenarios one after another.
///
/// Every scenario runs even if an earlier one failed.
pub async fn run_all(selected: &[Scenario], config: &HarnessConfig) -> Vec<ScenarioOutcome> {
    let mut outcomes = Vec::with_capacity(selected.len());
    for scenario in selected {
        let started = Instant::now();
        let span = info_span!("scenario", name = scenario.name);
        let result = (scenario.run)(config.clone()).instrument(span).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(()) => {
                info!(scenario = scenario.name, ?elapsed, "scenario passed");
                ScenarioOutcome {
                    name: scenario.name,
                    elapsed,
                    error: None,
                }
            }
            Err(err) => {
                error!(scenario = scenario.name, ?elapsed, error = %format!("{err:#}"), "scenario failed");
                ScenarioOutcome {
                    name: scenario.name,
                    elapsed,
                    error: Some(format!("{err:#}")),
                }
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_empty_means_all() {
        let selected = select(&[]).unwrap();
        assert_eq!(selected.len(), scenarios::all().len());
    }

    #[test]
    fn test_select_keeps_requested_order() {
        let names = vec![
            "gappy_sync_after_partial_state_synced".to_string(),
            "sync_blocks_during_partial_state_join".to_string(),
        ];
        let selected = select(&names).unwrap();
        let picked: Vec<&str> = selected.iter().map(|s| s.name).collect();
        assert_eq!(
            picked,
            vec![
                "gappy_sync_after_partial_state_synced",
                "sync_blocks_during_partial_state_join"
            ]
        );
    }

    #[test]
    fn test_select_reports_all_unknown_names() {
        let names = vec![
            "no_such_scenario".to_string(),
            "sync_blocks_during_partial_state_join".to_string(),
            "another_missing_one".to_string(),
        ];
        let err = select(&names).unwrap_err().to_string();
        assert!(err.contains("no_such_scenario"));
        assert!(err.contains("another_missing_one"));
    }

    #[test]
    fn test_outcome_display() {
        let outcome = ScenarioOutcome {
            name: "demo",
            elapsed: Duration::from_millis(1500),
            error: Some("boom".to_string()),
        };
        assert!(!outcome.passed());
        let line = outcome.to_string();
        assert!(line.starts_with("FAIL demo"));
        assert!(line.ends_with("boom"));
    }
}
