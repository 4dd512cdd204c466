//! Scenario-scoped failure collector.
//!
//! Mock request handlers run on server tasks, not on the scenario's own task,
//! so they cannot fail the scenario by returning an error. They record the
//! failure here instead; the scenario checks the reporter when it tears down
//! and fails if anything was recorded.

use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("scenario {scenario} recorded {} failure(s): {}", .failures.len(), .failures.join("; "))]
pub struct ScenarioFailed {
    pub scenario: String,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Reporter {
    scenario: Arc<str>,
    failures: Arc<Mutex<Vec<String>>>,
}

impl Reporter {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: Arc::from(scenario),
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Record a failure without interrupting the caller.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(scenario = %self.scenario, "{}", message);
        match self.failures.lock() {
            Ok(mut failures) => failures.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }

    pub fn failures(&self) -> Vec<String> {
        match self.failures.lock() {
            Ok(failures) => failures.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn has_failed(&self) -> bool {
        !self.failures().is_empty()
    }

    /// `Err` listing every recorded failure, if any.
    pub fn check(&self) -> Result<(), ScenarioFailed> {
        let failures = self.failures();
        if failures.is_empty() {
            return Ok(());
        }
        Err(ScenarioFailed {
            scenario: self.scenario.to_string(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_reporter_checks_ok() {
        let reporter = Reporter::new("clean");
        assert!(reporter.check().is_ok());
        assert!(!reporter.has_failed());
    }

    #[test]
    fn test_failures_from_clones_are_collected() {
        let reporter = Reporter::new("sync_blocks");
        let handler_side = reporter.clone();

        handler_side.error("Received unexpected PDU: {}");
        reporter.error("Error writing to request");

        let err = reporter.check().unwrap_err();
        assert_eq!(err.scenario, "sync_blocks");
        assert_eq!(err.failures.len(), 2);
        assert!(err.to_string().contains("2 failure(s)"));
    }
}
