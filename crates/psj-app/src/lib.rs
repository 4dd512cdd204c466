//! Partial-state join scenario orchestration
//!
//! This crate holds the coordination layer on top of `psj-infra`: gated
//! handlers that turn a mock peer's state-fetch routes into pause points,
//! the [`PartialStateJoin`] orchestrator, concurrent probes and the
//! scenario suite itself.

pub mod gated_handler;
pub mod orchestrator;
pub mod probe;
pub mod scenarios;
pub mod testing;

pub use gated_handler::Gate;
pub use orchestrator::{PartialStateJoin, ScenarioPhase};
pub use probe::{Probe, ProbeError};
pub use scenarios::Scenario;
