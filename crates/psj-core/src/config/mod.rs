//! Harness configuration domain model

mod harness_config;

pub use harness_config::{HarnessConfig, HomeserverConfig, WaitConfig};
