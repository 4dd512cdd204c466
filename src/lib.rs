//! `psj-runner` library half: bootstrap and scenario execution.

pub mod bootstrap;
pub mod runner;
