//! # psj-infra
//!
//! Adapters behind the scenario layer:
//!
//! - [`federation`]: the mock federation peer a scenario controls
//! - [`homeserver`]: the in-process homeserver under test
//! - [`deployment`]: blueprints, server-name directory and restarts
//! - [`client`]: client-server API handle used by scenario bodies
//! - [`config`]: layered loading of [`psj_core::HarnessConfig`]

pub mod client;
pub mod config;
pub mod deployment;
pub mod federation;
pub mod homeserver;
pub mod http;

pub use client::{CsApi, SyncReq};
pub use deployment::{Blueprint, Deployment};
pub use federation::{CancelListener, Server, ServerRoom};
