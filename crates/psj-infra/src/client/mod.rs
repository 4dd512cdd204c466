//! Client-server API handle used by scenario bodies.

mod cs_api;

pub use cs_api::{CsApi, SyncReq};
