//! # psj-core
//!
//! Core domain models and coordination primitives for partial-state join
//! scenarios.
//!
//! This crate contains pure logic without any HTTP or runtime-wiring
//! dependencies: identifiers, federation events, the [`Waiter`] barrier,
//! the scenario [`Reporter`], JSON check-off matchers and the harness
//! configuration model.

pub mod config;
pub mod event;
pub mod federation;
pub mod ids;
pub mod matching;
pub mod ports;
pub mod reporter;
pub mod sync;
pub mod waiter;

// Re-export commonly used types at the crate root
pub use config::HarnessConfig;
pub use event::{Event, EventSpec, ProtoEvent, StateMap};
pub use ids::{EventId, RoomId, RoomVersion, ServerName, UserId};
pub use reporter::{Reporter, ScenarioFailed};
pub use waiter::{WaitError, Waiter};
