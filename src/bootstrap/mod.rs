//! Runner bootstrap: command line parsing and tracing setup.

pub mod cli;
pub mod tracing;

pub use cli::{Cli, Commands};
pub use self::tracing::init_tracing_subscriber;
