//! Port interfaces
//!
//! Ports define the contract between the scenario layer and infrastructure
//! implementations, following the same hexagonal split as the rest of the
//! workspace.

mod directory;

pub use directory::ServerDirectory;
