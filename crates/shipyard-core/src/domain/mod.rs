//! Domain models for Shipyard.
//!
//! Canonical definitions for the core entities:
//! - `Environment`: a rung of the promotion ladder
//! - `ReleaseVersion`: the immutable version resolved for a run
//! - `MigrationSet`: the chain of schema migrations shipped with a release
//! - `ShipyardError`: the error taxonomy shared by every stage

pub mod environment;
pub mod error;
pub mod migration;
pub mod version;

// Re-export main types and errors
pub use environment::{Environment, PRODUCTION_CONFIRMATION_TOKEN};
pub use error::{ErrorKind, Result, ShipyardError};
pub use migration::{
    DatabaseTarget, MigrationOutcome, MigrationSet, MigrationStatus, MigrationUnit,
};
pub use version::{ReleaseVersion, VersionSource};
