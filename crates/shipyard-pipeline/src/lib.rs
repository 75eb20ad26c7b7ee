//! Shipyard Pipeline - promotion of one release through one environment
//!
//! Provides the promotion controller that:
//! - Resolves the version and builds the image while validating migrations
//! - Gates migrations, publishes tags and mutates the manifest repository
//! - Signals the reconciler and verifies health, recording every stage

pub mod controller;
pub mod report;
pub mod run;
pub mod stage;

// Re-export key types
pub use controller::{Collaborators, PromotionController, Trigger, Workspace};
pub use report::{RunFailure, RunReport};
pub use run::{PipelineRun, RunError, RunState};
pub use stage::{Stage, StageOutcome, StageRecord};
