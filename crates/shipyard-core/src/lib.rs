//! Shipyard Core Library
//!
//! Leaf components of the release pipeline (version resolution, migration
//! gate, artifact publisher, manifest mutator, reconciliation notifier,
//! health verifier), the collaborator traits they drive, and the real
//! adapters for docker, git, HTTP and an external migration engine.

pub mod artifact;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod git;
pub mod health;
pub mod manifest;
pub mod migration_gate;
pub mod obs;
pub mod process;
pub mod reconcile;
pub mod telemetry;
pub mod version_resolver;

pub use domain::{
    DatabaseTarget, Environment, ErrorKind, MigrationOutcome, MigrationSet, MigrationStatus,
    MigrationUnit, ReleaseVersion, Result, ShipyardError, VersionSource,
    PRODUCTION_CONFIRMATION_TOKEN,
};

pub use artifact::{
    ArtifactBuilder, ArtifactError, ArtifactPublisher, ArtifactReference, BuiltImage, DockerCli,
    SourceContext,
};
pub use config::{EnvironmentProfile, MigrationPolicy, ShipyardConfig};
pub use git::{capture_head_sha, GitError, GitManifestRepository};
pub use health::{Backoff, HealthProbe, HealthVerifier, HttpHealthProbe, LIVENESS_PATH};
pub use manifest::{
    ManifestError, ManifestMutator, ManifestRepository, MutationOutcome, RunMetadata, TagStatus,
};
pub use migration_gate::{
    CommandMigrationEngine, EngineError, MigrationChecks, MigrationEngine, MigrationGate,
    ValidatedMigrationSet, ValidationError,
};
pub use reconcile::{
    ClusterReconciler, ClusterTarget, HttpReconciler, ReconcileStatus, ReconciliationNotifier,
};
pub use telemetry::init_tracing;
pub use version_resolver::VersionResolver;

/// Crate version, embedded in run reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
