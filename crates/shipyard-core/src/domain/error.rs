//! Domain-level error taxonomy for Shipyard.

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactError;
use crate::manifest::ManifestError;
use crate::migration_gate::ValidationError;

/// Coarse classification of a failure, as reported in run summaries.
///
/// The kind decides how an operator remediates: configuration and validation
/// problems are fixed at the source, artifact and conflict problems are retried,
/// migration problems need a human to look at the partially applied schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Validation,
    Build,
    Publish,
    Migration,
    ManifestConflict,
    Repository,
    ReconciliationWarning,
    HealthCheckFailed,
    Timeout,
}

impl ErrorKind {
    /// Name as printed in the terminal summary.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Build => "BuildError",
            ErrorKind::Publish => "PublishError",
            ErrorKind::Migration => "MigrationError",
            ErrorKind::ManifestConflict => "ManifestConflict",
            ErrorKind::Repository => "RepositoryError",
            ErrorKind::ReconciliationWarning => "ReconciliationWarning",
            ErrorKind::HealthCheckFailed => "HealthCheckFailed",
            ErrorKind::Timeout => "Timeout",
        }
    }

    /// Whether re-running the pipeline unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Build
                | ErrorKind::Publish
                | ErrorKind::ManifestConflict
                | ErrorKind::Repository
                | ErrorKind::Timeout
        )
    }

    /// Whether this kind aborts the run. Only reconciliation is downgraded.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::ReconciliationWarning)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Shipyard domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ShipyardError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("migration error: {0}")]
    Migration(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShipyardError {
    /// Classify this error for reporting and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShipyardError::Configuration(_) => ErrorKind::Configuration,
            ShipyardError::Validation(_) => ErrorKind::Validation,
            ShipyardError::Artifact(e) => e.kind(),
            ShipyardError::Migration(_) => ErrorKind::Migration,
            ShipyardError::Manifest(e) => e.kind(),
            ShipyardError::HealthCheckFailed(_) => ErrorKind::HealthCheckFailed,
            ShipyardError::Timeout { .. } => ErrorKind::Timeout,
            ShipyardError::Yaml(_) => ErrorKind::Configuration,
            ShipyardError::Serialization(_) => ErrorKind::Configuration,
            ShipyardError::Io(_) => ErrorKind::Configuration,
        }
    }
}

/// Result type for Shipyard domain operations.
pub type Result<T> = std::result::Result<T, ShipyardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names() {
        assert_eq!(ErrorKind::Configuration.name(), "ConfigurationError");
        assert_eq!(ErrorKind::ManifestConflict.name(), "ManifestConflict");
        assert_eq!(ErrorKind::HealthCheckFailed.to_string(), "HealthCheckFailed");
    }

    #[test]
    fn test_retry_policy() {
        assert!(ErrorKind::Build.is_retryable());
        assert!(ErrorKind::Publish.is_retryable());
        assert!(ErrorKind::ManifestConflict.is_retryable());
        assert!(!ErrorKind::Migration.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Configuration.is_retryable());
    }

    #[test]
    fn test_only_reconciliation_is_non_fatal() {
        assert!(!ErrorKind::ReconciliationWarning.is_fatal());
        assert!(ErrorKind::HealthCheckFailed.is_fatal());
        assert!(ErrorKind::Timeout.is_fatal());
    }

    #[test]
    fn test_shipyard_error_kind() {
        let err = ShipyardError::Configuration("no version".to_string());
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("configuration error"));

        let err = ShipyardError::Timeout {
            operation: "docker push".to_string(),
            secs: 30,
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_artifact_error_kinds_are_distinguished() {
        let build: ShipyardError = ArtifactError::Build("exit 1".to_string()).into();
        assert_eq!(build.kind(), ErrorKind::Build);

        let push: ShipyardError = ArtifactError::Authentication {
            registry: "ghcr.io".to_string(),
            reason: "denied".to_string(),
        }
        .into();
        assert_eq!(push.kind(), ErrorKind::Publish);
    }
}
