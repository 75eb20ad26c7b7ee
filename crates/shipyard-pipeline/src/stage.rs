//! Pipeline stages and their recorded outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::ErrorKind;

/// A unit of work in a release run, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Confirmation and trigger checks.
    Preflight,

    /// Version resolution, migration validation and image build.
    Building,

    Migrating,

    /// Tag and push of the built image.
    Publishing,

    /// Manifest repository mutation.
    Deploying,

    /// Refresh signal to the cluster reconciler.
    Reconciling,

    /// Post-deploy health verification.
    Verifying,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::Building => "building",
            Stage::Migrating => "migrating",
            Stage::Publishing => "publishing",
            Stage::Deploying => "deploying",
            Stage::Reconciling => "reconciling",
            Stage::Verifying => "verifying",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a stage ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded { detail: String },
    Skipped { reason: String },
    /// Completed with a non-fatal problem.
    Warned { message: String },
    Failed { kind: ErrorKind, message: String },
}

impl StageOutcome {
    pub fn succeeded(detail: impl Into<String>) -> Self {
        StageOutcome::Succeeded {
            detail: detail.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        StageOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn warned(message: impl Into<String>) -> Self {
        StageOutcome::Warned {
            message: message.into(),
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        StageOutcome::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Succeeded { .. } => "succeeded",
            StageOutcome::Skipped { .. } => "skipped",
            StageOutcome::Warned { .. } => "warned",
            StageOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. })
    }

    /// Detail, reason or message, whichever the variant carries.
    pub fn text(&self) -> &str {
        match self {
            StageOutcome::Succeeded { detail } => detail,
            StageOutcome::Skipped { reason } => reason,
            StageOutcome::Warned { message } | StageOutcome::Failed { message, .. } => message,
        }
    }
}

/// One stage outcome as recorded on a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StageRecord {
    /// Whether the stage did not fail (skips and warnings pass).
    pub fn passed(&self) -> bool {
        !self.outcome.is_failure()
    }
}
