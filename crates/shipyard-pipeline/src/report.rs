//! Finalized run report: terminal summary, JSON form and content digest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shipyard_core::{ArtifactReference, Environment, ErrorKind, MigrationOutcome};

use crate::run::RunState;
use crate::stage::{Stage, StageOutcome, StageRecord};

/// The stage and error that ended a failed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunFailure {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

/// Immutable record of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub environment: Environment,
    /// `None` when the run failed before a version was resolved.
    pub version: Option<String>,
    pub final_state: RunState,
    pub actor: String,
    pub revision: String,
    pub stages: Vec<StageRecord>,
    pub artifact: Option<ArtifactReference>,
    pub migration: Option<MigrationOutcome>,
    pub manifest_commit: Option<String>,
    pub rollback_tag: Option<String>,
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub shipyard_version: String,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.final_state == RunState::Succeeded
    }

    /// Number of stages that did not fail.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// Number of stages that failed.
    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.passed()).count()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Whether `stage` was recorded at all.
    pub fn reached(&self, stage: Stage) -> bool {
        self.stage(stage).is_some()
    }

    /// Warning messages from warned stages and migration findings.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings: Vec<String> = self
            .stages
            .iter()
            .filter_map(|s| match &s.outcome {
                StageOutcome::Warned { message } => Some(format!("{}: {}", s.stage, message)),
                _ => None,
            })
            .collect();
        if let Some(migration) = &self.migration {
            warnings.extend(migration.warnings.iter().map(|w| format!("migrating: {w}")));
        }
        warnings
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// SHA-256 hex digest of the compact JSON form.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Human-readable summary printed at the end of a run.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("shipyard run {}\n", self.run_id));
        out.push_str(&format!("  environment: {}\n", self.environment));
        out.push_str(&format!(
            "  version:     {}\n",
            self.version.as_deref().unwrap_or("(unresolved)")
        ));
        match &self.failure {
            Some(failure) if !self.success() => out.push_str(&format!(
                "  result:      FAILED at {} ({})\n",
                failure.stage, failure.kind
            )),
            _ => out.push_str(&format!("  result:      {}\n", self.final_state)),
        }

        out.push_str("  stages:\n");
        for record in &self.stages {
            let text = record.outcome.text();
            let line = match &record.outcome {
                StageOutcome::Failed { kind, .. } => {
                    format!("{:<10} {} [{}]", record.outcome.label(), text, kind)
                }
                _ if text.is_empty() => record.outcome.label().to_string(),
                _ => format!("{:<10} {}", record.outcome.label(), text),
            };
            out.push_str(&format!("    {:<12} {}\n", record.stage.name(), line));
        }

        if let Some(artifact) = &self.artifact {
            out.push_str(&format!("  image:       {}\n", artifact.image_reference()));
            out.push_str(&format!("  tags:        {}\n", artifact.tags.join(", ")));
        }
        if let Some(commit) = &self.manifest_commit {
            out.push_str(&format!("  manifest:    {commit}\n"));
        }
        if let Some(tag) = &self.rollback_tag {
            out.push_str(&format!("  rollback:    {tag}\n"));
        }
        for warning in self.warnings() {
            out.push_str(&format!("  warning:     {warning}\n"));
        }
        out.push_str(&format!(
            "  {} passed, {} failed in {}ms\n",
            self.passed_count(),
            self.failed_count(),
            self.duration_ms
        ));
        out
    }
}
