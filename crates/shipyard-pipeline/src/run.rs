//! Run state machine and the mutable record of a run in progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{ArtifactReference, Environment, ErrorKind, MigrationOutcome, ReleaseVersion};
use uuid::Uuid;

use crate::report::{RunFailure, RunReport};
use crate::stage::{Stage, StageOutcome, StageRecord};

/// Promotion state of a run.
///
/// `Pending -> Building -> (Migrating | Skipped) -> Publishing -> Deploying ->
/// Verifying -> Succeeded`, with `Failed` reachable from every non-terminal
/// state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Building,
    Migrating,
    /// Migrations were not run for this environment.
    Skipped,
    Publishing,
    Deploying,
    Verifying,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Building => "building",
            RunState::Migrating => "migrating",
            RunState::Skipped => "skipped",
            RunState::Publishing => "publishing",
            RunState::Deploying => "deploying",
            RunState::Verifying => "verifying",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Building)
                | (Building, Migrating)
                | (Building, Skipped)
                | (Migrating, Publishing)
                | (Skipped, Publishing)
                | (Publishing, Deploying)
                | (Deploying, Verifying)
                | (Verifying, Succeeded)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("invalid run transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

/// A release run in progress. [`PipelineRun::finalize`] turns it into an
/// immutable [`RunReport`].
#[derive(Debug, Clone)]
pub struct PipelineRun {
    run_id: String,
    environment: Environment,
    actor: String,
    revision: String,
    state: RunState,
    version: Option<ReleaseVersion>,
    stages: Vec<StageRecord>,
    artifact: Option<ArtifactReference>,
    migration: Option<MigrationOutcome>,
    manifest_commit: Option<String>,
    rollback_tag: Option<String>,
    failure: Option<RunFailure>,
    started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(
        environment: Environment,
        actor: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self::new_at(environment, actor, revision, Utc::now())
    }

    pub fn new_at(
        environment: Environment,
        actor: impl Into<String>,
        revision: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            environment,
            actor: actor.into(),
            revision: revision.into(),
            state: RunState::Pending,
            version: None,
            stages: Vec::new(),
            artifact: None,
            migration: None,
            manifest_commit: None,
            rollback_tag: None,
            failure: None,
            started_at,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn version(&self) -> Option<&ReleaseVersion> {
        self.version.as_ref()
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn transition(&mut self, next: RunState) -> Result<(), RunError> {
        if !self.state.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(run_id = %self.run_id, from = %self.state, to = %next, "run transition");
        self.state = next;
        Ok(())
    }

    /// Record a stage outcome. A failed outcome also captures the run failure.
    pub fn record(&mut self, stage: Stage, outcome: StageOutcome, started_at: DateTime<Utc>) {
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        if let StageOutcome::Failed { kind, message } = &outcome {
            if self.failure.is_none() {
                self.failure = Some(RunFailure {
                    stage,
                    kind: *kind,
                    message: message.clone(),
                });
            }
        }
        shipyard_core::obs::emit_stage_finished(
            &self.run_id,
            stage.name(),
            outcome.label(),
            duration_ms,
        );
        self.stages.push(StageRecord {
            stage,
            outcome,
            started_at,
            duration_ms,
        });
    }

    /// Record a failed stage and move to `Failed`.
    pub fn fail(
        &mut self,
        stage: Stage,
        kind: ErrorKind,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Result<(), RunError> {
        self.record(stage, StageOutcome::failed(kind, message), started_at);
        self.transition(RunState::Failed)
    }

    pub fn set_version(&mut self, version: ReleaseVersion) {
        self.version = Some(version);
    }

    pub fn set_artifact(&mut self, artifact: ArtifactReference) {
        self.artifact = Some(artifact);
    }

    pub fn set_migration(&mut self, outcome: MigrationOutcome) {
        self.migration = Some(outcome);
    }

    pub fn set_manifest_commit(&mut self, commit: Option<String>, rollback_tag: Option<String>) {
        self.manifest_commit = commit;
        self.rollback_tag = rollback_tag;
    }

    /// Freeze the run into its report.
    pub fn finalize(self) -> RunReport {
        self.finalize_at(Utc::now())
    }

    pub fn finalize_at(self, finished_at: DateTime<Utc>) -> RunReport {
        let duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        RunReport {
            run_id: self.run_id,
            environment: self.environment,
            version: self.version.map(|v| v.as_str().to_string()),
            final_state: self.state,
            actor: self.actor,
            revision: self.revision,
            stages: self.stages,
            artifact: self.artifact,
            migration: self.migration,
            manifest_commit: self.manifest_commit,
            rollback_tag: self.rollback_tag,
            failure: self.failure,
            started_at: self.started_at,
            finished_at,
            duration_ms,
            shipyard_version: shipyard_core::VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut run = PipelineRun::new(Environment::Development, "ci", "abc");
        for next in [
            RunState::Building,
            RunState::Skipped,
            RunState::Publishing,
            RunState::Deploying,
            RunState::Verifying,
            RunState::Succeeded,
        ] {
            run.transition(next).unwrap();
        }
        assert_eq!(run.state(), RunState::Succeeded);
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for terminal in [RunState::Succeeded, RunState::Failed] {
            for next in [
                RunState::Pending,
                RunState::Building,
                RunState::Failed,
                RunState::Succeeded,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_cannot_skip_publishing() {
        assert!(!RunState::Migrating.can_transition_to(RunState::Deploying));
        assert!(!RunState::Pending.can_transition_to(RunState::Publishing));
        assert!(!RunState::Building.can_transition_to(RunState::Deploying));

        let mut run = PipelineRun::new(Environment::Staging, "ci", "abc");
        let err = run.transition(RunState::Deploying).unwrap_err();
        assert_eq!(
            err,
            RunError::InvalidTransition {
                from: RunState::Pending,
                to: RunState::Deploying
            }
        );
    }

    #[test]
    fn test_fail_captures_first_failure() {
        let mut run = PipelineRun::new(Environment::Production, "ci", "abc");
        run.fail(Stage::Preflight, ErrorKind::Configuration, "missing token", Utc::now())
            .unwrap();
        assert_eq!(run.state(), RunState::Failed);

        let report = run.finalize();
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.stage, Stage::Preflight);
        assert_eq!(failure.kind, ErrorKind::Configuration);
        assert_eq!(report.stages.len(), 1);
    }
}
