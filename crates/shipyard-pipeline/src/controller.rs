//! Promotion controller: drives one release run through the stage sequence.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use shipyard_core::obs;
use shipyard_core::{
    ArtifactPublisher, ClusterTarget, Environment, ErrorKind, HealthVerifier, ManifestError,
    ManifestMutator, ManifestRepository, MigrationGate, MigrationOutcome, MigrationPolicy,
    MigrationSet, MigrationStatus, MutationOutcome, ReconcileStatus, ReconciliationNotifier,
    RunMetadata, ShipyardConfig, ShipyardError, SourceContext, VersionResolver,
    PRODUCTION_CONFIRMATION_TOKEN,
};
use tracing::{info, warn, Instrument};

use crate::report::RunReport;
use crate::run::{PipelineRun, RunError, RunState};
use crate::stage::{Stage, StageOutcome};

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub environment: Environment,
    /// Used verbatim when non-empty.
    pub version_override: Option<String>,
    pub skip_migrations: bool,
    /// Must equal the production sentinel for production runs.
    pub confirmation_token: Option<String>,
    /// Source revision being released.
    pub revision: String,
    pub actor: String,
    /// Source branch; checked against the environment's trigger predicate when set.
    pub branch: Option<String>,
    /// Preview pending migrations without applying them.
    pub dry_run_migrations: bool,
    pub extra_tags: BTreeSet<String>,
}

impl Trigger {
    pub fn new(environment: Environment, revision: impl Into<String>) -> Self {
        Self {
            environment,
            version_override: None,
            skip_migrations: false,
            confirmation_token: None,
            revision: revision.into(),
            actor: "shipyard".to_string(),
            branch: None,
            dry_run_migrations: false,
            extra_tags: BTreeSet::new(),
        }
    }

    pub fn with_version_override(mut self, version: impl Into<String>) -> Self {
        self.version_override = Some(version.into());
        self
    }

    pub fn with_confirmation(mut self, token: impl Into<String>) -> Self {
        self.confirmation_token = Some(token.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn skipping_migrations(mut self) -> Self {
        self.skip_migrations = true;
        self
    }
}

/// The source tree being released.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub source: SourceContext,
    pub version_file: Option<PathBuf>,
    pub migrations: MigrationSet,
}

/// External systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub publisher: ArtifactPublisher,
    pub migration_gate: MigrationGate,
    pub manifest_repo: Arc<dyn ManifestRepository>,
    /// `None` skips reconciliation.
    pub notifier: Option<ReconciliationNotifier>,
    pub health: HealthVerifier,
}

/// Why stage execution stopped early.
enum Interrupt {
    /// A stage failed and the run is already `Failed`.
    Halted,
    Invalid(RunError),
}

impl From<RunError> for Interrupt {
    fn from(err: RunError) -> Self {
        Interrupt::Invalid(err)
    }
}

/// Record a failed stage and stop.
fn halt(
    run: &mut PipelineRun,
    stage: Stage,
    kind: ErrorKind,
    message: impl Into<String>,
    started_at: DateTime<Utc>,
) -> Interrupt {
    let message = message.into();
    warn!(stage = %stage, kind = %kind, error = %message, "stage failed");
    match run.fail(stage, kind, message, started_at) {
        Ok(()) => Interrupt::Halted,
        Err(e) => Interrupt::Invalid(e),
    }
}

/// Fail `stage` with a domain error, classified by its kind.
fn halt_on(
    run: &mut PipelineRun,
    stage: Stage,
    err: impl Into<ShipyardError>,
    started_at: DateTime<Utc>,
) -> Interrupt {
    let err = err.into();
    halt(run, stage, err.kind(), err.to_string(), started_at)
}

/// Refuse the run during preflight.
fn reject(
    run: &mut PipelineRun,
    message: impl Into<String>,
    started_at: DateTime<Utc>,
) -> Interrupt {
    halt(run, Stage::Preflight, ErrorKind::Configuration, message, started_at)
}

/// Orchestrates version, migrations, artifact, manifest and verification for
/// one environment per run.
pub struct PromotionController {
    config: ShipyardConfig,
    collaborators: Collaborators,
    mutator: ManifestMutator,
}

impl PromotionController {
    pub fn new(config: ShipyardConfig, collaborators: Collaborators) -> Self {
        let mutator = ManifestMutator::new(config.manifest.image_key.clone());
        Self {
            config,
            collaborators,
            mutator,
        }
    }

    pub fn config(&self) -> &ShipyardConfig {
        &self.config
    }

    /// Execute a run to its terminal state and return the finalized report.
    ///
    /// Stage failures do not produce `Err`; they are recorded on the report.
    /// `Err` means the controller itself misbehaved (an invalid transition).
    pub async fn run(&self, trigger: &Trigger, workspace: &Workspace) -> anyhow::Result<RunReport> {
        let mut run = PipelineRun::new(trigger.environment, &trigger.actor, &trigger.revision);
        let run_id = run.run_id().to_string();
        let span = obs::run_span(&run_id, trigger.environment.name());
        obs::emit_run_started(&run_id, trigger.environment.name(), &trigger.actor);

        let driven = self
            .drive(&mut run, trigger, workspace)
            .instrument(span)
            .await;
        match driven {
            Ok(()) | Err(Interrupt::Halted) => {}
            Err(Interrupt::Invalid(e)) => return Err(e.into()),
        }

        let report = run.finalize();
        obs::emit_run_finished(
            &run_id,
            report.version.as_deref(),
            report.duration_ms,
            report.success(),
        );
        Ok(report)
    }

    fn migrations_wanted(&self, trigger: &Trigger) -> bool {
        !trigger.skip_migrations
            && self.config.migration_policy(trigger.environment) == MigrationPolicy::Required
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        trigger: &Trigger,
        workspace: &Workspace,
    ) -> Result<(), Interrupt> {
        let env = trigger.environment;
        let wants_migrations = self.migrations_wanted(trigger);

        // -------------------------------------------------------------------
        // Preflight
        // -------------------------------------------------------------------
        let started = Utc::now();
        if env.requires_confirmation()
            && trigger.confirmation_token.as_deref() != Some(PRODUCTION_CONFIRMATION_TOKEN)
        {
            let message = match trigger.confirmation_token {
                None => "production runs require a confirmation token",
                Some(_) => "confirmation token does not match",
            };
            return Err(reject(run, message, started));
        }
        if let Some(branch) = &trigger.branch {
            if !self.config.branch_allowed(env, branch) {
                let message = format!(
                    "branch '{branch}' may not release to {env} (expected '{}')",
                    self.config.trigger_branch(env)
                );
                return Err(reject(run, message, started));
            }
        }
        if self.collaborators.publisher.repository().is_empty() {
            return Err(reject(run, "no image repository configured", started));
        }
        if wants_migrations
            && !workspace.migrations.is_empty()
            && self.config.database_target(env).is_none()
        {
            let message =
                format!("migrations are required for {env} but no database is configured");
            return Err(reject(run, message, started));
        }
        run.record(Stage::Preflight, StageOutcome::succeeded("checks passed"), started);

        // -------------------------------------------------------------------
        // Building: version, then migration validation alongside the build
        // -------------------------------------------------------------------
        run.transition(RunState::Building)?;
        let started = Utc::now();
        let version = match VersionResolver::resolve(
            trigger.version_override.as_deref(),
            workspace.version_file.as_deref(),
            &trigger.revision,
            env,
        ) {
            Ok(version) => version,
            Err(e) => return Err(halt_on(run, Stage::Building, e, started)),
        };
        run.set_version(version.clone());
        info!(version = %version, source = ?version.source(), "version resolved");

        let gate = &self.collaborators.migration_gate;
        let validation = async {
            wants_migrations.then(|| gate.validate(&workspace.migrations))
        };
        let build = self.collaborators.publisher.build(&workspace.source, &version);
        let (validated, built) = futures::join!(validation, build);

        let built = match built {
            Ok(built) => built,
            Err(e) => return Err(halt_on(run, Stage::Building, e, started)),
        };
        run.record(
            Stage::Building,
            StageOutcome::succeeded(format!("version {version}, image {}", built.image_id)),
            started,
        );

        // A rejected migration set fails the migrating stage before any database contact.
        let validated = match validated.transpose() {
            Ok(validated) => validated,
            Err(e) => return Err(halt_on(run, Stage::Migrating, e, started)),
        };

        // -------------------------------------------------------------------
        // Migrating | Skipped
        // -------------------------------------------------------------------
        match validated {
            Some(validated) => {
                run.transition(RunState::Migrating)?;
                let started = Utc::now();
                let outcome = match self.config.database_target(env) {
                    Some(db) => gate.apply(&validated, &db, trigger.dry_run_migrations).await,
                    None => MigrationOutcome::skipped("migration set is empty"),
                };
                let stage_outcome = match outcome.status {
                    MigrationStatus::Applied => StageOutcome::succeeded(format!(
                        "applied {}",
                        outcome.applied.join(", ")
                    )),
                    MigrationStatus::Skipped => {
                        StageOutcome::skipped(outcome.message.clone().unwrap_or_default())
                    }
                    MigrationStatus::Failed => {
                        let message = outcome
                            .message
                            .clone()
                            .unwrap_or_else(|| "migration failed".to_string());
                        run.set_migration(outcome);
                        let err = ShipyardError::Migration(message);
                        return Err(halt_on(run, Stage::Migrating, err, started));
                    }
                };
                run.set_migration(outcome);
                run.record(Stage::Migrating, stage_outcome, started);
            }
            None => {
                run.transition(RunState::Skipped)?;
                let reason = if trigger.skip_migrations {
                    "migrations disabled for this run"
                } else {
                    "environment policy skips migrations"
                };
                run.record(Stage::Migrating, StageOutcome::skipped(reason), Utc::now());
            }
        }

        // -------------------------------------------------------------------
        // Publishing
        // -------------------------------------------------------------------
        run.transition(RunState::Publishing)?;
        let started = Utc::now();
        let tags = ArtifactPublisher::tags_for(&version, env, &trigger.extra_tags);
        let artifact = match self.collaborators.publisher.push(&built, &tags).await {
            Ok(artifact) => artifact,
            Err(e) => return Err(halt_on(run, Stage::Publishing, e, started)),
        };
        run.record(
            Stage::Publishing,
            StageOutcome::succeeded(format!("pushed {}", tags.join(", "))),
            started,
        );
        let image_reference = artifact.image_reference();
        run.set_artifact(artifact);

        // -------------------------------------------------------------------
        // Deploying
        // -------------------------------------------------------------------
        run.transition(RunState::Deploying)?;
        let started = Utc::now();
        let meta = RunMetadata {
            run_id: run.run_id().to_string(),
            version: version.clone(),
            revision: trigger.revision.clone(),
            actor: trigger.actor.clone(),
            environment: env,
        };
        let path = self.config.manifest_path(env);
        let retries = self.config.manifest.push_retries;
        let repo = self.collaborators.manifest_repo.as_ref();

        let mut attempt = 0;
        let mutation = loop {
            match self.mutator.mutate(repo, &path, &image_reference, &meta).await {
                Ok(outcome) => break outcome,
                Err(e @ ManifestError::Conflict { .. }) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        retries,
                        error = %e,
                        "manifest push rejected, retrying on fresh checkout"
                    );
                }
                Err(e) => return Err(halt_on(run, Stage::Deploying, e, started)),
            }
        };
        let detail = match &mutation {
            MutationOutcome::Committed {
                commit,
                bootstrapped,
                rollback_tag,
                ..
            } => {
                let mut detail = format!("committed {} to {path}", short(commit));
                if *bootstrapped {
                    detail.push_str(" (new descriptor)");
                }
                if let Some(tag) = rollback_tag {
                    detail.push_str(&format!(", tagged {tag}"));
                }
                detail
            }
            MutationOutcome::NoChange { current } => {
                format!("no change: {path} already references {current}")
            }
        };
        run.set_manifest_commit(
            mutation.commit().map(str::to_string),
            mutation.rollback_tag().map(str::to_string),
        );
        run.record(Stage::Deploying, StageOutcome::succeeded(detail), started);

        // -------------------------------------------------------------------
        // Verifying: reconcile (best-effort), then health
        // -------------------------------------------------------------------
        run.transition(RunState::Verifying)?;
        let started = Utc::now();
        match &self.collaborators.notifier {
            Some(notifier) => {
                let target = ClusterTarget::new(self.config.application_set(env), env);
                match notifier.notify(&target).await {
                    ReconcileStatus::Signalled => run.record(
                        Stage::Reconciling,
                        StageOutcome::succeeded(format!(
                            "refresh requested for {}",
                            target.application_set
                        )),
                        started,
                    ),
                    ReconcileStatus::Warned(message) => {
                        obs::emit_reconcile_warning(run.run_id(), &message);
                        run.record(Stage::Reconciling, StageOutcome::warned(message), started);
                    }
                }
            }
            None => run.record(
                Stage::Reconciling,
                StageOutcome::skipped("no reconciler configured"),
                started,
            ),
        }

        let started = Utc::now();
        let Some(endpoint) = self.config.profile(env).health_endpoint.clone() else {
            run.record(
                Stage::Verifying,
                StageOutcome::skipped("no health endpoint configured"),
                started,
            );
            run.transition(RunState::Succeeded)?;
            return Ok(());
        };

        let health = &self.config.health;
        let verifier = &self.collaborators.health;
        let healthy = match health.timeout() {
            Some(limit) => {
                match verifier
                    .verify_within(&endpoint, health.attempts, health.backoff(), limit)
                    .await
                {
                    Ok(healthy) => healthy,
                    Err(e) => return Err(halt_on(run, Stage::Verifying, e, started)),
                }
            }
            None => {
                verifier
                    .verify(&endpoint, health.attempts, health.backoff())
                    .await
            }
        };
        if !healthy {
            let message = format!(
                "{endpoint} not healthy after {} attempt(s); manifest change left in place",
                health.attempts
            );
            let err = ShipyardError::HealthCheckFailed(message);
            return Err(halt_on(run, Stage::Verifying, err, started));
        }
        run.record(
            Stage::Verifying,
            StageOutcome::succeeded(format!("{endpoint} healthy")),
            started,
        );
        run.transition(RunState::Succeeded)?;
        Ok(())
    }
}

fn short(commit: &str) -> &str {
    commit.get(..7).unwrap_or(commit)
}
