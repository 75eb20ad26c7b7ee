//! Shipyard - release orchestrator CLI
//!
//! The `shipyard` command promotes a service release through the
//! development, staging and production environments of a GitOps setup.
//!
//! ## Commands
//!
//! - `release`: Run the full promotion pipeline for one environment
//! - `version`: Print the version a release would get
//! - `migrations validate`: Check the migration chain without a database
//! - `migrations plan`: Show pending migrations for an environment's database
//! - `verify`: Probe a deployed service's health endpoint
//! - `config`: Print the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use shipyard_core::{
    capture_head_sha, ArtifactPublisher, CommandMigrationEngine, DatabaseTarget, DockerCli,
    Environment, GitManifestRepository, HealthVerifier, HttpHealthProbe, HttpReconciler,
    MigrationChecks, MigrationGate, MigrationSet, ReconciliationNotifier, ShipyardConfig,
    SourceContext, VersionResolver, PRODUCTION_CONFIRMATION_TOKEN,
};
use shipyard_pipeline::{Collaborators, PromotionController, RunReport, Trigger, Workspace};

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Release orchestrator for GitOps deployments", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON reports
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: ./shipyard.toml when present)
    #[arg(short, long, global = true, env = "SHIPYARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, migrate, publish and deploy a release to one environment
    Release(ReleaseArgs),

    /// Print the version a release to an environment would get
    Version {
        /// Target environment
        #[arg(short, long)]
        environment: Environment,

        /// Explicit version, used verbatim
        #[arg(long)]
        version_override: Option<String>,

        /// Source revision (auto-detected from the source tree if omitted)
        #[arg(long)]
        revision: Option<String>,

        /// Source tree
        #[arg(short, long, default_value = ".")]
        source: PathBuf,
    },

    /// Migration set operations
    Migrations {
        #[command(subcommand)]
        action: MigrationsAction,
    },

    /// Probe a deployed service until it reports healthy
    Verify {
        /// Environment whose health endpoint to probe
        #[arg(short, long)]
        environment: Environment,

        /// Service base URL (overrides the configured endpoint)
        #[arg(long)]
        endpoint: Option<String>,

        /// Probe attempts (overrides the configured count)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        attempts: Option<u32>,
    },

    /// Print the effective configuration (secrets redacted)
    Config,
}

#[derive(clap::Args)]
struct ReleaseArgs {
    /// Target environment (derived from --branch when omitted)
    #[arg(short, long)]
    environment: Option<Environment>,

    /// Explicit version, used verbatim
    #[arg(long, env = "SHIPYARD_VERSION")]
    version_override: Option<String>,

    /// Do not run migrations for this release
    #[arg(long)]
    skip_migrations: bool,

    /// Preview pending migrations without applying them
    #[arg(long)]
    dry_run_migrations: bool,

    /// Confirmation token; production requires `deploy-to-production`
    #[arg(long, env = "SHIPYARD_CONFIRM")]
    confirm: Option<String>,

    /// Who triggered the release
    #[arg(long, env = "SHIPYARD_ACTOR", default_value = "shipyard-cli")]
    actor: String,

    /// Source revision (auto-detected from the source tree if omitted)
    #[arg(long)]
    revision: Option<String>,

    /// Source branch; checked against the environment's trigger branch
    #[arg(long, env = "SHIPYARD_BRANCH")]
    branch: Option<String>,

    /// Extra image tag (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Source tree to build
    #[arg(short, long, default_value = ".")]
    source: PathBuf,

    /// Also write the JSON run report to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Subcommand)]
enum MigrationsAction {
    /// Validate the migration chain (no database contact)
    Validate {
        /// Migration directory (default: from configuration)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Source tree the configured directory is relative to
        #[arg(short, long, default_value = ".")]
        source: PathBuf,
    },

    /// Show the upgrade path pending for an environment's database
    Plan {
        /// Target environment
        #[arg(short, long)]
        environment: Environment,

        /// Source tree the configured directory is relative to
        #[arg(short, long, default_value = ".")]
        source: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipyard_core::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Release(args) => cmd_release(config, args, cli.json).await,
        Commands::Version {
            environment,
            version_override,
            revision,
            source,
        } => cmd_version(
            &config,
            environment,
            version_override.as_deref(),
            revision,
            &source,
        ),
        Commands::Migrations { action } => match action {
            MigrationsAction::Validate { dir, source } => {
                cmd_migrations_validate(&config, dir.as_deref(), &source)
            }
            MigrationsAction::Plan {
                environment,
                source,
            } => cmd_migrations_plan(&config, environment, &source).await,
        },
        Commands::Verify {
            environment,
            endpoint,
            attempts,
        } => cmd_verify(&config, environment, endpoint, attempts).await,
        Commands::Config => cmd_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> Result<ShipyardConfig> {
    let mut config = ShipyardConfig::load(path).context("Failed to load configuration")?;
    config
        .apply_env()
        .context("Invalid SHIPYARD_* environment override")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn secs(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_secs)
}

fn migration_gate(config: &ShipyardConfig) -> MigrationGate {
    let engine = CommandMigrationEngine::new(
        config.migrations.engine_command.clone(),
        secs(config.migrations.timeout_secs),
    );
    let checks = MigrationChecks {
        min_schema_objects: config.migrations.min_schema_objects,
        probe: config.migrations.probe.clone(),
    };
    MigrationGate::new(Arc::new(engine), checks)
}

fn health_verifier() -> HealthVerifier {
    HealthVerifier::new(Arc::new(HttpHealthProbe::default()))
}

/// Real adapters for every collaborator: docker, the migration engine
/// command, a git clone of the manifest repository and HTTP.
fn collaborators(config: &ShipyardConfig) -> Result<Collaborators> {
    if config.manifest.remote.trim().is_empty() {
        bail!(
            "manifest.remote is not configured \
             (set it in shipyard.toml or SHIPYARD_MANIFEST_REMOTE)"
        );
    }

    let builder = DockerCli::with_program(config.image.builder.clone());
    let publisher = ArtifactPublisher::new(Arc::new(builder), config.image.repository.clone())
        .with_timeouts(
            secs(config.image.build_timeout_secs),
            secs(config.image.push_timeout_secs),
        );

    let manifests = GitManifestRepository::new(
        config.manifest.remote.clone(),
        config.manifest.branch.clone(),
        config.manifest.workdir.clone(),
    )
    .with_author(
        config.manifest.author_name.clone(),
        config.manifest.author_email.clone(),
    );

    let notifier = config.reconcile.endpoint.as_ref().map(|endpoint| {
        let mut reconciler = HttpReconciler::new(endpoint.clone());
        if let Some(token) = &config.reconcile.token {
            reconciler = reconciler.with_token(token.clone());
        }
        ReconciliationNotifier::new(
            Arc::new(reconciler),
            Duration::from_secs(config.reconcile.timeout_secs),
        )
    });

    Ok(Collaborators {
        publisher,
        migration_gate: migration_gate(config),
        manifest_repo: Arc::new(manifests),
        notifier,
        health: health_verifier(),
    })
}

fn resolve_revision(explicit: Option<String>, source: &Path) -> Result<String> {
    match explicit {
        Some(revision) => Ok(revision),
        None => capture_head_sha(source).with_context(|| {
            format!("Cannot detect revision of {}; pass --revision", source.display())
        }),
    }
}

fn migration_dir(config: &ShipyardConfig, source: &Path) -> PathBuf {
    source.join(&config.migrations.dir)
}

fn load_migrations(config: &ShipyardConfig, source: &Path) -> Result<MigrationSet> {
    let dir = migration_dir(config, source);
    MigrationSet::load_dir(&dir)
        .with_context(|| format!("Failed to load migrations from {}", dir.display()))
}

/// Resolve the target environment and refuse unconfirmed production runs
/// before touching git, migrations or any collaborator.
fn build_trigger(config: &ShipyardConfig, args: &ReleaseArgs) -> Result<Trigger> {
    let environment = match (args.environment, args.branch.as_deref()) {
        (Some(environment), _) => environment,
        (None, Some(branch)) => config
            .environment_for_branch(branch)
            .with_context(|| format!("Branch '{branch}' does not map to any environment"))?,
        (None, None) => bail!("Pass --environment or --branch"),
    };
    if environment.requires_confirmation()
        && args.confirm.as_deref() != Some(PRODUCTION_CONFIRMATION_TOKEN)
    {
        bail!(
            "{environment} releases require --confirm {PRODUCTION_CONFIRMATION_TOKEN} \
             (or SHIPYARD_CONFIRM)"
        );
    }

    let revision = resolve_revision(args.revision.clone(), &args.source)?;
    let mut trigger = Trigger::new(environment, revision).with_actor(args.actor.clone());
    trigger.version_override = args.version_override.clone().filter(|v| !v.is_empty());
    trigger.skip_migrations = args.skip_migrations;
    trigger.dry_run_migrations = args.dry_run_migrations;
    trigger.confirmation_token = args.confirm.clone();
    trigger.branch = args.branch.clone();
    trigger.extra_tags = args.tags.iter().cloned().collect::<BTreeSet<_>>();
    Ok(trigger)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_release(config: ShipyardConfig, args: ReleaseArgs, json: bool) -> Result<()> {
    let trigger = build_trigger(&config, &args)?;

    let wants_migrations = !trigger.skip_migrations;
    let migrations = if wants_migrations {
        load_migrations(&config, &args.source)?
    } else {
        MigrationSet::empty()
    };
    if wants_migrations && !migrations.is_empty() && config.migrations.engine_command.is_empty() {
        bail!(
            "migrations.engine_command is not configured; \
             pass --skip-migrations to release without them"
        );
    }

    let workspace = Workspace {
        source: SourceContext {
            path: args.source.clone(),
            dockerfile: config.image.dockerfile.clone(),
            ..SourceContext::default()
        },
        version_file: Some(args.source.join(&config.version_file)),
        migrations,
    };

    info!(
        environment = %trigger.environment,
        revision = %trigger.revision,
        actor = %trigger.actor,
        "starting release"
    );
    let controller = PromotionController::new(config.clone(), collaborators(&config)?);
    let report = controller
        .run(&trigger, &workspace)
        .await
        .context("Release pipeline aborted")?;

    print_report(&report, json)?;
    if let Some(path) = &args.report {
        std::fs::write(path, report.to_json()?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }

    match &report.failure {
        Some(failure) if !report.success() => {
            bail!("release failed at {} ({}): {}", failure.stage, failure.kind, failure.message)
        }
        _ => Ok(()),
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render_summary());
        println!("Report digest: {}", report.digest());
    }
    Ok(())
}

fn cmd_version(
    config: &ShipyardConfig,
    environment: Environment,
    version_override: Option<&str>,
    revision: Option<String>,
    source: &Path,
) -> Result<()> {
    let revision = match version_override {
        Some(_) => revision.unwrap_or_default(),
        None => resolve_revision(revision, source)?,
    };
    let version_file = source.join(&config.version_file);
    let version =
        VersionResolver::resolve(version_override, Some(&version_file), &revision, environment)?;
    println!("{version}");
    Ok(())
}

fn cmd_migrations_validate(
    config: &ShipyardConfig,
    dir: Option<&Path>,
    source: &Path,
) -> Result<()> {
    let dir = dir.map(Path::to_path_buf).unwrap_or_else(|| migration_dir(config, source));
    let set = MigrationSet::load_dir(&dir)
        .with_context(|| format!("Failed to load migrations from {}", dir.display()))?;
    let validated = migration_gate(config)
        .validate(&set)
        .with_context(|| format!("Invalid migration set in {}", dir.display()))?;

    if validated.is_empty() {
        println!("No migrations in {}", dir.display());
        return Ok(());
    }
    println!("Migration chain ({} units):", validated.len());
    for unit in validated.units() {
        let parent = unit.parent().unwrap_or("<base>");
        match &unit.description {
            Some(desc) => println!("  {} -> {}  {}", parent, unit.revision_id(), desc),
            None => println!("  {} -> {}", parent, unit.revision_id()),
        }
    }
    println!("Head: {}", validated.head().unwrap_or("<none>"));
    Ok(())
}

async fn cmd_migrations_plan(
    config: &ShipyardConfig,
    environment: Environment,
    source: &Path,
) -> Result<()> {
    let Some(db) = config.database_target(environment) else {
        bail!(
            "No database configured for {environment} (set SHIPYARD_{}_DATABASE_URL)",
            environment.name().to_ascii_uppercase()
        );
    };
    if config.migrations.engine_command.is_empty() {
        bail!("migrations.engine_command is not configured");
    }
    let gate = migration_gate(config);
    let set = load_migrations(config, source)?;
    let validated = gate.validate(&set).context("Invalid migration set")?;

    let outcome = gate.apply(&validated, &db, true).await;
    print_plan(&db, &outcome);
    if outcome.is_failed() {
        bail!("{}", outcome.message.unwrap_or_default());
    }
    Ok(())
}

fn print_plan(db: &DatabaseTarget, outcome: &shipyard_core::MigrationOutcome) {
    println!("Database: {db}");
    if outcome.preview.is_empty() {
        println!("Nothing pending");
    } else {
        println!("Pending:");
        for line in &outcome.preview {
            println!("  {line}");
        }
    }
    if let Some(message) = &outcome.message {
        println!("({message})");
    }
}

async fn cmd_verify(
    config: &ShipyardConfig,
    environment: Environment,
    endpoint: Option<String>,
    attempts: Option<u32>,
) -> Result<()> {
    let Some(endpoint) = endpoint.or_else(|| config.profile(environment).health_endpoint.clone())
    else {
        bail!("No health endpoint for {environment}; pass --endpoint");
    };
    let attempts = attempts.unwrap_or(config.health.attempts);
    let verifier = health_verifier();

    let healthy = match config.health.timeout() {
        Some(limit) => {
            verifier
                .verify_within(&endpoint, attempts, config.health.backoff(), limit)
                .await?
        }
        None => {
            verifier
                .verify(&endpoint, attempts, config.health.backoff())
                .await
        }
    };
    let url = HttpHealthProbe::liveness_url(&endpoint);
    if !healthy {
        bail!("{url} is not healthy after {attempts} attempt(s)");
    }
    println!("✓ {url} healthy");
    Ok(())
}

/// Configuration with credentials masked.
fn redacted(config: &ShipyardConfig) -> ShipyardConfig {
    let mut shown = config.clone();
    if shown.reconcile.token.is_some() {
        shown.reconcile.token = Some("***".to_string());
    }
    for environment in Environment::ALL {
        if let Some(db) = config.database_target(environment) {
            shown.environments.get_mut(environment).database_url = Some(db.redacted_url());
        }
    }
    shown
}

fn cmd_config(config: &ShipyardConfig) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&redacted(config)).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
