//! Shipyard configuration.
//!
//! Loaded from `shipyard.toml` (every field has a default), then overridden by
//! `SHIPYARD_*` environment variables, then by command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DatabaseTarget, Environment, Result, ShipyardError};
use crate::health::Backoff;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "shipyard.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShipyardConfig {
    /// Version marker file, relative to the source tree.
    pub version_file: PathBuf,
    pub image: ImageSettings,
    pub manifest: ManifestSettings,
    pub migrations: MigrationSettings,
    pub reconcile: ReconcileSettings,
    pub health: HealthSettings,
    pub environments: EnvironmentProfiles,
}

impl Default for ShipyardConfig {
    fn default() -> Self {
        Self {
            version_file: PathBuf::from("VERSION"),
            image: ImageSettings::default(),
            manifest: ManifestSettings::default(),
            migrations: MigrationSettings::default(),
            reconcile: ReconcileSettings::default(),
            health: HealthSettings::default(),
            environments: EnvironmentProfiles::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImageSettings {
    /// Registry repository, e.g. `ghcr.io/acme/ice-pulse-api`.
    pub repository: String,
    pub dockerfile: Option<PathBuf>,
    /// docker-compatible CLI.
    pub builder: String,
    pub build_timeout_secs: Option<u64>,
    pub push_timeout_secs: Option<u64>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            repository: String::new(),
            dockerfile: None,
            builder: "docker".to_string(),
            build_timeout_secs: Some(1800),
            push_timeout_secs: Some(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ManifestSettings {
    pub remote: String,
    pub branch: String,
    /// Local clone location.
    pub workdir: PathBuf,
    /// Dotted key path of the image reference in each descriptor.
    pub image_key: String,
    /// Extra attempts after a rejected push.
    pub push_retries: u32,
    pub author_name: String,
    pub author_email: String,
}

impl Default for ManifestSettings {
    fn default() -> Self {
        Self {
            remote: String::new(),
            branch: "main".to_string(),
            workdir: PathBuf::from(".shipyard/manifests"),
            image_key: crate::manifest::DEFAULT_IMAGE_KEY.to_string(),
            push_retries: 2,
            author_name: "shipyard".to_string(),
            author_email: "shipyard@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MigrationSettings {
    /// Directory of migration unit files, relative to the source tree.
    pub dir: PathBuf,
    /// The schema must hold more objects than this after apply.
    pub min_schema_objects: u64,
    /// Domain object expected to exist after apply; warning only.
    pub probe: Option<String>,
    /// Migration engine command (`<cmd> current|history|upgrade|count|probe`).
    pub engine_command: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
            min_schema_objects: 1,
            probe: None,
            engine_command: Vec::new(),
            timeout_secs: Some(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Reconciler API base URL; reconciliation is skipped when unset.
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthSettings {
    pub attempts: u32,
    pub backoff: BackoffKind,
    pub interval_secs: u64,
    /// Cap for exponential backoff.
    pub max_interval_secs: u64,
    /// Overall deadline for verification.
    pub timeout_secs: Option<u64>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffKind::Linear,
            interval_secs: 5,
            max_interval_secs: 60,
            timeout_secs: Some(300),
        }
    }
}

impl HealthSettings {
    pub fn backoff(&self) -> Backoff {
        let interval = Duration::from_secs(self.interval_secs);
        match self.backoff {
            BackoffKind::Linear => Backoff::Linear { step: interval },
            BackoffKind::Exponential => Backoff::Exponential {
                initial: interval,
                max: Duration::from_secs(self.max_interval_secs),
            },
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Whether an environment applies migrations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPolicy {
    #[default]
    Required,
    Skip,
}

/// Per-environment settings. Unset fields fall back to per-environment defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentProfile {
    /// Descriptor path inside the manifest repository.
    pub manifest_path: Option<String>,
    /// Trigger branch; a trailing `*` matches any suffix.
    pub branch: Option<String>,
    pub migrations: MigrationPolicy,
    pub database_url: Option<String>,
    /// Service base URL; `/health` is appended.
    pub health_endpoint: Option<String>,
    /// Reconciler application set; defaults to the image repository name.
    pub application_set: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentProfiles {
    pub development: EnvironmentProfile,
    pub staging: EnvironmentProfile,
    pub production: EnvironmentProfile,
}

impl EnvironmentProfiles {
    pub fn get(&self, environment: Environment) -> &EnvironmentProfile {
        match environment {
            Environment::Development => &self.development,
            Environment::Staging => &self.staging,
            Environment::Production => &self.production,
        }
    }

    pub fn get_mut(&mut self, environment: Environment) -> &mut EnvironmentProfile {
        match environment {
            Environment::Development => &mut self.development,
            Environment::Staging => &mut self.staging,
            Environment::Production => &mut self.production,
        }
    }
}

fn default_branch(environment: Environment) -> &'static str {
    match environment {
        Environment::Development => "develop",
        Environment::Staging => "release/*",
        Environment::Production => "main",
    }
}

fn branch_matches(pattern: &str, branch: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => branch.starts_with(prefix),
        None => pattern == branch,
    }
}

impl ShipyardConfig {
    /// Load from `path`, or from `shipyard.toml` in the working directory if
    /// present, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ShipyardError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ShipyardError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.health.attempts == 0 {
            return Err(ShipyardError::Configuration(
                "health attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `SHIPYARD_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SHIPYARD_*` overrides from an arbitrary lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SHIPYARD_VERSION_FILE") {
            self.version_file = PathBuf::from(v);
        }
        if let Some(v) = get("SHIPYARD_IMAGE_REPOSITORY") {
            self.image.repository = v;
        }
        if let Some(v) = get("SHIPYARD_MANIFEST_REMOTE") {
            self.manifest.remote = v;
        }
        if let Some(v) = get("SHIPYARD_MANIFEST_BRANCH") {
            self.manifest.branch = v;
        }
        if let Some(v) = get("SHIPYARD_MANIFEST_WORKDIR") {
            self.manifest.workdir = PathBuf::from(v);
        }
        if let Some(v) = get("SHIPYARD_RECONCILE_ENDPOINT") {
            self.reconcile.endpoint = Some(v);
        }
        if let Some(v) = get("SHIPYARD_RECONCILE_TOKEN") {
            self.reconcile.token = Some(v);
        }
        if let Some(v) = get("SHIPYARD_HEALTH_ATTEMPTS") {
            self.health.attempts = v.trim().parse().map_err(|_| {
                ShipyardError::Configuration(format!(
                    "SHIPYARD_HEALTH_ATTEMPTS must be a positive integer, got '{v}'"
                ))
            })?;
        }

        for env in Environment::ALL {
            let prefix = format!("SHIPYARD_{}", env.name().to_ascii_uppercase());
            let profile = self.environments.get_mut(env);
            if let Some(v) = get(&format!("{prefix}_DATABASE_URL")) {
                profile.database_url = Some(v);
            }
            if let Some(v) = get(&format!("{prefix}_HEALTH_ENDPOINT")) {
                profile.health_endpoint = Some(v);
            }
        }
        self.validate()
    }

    pub fn profile(&self, environment: Environment) -> &EnvironmentProfile {
        self.environments.get(environment)
    }

    /// Descriptor path for `environment` inside the manifest repository.
    pub fn manifest_path(&self, environment: Environment) -> String {
        self.profile(environment)
            .manifest_path
            .clone()
            .unwrap_or_else(|| format!("environments/{}/values.yaml", environment.name()))
    }

    /// Trigger branch pattern for `environment`.
    pub fn trigger_branch(&self, environment: Environment) -> String {
        self.profile(environment)
            .branch
            .clone()
            .unwrap_or_else(|| default_branch(environment).to_string())
    }

    /// Whether `branch` may trigger a run for `environment`.
    pub fn branch_allowed(&self, environment: Environment, branch: &str) -> bool {
        branch_matches(&self.trigger_branch(environment), branch)
    }

    /// Environment whose trigger predicate matches `branch`, most guarded first.
    pub fn environment_for_branch(&self, branch: &str) -> Option<Environment> {
        Environment::ALL
            .iter()
            .rev()
            .copied()
            .find(|env| self.branch_allowed(*env, branch))
    }

    pub fn migration_policy(&self, environment: Environment) -> MigrationPolicy {
        self.profile(environment).migrations
    }

    pub fn database_target(&self, environment: Environment) -> Option<DatabaseTarget> {
        self.profile(environment)
            .database_url
            .as_ref()
            .map(|url| DatabaseTarget::new(environment.name(), url.clone()))
    }

    /// Application set for the reconciler; the image repository's last segment by default.
    pub fn application_set(&self, environment: Environment) -> String {
        self.profile(environment)
            .application_set
            .clone()
            .unwrap_or_else(|| {
                self.image
                    .repository
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
version_file = "VERSION"

[image]
repository = "ghcr.io/acme/ice-pulse-api"

[manifest]
remote = "git@github.com:acme/ice-pulse-manifests.git"
push_retries = 4

[health]
attempts = 5
backoff = "exponential"
interval_secs = 2

[environments.staging]
database_url = "postgresql://app:pw@staging-db/icepulse"
health_endpoint = "https://staging.icepulse.example"

[environments.production]
migrations = "skip"
manifest_path = "prod/values.yaml"
"#;

    #[test]
    fn test_defaults() {
        let cfg = ShipyardConfig::default();
        assert_eq!(cfg.manifest.branch, "main");
        assert_eq!(cfg.manifest.image_key, "image");
        assert_eq!(cfg.health.attempts, 3);
        assert_eq!(
            cfg.manifest_path(Environment::Staging),
            "environments/staging/values.yaml"
        );
        assert_eq!(cfg.migration_policy(Environment::Production), MigrationPolicy::Required);
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg = ShipyardConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.image.repository, "ghcr.io/acme/ice-pulse-api");
        assert_eq!(cfg.image.builder, "docker");
        assert_eq!(cfg.manifest.push_retries, 4);
        assert_eq!(cfg.manifest.branch, "main");
        assert_eq!(
            cfg.health.backoff(),
            Backoff::Exponential {
                initial: Duration::from_secs(2),
                max: Duration::from_secs(60)
            }
        );
        assert_eq!(cfg.manifest_path(Environment::Production), "prod/values.yaml");
        assert_eq!(cfg.migration_policy(Environment::Production), MigrationPolicy::Skip);
        assert_eq!(
            cfg.database_target(Environment::Staging).map(|db| db.name),
            Some("staging".to_string())
        );
        assert!(cfg.database_target(Environment::Development).is_none());
        assert_eq!(cfg.application_set(Environment::Staging), "ice-pulse-api");
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = ShipyardConfig::from_toml_str("[health]\nattempts = \"many\"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SHIPYARD_IMAGE_REPOSITORY", "registry.local/api"),
            ("SHIPYARD_PRODUCTION_DATABASE_URL", "postgresql://prod-db/app"),
            ("SHIPYARD_HEALTH_ATTEMPTS", "7"),
            ("SHIPYARD_MANIFEST_BRANCH", ""),
        ]
        .into_iter()
        .collect();

        let mut cfg = ShipyardConfig::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.image.repository, "registry.local/api");
        assert_eq!(cfg.health.attempts, 7);
        assert_eq!(cfg.manifest.branch, "main", "blank values are ignored");
        assert_eq!(
            cfg.profile(Environment::Production).database_url.as_deref(),
            Some("postgresql://prod-db/app")
        );
    }

    #[test]
    fn test_bad_attempts_override() {
        let mut cfg = ShipyardConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "SHIPYARD_HEALTH_ATTEMPTS").then(|| "lots".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_zero_health_attempts_rejected() {
        let mut cfg = ShipyardConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "SHIPYARD_HEALTH_ATTEMPTS").then(|| "0".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("at least 1"));

        let err = ShipyardConfig::from_toml_str("[health]\nattempts = 0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_environment_for_branch() {
        let cfg = ShipyardConfig::default();
        assert_eq!(cfg.environment_for_branch("develop"), Some(Environment::Development));
        assert_eq!(cfg.environment_for_branch("release/2.4"), Some(Environment::Staging));
        assert_eq!(cfg.environment_for_branch("main"), Some(Environment::Production));
        assert_eq!(cfg.environment_for_branch("feature/x"), None);
        assert!(!cfg.branch_allowed(Environment::Production, "develop"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shipyard.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = ShipyardConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.health.attempts, 5);

        let missing = ShipyardConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(missing.is_err());
    }
}
