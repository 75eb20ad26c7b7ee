//! Container artifact build and publish.
//!
//! The publisher always pushes at least two tags: the immutable release
//! version and the environment's moving `*-latest` alias that polling agents
//! track. Build failures and registry failures are kept apart because one is
//! a source problem and the other a credentials/connectivity problem.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{Environment, ErrorKind, ReleaseVersion};
use crate::process::{run_command, CommandError, CommandSpec};

/// Artifact stage failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ArtifactError {
    #[error("build error: {0}")]
    Build(String),

    #[error("publish error: registry {registry} rejected credentials: {reason}")]
    Authentication { registry: String, reason: String },

    #[error("publish error: push of {reference} failed: {reason}")]
    Push { reference: String, reason: String },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },
}

impl ArtifactError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArtifactError::Build(_) => ErrorKind::Build,
            ArtifactError::Authentication { .. } | ArtifactError::Push { .. } => ErrorKind::Publish,
            ArtifactError::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Source tree handed to the builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceContext {
    /// Build context directory.
    pub path: PathBuf,

    /// Dockerfile relative to the context; builder default when `None`.
    pub dockerfile: Option<PathBuf>,

    pub build_args: BTreeMap<String, String>,
}

impl SourceContext {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Locally built image awaiting tagging and push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub image_id: String,
    pub version: ReleaseVersion,
}

/// Published artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactReference {
    /// Registry repository, e.g. `ghcr.io/acme/ice-pulse-api`.
    pub repository: String,

    /// Immutable version tag.
    pub version: String,

    /// Every tag pushed, version first.
    pub tags: Vec<String>,

    /// Registry digest when the builder reports one.
    pub digest: Option<String>,
}

impl ArtifactReference {
    /// `repository:version`, the reference written into manifests.
    pub fn image_reference(&self) -> String {
        format!("{}:{}", self.repository, self.version)
    }
}

/// The external artifact builder.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Build `source` into a local image, returning its id.
    async fn build(
        &self,
        source: &SourceContext,
        version: &ReleaseVersion,
    ) -> Result<String, ArtifactError>;

    /// Point `reference` (`repo:tag`) at a local image.
    async fn tag(&self, image_id: &str, reference: &str) -> Result<(), ArtifactError>;

    /// Push `reference`, returning the registry digest if known.
    async fn push(&self, reference: &str) -> Result<Option<String>, ArtifactError>;
}

/// Builds, tags and pushes release images.
#[derive(Clone)]
pub struct ArtifactPublisher {
    builder: Arc<dyn ArtifactBuilder>,
    repository: String,
    build_timeout: Option<Duration>,
    push_timeout: Option<Duration>,
}

impl ArtifactPublisher {
    pub fn new(builder: Arc<dyn ArtifactBuilder>, repository: impl Into<String>) -> Self {
        Self {
            builder,
            repository: repository.into(),
            build_timeout: None,
            push_timeout: None,
        }
    }

    pub fn with_timeouts(mut self, build: Option<Duration>, push: Option<Duration>) -> Self {
        self.build_timeout = build;
        self.push_timeout = push;
        self
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tags for a release: version, environment alias, then extras (deduplicated).
    pub fn tags_for(
        version: &ReleaseVersion,
        environment: Environment,
        extra: &BTreeSet<String>,
    ) -> Vec<String> {
        let mut tags = vec![version.as_str().to_string(), environment.latest_alias()];
        for tag in extra {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }

    /// Build the image for `version`.
    pub async fn build(
        &self,
        source: &SourceContext,
        version: &ReleaseVersion,
    ) -> Result<BuiltImage, ArtifactError> {
        info!(context = %source.path.display(), version = %version, "building image");
        let image_id = with_timeout(
            "image build",
            self.build_timeout,
            self.builder.build(source, version),
        )
        .await?;
        Ok(BuiltImage {
            image_id,
            version: version.clone(),
        })
    }

    /// Tag and push a built image under every tag. The first tag is the version.
    pub async fn push(
        &self,
        image: &BuiltImage,
        tags: &[String],
    ) -> Result<ArtifactReference, ArtifactError> {
        let mut digest = None;
        for tag in tags {
            let reference = format!("{}:{}", self.repository, tag);
            self.builder.tag(&image.image_id, &reference).await?;
            let pushed = with_timeout(
                "image push",
                self.push_timeout,
                self.builder.push(&reference),
            )
            .await?;
            debug!(reference = %reference, "pushed");
            if digest.is_none() {
                digest = pushed;
            }
        }
        info!(repository = %self.repository, tags = ?tags, "image published");
        Ok(ArtifactReference {
            repository: self.repository.clone(),
            version: image.version.as_str().to_string(),
            tags: tags.to_vec(),
            digest,
        })
    }

    /// Build then push with the standard tag set for `environment`.
    pub async fn publish(
        &self,
        source: &SourceContext,
        version: &ReleaseVersion,
        environment: Environment,
        extra_tags: &BTreeSet<String>,
    ) -> Result<ArtifactReference, ArtifactError> {
        let image = self.build(source, version).await?;
        let tags = Self::tags_for(version, environment, extra_tags);
        self.push(&image, &tags).await
    }
}

async fn with_timeout<T>(
    operation: &str,
    limit: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T, ArtifactError>>,
) -> Result<T, ArtifactError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ArtifactError::Timeout {
                operation: operation.to_string(),
                secs: limit.as_secs(),
            })?,
        None => fut.await,
    }
}

// ---------------------------------------------------------------------------
// Docker CLI adapter
// ---------------------------------------------------------------------------

/// [`ArtifactBuilder`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerCli {
    /// Use a docker-compatible binary (e.g. `podman`).
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn build_command(&self, source: &SourceContext, version: &ReleaseVersion) -> Vec<String> {
        let mut cmd = vec![self.program.clone(), "build".to_string(), "--quiet".to_string()];
        if let Some(dockerfile) = &source.dockerfile {
            cmd.push("--file".to_string());
            cmd.push(source.path.join(dockerfile).to_string_lossy().to_string());
        }
        cmd.push("--build-arg".to_string());
        cmd.push(format!("VERSION={}", version.as_str()));
        for (key, value) in &source.build_args {
            cmd.push("--build-arg".to_string());
            cmd.push(format!("{key}={value}"));
        }
        cmd.push("--label".to_string());
        cmd.push(format!("org.opencontainers.image.version={}", version.as_str()));
        cmd.push(source.path.to_string_lossy().to_string());
        cmd
    }
}

fn registry_of(reference: &str) -> String {
    reference
        .split('/')
        .next()
        .filter(|host| host.contains('.') || host.contains(':'))
        .unwrap_or("docker.io")
        .to_string()
}

fn is_auth_failure(diagnostics: &str) -> bool {
    let lower = diagnostics.to_ascii_lowercase();
    [
        "unauthorized",
        "denied",
        "authentication required",
        "no basic auth credentials",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// `digest: sha256:...` from `docker push` output.
fn parse_push_digest(stdout: &str) -> Option<String> {
    stdout.split_whitespace().find_map(|word| {
        word.strip_prefix("sha256:")
            .filter(|hex| !hex.is_empty())
            .map(|hex| format!("sha256:{hex}"))
    })
}

fn command_failure(err: CommandError) -> String {
    err.to_string()
}

#[async_trait]
impl ArtifactBuilder for DockerCli {
    async fn build(
        &self,
        source: &SourceContext,
        version: &ReleaseVersion,
    ) -> Result<String, ArtifactError> {
        let spec = CommandSpec::new(self.build_command(source, version));
        let output = run_command(&spec)
            .await
            .map_err(|e| ArtifactError::Build(command_failure(e)))?;
        if !output.success {
            return Err(ArtifactError::Build(format!(
                "docker build exited with {}: {}",
                output.exit_code,
                output.diagnostics()
            )));
        }
        let image_id = output.stdout.trim().to_string();
        if image_id.is_empty() {
            return Err(ArtifactError::Build(
                "docker build produced no image id".to_string(),
            ));
        }
        Ok(image_id)
    }

    async fn tag(&self, image_id: &str, reference: &str) -> Result<(), ArtifactError> {
        let spec = CommandSpec::new([self.program.as_str(), "tag", image_id, reference]);
        let output = run_command(&spec).await.map_err(|e| ArtifactError::Push {
            reference: reference.to_string(),
            reason: command_failure(e),
        })?;
        if output.success {
            Ok(())
        } else {
            Err(ArtifactError::Push {
                reference: reference.to_string(),
                reason: output.diagnostics(),
            })
        }
    }

    async fn push(&self, reference: &str) -> Result<Option<String>, ArtifactError> {
        let spec = CommandSpec::new([self.program.as_str(), "push", reference]);
        let output = run_command(&spec).await.map_err(|e| ArtifactError::Push {
            reference: reference.to_string(),
            reason: command_failure(e),
        })?;
        if output.success {
            return Ok(parse_push_digest(&output.stdout));
        }
        let diagnostics = output.diagnostics();
        if is_auth_failure(&diagnostics) {
            Err(ArtifactError::Authentication {
                registry: registry_of(reference),
                reason: diagnostics,
            })
        } else {
            Err(ArtifactError::Push {
                reference: reference.to_string(),
                reason: diagnostics,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VersionSource;
    use crate::fakes::RecordingArtifactBuilder;

    fn version(v: &str) -> ReleaseVersion {
        ReleaseVersion::new(v.to_string(), VersionSource::Override)
    }

    #[test]
    fn test_tags_always_include_version_and_alias() {
        let tags = ArtifactPublisher::tags_for(
            &version("1.2.3"),
            Environment::Development,
            &BTreeSet::new(),
        );
        assert_eq!(tags, vec!["1.2.3".to_string(), "dev-latest".to_string()]);
    }

    #[test]
    fn test_extra_tags_are_deduplicated() {
        let extra: BTreeSet<String> = ["dev-latest", "sha-abc"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let tags =
            ArtifactPublisher::tags_for(&version("1.2.3"), Environment::Development, &extra);
        assert_eq!(tags, vec!["1.2.3", "dev-latest", "sha-abc"]);
    }

    #[test]
    fn test_registry_detection() {
        assert_eq!(registry_of("ghcr.io/acme/api:1.0"), "ghcr.io");
        assert_eq!(registry_of("localhost:5000/api:1.0"), "localhost:5000");
        assert_eq!(registry_of("acme/api:1.0"), "docker.io");
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(is_auth_failure("denied: requested access to the resource is denied"));
        assert!(is_auth_failure("unauthorized: authentication required"));
        assert!(!is_auth_failure("connection reset by peer"));
    }

    #[test]
    fn test_parse_push_digest() {
        let out = "1.2.3: digest: \
            sha256:4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945 size: 1570";
        assert_eq!(
            parse_push_digest(out).as_deref(),
            Some("sha256:4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945")
        );
        assert!(parse_push_digest("pushed").is_none());
    }

    #[test]
    fn test_build_command_carries_version() {
        let mut source = SourceContext::new("/src/app");
        source.dockerfile = Some(PathBuf::from("Dockerfile.prod"));
        let cmd = DockerCli::default().build_command(&source, &version("1.2.3"));
        assert_eq!(cmd[0], "docker");
        assert!(cmd.contains(&"VERSION=1.2.3".to_string()));
        assert!(cmd.contains(&"/src/app/Dockerfile.prod".to_string()));
        assert_eq!(cmd.last().map(String::as_str), Some("/src/app"));
    }

    #[test]
    fn test_image_reference() {
        let artifact = ArtifactReference {
            repository: "ghcr.io/acme/api".to_string(),
            version: "1.2.3".to_string(),
            tags: vec!["1.2.3".to_string()],
            digest: None,
        };
        assert_eq!(artifact.image_reference(), "ghcr.io/acme/api:1.2.3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_push_times_out() {
        let builder = RecordingArtifactBuilder::new().with_push_delay(Duration::from_secs(600));
        let publisher = ArtifactPublisher::new(Arc::new(builder), "registry.test/acme/api")
            .with_timeouts(None, Some(Duration::from_secs(30)));

        let err = publisher
            .publish(
                &SourceContext::new("."),
                &version("1.2.3"),
                Environment::Staging,
                &BTreeSet::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ArtifactError::Timeout { secs: 30, .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("image push"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_build_times_out() {
        let builder = RecordingArtifactBuilder::new().with_build_delay(Duration::from_secs(600));
        let publisher = ArtifactPublisher::new(Arc::new(builder), "registry.test/acme/api")
            .with_timeouts(Some(Duration::from_secs(60)), None);

        let err = publisher
            .build(&SourceContext::new("."), &version("1.2.3"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
