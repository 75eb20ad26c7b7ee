//! Manifest repository mutation.
//!
//! Each environment owns one YAML descriptor in the manifest repository. A
//! run rewrites a single key path (the image reference), leaves every other
//! field alone, commits with an audit message, pushes, and for staging and
//! production leaves an annotated rollback tag behind.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};

use crate::domain::{Environment, ErrorKind, ReleaseVersion};
use crate::git::GitError;

/// Default dotted key path of the image reference inside a descriptor.
pub const DEFAULT_IMAGE_KEY: &str = "image";

/// Manifest repository failure.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("push to {branch} rejected: remote moved ahead")]
    Conflict { branch: String },

    #[error("manifest repository is locked by another run ({})", .path.display())]
    Locked { path: PathBuf },

    #[error("invalid descriptor {path}: {reason}")]
    Descriptor { path: String, reason: String },

    #[error("manifest io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManifestError::Conflict { .. } | ManifestError::Locked { .. } => {
                ErrorKind::ManifestConflict
            }
            ManifestError::Descriptor { .. } => ErrorKind::Configuration,
            ManifestError::Git(_) | ManifestError::Io(_) => ErrorKind::Repository,
        }
    }
}

/// Result of a rollback tag request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TagStatus {
    Created,
    AlreadyExists,
}

/// Advisory lock held for the duration of a mutation; released on drop.
#[derive(Debug)]
pub struct ManifestLock {
    path: Option<PathBuf>,
}

impl ManifestLock {
    /// Lock backed by a file that is removed on drop.
    pub fn file(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// Lock with nothing to release (in-memory repositories).
    pub fn noop() -> Self {
        Self { path: None }
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to release manifest lock");
            }
        }
    }
}

/// A versioned store of deployment descriptors.
///
/// Paths are relative to the repository root. `open` must leave the working
/// copy identical to the pinned remote branch, discarding local leftovers.
/// Callers take `lock` before `open`; the lock covers the whole working copy.
#[async_trait]
pub trait ManifestRepository: Send + Sync {
    /// Branch every mutation is committed to.
    fn branch(&self) -> &str;

    async fn open(&self) -> Result<(), ManifestError>;

    /// Exclusive hold on the working copy, failing fast when another run has it.
    async fn lock(&self) -> Result<ManifestLock, ManifestError>;

    /// Descriptor contents, `None` when the file does not exist.
    async fn read(&self, path: &str) -> Result<Option<String>, ManifestError>;

    async fn write(&self, path: &str, contents: &str) -> Result<(), ManifestError>;

    /// Commit `path`, returning the new commit id.
    async fn commit(&self, path: &str, message: &str) -> Result<String, ManifestError>;

    /// Push the branch. A rejected non-fast-forward is [`ManifestError::Conflict`].
    async fn push(&self) -> Result<(), ManifestError>;

    /// Create and publish an annotated tag; idempotent for an existing name.
    async fn tag(&self, name: &str, commit: &str, message: &str)
        -> Result<TagStatus, ManifestError>;
}

/// Audit data embedded in every manifest commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMetadata {
    pub run_id: String,
    pub version: ReleaseVersion,
    pub revision: String,
    pub actor: String,
    pub environment: Environment,
}

/// What a mutation did to the manifest repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MutationOutcome {
    Committed {
        commit: String,
        /// The descriptor did not exist and was created by this commit.
        bootstrapped: bool,
        rollback_tag: Option<String>,
        tag_status: Option<TagStatus>,
    },
    NoChange {
        current: String,
    },
}

impl MutationOutcome {
    pub fn commit(&self) -> Option<&str> {
        match self {
            MutationOutcome::Committed { commit, .. } => Some(commit),
            MutationOutcome::NoChange { .. } => None,
        }
    }

    pub fn rollback_tag(&self) -> Option<&str> {
        match self {
            MutationOutcome::Committed { rollback_tag, .. } => rollback_tag.as_deref(),
            MutationOutcome::NoChange { .. } => None,
        }
    }
}

/// Rewrites one environment's image reference in the manifest repository.
#[derive(Debug, Clone)]
pub struct ManifestMutator {
    key_path: String,
}

impl Default for ManifestMutator {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_KEY)
    }
}

impl ManifestMutator {
    pub fn new(key_path: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }

    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    /// Point `environment_path` at `image_reference` and publish the change.
    pub async fn mutate(
        &self,
        repo: &dyn ManifestRepository,
        environment_path: &str,
        image_reference: &str,
        meta: &RunMetadata,
    ) -> Result<MutationOutcome, ManifestError> {
        let _lock = repo.lock().await?;
        repo.open().await?;

        let (mut doc, bootstrapped) = match repo.read(environment_path).await? {
            Some(raw) => (parse_descriptor(environment_path, &raw)?, false),
            None => {
                info!(path = %environment_path, "descriptor missing, bootstrapping");
                (default_descriptor(meta.environment), true)
            }
        };

        let current = lookup(&doc, &self.key_path).and_then(Value::as_str).map(str::to_string);
        if !bootstrapped && current.as_deref() == Some(image_reference) {
            debug!(path = %environment_path, image = %image_reference, "manifest already current");
            return Ok(MutationOutcome::NoChange {
                current: image_reference.to_string(),
            });
        }

        assign(&mut doc, &self.key_path, image_reference).map_err(|reason| {
            ManifestError::Descriptor {
                path: environment_path.to_string(),
                reason,
            }
        })?;
        let rendered = serde_yaml::to_string(&doc).map_err(|e| ManifestError::Descriptor {
            path: environment_path.to_string(),
            reason: e.to_string(),
        })?;

        repo.write(environment_path, &rendered).await?;
        let commit = repo
            .commit(environment_path, &commit_message(image_reference, meta))
            .await?;
        repo.push().await?;
        info!(
            branch = %repo.branch(),
            commit = %commit,
            image = %image_reference,
            previous = ?current,
            "manifest updated"
        );

        let rollback_tag = meta.environment.rollback_tag(&meta.version);
        let tag_status = match &rollback_tag {
            Some(name) => {
                let message = format!(
                    "rollback point: {} {}",
                    meta.environment.name(),
                    meta.version
                );
                let status = repo.tag(name, &commit, &message).await?;
                if status == TagStatus::AlreadyExists {
                    info!(tag = %name, "rollback tag already present");
                }
                Some(status)
            }
            None => None,
        };

        Ok(MutationOutcome::Committed {
            commit,
            bootstrapped,
            rollback_tag,
            tag_status,
        })
    }
}

/// Commit message: a subject line plus one audit field per line.
pub fn commit_message(image_reference: &str, meta: &RunMetadata) -> String {
    format!(
        "deploy({env}): {image}\n\nversion: {version}\nrevision: {revision}\nactor: {actor}\nenvironment: {env}\nrun: {run}\n",
        env = meta.environment.name(),
        image = image_reference,
        version = meta.version,
        revision = meta.revision,
        actor = meta.actor,
        run = meta.run_id,
    )
}

fn parse_descriptor(path: &str, raw: &str) -> Result<Value, ManifestError> {
    let doc: Value = serde_yaml::from_str(raw).map_err(|e| ManifestError::Descriptor {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    match doc {
        Value::Mapping(_) => Ok(doc),
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        _ => Err(ManifestError::Descriptor {
            path: path.to_string(),
            reason: "top level is not a mapping".to_string(),
        }),
    }
}

/// Descriptor written for an environment that has none yet.
fn default_descriptor(environment: Environment) -> Value {
    let mut map = Mapping::new();
    map.insert(
        Value::from("environment"),
        Value::from(environment.name()),
    );
    map.insert(Value::from("replicas"), Value::from(1));
    Value::Mapping(map)
}

/// Value at a dotted key path.
pub fn lookup<'a>(doc: &'a Value, key_path: &str) -> Option<&'a Value> {
    key_path
        .split('.')
        .try_fold(doc, |node, segment| node.as_mapping()?.get(segment))
}

/// Set a string at a dotted key path, creating intermediate mappings.
fn assign(doc: &mut Value, key_path: &str, value: &str) -> Result<(), String> {
    let segments: Vec<&str> = key_path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(format!("invalid key path '{key_path}'"));
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(format!("invalid key path '{key_path}'"));
    };

    let mut node = doc;
    for segment in parents {
        let Value::Mapping(map) = node else {
            return Err(format!("'{segment}' is not inside a mapping"));
        };
        node = map
            .entry(Value::from(*segment))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if node.is_null() {
            *node = Value::Mapping(Mapping::new());
        }
    }
    match node {
        Value::Mapping(map) => {
            map.insert(Value::from(*last), Value::from(value));
            Ok(())
        }
        _ => Err(format!("parent of '{last}' is not a mapping")),
    }
}
