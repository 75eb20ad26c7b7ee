//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `RecordingArtifactBuilder`, `MemoryMigrationEngine`,
//! `MemoryManifestRepository`, `ScriptedReconciler` and `ScriptedHealthProbe`
//! that satisfy the trait contracts without docker, databases, git or HTTP.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::artifact::{ArtifactBuilder, ArtifactError, SourceContext};
use crate::domain::{DatabaseTarget, MigrationUnit, ReleaseVersion};
use crate::health::{HealthError, HealthProbe};
use crate::manifest::{ManifestError, ManifestLock, ManifestRepository, TagStatus};
use crate::migration_gate::{EngineError, MigrationEngine};
use crate::reconcile::{ClusterReconciler, ClusterTarget, ReconcileError};

// ---------------------------------------------------------------------------
// RecordingArtifactBuilder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BuilderLog {
    built: Vec<String>,
    tagged: Vec<String>,
    pushed: Vec<String>,
}

/// Artifact builder that records calls instead of running docker.
#[derive(Debug, Default)]
pub struct RecordingArtifactBuilder {
    log: Mutex<BuilderLog>,
    build_failure: Option<String>,
    reject_credentials: bool,
    build_delay: Option<Duration>,
    push_delay: Option<Duration>,
}

impl RecordingArtifactBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every build fails with `reason`.
    pub fn failing_build(reason: impl Into<String>) -> Self {
        Self {
            build_failure: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Every push is refused by the registry.
    pub fn rejecting_credentials() -> Self {
        Self {
            reject_credentials: true,
            ..Self::default()
        }
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    pub fn with_push_delay(mut self, delay: Duration) -> Self {
        self.push_delay = Some(delay);
        self
    }

    /// Versions built, in order.
    pub fn built(&self) -> Vec<String> {
        self.log.lock().unwrap().built.clone()
    }

    pub fn tagged(&self) -> Vec<String> {
        self.log.lock().unwrap().tagged.clone()
    }

    /// References pushed, in order.
    pub fn pushed(&self) -> Vec<String> {
        self.log.lock().unwrap().pushed.clone()
    }
}

#[async_trait]
impl ArtifactBuilder for RecordingArtifactBuilder {
    async fn build(
        &self,
        _source: &SourceContext,
        version: &ReleaseVersion,
    ) -> Result<String, ArtifactError> {
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.build_failure {
            return Err(ArtifactError::Build(reason.clone()));
        }
        self.log
            .lock()
            .unwrap()
            .built
            .push(version.as_str().to_string());
        Ok(format!("sha256:{}", short_digest(version.as_str())))
    }

    async fn tag(&self, _image_id: &str, reference: &str) -> Result<(), ArtifactError> {
        self.log.lock().unwrap().tagged.push(reference.to_string());
        Ok(())
    }

    async fn push(&self, reference: &str) -> Result<Option<String>, ArtifactError> {
        if let Some(delay) = self.push_delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_credentials {
            return Err(ArtifactError::Authentication {
                registry: "registry.test".to_string(),
                reason: "unauthorized: authentication required".to_string(),
            });
        }
        self.log.lock().unwrap().pushed.push(reference.to_string());
        Ok(Some(format!("sha256:{}", short_digest(reference))))
    }
}

// ---------------------------------------------------------------------------
// MemoryMigrationEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct EngineState {
    current: Option<String>,
    history: Vec<String>,
    objects: u64,
}

/// Migration engine over an in-memory revision pointer.
///
/// Each applied unit adds one schema object. Every trait call counts as a
/// database contact.
#[derive(Debug, Default)]
pub struct MemoryMigrationEngine {
    state: Mutex<EngineState>,
    fail_on: Option<String>,
    probes: BTreeSet<String>,
    contacts: AtomicU32,
}

impl MemoryMigrationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Database already at `revision`.
    pub fn at_revision(self, revision: impl Into<String>) -> Self {
        let revision = revision.into();
        {
            let mut state = self.state.lock().unwrap();
            state.history.push(revision.clone());
            state.current = Some(revision);
        }
        self
    }

    /// Upgrading to `revision` fails.
    pub fn failing_on(mut self, revision: impl Into<String>) -> Self {
        self.fail_on = Some(revision.into());
        self
    }

    /// Schema objects present before any upgrade.
    pub fn with_objects(self, count: u64) -> Self {
        self.state.lock().unwrap().objects = count;
        self
    }

    /// Domain object that `probe` reports as present.
    pub fn with_probe(mut self, name: impl Into<String>) -> Self {
        self.probes.insert(name.into());
        self
    }

    pub fn contacts(&self) -> u32 {
        self.contacts.load(Ordering::SeqCst)
    }

    /// Revision history, oldest first.
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn current_revision(&self) -> Option<String> {
        self.state.lock().unwrap().current.clone()
    }

    fn touch(&self) {
        self.contacts.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MigrationEngine for MemoryMigrationEngine {
    async fn current(&self, _db: &DatabaseTarget) -> Result<Option<String>, EngineError> {
        self.touch();
        Ok(self.state.lock().unwrap().current.clone())
    }

    async fn history(&self, _db: &DatabaseTarget) -> Result<Vec<String>, EngineError> {
        self.touch();
        Ok(self.applied())
    }

    async fn upgrade(&self, _db: &DatabaseTarget, unit: &MigrationUnit) -> Result<(), EngineError> {
        self.touch();
        let revision = unit.revision_id().to_string();
        if self.fail_on.as_deref() == Some(revision.as_str()) {
            return Err(EngineError::Upgrade {
                revision,
                reason: "relation already exists".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.history.push(revision.clone());
        state.current = Some(revision);
        state.objects += 1;
        Ok(())
    }

    async fn schema_object_count(&self, _db: &DatabaseTarget) -> Result<u64, EngineError> {
        self.touch();
        Ok(self.state.lock().unwrap().objects)
    }

    async fn probe(&self, _db: &DatabaseTarget, name: &str) -> Result<bool, EngineError> {
        self.touch();
        Ok(self.probes.contains(name))
    }
}

// ---------------------------------------------------------------------------
// MemoryManifestRepository
// ---------------------------------------------------------------------------

/// A commit recorded by [`MemoryManifestRepository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCommit {
    pub id: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct RepoState {
    /// Remote files.
    published: BTreeMap<String, String>,
    /// Working copy.
    working: BTreeMap<String, String>,
    commits: Vec<MemoryCommit>,
    pending: Vec<MemoryCommit>,
    tags: BTreeMap<String, String>,
    rejections_left: u32,
    pushes: u32,
    opens: u32,
}

/// Manifest repository with a simulated remote.
///
/// Commits stay local until a successful push; `open` discards them, like a
/// hard reset to the remote branch.
#[derive(Debug)]
pub struct MemoryManifestRepository {
    branch: String,
    state: Mutex<RepoState>,
}

impl MemoryManifestRepository {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            state: Mutex::new(RepoState::default()),
        }
    }

    /// Seed a descriptor on the remote.
    pub fn with_file(self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.state
            .lock()
            .unwrap()
            .published
            .insert(path.into(), contents.into());
        self
    }

    /// Seed an existing tag on the remote.
    pub fn with_tag(self, name: impl Into<String>) -> Self {
        self.state
            .lock()
            .unwrap()
            .tags
            .insert(name.into(), "0000000".to_string());
        self
    }

    /// The next `count` pushes are rejected as non-fast-forward.
    pub fn rejecting_pushes(self, count: u32) -> Self {
        self.state.lock().unwrap().rejections_left = count;
        self
    }

    /// Published commits, oldest first.
    pub fn commits(&self) -> Vec<MemoryCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    /// Remote contents of `path`.
    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().published.get(path).cloned()
    }

    /// Remote tags: name to commit id.
    pub fn tags(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().tags.clone()
    }

    /// Push attempts, including rejected ones.
    pub fn pushes(&self) -> u32 {
        self.state.lock().unwrap().pushes
    }

    pub fn opens(&self) -> u32 {
        self.state.lock().unwrap().opens
    }
}

#[async_trait]
impl ManifestRepository for MemoryManifestRepository {
    fn branch(&self) -> &str {
        &self.branch
    }

    async fn open(&self) -> Result<(), ManifestError> {
        let mut state = self.state.lock().unwrap();
        state.working = state.published.clone();
        state.pending.clear();
        state.opens += 1;
        Ok(())
    }

    async fn lock(&self) -> Result<ManifestLock, ManifestError> {
        Ok(ManifestLock::noop())
    }

    async fn read(&self, path: &str) -> Result<Option<String>, ManifestError> {
        Ok(self.state.lock().unwrap().working.get(path).cloned())
    }

    async fn write(&self, path: &str, contents: &str) -> Result<(), ManifestError> {
        self.state
            .lock()
            .unwrap()
            .working
            .insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn commit(&self, path: &str, message: &str) -> Result<String, ManifestError> {
        let mut state = self.state.lock().unwrap();
        let parent = state
            .pending
            .last()
            .or(state.commits.last())
            .map(|c| c.id.clone())
            .unwrap_or_default();
        let contents = state.working.get(path).cloned().unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(parent.as_bytes());
        hasher.update(path.as_bytes());
        hasher.update(contents.as_bytes());
        hasher.update(message.as_bytes());
        let id = hex::encode(hasher.finalize())[..40].to_string();

        state.pending.push(MemoryCommit {
            id: id.clone(),
            path: path.to_string(),
            message: message.to_string(),
        });
        Ok(id)
    }

    async fn push(&self) -> Result<(), ManifestError> {
        let mut state = self.state.lock().unwrap();
        state.pushes += 1;
        if state.rejections_left > 0 {
            state.rejections_left -= 1;
            return Err(ManifestError::Conflict {
                branch: self.branch.clone(),
            });
        }
        let pending = std::mem::take(&mut state.pending);
        state.commits.extend(pending);
        state.published = state.working.clone();
        Ok(())
    }

    async fn tag(
        &self,
        name: &str,
        commit: &str,
        _message: &str,
    ) -> Result<TagStatus, ManifestError> {
        let mut state = self.state.lock().unwrap();
        if state.tags.contains_key(name) {
            return Ok(TagStatus::AlreadyExists);
        }
        state.tags.insert(name.to_string(), commit.to_string());
        Ok(TagStatus::Created)
    }
}

// ---------------------------------------------------------------------------
// ScriptedReconciler
// ---------------------------------------------------------------------------

/// Reconciler that succeeds or fails on every call.
#[derive(Debug, Default)]
pub struct ScriptedReconciler {
    failure: Option<String>,
    calls: AtomicU32,
}

impl ScriptedReconciler {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterReconciler for ScriptedReconciler {
    async fn refresh(&self, _target: &ClusterTarget) -> Result<(), ReconcileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(reason) => Err(ReconcileError::Transport(reason.clone())),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedHealthProbe
// ---------------------------------------------------------------------------

/// Health probe that fails a fixed number of times before answering.
#[derive(Debug)]
pub struct ScriptedHealthProbe {
    /// Failures before the first success; `None` never succeeds.
    failures_before_success: Option<u32>,
    calls: AtomicU32,
}

impl ScriptedHealthProbe {
    pub fn healthy() -> Self {
        Self::healthy_after(0)
    }

    pub fn healthy_after(failures: u32) -> Self {
        Self {
            failures_before_success: Some(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self {
            failures_before_success: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedHealthProbe {
    async fn check(&self, _endpoint: &str) -> Result<(), HealthError> {
        let previous = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures_before_success {
            Some(failures) if previous >= failures => Ok(()),
            _ => Err(HealthError::Unhealthy { status: 503 }),
        }
    }
}

fn short_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_repo_discards_unpushed_commits_on_open() {
        let repo = MemoryManifestRepository::new("main").rejecting_pushes(1);
        repo.open().await.unwrap();
        repo.write("a.yaml", "image: x\n").await.unwrap();
        repo.commit("a.yaml", "first").await.unwrap();
        assert!(repo.push().await.is_err());

        repo.open().await.unwrap();
        assert!(repo.read("a.yaml").await.unwrap().is_none());
        assert!(repo.commits().is_empty());
    }

    #[tokio::test]
    async fn memory_engine_counts_contacts() {
        let engine = MemoryMigrationEngine::new().at_revision("001");
        let db = DatabaseTarget::new("test", "postgresql://localhost/test");
        assert_eq!(engine.current(&db).await.unwrap().as_deref(), Some("001"));
        assert_eq!(engine.contacts(), 1);
    }

    #[tokio::test]
    async fn scripted_probe_recovers() {
        let probe = ScriptedHealthProbe::healthy_after(1);
        assert!(probe.check("x").await.is_err());
        assert!(probe.check("x").await.is_ok());
        assert_eq!(probe.calls(), 2);
    }
}
