//! Git integration: source revision capture and the git-backed manifest repository.

use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::manifest::{ManifestError, ManifestLock, ManifestRepository, TagStatus};
use crate::process::{run_command, CommandOutput, CommandSpec};

/// A git invocation that failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("git {command} failed: {stderr}")]
pub struct GitError {
    pub command: String,
    pub stderr: String,
}

/// Capture the HEAD commit SHA from a git repository.
///
/// Runs `git rev-parse HEAD` in the given directory. Returns an error if the
/// directory is not inside a git repository or if git is not available.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .map_err(|e| GitError {
            command: "rev-parse HEAD".to_string(),
            stderr: format!("failed to run git: {e}"),
        })?;

    if !output.status.success() {
        return Err(GitError {
            command: "rev-parse HEAD".to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        return Err(GitError {
            command: "rev-parse HEAD".to_string(),
            stderr: "empty output".to_string(),
        });
    }

    Ok(sha)
}

// ---------------------------------------------------------------------------
// Git-backed manifest repository
// ---------------------------------------------------------------------------

/// [`ManifestRepository`] over a local clone of a remote git repository.
#[derive(Debug, Clone)]
pub struct GitManifestRepository {
    remote: String,
    branch: String,
    workdir: PathBuf,
    author_name: String,
    author_email: String,
    timeout: Option<Duration>,
}

impl GitManifestRepository {
    pub fn new(
        remote: impl Into<String>,
        branch: impl Into<String>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            remote: remote.into(),
            branch: branch.into(),
            workdir: workdir.into(),
            author_name: "shipyard".to_string(),
            author_email: "shipyard@localhost".to_string(),
            timeout: Some(Duration::from_secs(120)),
        }
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Sibling of the work tree, so it can be taken before the first clone.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .workdir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "manifests".into());
        name.push(".lock");
        self.workdir.with_file_name(name)
    }

    /// Run git in the work tree; non-zero exit becomes a [`GitError`].
    async fn git(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        let output = self.git_unchecked(args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(GitError {
                command: args.join(" "),
                stderr: output.diagnostics(),
            })
        }
    }

    async fn git_unchecked(&self, args: &[&str]) -> Result<CommandOutput, GitError> {
        let mut command = vec![
            "git".to_string(),
            "-c".to_string(),
            format!("user.name={}", self.author_name),
            "-c".to_string(),
            format!("user.email={}", self.author_email),
        ];
        command.extend(args.iter().map(|a| a.to_string()));
        let spec = CommandSpec::new(command)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeout);
        debug!(command = %args.join(" "), "git");
        run_command(&spec).await.map_err(|e| GitError {
            command: args.join(" "),
            stderr: e.to_string(),
        })
    }

    async fn ref_exists(&self, reference: &str) -> Result<bool, GitError> {
        let output = self
            .git_unchecked(&["rev-parse", "--verify", "--quiet", reference])
            .await?;
        Ok(output.success)
    }

    /// Resolve a repository-relative path, refusing to escape the work tree.
    fn resolve(&self, path: &str) -> Result<PathBuf, ManifestError> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if path.is_empty() || escapes {
            return Err(ManifestError::Descriptor {
                path: path.to_string(),
                reason: "path must stay inside the manifest repository".to_string(),
            });
        }
        Ok(self.workdir.join(relative))
    }
}

fn is_push_rejection(diagnostics: &str) -> bool {
    ["rejected", "non-fast-forward", "fetch first", "stale info"]
        .iter()
        .any(|needle| diagnostics.contains(needle))
}

#[async_trait]
impl ManifestRepository for GitManifestRepository {
    fn branch(&self) -> &str {
        &self.branch
    }

    async fn open(&self) -> Result<(), ManifestError> {
        if !self.workdir.join(".git").exists() {
            if let Some(parent) = self.workdir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let target = self.workdir.to_string_lossy().to_string();
            let argv = ["git", "clone", "--quiet", self.remote.as_str(), target.as_str()];
            let spec = CommandSpec::new(argv)
                .env("GIT_TERMINAL_PROMPT", "0")
                .timeout(self.timeout);
            let output = run_command(&spec).await.map_err(|e| GitError {
                command: "clone".to_string(),
                stderr: e.to_string(),
            })?;
            if !output.success {
                return Err(GitError {
                    command: "clone".to_string(),
                    stderr: output.diagnostics(),
                }
                .into());
            }
        }

        self.git(&["fetch", "--quiet", "--prune", "--force", "--tags", "origin"])
            .await?;

        let remote_ref = format!("refs/remotes/origin/{}", self.branch);
        if self.ref_exists(&remote_ref).await? {
            let upstream = format!("origin/{}", self.branch);
            self.git(&["checkout", "--quiet", "-f", "-B", &self.branch, &upstream])
                .await?;
        } else {
            // Empty remote: start the branch from nothing.
            let local_ref = format!("refs/heads/{}", self.branch);
            if self.ref_exists(&local_ref).await? {
                self.git(&["update-ref", "-d", &local_ref]).await?;
            }
            self.git(&["symbolic-ref", "HEAD", &local_ref]).await?;
            self.git(&["read-tree", "--empty"]).await?;
        }
        self.git(&["clean", "-fdq"]).await?;
        Ok(())
    }

    async fn lock(&self) -> Result<ManifestLock, ManifestError> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                writeln!(file, "{}", std::process::id())?;
                Ok(ManifestLock::file(path))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ManifestError::Locked { path })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Option<String>, ManifestError> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &str, contents: &str) -> Result<(), ManifestError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, contents).await?;
        Ok(())
    }

    async fn commit(&self, path: &str, message: &str) -> Result<String, ManifestError> {
        self.resolve(path)?;
        self.git(&["add", "--", path]).await?;
        self.git(&["commit", "--quiet", "-m", message]).await?;
        let head = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(head.stdout.trim().to_string())
    }

    async fn push(&self) -> Result<(), ManifestError> {
        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        let output = self
            .git_unchecked(&["push", "--quiet", "origin", &refspec])
            .await?;
        if output.success {
            return Ok(());
        }
        let diagnostics = output.diagnostics();
        if is_push_rejection(&diagnostics) {
            Err(ManifestError::Conflict {
                branch: self.branch.clone(),
            })
        } else {
            Err(GitError {
                command: format!("push origin {refspec}"),
                stderr: diagnostics,
            }
            .into())
        }
    }

    async fn tag(
        &self,
        name: &str,
        commit: &str,
        message: &str,
    ) -> Result<TagStatus, ManifestError> {
        let tag_ref = format!("refs/tags/{name}");
        let remote = self
            .git(&["ls-remote", "--tags", "origin", &tag_ref])
            .await?;
        if !remote.stdout.trim().is_empty() {
            return Ok(TagStatus::AlreadyExists);
        }

        self.git(&["tag", "--force", "--annotate", name, "-m", message, commit])
            .await?;
        let output = self
            .git_unchecked(&["push", "--quiet", "origin", &tag_ref])
            .await?;
        if output.success {
            Ok(TagStatus::Created)
        } else if output.diagnostics().contains("already exists") {
            Ok(TagStatus::AlreadyExists)
        } else {
            Err(GitError {
                command: format!("push origin {tag_ref}"),
                stderr: output.diagnostics(),
            }
            .into())
        }
    }
}
