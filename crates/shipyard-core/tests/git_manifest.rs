//! Manifest mutation against real git repositories.
//!
//! Each test creates a bare "remote" and one or more clones in temp dirs.

use std::path::Path;
use std::process::Command;

use shipyard_core::{
    Environment, ErrorKind, GitManifestRepository, ManifestError, ManifestMutator,
    ManifestRepository, MutationOutcome, RunMetadata, TagStatus, VersionResolver,
};

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn bare_remote() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init", "--bare", "--quiet"]);
    git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/main"]);
    dir
}

fn clone_of(remote: &Path, scratch: &Path, name: &str) -> GitManifestRepository {
    GitManifestRepository::new(remote.to_string_lossy(), "main", scratch.join(name))
        .with_author("shipyard-test", "shipyard@test.local")
}

fn meta(environment: Environment, version: &str) -> RunMetadata {
    RunMetadata {
        run_id: "run-42".to_string(),
        version: VersionResolver::resolve(Some(version), None, "abcdef1234", environment).unwrap(),
        revision: "abcdef1234".to_string(),
        actor: "release-bot".to_string(),
        environment,
    }
}

fn remote_commit_count(remote: &Path) -> usize {
    git(remote, &["rev-list", "--count", "main"]).parse().unwrap()
}

#[tokio::test]
async fn bootstrap_on_empty_remote_is_one_commit() {
    let remote = bare_remote();
    let scratch = tempfile::tempdir().unwrap();
    let repo = clone_of(remote.path(), scratch.path(), "work");

    let outcome = ManifestMutator::default()
        .mutate(
            &repo,
            "environments/development/values.yaml",
            "ghcr.io/acme/api:1.0.0",
            &meta(Environment::Development, "1.0.0"),
        )
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        MutationOutcome::Committed {
            bootstrapped: true,
            rollback_tag: None,
            ..
        }
    ));
    assert_eq!(remote_commit_count(remote.path()), 1);

    let shown = git(
        remote.path(),
        &["show", "main:environments/development/values.yaml"],
    );
    assert!(shown.contains("image: ghcr.io/acme/api:1.0.0"));
    assert!(shown.contains("environment: development"));

    let message = git(remote.path(), &["log", "-1", "--format=%B", "main"]);
    assert!(message.starts_with("deploy(development): ghcr.io/acme/api:1.0.0"));
    assert!(message.contains("actor: release-bot"));
}

#[tokio::test]
async fn unchanged_image_makes_no_commit() {
    let remote = bare_remote();
    let scratch = tempfile::tempdir().unwrap();
    let repo = clone_of(remote.path(), scratch.path(), "work");
    let mutator = ManifestMutator::default();
    let meta = meta(Environment::Development, "1.0.0");

    mutator
        .mutate(&repo, "dev.yaml", "acme/api:1.0.0", &meta)
        .await
        .unwrap();
    let second = mutator
        .mutate(&repo, "dev.yaml", "acme/api:1.0.0", &meta)
        .await
        .unwrap();

    assert!(matches!(second, MutationOutcome::NoChange { .. }));
    assert_eq!(remote_commit_count(remote.path()), 1);
}

#[tokio::test]
async fn staging_release_is_tagged_once() {
    let remote = bare_remote();
    let scratch = tempfile::tempdir().unwrap();
    let repo = clone_of(remote.path(), scratch.path(), "work");
    let mutator = ManifestMutator::default();
    let meta = meta(Environment::Staging, "2.0.0");

    let first = mutator
        .mutate(&repo, "staging.yaml", "acme/api:2.0.0", &meta)
        .await
        .unwrap();
    assert!(matches!(
        first,
        MutationOutcome::Committed {
            tag_status: Some(TagStatus::Created),
            ..
        }
    ));
    assert_eq!(first.rollback_tag(), Some("staging-v2.0.0"));
    let tagged = git(remote.path(), &["rev-list", "-n", "1", "staging-v2.0.0"]);
    assert_eq!(Some(tagged.as_str()), first.commit());

    // Same version, different image: new commit, existing tag left alone.
    let second = mutator
        .mutate(&repo, "staging.yaml", "acme/api:2.0.0-hotfix", &meta)
        .await
        .unwrap();
    assert!(matches!(
        second,
        MutationOutcome::Committed {
            tag_status: Some(TagStatus::AlreadyExists),
            ..
        }
    ));
    let still_tagged = git(remote.path(), &["rev-list", "-n", "1", "staging-v2.0.0"]);
    assert_eq!(still_tagged, tagged);
}

#[tokio::test]
async fn stale_clone_push_is_conflict_and_reopen_recovers() {
    let remote = bare_remote();
    let scratch = tempfile::tempdir().unwrap();
    let mutator = ManifestMutator::default();
    let meta = meta(Environment::Development, "1.0.0");

    let seed = clone_of(remote.path(), scratch.path(), "seed");
    mutator
        .mutate(&seed, "dev.yaml", "acme/api:0.9.0", &meta)
        .await
        .unwrap();

    let stale = clone_of(remote.path(), scratch.path(), "stale");
    stale.open().await.unwrap();

    let other = clone_of(remote.path(), scratch.path(), "other");
    mutator
        .mutate(&other, "other.yaml", "acme/worker:1.0.0", &meta)
        .await
        .unwrap();

    stale
        .write("dev.yaml", "image: acme/api:1.0.0\n")
        .await
        .unwrap();
    stale.commit("dev.yaml", "manual").await.unwrap();
    let err = stale.push().await.unwrap_err();
    assert!(matches!(err, ManifestError::Conflict { .. }));
    assert_eq!(err.kind(), ErrorKind::ManifestConflict);

    // A full mutation re-fetches, so the retry lands on top of the remote.
    let retried = mutator
        .mutate(&stale, "dev.yaml", "acme/api:1.0.0", &meta)
        .await
        .unwrap();
    assert!(matches!(retried, MutationOutcome::Committed { bootstrapped: false, .. }));
    assert_eq!(remote_commit_count(remote.path()), 3);
    let other_file = git(remote.path(), &["show", "main:other.yaml"]);
    assert!(other_file.contains("acme/worker:1.0.0"));
}

#[tokio::test]
async fn other_descriptor_fields_survive_mutation() {
    let remote = bare_remote();
    let scratch = tempfile::tempdir().unwrap();
    let repo = clone_of(remote.path(), scratch.path(), "work");
    repo.open().await.unwrap();
    repo.write(
        "prod.yaml",
        "environment: production\nreplicas: 6\nresources:\n  cpu: 500m\nimage: acme/api:1.0.0.PROD\n",
    )
    .await
    .unwrap();
    repo.commit("prod.yaml", "seed").await.unwrap();
    repo.push().await.unwrap();

    ManifestMutator::default()
        .mutate(
            &repo,
            "prod.yaml",
            "acme/api:1.1.0.PROD",
            &meta(Environment::Production, "1.1.0.PROD"),
        )
        .await
        .unwrap();

    let shown = git(remote.path(), &["show", "main:prod.yaml"]);
    let doc: serde_yaml::Value = serde_yaml::from_str(&shown).unwrap();
    assert_eq!(doc["replicas"].as_u64(), Some(6));
    assert_eq!(doc["resources"]["cpu"].as_str(), Some("500m"));
    assert_eq!(doc["image"].as_str(), Some("acme/api:1.1.0.PROD"));
}

#[tokio::test]
async fn held_lock_keeps_second_run_off_the_work_tree() {
    let remote = bare_remote();
    let scratch = tempfile::tempdir().unwrap();
    let mutator = ManifestMutator::default();

    let seed = clone_of(remote.path(), scratch.path(), "work");
    let staging = meta(Environment::Staging, "1");
    mutator
        .mutate(&seed, "staging.yaml", "acme/api:1", &staging)
        .await
        .unwrap();

    // First run holds the lock and has an unpushed commit in the shared tree.
    let first = clone_of(remote.path(), scratch.path(), "work");
    let _held = first.lock().await.unwrap();
    first.open().await.unwrap();
    first
        .write("staging.yaml", "image: acme/api:2\n")
        .await
        .unwrap();
    let pending = first.commit("staging.yaml", "in flight").await.unwrap();

    // A second run on another environment shares the tree and must not touch it.
    let second = clone_of(remote.path(), scratch.path(), "work");
    let prod = meta(Environment::Production, "2.PROD");
    let err = mutator
        .mutate(&second, "prod.yaml", "acme/api:2.PROD", &prod)
        .await
        .unwrap_err();
    assert!(matches!(err, ManifestError::Locked { .. }));

    let work = scratch.path().join("work");
    assert_eq!(git(&work, &["rev-parse", "HEAD"]), pending);
    let on_disk = std::fs::read_to_string(work.join("staging.yaml")).unwrap();
    assert_eq!(on_disk, "image: acme/api:2\n");
}
