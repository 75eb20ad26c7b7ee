//! Schema migration units and outcomes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::error::Result;

/// One schema migration as shipped with a release.
///
/// Every field is optional on the wire so a malformed unit can still be
/// loaded and reported by the migration gate instead of failing to parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationUnit {
    /// Unique revision id.
    #[serde(default)]
    pub revision: Option<String>,

    /// Parent revision; `None` marks the root of the chain.
    #[serde(default)]
    pub down_revision: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Script that moves the schema from the parent to this revision.
    #[serde(default)]
    pub upgrade: Option<String>,

    /// Script that moves the schema back to the parent revision.
    #[serde(default)]
    pub downgrade: Option<String>,
}

impl MigrationUnit {
    /// Create a fully populated unit.
    pub fn new(
        revision: impl Into<String>,
        down_revision: Option<&str>,
        upgrade: impl Into<String>,
        downgrade: impl Into<String>,
    ) -> Self {
        Self {
            revision: Some(revision.into()),
            down_revision: down_revision.map(str::to_string),
            description: None,
            upgrade: Some(upgrade.into()),
            downgrade: Some(downgrade.into()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Revision id, or the empty string when missing.
    pub fn revision_id(&self) -> &str {
        self.revision.as_deref().unwrap_or("")
    }

    /// Parent revision, treating an empty string as "no parent".
    pub fn parent(&self) -> Option<&str> {
        self.down_revision.as_deref().filter(|p| !p.trim().is_empty())
    }
}

/// The migrations shipped with a release, in load order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationSet {
    pub units: Vec<MigrationUnit>,
}

impl MigrationSet {
    pub fn new(units: Vec<MigrationUnit>) -> Self {
        Self { units }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Load every `*.yaml` / `*.yml` unit file in `dir`, sorted by file name.
    ///
    /// A missing directory yields an empty set: a service without migrations
    /// is legitimate and the gate reports `skipped` for it.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            return Ok(Self::empty());
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if path.is_file() && is_yaml {
                paths.push(path);
            }
        }
        paths.sort();

        let mut units = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = std::fs::read_to_string(&path)?;
            let unit: MigrationUnit = serde_yaml::from_str(&raw)?;
            units.push(unit);
        }
        Ok(Self { units })
    }
}

/// Connection descriptor for the database a migration set targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseTarget {
    pub name: String,
    pub url: String,
}

impl DatabaseTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// URL with any password replaced, safe for logs.
    pub fn redacted_url(&self) -> String {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return self.url.clone();
        };
        let Some((credentials, host)) = rest.rsplit_once('@') else {
            return self.url.clone();
        };
        match credentials.split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
            None => self.url.clone(),
        }
    }
}

impl std::fmt::Display for DatabaseTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.redacted_url())
    }
}

/// Tri-state result of applying a migration set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Applied,
    Skipped,
    Failed,
}

/// What the migration gate did against the target database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub status: MigrationStatus,

    /// Rendered upgrade path, one line per pending unit.
    pub preview: Vec<String>,

    /// Revisions applied during this run, in order.
    pub applied: Vec<String>,

    /// Revision whose upgrade failed, if any.
    pub failed_revision: Option<String>,

    /// Schema objects observed after apply; a sanity check, not a proof.
    pub schema_object_count: Option<u64>,

    /// Why the gate skipped or failed.
    pub message: Option<String>,

    /// Non-fatal findings (e.g. a missing health probe).
    pub warnings: Vec<String>,
}

impl MigrationOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: MigrationStatus::Skipped,
            preview: Vec::new(),
            applied: Vec::new(),
            failed_revision: None,
            schema_object_count: None,
            message: Some(reason.into()),
            warnings: Vec::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: MigrationStatus::Failed,
            message: Some(reason.into()),
            ..Self::skipped("")
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == MigrationStatus::Failed
    }
}
