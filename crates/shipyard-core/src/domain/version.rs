//! Release version value type.

use serde::{Deserialize, Serialize};

/// Where a resolved version came from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    /// Caller-supplied override, used verbatim.
    Override,
    /// Trimmed contents of the version marker file.
    File,
    /// `0.0.<unix seconds>-<short revision>` fallback.
    #[default]
    Synthesized,
}

/// The version a run builds, tags and ships.
///
/// Only [`crate::VersionResolver`] constructs one; once resolved it is never
/// mutated, so every downstream stage sees the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseVersion {
    value: String,
    source: VersionSource,
}

impl ReleaseVersion {
    pub(crate) fn new(value: String, source: VersionSource) -> Self {
        Self { value, source }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> VersionSource {
        self.source
    }
}

impl std::fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}
