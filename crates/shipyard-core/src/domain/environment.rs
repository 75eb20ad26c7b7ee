//! Promotion ladder environments.

use serde::{Deserialize, Serialize};

use crate::domain::version::ReleaseVersion;

/// Literal a caller must present to authorize a production run.
pub const PRODUCTION_CONFIRMATION_TOKEN: &str = "deploy-to-production";

/// Deployment environment for a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Every environment, in promotion order.
    pub const ALL: [Environment; 3] = [
        Environment::Development,
        Environment::Staging,
        Environment::Production,
    ];

    /// Full lowercase name, used in manifest paths and rollback tags.
    pub fn name(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    /// Short name, used for moving image aliases.
    pub fn short_name(&self) -> &'static str {
        match self {
            Environment::Development => "dev",
            Environment::Staging => "staging",
            Environment::Production => "prod",
        }
    }

    /// Suffix appended to non-overridden versions built for this environment.
    pub fn version_suffix(&self) -> Option<&'static str> {
        match self {
            Environment::Development => None,
            Environment::Staging => Some(".RELEASE"),
            Environment::Production => Some(".PROD"),
        }
    }

    /// Moving image tag tracked by automatic pollers (e.g. `dev-latest`).
    pub fn latest_alias(&self) -> String {
        format!("{}-latest", self.short_name())
    }

    /// Whether a run needs the confirmation token before any work starts.
    pub fn requires_confirmation(&self) -> bool {
        matches!(self, Environment::Production)
    }

    /// Rollback tag for a shipped version; only staging and production are tagged.
    pub fn rollback_tag(&self, version: &ReleaseVersion) -> Option<String> {
        match self {
            Environment::Development => None,
            Environment::Staging | Environment::Production => {
                Some(format!("{}-v{}", self.name(), version.as_str()))
            }
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "develop" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!(
                "unknown environment '{other}' (expected development, staging or production)"
            )),
        }
    }
}
