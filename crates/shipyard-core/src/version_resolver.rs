//! Build version resolution.
//!
//! Precedence: explicit override, then the version marker file, then a
//! synthesized `0.0.<unix seconds>-<short revision>`. Staging and production
//! builds get an environment suffix unless the version was overridden.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{Environment, ReleaseVersion, Result, ShipyardError, VersionSource};

/// Length of the revision prefix embedded in synthesized versions.
pub const SHORT_REVISION_LEN: usize = 7;

/// Computes the immutable version for a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionResolver;

impl VersionResolver {
    /// Resolve using the current UTC time for the synthesized fallback.
    pub fn resolve(
        version_override: Option<&str>,
        version_file: Option<&Path>,
        revision_id: &str,
        environment: Environment,
    ) -> Result<ReleaseVersion> {
        Self::resolve_at(
            version_override,
            version_file,
            revision_id,
            environment,
            Utc::now(),
        )
    }

    /// Resolve at a fixed timestamp (used for deterministic tests).
    pub fn resolve_at(
        version_override: Option<&str>,
        version_file: Option<&Path>,
        revision_id: &str,
        environment: Environment,
        now: DateTime<Utc>,
    ) -> Result<ReleaseVersion> {
        if let Some(explicit) = version_override.filter(|v| !v.is_empty()) {
            debug!(version = %explicit, "using version override");
            return Ok(ReleaseVersion::new(
                explicit.to_string(),
                VersionSource::Override,
            ));
        }

        let (base, source) = match read_version_file(version_file)? {
            Some(base) => (base, VersionSource::File),
            None => {
                let revision = revision_id.trim();
                if revision.is_empty() {
                    return Err(ShipyardError::Configuration(
                        "cannot resolve a version: no override, no version file and no source revision"
                            .to_string(),
                    ));
                }
                let short: String = revision.chars().take(SHORT_REVISION_LEN).collect();
                (
                    format!("0.0.{}-{}", now.timestamp(), short),
                    VersionSource::Synthesized,
                )
            }
        };

        let value = match environment.version_suffix() {
            Some(suffix) => format!("{base}{suffix}"),
            None => base,
        };
        debug!(version = %value, ?source, environment = %environment, "resolved version");
        Ok(ReleaseVersion::new(value, source))
    }
}

/// Trimmed version marker contents; `None` when absent or blank.
fn read_version_file(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let trimmed = raw.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-13T10:00:00Z")
            .expect("parse timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn override_is_verbatim_for_every_environment() {
        for env in Environment::ALL {
            let v = VersionResolver::resolve_at(Some("1.2.3"), None, "abc", env, fixed_time())
                .unwrap();
            assert_eq!(v.as_str(), "1.2.3");
            assert_eq!(v.source(), VersionSource::Override);
        }
    }

    #[test]
    fn empty_override_falls_through() {
        let v = VersionResolver::resolve_at(
            Some(""),
            None,
            "abcdef1234",
            Environment::Development,
            fixed_time(),
        )
        .unwrap();
        assert_eq!(v.source(), VersionSource::Synthesized);
    }

    #[test]
    fn version_file_is_trimmed_and_suffixed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("VERSION");
        std::fs::write(&file, "  2.4.0\n").unwrap();

        let dev = VersionResolver::resolve_at(
            None,
            Some(&file),
            "abc",
            Environment::Development,
            fixed_time(),
        )
        .unwrap();
        assert_eq!(dev.as_str(), "2.4.0");
        assert_eq!(dev.source(), VersionSource::File);

        let prod = VersionResolver::resolve_at(
            None,
            Some(&file),
            "abc",
            Environment::Production,
            fixed_time(),
        )
        .unwrap();
        assert_eq!(prod.as_str(), "2.4.0.PROD");
    }

    #[test]
    fn staging_fallback_matches_timestamp_and_short_revision() {
        let now = fixed_time();
        let v = VersionResolver::resolve_at(None, None, "abcdef1234", Environment::Staging, now)
            .unwrap();
        assert_eq!(v.as_str(), format!("0.0.{}-abcdef1.RELEASE", now.timestamp()));
    }

    #[test]
    fn missing_version_file_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let v = VersionResolver::resolve_at(
            None,
            Some(&dir.path().join("VERSION")),
            "abc",
            Environment::Development,
            fixed_time(),
        )
        .unwrap();
        assert_eq!(v.as_str(), format!("0.0.{}-abc", fixed_time().timestamp()));
    }

    #[test]
    fn non_development_versions_end_with_suffix() {
        for env in [Environment::Staging, Environment::Production] {
            let v = VersionResolver::resolve_at(None, None, "deadbeef", env, fixed_time()).unwrap();
            assert!(v.as_str().ends_with(env.version_suffix().unwrap()));
        }
    }

    #[test]
    fn nothing_to_resolve_is_configuration_error() {
        let err = VersionResolver::resolve_at(None, None, "  ", Environment::Staging, fixed_time())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
