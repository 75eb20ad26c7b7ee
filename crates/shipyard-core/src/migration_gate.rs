//! Migration validation and gated apply.
//!
//! [`MigrationGate::validate`] turns a raw [`MigrationSet`] into a
//! [`ValidatedMigrationSet`]: every unit structurally complete and parseable,
//! and the whole set a single linear chain. Only a validated set can be
//! applied, so an invalid set never reaches the database.
//!
//! Apply semantics:
//! - empty set: `skipped`, the engine is never contacted
//! - each unit upgrades in its own transaction; a failing unit halts the run
//!   and leaves earlier units applied (their downgrade is the rollback primitive)
//! - after apply, the schema object count must exceed a minimum, otherwise the
//!   outcome is downgraded to `failed`
//! - an optional domain probe is checked best-effort and only ever warns

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::{DatabaseTarget, MigrationOutcome, MigrationSet, MigrationStatus, MigrationUnit};
use crate::process::{run_command, CommandSpec};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Which script of a unit failed the syntax check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    Upgrade,
    Downgrade,
}

impl std::fmt::Display for ScriptAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptAction::Upgrade => f.write_str("upgrade"),
            ScriptAction::Downgrade => f.write_str("downgrade"),
        }
    }
}

/// Why a migration set was rejected. The first violation found wins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("migration unit #{index} has no revision id")]
    MissingRevision { index: usize },

    #[error("migration {revision} has no upgrade action")]
    MissingUpgrade { revision: String },

    #[error("migration {revision} has no downgrade action")]
    MissingDowngrade { revision: String },

    #[error("migration {revision} {action} script is not parseable: {reason}")]
    InvalidScript {
        revision: String,
        action: ScriptAction,
        reason: String,
    },

    #[error("revision {revision} is defined more than once")]
    DuplicateRevision { revision: String },

    #[error("migration {revision} revises unknown revision {parent}")]
    UnknownParent { revision: String, parent: String },

    #[error("migration set has multiple roots: {}", .roots.join(", "))]
    MultipleRoots { roots: Vec<String> },

    #[error("revision {parent} has more than one child: {}", .children.join(", "))]
    OpenFork {
        parent: String,
        children: Vec<String>,
    },

    #[error("migration {revision} is part of a cycle")]
    Cycle { revision: String },
}

impl ValidationError {
    /// Revision id the violation is about, when there is a single one.
    pub fn revision(&self) -> Option<&str> {
        match self {
            ValidationError::MissingUpgrade { revision }
            | ValidationError::MissingDowngrade { revision }
            | ValidationError::InvalidScript { revision, .. }
            | ValidationError::DuplicateRevision { revision }
            | ValidationError::UnknownParent { revision, .. }
            | ValidationError::Cycle { revision } => Some(revision),
            ValidationError::OpenFork { parent, .. } => Some(parent),
            ValidationError::MissingRevision { .. } | ValidationError::MultipleRoots { .. } => None,
        }
    }
}

/// A migration set that passed validation, ordered root to head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedMigrationSet {
    units: Vec<MigrationUnit>,
}

impl ValidatedMigrationSet {
    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Revision of the single head, if any.
    pub fn head(&self) -> Option<&str> {
        self.units.last().map(MigrationUnit::revision_id)
    }

    /// Units after `current`, or all of them when the database is unversioned.
    /// `None` when `current` is not part of this chain.
    pub fn pending_after(&self, current: Option<&str>) -> Option<&[MigrationUnit]> {
        match current {
            None => Some(&self.units),
            Some(rev) => self
                .units
                .iter()
                .position(|u| u.revision_id() == rev)
                .map(|idx| &self.units[idx + 1..]),
        }
    }
}

/// Check one script for parseability.
///
/// This is a lexical check, not a SQL parser: quotes, dollar-quoted bodies,
/// block comments and parentheses must balance, and at least one statement
/// must remain once comments are stripped.
pub fn check_script(script: &str) -> Result<(), String> {
    let chars: Vec<char> = script.chars().collect();
    let mut depth: i64 = 0;
    let mut has_statement = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                let mut j = i + 2;
                loop {
                    if j + 1 >= chars.len() {
                        return Err("unterminated block comment".to_string());
                    }
                    if chars[j] == '*' && chars[j + 1] == '/' {
                        break;
                    }
                    j += 1;
                }
                i = j + 2;
                continue;
            }
            '\'' | '"' => {
                has_statement = true;
                let quote = c;
                let mut j = i + 1;
                loop {
                    if j >= chars.len() {
                        return Err(format!("unterminated {quote} quote"));
                    }
                    if chars[j] == quote {
                        // doubled quote is an escaped quote
                        if chars.get(j + 1) == Some(&quote) {
                            j += 2;
                            continue;
                        }
                        break;
                    }
                    j += 1;
                }
                i = j + 1;
                continue;
            }
            '$' => {
                if let Some(tag_end) = dollar_tag_end(&chars, i) {
                    has_statement = true;
                    let tag: String = chars[i..=tag_end].iter().collect();
                    let body_start = tag_end + 1;
                    let rest: String = chars[body_start..].iter().collect();
                    match rest.find(&tag) {
                        Some(offset) => {
                            let consumed = rest[..offset].chars().count() + tag.chars().count();
                            i = body_start + consumed;
                            continue;
                        }
                        None => return Err(format!("unterminated {tag} body")),
                    }
                }
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced ')'".to_string());
                }
            }
            _ => {}
        }
        if !c.is_whitespace() && c != ';' {
            has_statement = true;
        }
        i += 1;
    }

    if depth != 0 {
        return Err(format!("{depth} unclosed '('"));
    }
    if !has_statement {
        return Err("script has no statements".to_string());
    }
    Ok(())
}

/// End index of a `$tag$` opener starting at `start`, if there is one.
fn dollar_tag_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    while j < chars.len() {
        let c = chars[j];
        if c == '$' {
            return Some(j);
        }
        if !(c.is_ascii_alphanumeric() || c == '_') || (j == start + 1 && c.is_ascii_digit()) {
            return None;
        }
        j += 1;
    }
    None
}

/// Structural and chain validation, fail-fast.
pub fn validate_set(set: &MigrationSet) -> Result<ValidatedMigrationSet, ValidationError> {
    // Per-unit checks first, in load order.
    for (index, unit) in set.units.iter().enumerate() {
        let revision = match unit.revision.as_deref().map(str::trim) {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => return Err(ValidationError::MissingRevision { index }),
        };
        let upgrade = unit
            .upgrade
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingUpgrade {
                revision: revision.clone(),
            })?;
        let downgrade = unit
            .downgrade
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingDowngrade {
                revision: revision.clone(),
            })?;
        for (action, script) in [
            (ScriptAction::Upgrade, upgrade),
            (ScriptAction::Downgrade, downgrade),
        ] {
            check_script(script).map_err(|reason| ValidationError::InvalidScript {
                revision: revision.clone(),
                action,
                reason,
            })?;
        }
    }

    if set.is_empty() {
        return Ok(ValidatedMigrationSet::default());
    }

    let mut by_revision: HashMap<&str, &MigrationUnit> = HashMap::new();
    for unit in &set.units {
        if by_revision.insert(unit.revision_id(), unit).is_some() {
            return Err(ValidationError::DuplicateRevision {
                revision: unit.revision_id().to_string(),
            });
        }
    }

    let mut roots = Vec::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for unit in &set.units {
        match unit.parent() {
            None => roots.push(unit.revision_id()),
            Some(parent) => {
                if !by_revision.contains_key(parent) {
                    return Err(ValidationError::UnknownParent {
                        revision: unit.revision_id().to_string(),
                        parent: parent.to_string(),
                    });
                }
                children.entry(parent).or_default().push(unit.revision_id());
            }
        }
    }

    // Forks are reported in load order so the message is stable.
    for unit in &set.units {
        if let Some(kids) = children.get(unit.revision_id()) {
            if kids.len() > 1 {
                return Err(ValidationError::OpenFork {
                    parent: unit.revision_id().to_string(),
                    children: kids.iter().map(|k| k.to_string()).collect(),
                });
            }
        }
    }

    let root = match roots.as_slice() {
        [] => {
            // Every unit has a known parent: the whole set is a cycle.
            return Err(ValidationError::Cycle {
                revision: set.units[0].revision_id().to_string(),
            });
        }
        [root] => *root,
        many => {
            return Err(ValidationError::MultipleRoots {
                roots: many.iter().map(|r| r.to_string()).collect(),
            })
        }
    };

    let mut ordered = Vec::with_capacity(set.len());
    let mut visited = HashSet::new();
    let mut cursor = Some(root);
    while let Some(rev) = cursor {
        if !visited.insert(rev) {
            return Err(ValidationError::Cycle {
                revision: rev.to_string(),
            });
        }
        ordered.push(by_revision[rev].clone());
        cursor = children.get(rev).and_then(|kids| kids.first().copied());
    }

    // Units never reached from the root hang off a cycle.
    if let Some(stray) = set
        .units
        .iter()
        .find(|u| !visited.contains(u.revision_id()))
    {
        return Err(ValidationError::Cycle {
            revision: stray.revision_id().to_string(),
        });
    }

    Ok(ValidatedMigrationSet { units: ordered })
}

// ---------------------------------------------------------------------------
// Engine seam
// ---------------------------------------------------------------------------

/// Failure reported by a migration engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("cannot reach database {0}")]
    Connection(String),

    #[error("upgrade to {revision} failed: {reason}")]
    Upgrade { revision: String, reason: String },

    #[error("engine query failed: {0}")]
    Query(String),
}

/// The external migration engine. Only its outcomes and post-apply
/// introspection matter to the gate.
#[async_trait]
pub trait MigrationEngine: Send + Sync {
    /// Revision the database is currently at; `None` when unversioned.
    async fn current(&self, db: &DatabaseTarget) -> Result<Option<String>, EngineError>;

    /// Applied revisions, oldest first.
    async fn history(&self, db: &DatabaseTarget) -> Result<Vec<String>, EngineError>;

    /// Upgrade to `unit`'s revision in a single transaction.
    async fn upgrade(&self, db: &DatabaseTarget, unit: &MigrationUnit) -> Result<(), EngineError>;

    /// Number of persisted schema objects (tables, views, functions).
    async fn schema_object_count(&self, db: &DatabaseTarget) -> Result<u64, EngineError>;

    /// Whether a named domain object exists.
    async fn probe(&self, db: &DatabaseTarget, name: &str) -> Result<bool, EngineError>;
}

/// Post-apply checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationChecks {
    /// Apply fails unless the schema holds more objects than this.
    pub min_schema_objects: u64,

    /// Domain object probed after apply; absence only warns.
    pub probe: Option<String>,
}

impl Default for MigrationChecks {
    fn default() -> Self {
        Self {
            min_schema_objects: 1,
            probe: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Validates and conditionally applies migration sets.
#[derive(Clone)]
pub struct MigrationGate {
    engine: Arc<dyn MigrationEngine>,
    checks: MigrationChecks,
}

impl MigrationGate {
    pub fn new(engine: Arc<dyn MigrationEngine>, checks: MigrationChecks) -> Self {
        Self { engine, checks }
    }

    /// See [`validate_set`].
    pub fn validate(&self, set: &MigrationSet) -> Result<ValidatedMigrationSet, ValidationError> {
        validate_set(set)
    }

    /// Apply pending units of `set` to `db`.
    ///
    /// Never returns an error: every failure is folded into a `failed`
    /// outcome so the caller records what was applied before the halt.
    pub async fn apply(
        &self,
        set: &ValidatedMigrationSet,
        db: &DatabaseTarget,
        dry_run: bool,
    ) -> MigrationOutcome {
        if set.is_empty() {
            info!("no migrations in release, skipping");
            return MigrationOutcome::skipped("migration set is empty");
        }

        let current = match self.engine.current(db).await {
            Ok(current) => current,
            Err(e) => return MigrationOutcome::failed(e.to_string()),
        };

        let Some(pending) = set.pending_after(current.as_deref()) else {
            return MigrationOutcome::failed(format!(
                "database {} is at revision {} which is not part of this release's chain",
                db,
                current.as_deref().unwrap_or("<none>")
            ));
        };

        let preview = render_preview(pending);
        for line in &preview {
            info!(database = %db, "pending {}", line);
        }

        if pending.is_empty() {
            let mut outcome = MigrationOutcome::skipped(format!(
                "database already at head {}",
                set.head().unwrap_or("<none>")
            ));
            outcome.preview = preview;
            return outcome;
        }

        if dry_run {
            let mut outcome = MigrationOutcome::skipped(format!(
                "dry run: {} pending migration(s) not applied",
                pending.len()
            ));
            outcome.preview = preview;
            return outcome;
        }

        let mut applied = Vec::with_capacity(pending.len());
        for unit in pending {
            if let Err(e) = self.engine.upgrade(db, unit).await {
                warn!(
                    revision = %unit.revision_id(),
                    applied = applied.len(),
                    error = %e,
                    "migration failed; earlier units stay applied"
                );
                let mut outcome = MigrationOutcome::failed(e.to_string());
                outcome.preview = preview;
                outcome.applied = applied;
                outcome.failed_revision = Some(unit.revision_id().to_string());
                return outcome;
            }
            info!(revision = %unit.revision_id(), "migration applied");
            applied.push(unit.revision_id().to_string());
        }

        let mut outcome = MigrationOutcome {
            status: MigrationStatus::Applied,
            preview,
            applied,
            failed_revision: None,
            schema_object_count: None,
            message: None,
            warnings: Vec::new(),
        };

        match self.engine.schema_object_count(db).await {
            Ok(count) => {
                outcome.schema_object_count = Some(count);
                if count <= self.checks.min_schema_objects {
                    outcome.status = MigrationStatus::Failed;
                    outcome.message = Some(format!(
                        "schema has {count} objects after apply, expected more than {} (wrong database?)",
                        self.checks.min_schema_objects
                    ));
                    return outcome;
                }
            }
            Err(e) => {
                outcome.status = MigrationStatus::Failed;
                outcome.message = Some(format!("post-apply introspection failed: {e}"));
                return outcome;
            }
        }

        if let Some(probe) = &self.checks.probe {
            let finding = match self.engine.probe(db, probe).await {
                Ok(true) => None,
                Ok(false) => Some(format!("health probe '{probe}' not present in schema")),
                Err(e) => Some(format!("health probe '{probe}' could not be checked: {e}")),
            };
            if let Some(finding) = finding {
                warn!(probe = %probe, "{}", finding);
                outcome.warnings.push(finding);
            }
        }

        outcome
    }
}

fn render_preview(pending: &[MigrationUnit]) -> Vec<String> {
    pending
        .iter()
        .map(|unit| {
            let from = unit.parent().unwrap_or("<base>");
            match &unit.description {
                Some(desc) => format!("{} -> {}, {}", from, unit.revision_id(), desc),
                None => format!("{} -> {}", from, unit.revision_id()),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Command-line engine adapter
// ---------------------------------------------------------------------------

/// Drives an external migration tool through a small command protocol.
///
/// The configured program is invoked as `<program..> <verb> [arg]` with
/// `DATABASE_URL` set, where verb is one of `current`, `history`,
/// `upgrade <revision>`, `count`, `probe <name>`. Output is read from stdout:
/// one revision per line, or a single integer for `count`, and exit status 0
/// for a present probe.
pub struct CommandMigrationEngine {
    program: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandMigrationEngine {
    pub fn new(program: Vec<String>, timeout: Option<Duration>) -> Self {
        Self { program, timeout }
    }

    async fn invoke(
        &self,
        db: &DatabaseTarget,
        args: &[&str],
    ) -> Result<crate::process::CommandOutput, EngineError> {
        let mut command = self.program.clone();
        command.extend(args.iter().map(|a| a.to_string()));
        let spec = CommandSpec::new(command)
            .env("DATABASE_URL", db.url.clone())
            .timeout(self.timeout);
        run_command(&spec)
            .await
            .map_err(|e| EngineError::Connection(format!("{db}: {e}")))
    }

    async fn query(&self, db: &DatabaseTarget, args: &[&str]) -> Result<String, EngineError> {
        let output = self.invoke(db, args).await?;
        if !output.success {
            return Err(EngineError::Query(format!(
                "{} exited with {}: {}",
                args.join(" "),
                output.exit_code,
                output.diagnostics()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl MigrationEngine for CommandMigrationEngine {
    async fn current(&self, db: &DatabaseTarget) -> Result<Option<String>, EngineError> {
        let out = self.query(db, &["current"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    async fn history(&self, db: &DatabaseTarget) -> Result<Vec<String>, EngineError> {
        let out = self.query(db, &["history"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn upgrade(&self, db: &DatabaseTarget, unit: &MigrationUnit) -> Result<(), EngineError> {
        let output = self.invoke(db, &["upgrade", unit.revision_id()]).await?;
        if output.success {
            Ok(())
        } else {
            Err(EngineError::Upgrade {
                revision: unit.revision_id().to_string(),
                reason: output.diagnostics(),
            })
        }
    }

    async fn schema_object_count(&self, db: &DatabaseTarget) -> Result<u64, EngineError> {
        let out = self.query(db, &["count"]).await?;
        out.trim()
            .parse::<u64>()
            .map_err(|e| EngineError::Query(format!("count returned '{}': {e}", out.trim())))
    }

    async fn probe(&self, db: &DatabaseTarget, name: &str) -> Result<bool, EngineError> {
        Ok(self.invoke(db, &["probe", name]).await?.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(rev: &str, parent: Option<&str>) -> MigrationUnit {
        MigrationUnit::new(
            rev,
            parent,
            format!("CREATE TABLE t_{rev} (id int);"),
            format!("DROP TABLE t_{rev};"),
        )
    }

    #[test]
    fn test_check_script_accepts_plain_sql() {
        assert!(check_script("CREATE TABLE sensors (id uuid PRIMARY KEY, name text);").is_ok());
    }

    #[test]
    fn test_check_script_accepts_dollar_quoted_function() {
        let script = r#"
            CREATE OR REPLACE FUNCTION archive_old_readings() RETURNS void AS $$
            BEGIN
                DELETE FROM readings WHERE ts < now() - interval '90 days';
            END;
            $$ LANGUAGE plpgsql;
        "#;
        assert!(check_script(script).is_ok());
    }

    #[test]
    fn test_check_script_rejects_unbalanced() {
        assert!(check_script("CREATE TABLE t (id int;").is_err());
        assert!(check_script("SELECT 1);").is_err());
        assert!(check_script("SELECT 'oops;").is_err());
        assert!(check_script("/* never closed").is_err());
        assert!(check_script("CREATE FUNCTION f() AS $body$ SELECT 1;").is_err());
    }

    #[test]
    fn test_check_script_rejects_comment_only() {
        assert!(check_script("-- nothing here\n;").is_err());
    }

    #[test]
    fn test_check_script_handles_escaped_quotes() {
        assert!(check_script("INSERT INTO t VALUES ('it''s fine');").is_ok());
    }

    #[test]
    fn test_validate_orders_root_to_head() {
        let set = MigrationSet::new(vec![
            unit("003", Some("002")),
            unit("001", None),
            unit("002", Some("001")),
        ]);
        let validated = validate_set(&set).unwrap();
        let order: Vec<&str> = validated.units().iter().map(|u| u.revision_id()).collect();
        assert_eq!(order, vec!["001", "002", "003"]);
        assert_eq!(validated.head(), Some("003"));
    }

    #[test]
    fn test_missing_revision_rejected() {
        let mut bad = unit("001", None);
        bad.revision = None;
        let err = validate_set(&MigrationSet::new(vec![bad])).unwrap_err();
        assert_eq!(err, ValidationError::MissingRevision { index: 0 });
    }

    #[test]
    fn test_missing_upgrade_rejected() {
        let mut bad = unit("001", None);
        bad.upgrade = None;
        let err = validate_set(&MigrationSet::new(vec![bad])).unwrap_err();
        assert!(matches!(err, ValidationError::MissingUpgrade { .. }));
        assert_eq!(err.revision(), Some("001"));
    }

    #[test]
    fn test_missing_downgrade_rejected() {
        let mut bad = unit("002", Some("001"));
        bad.downgrade = Some("   ".to_string());
        let err = validate_set(&MigrationSet::new(vec![unit("001", None), bad])).unwrap_err();
        assert!(matches!(err, ValidationError::MissingDowngrade { .. }));
        assert_eq!(err.revision(), Some("002"));
    }

    #[test]
    fn test_one_invalid_unit_fails_whole_set() {
        let mut bad = unit("002", Some("001"));
        bad.upgrade = Some("CREATE TABLE broken (id int".to_string());
        let set = MigrationSet::new(vec![unit("001", None), bad, unit("003", Some("002"))]);
        let err = validate_set(&set).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidScript {
                action: ScriptAction::Upgrade,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_revision_rejected() {
        let set = MigrationSet::new(vec![
            unit("001", None),
            unit("002", Some("001")),
            unit("003", Some("002")),
            unit("003", Some("002")),
        ]);
        let err = validate_set(&set).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DuplicateRevision {
                revision: "003".to_string()
            }
        );
    }

    #[test]
    fn test_open_fork_rejected() {
        let set = MigrationSet::new(vec![
            unit("001", None),
            unit("002a", Some("001")),
            unit("002b", Some("001")),
        ]);
        let err = validate_set(&set).unwrap_err();
        assert!(matches!(err, ValidationError::OpenFork { ref parent, .. } if parent == "001"));
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let set = MigrationSet::new(vec![unit("001", None), unit("003", Some("002"))]);
        assert!(matches!(
            validate_set(&set).unwrap_err(),
            ValidationError::UnknownParent { .. }
        ));
    }

    #[test]
    fn test_multiple_roots_rejected() {
        let set = MigrationSet::new(vec![unit("001", None), unit("100", None)]);
        assert!(matches!(
            validate_set(&set).unwrap_err(),
            ValidationError::MultipleRoots { .. }
        ));
    }

    #[test]
    fn test_cycles_rejected() {
        let whole = MigrationSet::new(vec![unit("a", Some("b")), unit("b", Some("a"))]);
        assert!(matches!(
            validate_set(&whole).unwrap_err(),
            ValidationError::Cycle { .. }
        ));

        let detached = MigrationSet::new(vec![
            unit("001", None),
            unit("x", Some("y")),
            unit("y", Some("x")),
        ]);
        assert!(matches!(
            validate_set(&detached).unwrap_err(),
            ValidationError::Cycle { .. }
        ));
    }

    #[test]
    fn test_pending_after() {
        let validated = validate_set(&MigrationSet::new(vec![
            unit("001", None),
            unit("002", Some("001")),
        ]))
        .unwrap();
        assert_eq!(validated.pending_after(None).unwrap().len(), 2);
        assert_eq!(validated.pending_after(Some("001")).unwrap().len(), 1);
        assert!(validated.pending_after(Some("002")).unwrap().is_empty());
        assert!(validated.pending_after(Some("zzz")).is_none());
    }

    #[test]
    fn test_preview_renders_path() {
        let units = vec![
            unit("001", None).with_description("base tables"),
            unit("002", Some("001")),
        ];
        let preview = render_preview(&units);
        assert_eq!(preview[0], "<base> -> 001, base tables");
        assert_eq!(preview[1], "001 -> 002");
    }

    // -----------------------------------------------------------------------
    // apply
    // -----------------------------------------------------------------------

    use crate::fakes::MemoryMigrationEngine;

    fn db() -> DatabaseTarget {
        DatabaseTarget::new("icepulse", "postgresql://app:pw@localhost/icepulse")
    }

    fn chain() -> ValidatedMigrationSet {
        validate_set(&MigrationSet::new(vec![
            unit("001", None),
            unit("002", Some("001")),
            unit("003", Some("002")),
        ]))
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_set_never_contacts_engine() {
        let engine = Arc::new(MemoryMigrationEngine::new());
        let gate = MigrationGate::new(engine.clone(), MigrationChecks::default());
        let empty = validate_set(&MigrationSet::empty()).unwrap();

        let outcome = gate.apply(&empty, &db(), false).await;
        assert_eq!(outcome.status, MigrationStatus::Skipped);
        assert_eq!(engine.contacts(), 0);
    }

    #[tokio::test]
    async fn test_apply_all_pending() {
        let engine = Arc::new(MemoryMigrationEngine::new().with_objects(5));
        let gate = MigrationGate::new(engine.clone(), MigrationChecks::default());

        let outcome = gate.apply(&chain(), &db(), false).await;
        assert_eq!(outcome.status, MigrationStatus::Applied);
        assert_eq!(outcome.applied, vec!["001", "002", "003"]);
        assert_eq!(outcome.schema_object_count, Some(8));
        assert_eq!(outcome.preview.len(), 3);
        assert_eq!(engine.current_revision().as_deref(), Some("003"));
    }

    #[tokio::test]
    async fn test_apply_resumes_after_current() {
        let engine = Arc::new(MemoryMigrationEngine::new().at_revision("001").with_objects(5));
        let gate = MigrationGate::new(engine.clone(), MigrationChecks::default());

        let outcome = gate.apply(&chain(), &db(), false).await;
        assert_eq!(outcome.applied, vec!["002", "003"]);
    }

    #[tokio::test]
    async fn test_at_head_is_skipped() {
        let engine = Arc::new(MemoryMigrationEngine::new().at_revision("003"));
        let gate = MigrationGate::new(engine, MigrationChecks::default());
        let outcome = gate.apply(&chain(), &db(), false).await;
        assert_eq!(outcome.status, MigrationStatus::Skipped);
        assert!(outcome.applied.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_current_revision_fails() {
        let engine = Arc::new(MemoryMigrationEngine::new().at_revision("999"));
        let gate = MigrationGate::new(engine, MigrationChecks::default());
        let outcome = gate.apply(&chain(), &db(), false).await;
        assert!(outcome.is_failed());
        assert!(outcome.message.unwrap().contains("999"));
    }

    #[tokio::test]
    async fn test_failing_unit_halts_and_keeps_earlier_units() {
        let engine = Arc::new(MemoryMigrationEngine::new().with_objects(5).failing_on("002"));
        let gate = MigrationGate::new(engine.clone(), MigrationChecks::default());

        let outcome = gate.apply(&chain(), &db(), false).await;
        assert!(outcome.is_failed());
        assert_eq!(outcome.applied, vec!["001"]);
        assert_eq!(outcome.failed_revision.as_deref(), Some("002"));
        assert_eq!(engine.current_revision().as_deref(), Some("001"));
        assert!(!engine.applied().contains(&"003".to_string()));
    }

    #[tokio::test]
    async fn test_dry_run_previews_only() {
        let engine = Arc::new(MemoryMigrationEngine::new());
        let gate = MigrationGate::new(engine.clone(), MigrationChecks::default());

        let outcome = gate.apply(&chain(), &db(), true).await;
        assert_eq!(outcome.status, MigrationStatus::Skipped);
        assert_eq!(outcome.preview.len(), 3);
        assert!(engine.applied().is_empty());
    }

    #[tokio::test]
    async fn test_too_few_schema_objects_fails() {
        let engine = Arc::new(MemoryMigrationEngine::new());
        let checks = MigrationChecks {
            min_schema_objects: 10,
            probe: None,
        };
        let gate = MigrationGate::new(engine, checks);

        let outcome = gate.apply(&chain(), &db(), false).await;
        assert!(outcome.is_failed());
        assert_eq!(outcome.schema_object_count, Some(3));
    }

    #[tokio::test]
    async fn test_missing_probe_only_warns() {
        let engine = Arc::new(MemoryMigrationEngine::new().with_objects(5));
        let checks = MigrationChecks {
            min_schema_objects: 1,
            probe: Some("archive_old_readings".to_string()),
        };
        let gate = MigrationGate::new(engine, checks);

        let outcome = gate.apply(&chain(), &db(), false).await;
        assert_eq!(outcome.status, MigrationStatus::Applied);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("archive_old_readings"));
    }
}
