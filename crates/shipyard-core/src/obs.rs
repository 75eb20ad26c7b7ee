//! Structured lifecycle events for release runs.
//!
//! Every event carries an `event` field (`run.started`, `stage.finished`,
//! `run.finished`, `reconcile.warning`) so log pipelines can filter on it.

use tracing::{info, warn};

/// Run-scoped span; attach it to the run future with `Instrument`.
///
/// ```ignore
/// drive(run).instrument(run_span("3f2b...", "staging")).await
/// // every log line inside carries run_id and environment
/// ```
pub fn run_span(run_id: &str, environment: &str) -> tracing::Span {
    tracing::info_span!("shipyard.run", run_id = %run_id, environment = %environment)
}

/// Emit event: run triggered.
pub fn emit_run_started(run_id: &str, environment: &str, actor: &str) {
    info!(event = "run.started", run_id = %run_id, environment = %environment, actor = %actor);
}

/// Emit event: a stage reached its outcome.
pub fn emit_stage_finished(run_id: &str, stage: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: run finalized.
pub fn emit_run_finished(run_id: &str, version: Option<&str>, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        version = version.unwrap_or("-"),
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: reconciler could not be signalled (warning level).
pub fn emit_reconcile_warning(run_id: &str, message: &dyn std::fmt::Display) {
    warn!(event = "reconcile.warning", run_id = %run_id, error = %message);
}
