//! Orchestration for a single `archiver run`.

use anyhow::{Error, Result};
use tracing::{error, info, instrument};

use crate::core::summary::{RunSummary, reconcile_exit_code};
use crate::io::archiver::{ArchiveResult, BuildExecutor};
use crate::io::config::StepConfig;
use crate::io::dependencies::{DependencyInstaller, ensure_dependencies};
use crate::io::export::Exporter;
use crate::io::remediation::Remediator;
use crate::retry::{RetryPolicy, Sleeper, run_with_retry};

/// Side-effecting collaborators the step drives.
pub struct StepCollaborators<'a> {
    pub installer: &'a dyn DependencyInstaller,
    pub builder: &'a dyn BuildExecutor,
    pub remediator: &'a dyn Remediator,
    pub sleeper: &'a dyn Sleeper,
    pub exporter: &'a dyn Exporter,
}

/// Result of a whole step run.
#[derive(Debug)]
pub struct StepOutcome {
    /// Process exit code to report.
    pub exit_code: i32,
    /// Outcome of the retry loop; the build error (if any) lives here.
    pub summary: RunSummary<ArchiveResult>,
    /// Export failure, which outranks the build outcome.
    pub export_error: Option<Error>,
}

impl StepOutcome {
    /// The error the step reports: an export failure first, otherwise the
    /// last attempt's build error.
    pub fn reported_error(&self) -> Option<&Error> {
        self.export_error.as_ref().or(self.summary.error.as_ref())
    }
}

/// Install dependencies, archive with retries, then export exactly once.
///
/// Returns `Err` only when the dependency phase fails fatally, in which case
/// neither the build nor the export runs.
#[instrument(skip_all, fields(scheme = %config.build.scheme))]
pub fn run_step(config: &StepConfig, deps: &StepCollaborators<'_>) -> Result<StepOutcome> {
    let base = ensure_dependencies(deps.installer, &config.build)?;
    let policy = RetryPolicy::new(base.max_retry_count, config.retry.settle_delay());

    let summary = run_with_retry(&base, &policy, deps.builder, deps.remediator, deps.sleeper);
    if let Some(err) = &summary.error {
        error!(
            attempts = summary.attempts_used,
            "archive failed after {} attempts: {err:#}", summary.attempts_used
        );
    }

    let export = deps.exporter.export(&summary.final_config, &summary);
    if let Err(err) = &export {
        error!("export outputs failed: {err:#}");
    }
    let exit_code = reconcile_exit_code(summary.succeeded(), &export);
    info!(
        exit_code,
        attempts_used = summary.attempts_used,
        max_attempts = summary.max_attempts,
        "archive step finished"
    );

    Ok(StepOutcome {
        exit_code,
        summary,
        export_error: export.err(),
    })
}
