//! Attempt outcomes and the reconciled result of a retry loop.

use anyhow::Error;

use crate::core::attempt::AttemptConfig;
use crate::exit_codes;

/// Result of a single build attempt.
#[derive(Debug)]
pub enum AttemptOutcome<R> {
    Success(R),
    Failure(Error),
}

impl<R> AttemptOutcome<R> {
    pub fn from_result(result: anyhow::Result<R>) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(err) => AttemptOutcome::Failure(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success(_))
    }
}

/// Final outcome of the whole retry loop.
///
/// Built once after the loop stops and consumed by the export phase and the
/// exit code decision. Only the last attempt's outcome is kept.
#[derive(Debug)]
pub struct RunSummary<R> {
    /// Result of the last attempt when it succeeded.
    pub result: Option<R>,
    /// Error of the last attempt when it failed.
    pub error: Option<Error>,
    /// Number of attempts actually made (1-indexed count).
    pub attempts_used: u32,
    /// Effective attempt budget after clamping.
    pub max_attempts: u32,
    /// Configuration the last attempt ran with.
    pub final_config: AttemptConfig,
}

impl<R> RunSummary<R> {
    pub fn from_last_outcome(
        outcome: AttemptOutcome<R>,
        final_config: AttemptConfig,
        max_attempts: u32,
    ) -> Self {
        let attempts_used = final_config.attempt;
        let (result, error) = match outcome {
            AttemptOutcome::Success(value) => (Some(value), None),
            AttemptOutcome::Failure(err) => (None, Some(err)),
        };
        Self {
            result,
            error,
            attempts_used,
            max_attempts,
            final_config,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Combine the build outcome with the export outcome into a process exit code.
///
/// Export failure is always fatal; the build outcome itself is never rewritten.
pub fn reconcile_exit_code(build_succeeded: bool, export: &anyhow::Result<()>) -> i32 {
    if build_succeeded && export.is_ok() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    }
}
