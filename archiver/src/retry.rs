//! Retry loop around archive attempts.
//!
//! Attempts run strictly one after another. Before every attempt after the
//! first, the remediation plan cleans up after the failed attempt, the
//! dependency cache is disabled, and the loop blocks for a settling delay so
//! purged caches are not read mid-invalidation.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::attempt::{AttemptConfig, effective_max_attempts};
use crate::core::summary::{AttemptOutcome, RunSummary};
use crate::core::types::BuildConfig;
use crate::io::archiver::{ArchiveResult, BuildExecutor};
use crate::io::remediation::Remediator;

/// Attempt budget and pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    pub settle_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy from a configured retry count; values below 1 mean a single attempt.
    pub fn new(max_retry_count: i64, settle_delay: Duration) -> Self {
        Self {
            max_attempts: effective_max_attempts(max_retry_count),
            settle_delay,
        }
    }
}

/// Blocking wait between attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Run archive attempts until one succeeds or the budget is spent.
///
/// Never fails: the outcome of the last attempt is reported in the returned
/// [`RunSummary`]. Earlier failures are only logged.
#[instrument(skip_all, fields(max_attempts = policy.max_attempts, scheme = %base.scheme))]
pub fn run_with_retry<B, M, S>(
    base: &BuildConfig,
    policy: &RetryPolicy,
    builder: &B,
    remediator: &M,
    sleeper: &S,
) -> RunSummary<ArchiveResult>
where
    B: BuildExecutor + ?Sized,
    M: Remediator + ?Sized,
    S: Sleeper + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut previous: Option<AttemptConfig> = None;
    let mut attempt = 1u32;

    loop {
        if let Some(failed) = previous.take() {
            info!(attempt, max_attempts, "archive attempt {attempt} of {max_attempts}");
            remediator.remediate(&failed);
            debug!(
                delay_secs = policy.settle_delay.as_secs(),
                "waiting for caches to settle"
            );
            sleeper.sleep(policy.settle_delay);
        }

        let config = AttemptConfig::for_attempt(base, attempt);
        debug!(attempt, cache_level = ?config.build.cache_level, "starting archive attempt");
        let outcome = AttemptOutcome::from_result(builder.run(&config));

        if outcome.is_success() {
            info!(attempt, max_attempts, "archive attempt succeeded");
        } else if attempt < max_attempts {
            if let AttemptOutcome::Failure(err) = &outcome {
                warn!(attempt, max_attempts, "archive failed, will retry: {err:#}");
            }
            previous = Some(config);
            attempt += 1;
            continue;
        } else {
            debug!(attempt, "attempt budget exhausted");
        }
        return RunSummary::from_last_outcome(outcome, config, max_attempts);
    }
}
