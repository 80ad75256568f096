//! Per-attempt configuration derived from the immutable base configuration.

use crate::core::types::{BuildConfig, CacheLevel};

/// Clamp a configured retry count to a usable attempt budget (at least one).
pub fn effective_max_attempts(max_retry_count: i64) -> u32 {
    if max_retry_count < 1 {
        return 1;
    }
    u32::try_from(max_retry_count).unwrap_or(u32::MAX)
}

/// Effective configuration for a single attempt.
///
/// Built fresh for every attempt from the base configuration; nothing carries
/// over between iterations except what `for_attempt` derives from `attempt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptConfig {
    /// Attempt number (1-indexed).
    pub attempt: u32,
    pub build: BuildConfig,
}

impl AttemptConfig {
    /// Derive the configuration for `attempt`.
    ///
    /// Attempt 1 is an exact copy of `base`. Later attempts disable the
    /// dependency cache so nothing from a failed build is reused.
    pub fn for_attempt(base: &BuildConfig, attempt: u32) -> Self {
        let mut build = base.clone();
        if attempt > 1 {
            build.cache_level = CacheLevel::None;
        }
        Self { attempt, build }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_budgets_mean_one_attempt() {
        assert_eq!(effective_max_attempts(0), 1);
        assert_eq!(effective_max_attempts(-1), 1);
        assert_eq!(effective_max_attempts(i64::MIN), 1);
    }

    #[test]
    fn positive_budgets_are_kept() {
        assert_eq!(effective_max_attempts(1), 1);
        assert_eq!(effective_max_attempts(3), 3);
        assert_eq!(effective_max_attempts(i64::MAX), u32::MAX);
    }

    #[test]
    fn first_attempt_matches_base() {
        let base = BuildConfig {
            scheme: "App".to_string(),
            cache_level: CacheLevel::SwiftPackages,
            ..BuildConfig::default()
        };

        let first = AttemptConfig::for_attempt(&base, 1);
        assert_eq!(first.build, base);
    }

    #[test]
    fn later_attempts_only_disable_cache() {
        let base = BuildConfig {
            scheme: "App".to_string(),
            cache_level: CacheLevel::SwiftPackages,
            ..BuildConfig::default()
        };

        for attempt in 2..=4 {
            let config = AttemptConfig::for_attempt(&base, attempt);
            assert_eq!(config.build.cache_level, CacheLevel::None);
            let mut restored = config.build.clone();
            restored.cache_level = base.cache_level;
            assert_eq!(restored, base);
        }
    }
}
