//! Whole-step scenarios: dependency phase, retry loop, export, exit code.
//!
//! Scripted collaborators keep these fast; the last test drives the real
//! archiver, remediator and exporter against a fake `xcodebuild`.

use archiver::core::types::CacheLevel;
use archiver::exit_codes;
use archiver::io::config::StepConfig;
use archiver::step::{StepCollaborators, StepOutcome, run_step};
use archiver::test_support::{
    ExportCall, InstallBehavior, RecordingRemediator, RecordingSleeper, ScriptedAttempt,
    ScriptedBuilder, ScriptedExporter, ScriptedInstaller, base_config,
};

struct Harness {
    installer: ScriptedInstaller,
    builder: ScriptedBuilder,
    remediator: RecordingRemediator,
    sleeper: RecordingSleeper,
    exporter: ScriptedExporter,
}

impl Harness {
    fn new(script: Vec<ScriptedAttempt>, exporter: ScriptedExporter) -> Self {
        Self {
            installer: ScriptedInstaller::new(InstallBehavior::Succeed),
            builder: ScriptedBuilder::new(script),
            remediator: RecordingRemediator::default(),
            sleeper: RecordingSleeper::default(),
            exporter,
        }
    }

    fn run(&self, max_retry_count: i64) -> StepOutcome {
        let mut config = StepConfig {
            build: base_config(),
            ..StepConfig::default()
        };
        config.build.max_retry_count = max_retry_count;
        let deps = StepCollaborators {
            installer: &self.installer,
            builder: &self.builder,
            remediator: &self.remediator,
            sleeper: &self.sleeper,
            exporter: &self.exporter,
        };
        run_step(&config, &deps).expect("step")
    }
}

#[test]
fn third_attempt_success_after_two_remediations() {
    let harness = Harness::new(
        vec![
            ScriptedAttempt::Fail("first"),
            ScriptedAttempt::Fail("second"),
            ScriptedAttempt::Succeed,
        ],
        ScriptedExporter::default(),
    );

    let outcome = harness.run(3);

    assert_eq!(outcome.exit_code, exit_codes::OK);
    assert_eq!(harness.remediator.calls(), vec![1, 2]);
    let levels: Vec<CacheLevel> = harness
        .builder
        .calls()
        .iter()
        .map(|call| call.build.cache_level)
        .collect();
    assert_eq!(
        levels,
        vec![CacheLevel::SwiftPackages, CacheLevel::None, CacheLevel::None]
    );
    assert_eq!(
        harness.exporter.calls(),
        vec![ExportCall {
            attempt: 3,
            succeeded: true,
            attempts_used: 3,
            max_attempts: 3,
        }]
    );
}

#[test]
fn single_failed_attempt_still_exports() {
    let harness = Harness::new(
        vec![ScriptedAttempt::Fail("provisioning profile")],
        ScriptedExporter::default(),
    );

    let outcome = harness.run(1);

    assert_eq!(outcome.exit_code, exit_codes::FAILED);
    assert!(harness.remediator.calls().is_empty());
    assert!(harness.sleeper.sleeps().is_empty());
    assert_eq!(
        harness.exporter.calls(),
        vec![ExportCall {
            attempt: 1,
            succeeded: false,
            attempts_used: 1,
            max_attempts: 1,
        }]
    );
    let reported = outcome.reported_error().expect("reported error");
    assert!(reported.to_string().contains("provisioning profile"));
}

#[test]
fn export_failure_dominates_exhausted_build() {
    let harness = Harness::new(
        vec![
            ScriptedAttempt::Fail("one"),
            ScriptedAttempt::Fail("two"),
            ScriptedAttempt::Fail("three"),
        ],
        ScriptedExporter::failing("output dir is read-only"),
    );

    let outcome = harness.run(3);

    assert_eq!(outcome.exit_code, exit_codes::FAILED);
    assert_eq!(harness.exporter.calls().len(), 1);
    let reported = outcome.reported_error().expect("reported error");
    assert!(reported.to_string().contains("output dir is read-only"));
    assert!(!outcome.summary.succeeded());
}

#[test]
fn export_failure_after_successful_build_fails_step() {
    let harness = Harness::new(
        vec![ScriptedAttempt::Succeed],
        ScriptedExporter::failing("disk full"),
    );

    let outcome = harness.run(3);

    assert_eq!(outcome.exit_code, exit_codes::FAILED);
    assert!(outcome.summary.succeeded());
    assert!(outcome.summary.result.is_some());
    assert!(
        outcome
            .reported_error()
            .expect("reported error")
            .to_string()
            .contains("disk full")
    );
}

#[test]
fn non_positive_retry_counts_mean_one_attempt() {
    for count in [0, -1, -100] {
        let harness = Harness::new(
            vec![ScriptedAttempt::Fail("a"), ScriptedAttempt::Succeed],
            ScriptedExporter::default(),
        );

        let outcome = harness.run(count);

        assert_eq!(outcome.summary.max_attempts, 1, "count {count}");
        assert_eq!(harness.builder.calls().len(), 1, "count {count}");
        assert_eq!(outcome.exit_code, exit_codes::FAILED);
    }
}

#[test]
fn no_attempt_or_remediation_after_success() {
    for success_at in 1..=4usize {
        let mut script: Vec<ScriptedAttempt> = (1..success_at)
            .map(|_| ScriptedAttempt::Fail("flaky"))
            .collect();
        script.push(ScriptedAttempt::Succeed);
        script.push(ScriptedAttempt::Fail("must not run"));
        let harness = Harness::new(script, ScriptedExporter::default());

        let outcome = harness.run(5);

        assert_eq!(outcome.exit_code, exit_codes::OK);
        assert_eq!(harness.builder.calls().len(), success_at);
        assert_eq!(harness.remediator.calls().len(), success_at - 1);
    }
}

#[cfg(unix)]
mod real_collaborators {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use archiver::exit_codes;
    use archiver::io::archiver::XcodebuildArchiver;
    use archiver::io::config::StepConfig;
    use archiver::io::export::{ExportStatus, OUTPUTS_FILE, OutputExporter, load_outputs};
    use archiver::io::paths::CachePaths;
    use archiver::io::process::{Launcher, ProcessLimits, Toolchain};
    use archiver::io::remediation::PlanRemediator;
    use archiver::step::{StepCollaborators, run_step};
    use archiver::test_support::{
        FixedPathResolver, InstallBehavior, RecordingSleeper, ScriptedInstaller, base_config,
    };

    /// Archive fails unless the package cache is disabled, i.e. only on attempt 1.
    /// `clean` calls are recorded next to the script.
    const FLAKY_XCODEBUILD: &str = r#"
echo "fake xcodebuild $*"
if [ "$1" = clean ]; then
  echo "$*" >> "$(dirname "$0")/clean.log"
  exit 0
fi
case "$*" in
  *-exportArchive*|*-clonedSourcePackagesDirPath*) ;;
  *) echo "error: stale package cache" >&2; exit 65 ;;
esac
while [ $# -gt 0 ]; do
  case "$1" in
    -archivePath) shift; mkdir -p "$1/dSYMs/App.app.dSYM" ;;
    -exportPath) shift; mkdir -p "$1"; touch "$1/App.ipa" ;;
  esac
  shift
done
"#;

    fn seed_caches(home: &Path) -> CachePaths {
        let caches = CachePaths::from_home(home);
        for dir in [
            &caches.xcode_cache,
            &caches.swiftpm_cache,
            &caches.derived_data,
            &caches.build_state,
        ] {
            fs::create_dir_all(dir.join("stale")).expect("seed cache");
        }
        caches
    }

    #[test]
    fn flaky_first_attempt_recovers_and_exports() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path().join("home");
        let caches = seed_caches(&home);
        let script = temp.path().join("xcodebuild.sh");
        fs::write(&script, FLAKY_XCODEBUILD).expect("write script");
        let work_dir = temp.path().join("work");
        let output_dir = temp.path().join("output");

        let limits = ProcessLimits {
            timeout: Duration::from_secs(20),
            output_limit_bytes: 100_000,
        };
        let mut config = StepConfig {
            build: base_config(),
            ..StepConfig::default()
        };
        config.build.max_retry_count = 2;
        config.build.output_dir = output_dir.clone();

        let installer = ScriptedInstaller::new(InstallBehavior::Succeed);
        let tools = Toolchain {
            xcodebuild: Launcher::new("sh").with_leading_args(vec![script.display().to_string()]),
            tuist: Launcher::new("true"),
        };
        let builder =
            XcodebuildArchiver::new(&work_dir, limits).with_xcodebuild(tools.xcodebuild.clone());
        let remediator =
            PlanRemediator::new(FixedPathResolver(Some(home.clone())), limits).with_toolchain(tools);
        let sleeper = RecordingSleeper::default();
        let exporter = OutputExporter::new(&work_dir);
        let deps = StepCollaborators {
            installer: &installer,
            builder: &builder,
            remediator: &remediator,
            sleeper: &sleeper,
            exporter: &exporter,
        };

        let outcome = run_step(&config, &deps).expect("step");

        assert_eq!(outcome.exit_code, exit_codes::OK);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(30)]);
        let cleaned = fs::read_to_string(temp.path().join("clean.log")).expect("clean log");
        assert_eq!(cleaned, "clean -workspace ios/App.xcworkspace -scheme App\n");
        assert!(!caches.xcode_cache.exists());
        assert!(!caches.swiftpm_cache.exists());
        assert!(caches.derived_data.is_dir());
        assert!(!caches.derived_data.join("stale").exists());
        assert!(!caches.build_state.join("stale").exists());

        let outputs = load_outputs(&output_dir.join(OUTPUTS_FILE)).expect("outputs");
        assert_eq!(outputs.status, ExportStatus::Succeeded);
        assert_eq!(outputs.attempts_used, 2);
        assert_eq!(outputs.max_attempts, 2);
        assert_eq!(outputs.ipa_path, Some(output_dir.join("App.ipa")));
        assert!(output_dir.join("App.ipa").is_file());
        assert!(output_dir.join("dSYMs").join("App.app.dSYM").is_dir());
        let log_path: PathBuf = outputs
            .xcodebuild_archive_log_path
            .expect("archive log exported");
        let log = fs::read_to_string(log_path).expect("read log");
        assert!(log.contains("-clonedSourcePackagesDirPath"));
    }
}
