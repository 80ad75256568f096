//! Build executor abstraction and the `xcodebuild` archive/export adapter.
//!
//! The [`BuildExecutor`] trait decouples the retry loop from the actual build
//! tool. Tests use scripted executors that return predetermined outcomes
//! without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::attempt::AttemptConfig;
use crate::core::types::{BuildConfig, CacheLevel, LogFormatter};
use crate::io::process::{
    CommandOutput, Launcher, ProcessLimits, Toolchain, display_command, run_command,
};

/// Lines of build output quoted in an attempt's error.
const ERROR_TAIL_LINES: usize = 30;

/// Artifacts produced by a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveResult {
    pub artifact_name: String,
    pub archive_path: PathBuf,
    pub ipa_export_dir: PathBuf,
    pub export_options_path: PathBuf,
    pub archive_log_path: PathBuf,
    pub export_log_path: PathBuf,
}

/// Performs one archive + export attempt.
///
/// Implementations must not keep state between calls; every call receives the
/// full configuration for its attempt.
pub trait BuildExecutor {
    fn run(&self, config: &AttemptConfig) -> Result<ArchiveResult>;
}

/// Where one attempt writes its artifacts and logs.
///
/// Deterministic for a given work dir and attempt, so the export phase can
/// collect logs of a failed attempt that produced no [`ArchiveResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub dir: PathBuf,
    pub archive_path: PathBuf,
    pub ipa_export_dir: PathBuf,
    pub export_options_path: PathBuf,
    pub xcconfig_path: PathBuf,
    pub archive_log_path: PathBuf,
    pub export_log_path: PathBuf,
    /// Private package checkout used when the dependency cache is disabled.
    pub source_packages_dir: PathBuf,
}

impl ArchiveLayout {
    pub fn new(work_dir: &Path, config: &AttemptConfig) -> Self {
        let dir = work_dir.join(format!("attempt-{}", config.attempt));
        let name = config.build.effective_artifact_name();
        Self {
            archive_path: dir.join(format!("{name}.xcarchive")),
            ipa_export_dir: dir.join("export"),
            export_options_path: dir.join("export_options.plist"),
            xcconfig_path: dir.join("overrides.xcconfig"),
            archive_log_path: dir.join("xcodebuild-archive.log"),
            export_log_path: dir.join("xcodebuild-export-archive.log"),
            source_packages_dir: dir.join("SourcePackages"),
            dir,
        }
    }
}

/// Arguments for `xcodebuild ... archive`.
pub fn archive_args(build: &BuildConfig, layout: &ArchiveLayout) -> Vec<String> {
    let mut args = Vec::new();
    if build.is_workspace() {
        args.push("-workspace".to_string());
    } else {
        args.push("-project".to_string());
    }
    args.push(build.project_path.display().to_string());
    args.push("-scheme".to_string());
    args.push(build.scheme.clone());
    if !build.configuration.trim().is_empty() {
        args.push("-configuration".to_string());
        args.push(build.configuration.clone());
    }
    if has_xcconfig(build) {
        args.push("-xcconfig".to_string());
        args.push(layout.xcconfig_path.display().to_string());
    }
    if build.cache_level == CacheLevel::None {
        args.push("-clonedSourcePackagesDirPath".to_string());
        args.push(layout.source_packages_dir.display().to_string());
    }
    if build.perform_clean_action {
        args.push("clean".to_string());
    }
    args.push("archive".to_string());
    args.push("-archivePath".to_string());
    args.push(layout.archive_path.display().to_string());
    args.push("COMPILER_INDEX_STORE_ENABLE=NO".to_string());
    args.extend(build.xcodebuild_additional_options.iter().cloned());
    args
}

/// Arguments for `xcodebuild -exportArchive`.
pub fn export_args(layout: &ArchiveLayout) -> Vec<String> {
    vec![
        "-exportArchive".to_string(),
        "-archivePath".to_string(),
        layout.archive_path.display().to_string(),
        "-exportPath".to_string(),
        layout.ipa_export_dir.display().to_string(),
        "-exportOptionsPlist".to_string(),
        layout.export_options_path.display().to_string(),
    ]
}

fn has_xcconfig(build: &BuildConfig) -> bool {
    build
        .xcconfig_content
        .as_deref()
        .is_some_and(|content| !content.trim().is_empty())
}

/// Export options plist for the configured distribution.
///
/// Custom content wins over every generated key. Bitcode keys are left out for
/// Xcode 14 and later, which no longer supports bitcode.
pub fn export_options_plist(build: &BuildConfig) -> String {
    if let Some(custom) = build
        .export_options_plist_content
        .as_deref()
        .filter(|content| !content.trim().is_empty())
    {
        return custom.to_string();
    }

    let mut entries = vec![("method", plist_string(&build.export_method))];
    if let Some(team) = &build.export_development_team {
        entries.push(("teamID", plist_string(team)));
    }
    if let Some(env) = &build.icloud_container_environment {
        entries.push(("iCloudContainerEnvironment", plist_string(env)));
    }
    let supports_bitcode = build.xcode_major_version.is_none_or(|major| major < 14);
    if supports_bitcode {
        entries.push(("compileBitcode", plist_bool(build.compile_bitcode)));
        entries.push(("uploadBitcode", plist_bool(build.upload_bitcode)));
    }

    let mut buf = String::from(concat!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
        "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" ",
        "\"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n",
        "<plist version=\"1.0\">\n<dict>\n"
    ));
    for (key, value) in entries {
        buf.push_str(&format!("\t<key>{key}</key>\n\t{value}\n"));
    }
    buf.push_str("</dict>\n</plist>\n");
    buf
}

fn plist_string(value: &str) -> String {
    let escaped = value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!("<string>{escaped}</string>")
}

fn plist_bool(value: bool) -> String {
    if value { "<true/>" } else { "<false/>" }.to_string()
}

/// Executor that shells out to `xcodebuild`.
pub struct XcodebuildArchiver {
    work_dir: PathBuf,
    limits: ProcessLimits,
    xcodebuild: Launcher,
}

impl XcodebuildArchiver {
    pub fn new(work_dir: impl Into<PathBuf>, limits: ProcessLimits) -> Self {
        Self {
            work_dir: work_dir.into(),
            limits,
            xcodebuild: Toolchain::default().xcodebuild,
        }
    }

    /// Replace the `xcodebuild` launcher.
    pub fn with_xcodebuild(mut self, launcher: Launcher) -> Self {
        self.xcodebuild = launcher;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = self.xcodebuild.command();
        cmd.args(args);
        cmd
    }

    fn archive(&self, config: &AttemptConfig, layout: &ArchiveLayout) -> Result<()> {
        let build = &config.build;
        if let Some(content) = build
            .xcconfig_content
            .as_deref()
            .filter(|content| !content.trim().is_empty())
        {
            fs::write(&layout.xcconfig_path, content)
                .with_context(|| format!("write {}", layout.xcconfig_path.display()))?;
        }

        let cmd = self.command(&archive_args(build, layout));
        info!(command = %display_command(&cmd), "archiving");
        let output = run_command(cmd, None, self.limits, Some(&layout.archive_log_path))
            .context("run xcodebuild archive")?;
        self.render_output(build.log_formatter, &output);
        check_status("xcodebuild archive", &output, &layout.archive_log_path)
    }

    fn export(&self, config: &AttemptConfig, layout: &ArchiveLayout) -> Result<()> {
        fs::write(
            &layout.export_options_path,
            export_options_plist(&config.build),
        )
        .with_context(|| format!("write {}", layout.export_options_path.display()))?;

        let cmd = self.command(&export_args(layout));
        info!(command = %display_command(&cmd), "exporting archive");
        let output = run_command(cmd, None, self.limits, Some(&layout.export_log_path))
            .context("run xcodebuild -exportArchive")?;
        self.render_output(config.build.log_formatter, &output);
        check_status("xcodebuild -exportArchive", &output, &layout.export_log_path)
    }

    /// Print build output to the step log through the configured formatter.
    fn render_output(&self, formatter: LogFormatter, output: &CommandOutput) {
        match formatter {
            LogFormatter::Xcodebuild => print!("{}", String::from_utf8_lossy(&output.stdout)),
            LogFormatter::Xcpretty => {
                let mut cmd = Command::new("xcpretty");
                cmd.arg("--color");
                match run_command(cmd, Some(&output.stdout), self.limits, None) {
                    Ok(pretty) if pretty.success() => {
                        print!("{}", String::from_utf8_lossy(&pretty.stdout));
                    }
                    Ok(pretty) => {
                        warn!(exit_code = ?pretty.status.code(), "xcpretty failed, printing raw output");
                        print!("{}", String::from_utf8_lossy(&output.stdout));
                    }
                    Err(err) => {
                        warn!("xcpretty unavailable, printing raw output: {err:#}");
                        print!("{}", String::from_utf8_lossy(&output.stdout));
                    }
                }
            }
        }
    }
}

impl BuildExecutor for XcodebuildArchiver {
    #[instrument(skip_all, fields(attempt = config.attempt, scheme = %config.build.scheme))]
    fn run(&self, config: &AttemptConfig) -> Result<ArchiveResult> {
        let layout = ArchiveLayout::new(&self.work_dir, config);
        if layout.dir.exists() {
            fs::remove_dir_all(&layout.dir)
                .with_context(|| format!("reset attempt dir {}", layout.dir.display()))?;
        }
        fs::create_dir_all(&layout.dir)
            .with_context(|| format!("create attempt dir {}", layout.dir.display()))?;

        self.archive(config, &layout)?;
        if !layout.archive_path.exists() {
            return Err(anyhow!(
                "xcodebuild archive succeeded but {} is missing",
                layout.archive_path.display()
            ));
        }
        self.export(config, &layout)?;

        debug!(archive = %layout.archive_path.display(), "attempt produced archive");
        Ok(ArchiveResult {
            artifact_name: config.build.effective_artifact_name().to_string(),
            archive_path: layout.archive_path,
            ipa_export_dir: layout.ipa_export_dir,
            export_options_path: layout.export_options_path,
            archive_log_path: layout.archive_log_path,
            export_log_path: layout.export_log_path,
        })
    }
}

fn check_status(label: &str, output: &CommandOutput, log_path: &Path) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    let reason = if output.timed_out {
        "timed out".to_string()
    } else {
        format!("exited with status {:?}", output.status.code())
    };
    Err(anyhow!(
        "{label} {reason} (full log: {})\n{}",
        log_path.display(),
        tail_lines(&output.combined(), ERROR_TAIL_LINES)
    ))
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn build() -> BuildConfig {
        BuildConfig {
            project_path: PathBuf::from("ios/App.xcworkspace"),
            scheme: "App".to_string(),
            configuration: "Release".to_string(),
            ..BuildConfig::default()
        }
    }

    #[test]
    fn layout_is_per_attempt() {
        let first = ArchiveLayout::new(Path::new("/tmp/w"), &AttemptConfig::for_attempt(&build(), 1));
        let second =
            ArchiveLayout::new(Path::new("/tmp/w"), &AttemptConfig::for_attempt(&build(), 2));
        assert_eq!(first.dir, PathBuf::from("/tmp/w/attempt-1"));
        assert_eq!(second.dir, PathBuf::from("/tmp/w/attempt-2"));
        assert_eq!(
            first.archive_path,
            PathBuf::from("/tmp/w/attempt-1/App.xcarchive")
        );
    }

    #[test]
    fn archive_args_for_first_attempt() {
        let config = AttemptConfig::for_attempt(&build(), 1);
        let layout = ArchiveLayout::new(Path::new("/w"), &config);
        assert_eq!(
            archive_args(&config.build, &layout),
            vec![
                "-workspace",
                "ios/App.xcworkspace",
                "-scheme",
                "App",
                "-configuration",
                "Release",
                "archive",
                "-archivePath",
                "/w/attempt-1/App.xcarchive",
                "COMPILER_INDEX_STORE_ENABLE=NO",
            ]
        );
    }

    #[test]
    fn retry_attempt_uses_private_package_dir() {
        let mut base = build();
        base.project_path = PathBuf::from("App.xcodeproj");
        base.perform_clean_action = true;
        base.xcconfig_content = Some("CODE_SIGN_STYLE = Manual".to_string());
        base.xcodebuild_additional_options = vec!["-quiet".to_string()];
        let config = AttemptConfig::for_attempt(&base, 2);
        let layout = ArchiveLayout::new(Path::new("/w"), &config);

        let args = archive_args(&config.build, &layout);
        assert_eq!(&args[..2], &["-project", "App.xcodeproj"]);
        let joined = args.join(" ");
        assert!(joined.contains("-xcconfig /w/attempt-2/overrides.xcconfig"));
        assert!(joined.contains("-clonedSourcePackagesDirPath /w/attempt-2/SourcePackages"));
        assert!(joined.contains("clean archive -archivePath"));
        assert_eq!(args.last().map(String::as_str), Some("-quiet"));
    }

    #[test]
    fn export_plist_generated_from_options() {
        let mut config = build();
        config.export_method = "ad-hoc".to_string();
        config.export_development_team = Some("ABCDE12345".to_string());
        config.compile_bitcode = false;
        config.xcode_major_version = Some(13);

        let plist = export_options_plist(&config);
        assert!(plist.contains("<key>method</key>\n\t<string>ad-hoc</string>"));
        assert!(plist.contains("<key>teamID</key>\n\t<string>ABCDE12345</string>"));
        assert!(plist.contains("<key>compileBitcode</key>\n\t<false/>"));
        assert!(plist.contains("<key>uploadBitcode</key>\n\t<true/>"));
        assert!(!plist.contains("iCloudContainerEnvironment"));
    }

    #[test]
    fn export_plist_drops_bitcode_on_new_xcode() {
        let mut config = build();
        config.xcode_major_version = Some(15);
        let plist = export_options_plist(&config);
        assert!(!plist.contains("Bitcode"));
    }

    #[test]
    fn custom_export_plist_wins() {
        let mut config = build();
        config.export_options_plist_content = Some("<plist>custom</plist>".to_string());
        assert_eq!(export_options_plist(&config), "<plist>custom</plist>");
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail_lines("a", 5), "a");
    }

    #[cfg(unix)]
    mod fake_xcodebuild {
        use super::*;

        /// Fake `xcodebuild` that creates the paths it is asked for.
        const SCRIPT: &str = r#"
echo "fake xcodebuild $*"
while [ $# -gt 0 ]; do
  case "$1" in
    -archivePath) shift; mkdir -p "$1" ;;
    -exportPath) shift; mkdir -p "$1"; touch "$1/App.ipa" ;;
    fail-me) echo "error: build failed" >&2; exit 65 ;;
  esac
  shift
done
"#;

        fn archiver(temp: &Path) -> XcodebuildArchiver {
            let script = temp.join("xcodebuild.sh");
            fs::write(&script, SCRIPT).expect("write script");
            XcodebuildArchiver::new(
                temp.join("work"),
                ProcessLimits {
                    timeout: Duration::from_secs(10),
                    output_limit_bytes: 10_000,
                },
            )
            .with_xcodebuild(Launcher::new("sh").with_leading_args(vec![script.display().to_string()]))
        }

        #[test]
        fn successful_attempt_returns_artifacts_and_logs() {
            let temp = tempfile::tempdir().expect("tempdir");
            let archiver = archiver(temp.path());
            let config = AttemptConfig::for_attempt(&build(), 1);

            let result = archiver.run(&config).expect("run");

            assert_eq!(result.artifact_name, "App");
            assert!(result.archive_path.is_dir());
            assert!(result.ipa_export_dir.join("App.ipa").is_file());
            assert!(result.export_options_path.is_file());
            let log = fs::read_to_string(&result.archive_log_path).expect("archive log");
            assert!(log.contains("fake xcodebuild -workspace"));
            assert!(result.export_log_path.is_file());
        }

        #[test]
        fn failed_attempt_leaves_log_and_quotes_output() {
            let temp = tempfile::tempdir().expect("tempdir");
            let archiver = archiver(temp.path());
            let mut base = build();
            base.xcodebuild_additional_options = vec!["fail-me".to_string()];
            let config = AttemptConfig::for_attempt(&base, 3);

            let err = archiver.run(&config).unwrap_err();

            let message = format!("{err:#}");
            assert!(message.contains("xcodebuild archive exited with status Some(65)"));
            assert!(message.contains("error: build failed"));
            let layout = ArchiveLayout::new(archiver.work_dir(), &config);
            assert!(layout.archive_log_path.is_file());
        }
    }
}
