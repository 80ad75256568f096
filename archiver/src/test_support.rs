//! Scripted collaborators for exercising the retry loop and the step without
//! spawning build tools.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::attempt::AttemptConfig;
use crate::core::summary::RunSummary;
use crate::core::types::{BuildConfig, CacheLevel};
use crate::io::archiver::{ArchiveResult, BuildExecutor};
use crate::io::dependencies::{DependencyInstaller, XcprettyInstallError};
use crate::io::export::Exporter;
use crate::io::paths::PathResolver;
use crate::io::remediation::Remediator;

/// Shared, ordered record of calls across several fakes.
pub type Journal = Rc<RefCell<Vec<String>>>;

pub fn journal() -> Journal {
    Rc::new(RefCell::new(Vec::new()))
}

fn record(journal: &Option<Journal>, entry: String) {
    if let Some(journal) = journal {
        journal.borrow_mut().push(entry);
    }
}

/// Deterministic base configuration with the package cache enabled.
pub fn base_config() -> BuildConfig {
    BuildConfig {
        project_path: PathBuf::from("ios/App.xcworkspace"),
        scheme: "App".to_string(),
        configuration: "Release".to_string(),
        cache_level: CacheLevel::SwiftPackages,
        ..BuildConfig::default()
    }
}

/// Artifact paths a successful attempt would report.
pub fn sample_result(config: &AttemptConfig) -> ArchiveResult {
    let dir = PathBuf::from(format!("/tmp/archiver/attempt-{}", config.attempt));
    ArchiveResult {
        artifact_name: config.build.effective_artifact_name().to_string(),
        archive_path: dir.join("App.xcarchive"),
        ipa_export_dir: dir.join("export"),
        export_options_path: dir.join("export_options.plist"),
        archive_log_path: dir.join("xcodebuild-archive.log"),
        export_log_path: dir.join("xcodebuild-export-archive.log"),
    }
}

/// Outcome of one scripted build attempt.
#[derive(Debug, Clone)]
pub enum ScriptedAttempt {
    Succeed,
    Fail(&'static str),
}

/// Build executor that replays scripted outcomes in order.
pub struct ScriptedBuilder {
    script: RefCell<VecDeque<ScriptedAttempt>>,
    calls: RefCell<Vec<AttemptConfig>>,
    journal: Option<Journal>,
}

impl ScriptedBuilder {
    pub fn new(script: Vec<ScriptedAttempt>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            calls: RefCell::new(Vec::new()),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Configurations received, in call order.
    pub fn calls(&self) -> Vec<AttemptConfig> {
        self.calls.borrow().clone()
    }
}

impl BuildExecutor for ScriptedBuilder {
    fn run(&self, config: &AttemptConfig) -> Result<ArchiveResult> {
        self.calls.borrow_mut().push(config.clone());
        record(&self.journal, format!("build:{}", config.attempt));
        match self.script.borrow_mut().pop_front() {
            Some(ScriptedAttempt::Succeed) => Ok(sample_result(config)),
            Some(ScriptedAttempt::Fail(reason)) => Err(anyhow!("archive failed: {reason}")),
            None => Err(anyhow!("no scripted attempt left")),
        }
    }
}

/// Remediator that records which attempt it cleaned up after.
#[derive(Default)]
pub struct RecordingRemediator {
    calls: RefCell<Vec<u32>>,
    journal: Option<Journal>,
}

impl RecordingRemediator {
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn calls(&self) -> Vec<u32> {
        self.calls.borrow().clone()
    }
}

impl Remediator for RecordingRemediator {
    fn remediate(&self, previous: &AttemptConfig) {
        self.calls.borrow_mut().push(previous.attempt);
        record(&self.journal, format!("remediate:{}", previous.attempt));
    }
}

/// Sleeper that records requested delays instead of waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: RefCell<Vec<Duration>>,
    journal: Option<Journal>,
}

impl RecordingSleeper {
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl crate::retry::Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
        record(&self.journal, format!("sleep:{}s", duration.as_secs()));
    }
}

/// What the export phase saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportCall {
    pub attempt: u32,
    pub succeeded: bool,
    pub attempts_used: u32,
    pub max_attempts: u32,
}

/// Exporter that records its call and optionally fails.
#[derive(Default)]
pub struct ScriptedExporter {
    failure: Option<&'static str>,
    calls: RefCell<Vec<ExportCall>>,
}

impl ScriptedExporter {
    pub fn failing(reason: &'static str) -> Self {
        Self {
            failure: Some(reason),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ExportCall> {
        self.calls.borrow().clone()
    }
}

impl Exporter for ScriptedExporter {
    fn export(&self, config: &AttemptConfig, summary: &RunSummary<ArchiveResult>) -> Result<()> {
        self.calls.borrow_mut().push(ExportCall {
            attempt: config.attempt,
            succeeded: summary.succeeded(),
            attempts_used: summary.attempts_used,
            max_attempts: summary.max_attempts,
        });
        match self.failure {
            Some(reason) => Err(anyhow!("export failed: {reason}")),
            None => Ok(()),
        }
    }
}

/// How a [`ScriptedInstaller`] responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallBehavior {
    Succeed,
    /// Fails with [`XcprettyInstallError`].
    XcprettyFails,
    /// Fails with an unrelated, fatal error.
    Fatal,
}

pub struct ScriptedInstaller {
    behavior: InstallBehavior,
    calls: Cell<u32>,
}

impl ScriptedInstaller {
    pub fn new(behavior: InstallBehavior) -> Self {
        Self {
            behavior,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl DependencyInstaller for ScriptedInstaller {
    fn ensure_xcpretty(&self) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        match self.behavior {
            InstallBehavior::Succeed => Ok(()),
            InstallBehavior::XcprettyFails => Err(XcprettyInstallError {
                source: anyhow!("gem install exited 1"),
            }
            .into()),
            InstallBehavior::Fatal => Err(anyhow!("ruby toolchain missing")),
        }
    }
}

/// Path resolver rooted at a fixed directory (or none at all).
pub struct FixedPathResolver(pub Option<PathBuf>);

impl PathResolver for FixedPathResolver {
    fn home_dir(&self) -> Option<PathBuf> {
        self.0.clone()
    }
}
