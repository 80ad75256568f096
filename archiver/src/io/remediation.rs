//! Best-effort cleanup run between failed archive attempts.
//!
//! Every action is independent and idempotent. A failing action is logged with
//! its captured output and the plan moves on; the plan as a whole never fails.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::attempt::AttemptConfig;
use crate::io::paths::{CachePaths, PathResolver};
use crate::io::process::{Launcher, ProcessLimits, Toolchain, display_command, run_command};

/// One cleanup step. Errors should carry whatever output explains the failure.
pub trait RemediationAction {
    fn name(&self) -> &str;
    fn execute(&self) -> Result<()>;
}

/// Runs an external command; non-zero exit or timeout is a failure.
#[derive(Debug, Clone)]
pub struct CommandAction {
    name: String,
    launcher: Launcher,
    args: Vec<String>,
    limits: ProcessLimits,
}

impl CommandAction {
    pub fn new(
        name: impl Into<String>,
        launcher: Launcher,
        args: Vec<String>,
        limits: ProcessLimits,
    ) -> Self {
        Self {
            name: name.into(),
            launcher,
            args,
            limits,
        }
    }

    pub fn command(&self) -> Command {
        let mut cmd = self.launcher.command();
        cmd.args(&self.args);
        cmd
    }
}

impl RemediationAction for CommandAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self) -> Result<()> {
        let cmd = self.command();
        info!(action = %self.name, command = %display_command(&cmd), "running remediation command");
        run_command(cmd, None, self.limits, None)?.into_result(self.launcher.program())?;
        Ok(())
    }
}

/// What a [`PurgeAction`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// The directory itself.
    Directory,
    /// Everything inside the directory; the directory is kept.
    Contents,
}

/// Deletes a cache location. A missing target is not an error.
#[derive(Debug, Clone)]
pub struct PurgeAction {
    name: String,
    /// `None` when the location could not be resolved (nothing to purge).
    target: Option<PathBuf>,
    mode: PurgeMode,
}

impl PurgeAction {
    pub fn new(name: impl Into<String>, target: Option<PathBuf>, mode: PurgeMode) -> Self {
        Self {
            name: name.into(),
            target,
            mode,
        }
    }
}

impl RemediationAction for PurgeAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self) -> Result<()> {
        let Some(target) = &self.target else {
            debug!(action = %self.name, "cache location unknown, nothing to purge");
            return Ok(());
        };
        info!(action = %self.name, path = %target.display(), mode = ?self.mode, "purging cache");
        match self.mode {
            PurgeMode::Directory => remove_path(target),
            PurgeMode::Contents => remove_contents(target),
        }
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
    };
    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

fn remove_contents(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };

    // Keep going past individual failures so one locked file does not shield the rest.
    let mut failures = Vec::new();
    for entry in entries {
        let result = entry
            .with_context(|| format!("read entry in {}", dir.display()))
            .and_then(|entry| remove_path(&entry.path()));
        if let Err(err) = result {
            failures.push(format!("{err:#}"));
        }
    }
    if failures.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "failed to purge {} of {}:\n{}",
        failures.len(),
        dir.display(),
        failures.join("\n")
    ))
}

/// `xcodebuild clean` for the configured project or workspace and scheme.
pub fn clean_action(
    config: &AttemptConfig,
    xcodebuild: &Launcher,
    limits: ProcessLimits,
) -> CommandAction {
    let build = &config.build;
    let target_flag = if build.is_workspace() {
        "-workspace"
    } else {
        "-project"
    };
    CommandAction::new(
        "clean",
        xcodebuild.clone(),
        vec![
            "clean".to_string(),
            target_flag.to_string(),
            build.project_path.display().to_string(),
            "-scheme".to_string(),
            build.scheme.clone(),
        ],
        limits,
    )
}

/// `tuist generate` for the configured build configuration.
pub fn regenerate_action(
    config: &AttemptConfig,
    tuist: &Launcher,
    limits: ProcessLimits,
) -> CommandAction {
    let mut args = vec!["generate".to_string()];
    if !config.build.configuration.trim().is_empty() {
        args.push("--configuration".to_string());
        args.push(config.build.configuration.clone());
    }
    args.push("-p".to_string());
    args.push("tuist".to_string());
    CommandAction::new("regenerate-project", tuist.clone(), args, limits)
}

/// Result of one action inside a plan run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub name: String,
    /// Rendered error with captured output, when the action failed.
    pub error: Option<String>,
}

/// Per-action results of a plan run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemediationReport {
    pub actions: Vec<ActionReport>,
}

impl RemediationReport {
    pub fn failed_count(&self) -> usize {
        self.actions.iter().filter(|a| a.error.is_some()).count()
    }
}

/// Ordered set of independent cleanup actions.
pub struct RemediationPlan {
    actions: Vec<Box<dyn RemediationAction>>,
}

impl RemediationPlan {
    pub fn new(actions: Vec<Box<dyn RemediationAction>>) -> Self {
        Self { actions }
    }

    /// The fixed cleanup sequence for a failed archive attempt.
    ///
    /// Order: clean the build target, purge the Xcode cache, the Swift package
    /// cache, derived data and build state, then regenerate the project.
    pub fn standard<P: PathResolver + ?Sized>(
        config: &AttemptConfig,
        resolver: &P,
        tools: &Toolchain,
        limits: ProcessLimits,
    ) -> Self {
        let caches = CachePaths::resolve(resolver);
        if caches.is_none() {
            warn!("home directory unavailable, cache purges will be skipped");
        }
        let caches = caches.as_ref();

        Self::new(vec![
            Box::new(clean_action(config, &tools.xcodebuild, limits)),
            Box::new(PurgeAction::new(
                "purge-xcode-cache",
                caches.map(|c| c.xcode_cache.clone()),
                PurgeMode::Directory,
            )),
            Box::new(PurgeAction::new(
                "purge-swiftpm-cache",
                caches.map(|c| c.swiftpm_cache.clone()),
                PurgeMode::Directory,
            )),
            Box::new(PurgeAction::new(
                "purge-derived-data",
                caches.map(|c| c.derived_data.clone()),
                PurgeMode::Contents,
            )),
            Box::new(PurgeAction::new(
                "purge-build-state",
                caches.map(|c| c.build_state.clone()),
                PurgeMode::Contents,
            )),
            Box::new(regenerate_action(config, &tools.tuist, limits)),
        ])
    }

    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    /// Run every action in order. Failures are logged and recorded, never returned.
    #[instrument(skip_all, fields(actions = self.actions.len()))]
    pub fn run(&self) -> RemediationReport {
        let mut report = RemediationReport::default();
        for action in &self.actions {
            let error = match action.execute() {
                Ok(()) => None,
                Err(err) => {
                    let rendered = format!("{err:#}");
                    warn!(action = action.name(), "remediation action failed: {rendered}");
                    Some(rendered)
                }
            };
            report.actions.push(ActionReport {
                name: action.name().to_string(),
                error,
            });
        }
        report
    }
}

/// Cleanup hook invoked by the retry loop before every attempt after the first.
pub trait Remediator {
    /// Clean up after the attempt that ran with `previous`. Must not fail.
    fn remediate(&self, previous: &AttemptConfig);
}

/// Runs [`RemediationPlan::standard`] for the previous attempt's configuration.
pub struct PlanRemediator<P> {
    resolver: P,
    tools: Toolchain,
    limits: ProcessLimits,
}

impl<P: PathResolver> PlanRemediator<P> {
    pub fn new(resolver: P, limits: ProcessLimits) -> Self {
        Self {
            resolver,
            tools: Toolchain::default(),
            limits,
        }
    }

    pub fn with_toolchain(mut self, tools: Toolchain) -> Self {
        self.tools = tools;
        self
    }
}

impl<P: PathResolver> Remediator for PlanRemediator<P> {
    fn remediate(&self, previous: &AttemptConfig) {
        info!(after_attempt = previous.attempt, "running remediation plan");
        let report = RemediationPlan::standard(previous, &self.resolver, &self.tools, self.limits).run();
        info!(
            actions = report.actions.len(),
            failed = report.failed_count(),
            "remediation plan finished"
        );
    }
}
