//! One-time tool installation before the first archive attempt.

use std::fmt;
use std::process::Command;

use anyhow::{Error, Result};
use tracing::{debug, info, warn};

use crate::core::types::{BuildConfig, LogFormatter};
use crate::io::process::{ProcessLimits, display_command, run_command};

/// Installing the optional `xcpretty` formatter failed.
///
/// Recognised by [`ensure_dependencies`] to fall back to raw `xcodebuild` output
/// instead of failing the step.
#[derive(Debug)]
pub struct XcprettyInstallError {
    pub source: Error,
}

impl fmt::Display for XcprettyInstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "install xcpretty: {:#}", self.source)
    }
}

impl std::error::Error for XcprettyInstallError {}

/// Installs tools the build needs.
pub trait DependencyInstaller {
    /// Make `xcpretty` available. Install failures must be reported as
    /// [`XcprettyInstallError`]; anything else is treated as fatal.
    fn ensure_xcpretty(&self) -> Result<()>;
}

/// Installer that uses RubyGems.
pub struct GemInstaller {
    limits: ProcessLimits,
}

impl GemInstaller {
    pub fn new(limits: ProcessLimits) -> Self {
        Self { limits }
    }

    fn xcpretty_installed(&self) -> bool {
        let mut cmd = Command::new("xcpretty");
        cmd.arg("--version");
        match run_command(cmd, None, self.limits, None) {
            Ok(output) if output.success() => {
                debug!(version = %String::from_utf8_lossy(&output.stdout).trim(), "xcpretty present");
                true
            }
            _ => false,
        }
    }
}

impl DependencyInstaller for GemInstaller {
    fn ensure_xcpretty(&self) -> Result<()> {
        if self.xcpretty_installed() {
            return Ok(());
        }
        let mut cmd = Command::new("gem");
        cmd.arg("install").arg("xcpretty").arg("--no-document");
        info!(command = %display_command(&cmd), "installing xcpretty");
        run_command(cmd, None, self.limits, None)
            .and_then(|output| output.into_result("gem install xcpretty"))
            .map_err(|source| XcprettyInstallError { source })?;
        Ok(())
    }
}

/// Prepare tools for the configured log formatter.
///
/// A failed `xcpretty` install downgrades the formatter to `xcodebuild` and the
/// step continues; any other failure is returned.
pub fn ensure_dependencies<I: DependencyInstaller + ?Sized>(
    installer: &I,
    config: &BuildConfig,
) -> Result<BuildConfig> {
    let mut config = config.clone();
    if config.log_formatter != LogFormatter::Xcpretty {
        return Ok(config);
    }
    match installer.ensure_xcpretty() {
        Ok(()) => Ok(config),
        Err(err) if err.downcast_ref::<XcprettyInstallError>().is_some() => {
            warn!("installing xcpretty failed: {err:#}");
            warn!("switching to xcodebuild for log formatter");
            config.log_formatter = LogFormatter::Xcodebuild;
            Ok(config)
        }
        Err(err) => Err(err.context("install step dependencies")),
    }
}
