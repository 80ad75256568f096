//! Step configuration stored in a TOML file (default `archive.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::BuildConfig;
use crate::io::process::ProcessLimits;

pub const DEFAULT_CONFIG_PATH: &str = "archive.toml";

/// Step configuration (TOML).
///
/// Missing tables and fields fall back to defaults, so a file only needs the
/// project path and scheme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StepConfig {
    pub build: BuildConfig,
    pub retry: RetryConfig,
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Wait after remediation before the next attempt, so purged caches settle.
    pub settle_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Wall-clock limit for any single child process.
    pub timeout_secs: u64,
    /// Keep at most this many bytes of stdout/stderr per child process.
    pub output_limit_bytes: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 2 * 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl ProcessConfig {
    pub fn limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

impl StepConfig {
    pub fn validate(&self) -> Result<()> {
        if self.build.project_path.as_os_str().is_empty() {
            return Err(anyhow!("build.project_path must be set"));
        }
        if self.build.scheme.trim().is_empty() {
            return Err(anyhow!("build.scheme must be set"));
        }
        if self.build.output_dir.as_os_str().is_empty() {
            return Err(anyhow!("build.output_dir must be set"));
        }
        if self.process.timeout_secs == 0 {
            return Err(anyhow!("process.timeout_secs must be > 0"));
        }
        if self.process.output_limit_bytes == 0 {
            return Err(anyhow!("process.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file without validating it.
///
/// If the file is missing, returns `StepConfig::default()`. Callers validate
/// after applying command line overrides.
pub fn load_config(path: &Path) -> Result<StepConfig> {
    if !path.exists() {
        return Ok(StepConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StepConfig) -> Result<()> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
