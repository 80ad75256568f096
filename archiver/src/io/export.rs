//! Export phase: persist artifacts and logs of the final attempt.
//!
//! Runs once after the retry loop whatever its outcome, because the logs of a
//! failed attempt are still worth keeping.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::attempt::AttemptConfig;
use crate::core::summary::RunSummary;
use crate::io::archiver::{ArchiveLayout, ArchiveResult};

pub const OUTPUTS_FILE: &str = "outputs.json";

/// Persists the outcome of the retry loop.
pub trait Exporter {
    /// Called exactly once per run with the last attempt's configuration.
    fn export(&self, config: &AttemptConfig, summary: &RunSummary<ArchiveResult>) -> Result<()>;
}

/// Step outputs written to `outputs.json` in the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct StepOutputs {
    pub status: ExportStatus,
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub archive_path: Option<PathBuf>,
    pub ipa_path: Option<PathBuf>,
    pub dsym_dir_path: Option<PathBuf>,
    pub export_options_path: Option<PathBuf>,
    pub xcodebuild_archive_log_path: Option<PathBuf>,
    pub xcodebuild_export_archive_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Succeeded,
    Failed,
}

/// Copies artifacts into `build.output_dir` and writes [`StepOutputs`].
pub struct OutputExporter {
    work_dir: PathBuf,
}

impl OutputExporter {
    /// `work_dir` must be the directory the build executor wrote attempts into.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

impl Exporter for OutputExporter {
    #[instrument(skip_all, fields(attempt = config.attempt, output_dir = %config.build.output_dir.display()))]
    fn export(&self, config: &AttemptConfig, summary: &RunSummary<ArchiveResult>) -> Result<()> {
        let output_dir = &config.build.output_dir;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("create output dir {}", output_dir.display()))?;

        let layout = ArchiveLayout::new(&self.work_dir, config);
        let name = config.build.effective_artifact_name();
        let mut errors = Vec::new();

        // A failed attempt can still leave a finished archive behind (e.g. when
        // only -exportArchive failed), so fall back to the attempt layout.
        let artifacts = match &summary.result {
            Some(result) => AttemptArtifacts {
                archive: &result.archive_path,
                ipa_export_dir: &result.ipa_export_dir,
                export_options: &result.export_options_path,
                archive_log: &result.archive_log_path,
                export_log: &result.export_log_path,
            },
            None => AttemptArtifacts {
                archive: &layout.archive_path,
                ipa_export_dir: &layout.ipa_export_dir,
                export_options: &layout.export_options_path,
                archive_log: &layout.archive_log_path,
                export_log: &layout.export_log_path,
            },
        };

        let mut outputs = StepOutputs {
            status: if summary.succeeded() {
                ExportStatus::Succeeded
            } else {
                ExportStatus::Failed
            },
            attempts_used: summary.attempts_used,
            max_attempts: summary.max_attempts,
            archive_path: None,
            ipa_path: None,
            dsym_dir_path: None,
            export_options_path: None,
            xcodebuild_archive_log_path: copy_if_exists(
                artifacts.archive_log,
                &output_dir.join("xcodebuild-archive.log"),
                &mut errors,
            ),
            xcodebuild_export_archive_log_path: copy_if_exists(
                artifacts.export_log,
                &output_dir.join("xcodebuild-export-archive.log"),
                &mut errors,
            ),
        };

        let archive_dst = output_dir.join(format!("{name}.xcarchive"));
        outputs.archive_path = copy_dir_if_exists(artifacts.archive, &archive_dst, &mut errors);
        outputs.export_options_path = copy_if_exists(
            artifacts.export_options,
            &output_dir.join("export_options.plist"),
            &mut errors,
        );
        outputs.ipa_path = match find_ipa(artifacts.ipa_export_dir) {
            Some(ipa) => copy_if_exists(&ipa, &output_dir.join(format!("{name}.ipa")), &mut errors),
            None => {
                if summary.succeeded() {
                    warn!(dir = %artifacts.ipa_export_dir.display(), "no ipa found in export dir");
                }
                None
            }
        };
        outputs.dsym_dir_path = export_dsyms(
            &artifacts.archive.join("dSYMs"),
            &output_dir.join("dSYMs"),
            config.build.export_all_dsyms,
            &mut errors,
        );

        let outputs_path = output_dir.join(OUTPUTS_FILE);
        write_outputs(&outputs_path, &outputs)?;
        info!(path = %outputs_path.display(), status = ?outputs.status, "step outputs exported");

        if errors.is_empty() {
            return Ok(());
        }
        Err(anyhow!("export had errors:\n- {}", errors.join("\n- ")))
    }
}

/// Source paths of the final attempt's artifacts and logs.
struct AttemptArtifacts<'a> {
    archive: &'a Path,
    ipa_export_dir: &'a Path,
    export_options: &'a Path,
    archive_log: &'a Path,
    export_log: &'a Path,
}

pub fn load_outputs(path: &Path) -> Result<StepOutputs> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_outputs(path: &Path, outputs: &StepOutputs) -> Result<()> {
    let contents = serde_json::to_string_pretty(outputs).context("serialize outputs")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write outputs {}", path.display()))
}

/// Copy `src` to `dst` if it exists. Returns `dst` on success.
fn copy_if_exists(src: &Path, dst: &Path, errors: &mut Vec<String>) -> Option<PathBuf> {
    if !src.is_file() {
        debug!(path = %src.display(), "nothing to export");
        return None;
    }
    match fs::copy(src, dst) {
        Ok(_) => Some(dst.to_path_buf()),
        Err(err) => {
            errors.push(format!("copy {}: {err}", src.display()));
            None
        }
    }
}

fn copy_dir_if_exists(src: &Path, dst: &Path, errors: &mut Vec<String>) -> Option<PathBuf> {
    if !src.is_dir() {
        debug!(path = %src.display(), "nothing to export");
        return None;
    }
    if dst.exists()
        && let Err(err) = fs::remove_dir_all(dst)
    {
        errors.push(format!("replace {}: {err}", dst.display()));
        return None;
    }
    match copy_dir_recursive(src, dst) {
        Ok(()) => Some(dst.to_path_buf()),
        Err(err) => {
            errors.push(format!("{err:#}"));
            None
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target).with_context(|| format!("copy {}", path.display()))?;
        }
    }
    Ok(())
}

fn find_ipa(dir: &Path) -> Option<PathBuf> {
    let mut ipas: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "ipa"))
        .collect();
    ipas.sort();
    ipas.into_iter().next()
}

/// Copy dSYM bundles. Without `all`, only app dSYMs (`*.app.dSYM`) are kept.
fn export_dsyms(src: &Path, dst: &Path, all: bool, errors: &mut Vec<String>) -> Option<PathBuf> {
    let entries = fs::read_dir(src).ok()?;
    let mut exported = 0usize;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if !name.ends_with(".dSYM") || !(all || name.ends_with(".app.dSYM")) {
            continue;
        }
        if copy_dir_if_exists(&entry.path(), &dst.join(&file_name), errors).is_some() {
            exported += 1;
        }
    }
    if exported == 0 {
        return None;
    }
    Some(dst.to_path_buf())
}
