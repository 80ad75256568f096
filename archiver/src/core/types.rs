//! Shared deterministic types for the archive step.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Dependency cache behaviour requested from the build tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    /// No package caches are read or written.
    None,
    /// Resolved Swift packages are reused between builds.
    SwiftPackages,
}

/// Tool used to render build tool output in the step log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatter {
    /// Raw `xcodebuild` output. Always available.
    Xcodebuild,
    /// Output piped through `xcpretty`, which may need installing first.
    Xcpretty,
}

impl fmt::Display for LogFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormatter::Xcodebuild => f.write_str("xcodebuild"),
            LogFormatter::Xcpretty => f.write_str("xcpretty"),
        }
    }
}

/// Immutable snapshot of the build parameters for one step run.
///
/// Missing fields default to values suitable for a plain App Store archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Path to the `.xcodeproj` or `.xcworkspace`.
    pub project_path: PathBuf,
    pub scheme: String,
    /// Build configuration (e.g. `Release`). Empty means the scheme's default.
    pub configuration: String,
    pub log_formatter: LogFormatter,
    pub xcode_major_version: Option<u32>,
    /// Base name for produced artifacts. Empty means the scheme name.
    pub artifact_name: String,
    /// Run `clean` before `archive` inside the same build invocation.
    pub perform_clean_action: bool,
    /// Inline xcconfig content applied to the archive build.
    pub xcconfig_content: Option<String>,
    pub xcodebuild_additional_options: Vec<String>,
    pub cache_level: CacheLevel,
    /// Distribution method for the IPA export (`app-store`, `ad-hoc`, ...).
    pub export_method: String,
    /// Custom export options plist. Overrides every generated export option.
    pub export_options_plist_content: Option<String>,
    pub export_development_team: Option<String>,
    pub icloud_container_environment: Option<String>,
    pub compile_bitcode: bool,
    pub upload_bitcode: bool,
    /// Directory receiving exported artifacts and logs.
    pub output_dir: PathBuf,
    /// Export every dSYM in the archive instead of only the app's.
    pub export_all_dsyms: bool,
    /// Configured attempt budget. Values below 1 are treated as 1.
    pub max_retry_count: i64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            project_path: PathBuf::new(),
            scheme: String::new(),
            configuration: String::new(),
            log_formatter: LogFormatter::Xcodebuild,
            xcode_major_version: None,
            artifact_name: String::new(),
            perform_clean_action: false,
            xcconfig_content: None,
            xcodebuild_additional_options: Vec::new(),
            cache_level: CacheLevel::SwiftPackages,
            export_method: "app-store".to_string(),
            export_options_plist_content: None,
            export_development_team: None,
            icloud_container_environment: None,
            compile_bitcode: true,
            upload_bitcode: true,
            output_dir: PathBuf::from("build/output"),
            export_all_dsyms: true,
            max_retry_count: 1,
        }
    }
}

impl BuildConfig {
    /// Whether the project path points at a workspace rather than a project.
    pub fn is_workspace(&self) -> bool {
        self.project_path
            .extension()
            .is_some_and(|ext| ext == "xcworkspace")
    }

    /// Artifact base name, falling back to the scheme.
    pub fn effective_artifact_name(&self) -> &str {
        if self.artifact_name.trim().is_empty() {
            &self.scheme
        } else {
            &self.artifact_name
        }
    }
}
