//! Retrying iOS archive step.
//!
//! Reads `archive.toml`, archives the project with `xcodebuild`, remediates
//! and retries failed attempts, then copies artifacts and logs to the output
//! directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use archiver::core::types::LogFormatter;
use archiver::exit_codes;
use archiver::io::archiver::XcodebuildArchiver;
use archiver::io::config::{DEFAULT_CONFIG_PATH, StepConfig, load_config, write_config};
use archiver::io::dependencies::GemInstaller;
use archiver::io::export::OutputExporter;
use archiver::io::paths::HomePathResolver;
use archiver::io::remediation::PlanRemediator;
use archiver::logging;
use archiver::retry::ThreadSleeper;
use archiver::step::{StepCollaborators, run_step};

#[derive(Parser)]
#[command(
    name = "archiver",
    version,
    about = "Archive an iOS project, remediating and retrying flaky failures"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Config file to create.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Archive and export, retrying failed attempts.
    Run {
        /// Config file to read; defaults apply when it does not exist.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        #[command(flatten)]
        overrides: BuildOverrides,
    },
}

/// Command line values that take precedence over `[build]` in the config file.
#[derive(Args, Debug, Default, PartialEq, Eq)]
struct BuildOverrides {
    /// Path to the `.xcodeproj` or `.xcworkspace`.
    #[arg(long)]
    project_path: Option<PathBuf>,
    #[arg(long)]
    scheme: Option<String>,
    /// Build configuration, e.g. `Release`.
    #[arg(long)]
    configuration: Option<String>,
    /// Total attempts including the first; values below 1 mean one attempt.
    #[arg(long, allow_negative_numbers = true)]
    max_retry_count: Option<i64>,
    #[arg(long, value_enum)]
    log_formatter: Option<FormatterArg>,
    /// Directory that receives artifacts, logs and `outputs.json`.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FormatterArg {
    Xcodebuild,
    Xcpretty,
}

impl From<FormatterArg> for LogFormatter {
    fn from(arg: FormatterArg) -> Self {
        match arg {
            FormatterArg::Xcodebuild => LogFormatter::Xcodebuild,
            FormatterArg::Xcpretty => LogFormatter::Xcpretty,
        }
    }
}

impl BuildOverrides {
    fn apply(self, config: &mut StepConfig) {
        let build = &mut config.build;
        if let Some(path) = self.project_path {
            build.project_path = path;
        }
        if let Some(scheme) = self.scheme {
            build.scheme = scheme;
        }
        if let Some(configuration) = self.configuration {
            build.configuration = configuration;
        }
        if let Some(count) = self.max_retry_count {
            build.max_retry_count = count;
        }
        if let Some(formatter) = self.log_formatter {
            build.log_formatter = formatter.into();
        }
        if let Some(dir) = self.output_dir {
            build.output_dir = dir;
        }
    }
}

fn main() {
    logging::init();
    let code = match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { config, force } => {
            cmd_init(&config, force)?;
            Ok(exit_codes::OK)
        }
        Command::Run { config, overrides } => cmd_run(&config, overrides),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    write_config(path, &StepConfig::default())?;
    info!(path = %path.display(), "wrote default config");
    Ok(())
}

fn cmd_run(path: &Path, overrides: BuildOverrides) -> Result<i32> {
    let mut config = load_config(path)?;
    overrides.apply(&mut config);
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;

    let limits = config.process.limits();
    let work_dir = tempfile::Builder::new()
        .prefix("archiver-")
        .tempdir()
        .context("create work dir")?;

    let installer = GemInstaller::new(limits);
    let builder = XcodebuildArchiver::new(work_dir.path(), limits);
    let remediator = PlanRemediator::new(HomePathResolver, limits);
    let exporter = OutputExporter::new(work_dir.path());
    let deps = StepCollaborators {
        installer: &installer,
        builder: &builder,
        remediator: &remediator,
        sleeper: &ThreadSleeper,
        exporter: &exporter,
    };

    let outcome = run_step(&config, &deps)?;
    Ok(outcome.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_defaults() {
        let cli = Cli::parse_from(["archiver", "init"]);
        match cli.command {
            Command::Init { config, force } => {
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_PATH));
                assert!(!force);
            }
            Command::Run { .. } => panic!("expected init"),
        }
    }

    #[test]
    fn parse_run_overrides() {
        let cli = Cli::parse_from([
            "archiver",
            "run",
            "--config",
            "ci/archive.toml",
            "--scheme",
            "App",
            "--max-retry-count",
            "-1",
            "--log-formatter",
            "xcpretty",
        ]);
        let Command::Run { config, overrides } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(config, PathBuf::from("ci/archive.toml"));
        assert_eq!(overrides.scheme.as_deref(), Some("App"));
        assert_eq!(overrides.max_retry_count, Some(-1));
        assert_eq!(overrides.log_formatter, Some(FormatterArg::Xcpretty));
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut config = StepConfig::default();
        config.build.scheme = "FromFile".to_string();
        config.build.configuration = "Debug".to_string();

        BuildOverrides {
            configuration: Some("Release".to_string()),
            log_formatter: Some(FormatterArg::Xcpretty),
            ..BuildOverrides::default()
        }
        .apply(&mut config);

        assert_eq!(config.build.scheme, "FromFile");
        assert_eq!(config.build.configuration, "Release");
        assert_eq!(config.build.log_formatter, LogFormatter::Xcpretty);
    }
}
