//! I/O helpers for the archive step.

pub mod archiver;
pub mod config;
pub mod dependencies;
pub mod export;
pub mod paths;
pub mod process;
pub mod remediation;
