//! Stable exit codes for archiver CLI commands.

/// The final archive attempt succeeded and outputs were exported.
pub const OK: i32 = 0;
/// Every attempt failed, export failed, or the step could not start
/// (invalid config, fatal dependency error).
pub const FAILED: i32 = 1;
