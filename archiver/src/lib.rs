//! Retrying archive step for iOS projects.
//!
//! Runs `xcodebuild archive` + `-exportArchive`, and when an attempt fails,
//! cleans up the state that usually causes flaky failures (build products,
//! Xcode and SwiftPM caches, DerivedData, the generated project) before trying
//! again with the dependency cache disabled.
//!
//! - **[`core`]**: Pure, deterministic logic (configuration, per-attempt
//!   derivation, outcome reconciliation). No I/O.
//! - **[`io`]**: Side-effecting operations (processes, filesystem, config).
//!   Behind traits so tests can script them.
//!
//! [`retry`] drives the attempt loop; [`step`] wraps it with the dependency and
//! export phases that run once per invocation.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod retry;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
