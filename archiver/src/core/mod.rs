//! Deterministic, pure logic shared by the archive step.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod attempt;
pub mod summary;
pub mod types;
