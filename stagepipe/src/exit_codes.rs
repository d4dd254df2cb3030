//! Stable exit codes for the `stagepipe` binary.
//!
//! Fatal pipeline errors map onto a fixed code per kind. Log-scraping tooling
//! keys on these values, so they must never be renumbered.

/// Pipeline completed (non-fatal stage failures included).
pub const OK: i32 = 0;
/// Failure outside the fatal taxonomy (unreadable definition, bad CLI input, I/O).
pub const INVALID: i32 = 1;
/// A required input file is absent.
pub const MISSING_INPUT: i32 = 10;
/// A required environment variable or executable is absent.
pub const MISSING_ENVIRONMENT: i32 = 11;
/// A stage or predicate was wired incorrectly.
pub const CONFIGURATION_ERROR: i32 = 12;
/// A target directory does not exist.
pub const INVALID_TARGET: i32 = 13;
/// A stage's external process exited non-zero.
pub const ACTION_FAILURE: i32 = 30;
/// A postcondition evaluated false after the action completed.
pub const POSTCONDITION_UNSATISFIABLE: i32 = 31;
