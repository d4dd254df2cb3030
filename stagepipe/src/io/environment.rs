//! Environment lookups used by environment predicates and initialization.

use std::path::PathBuf;

/// Source of environment variables and executables.
pub trait Environment {
    /// Value of a variable, `None` when unset or empty.
    fn var(&self, key: &str) -> Option<String>;

    /// Resolved path of an executable on `PATH`.
    fn executable(&self, name: &str) -> Option<PathBuf>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|value| !value.is_empty())
    }

    fn executable(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}
