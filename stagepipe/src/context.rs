//! Explicit collaborators handed to every predicate and dispatch.
//!
//! Nothing in the engine reaches for a global: the runner, the cluster
//! counter, the clock, the environment and the log all arrive through
//! [`RunContext`].

use std::path::{Path, PathBuf};

use crate::io::barrier::{CancellationToken, Clock};
use crate::io::cluster::JobCounter;
use crate::io::config::Settings;
use crate::io::environment::Environment;
use crate::io::log_sink::LogSink;
use crate::io::process::ProcessRunner;

/// Collaborators for one pipeline run.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub runner: &'a dyn ProcessRunner,
    pub counter: &'a dyn JobCounter,
    pub clock: &'a dyn Clock,
    pub cancel: &'a CancellationToken,
    pub env: &'a dyn Environment,
    pub log: &'a dyn LogSink,
    pub settings: &'a Settings,
}

/// Resolve `path` against an optional working directory.
pub fn resolve_path(workdir: Option<&Path>, path: &str) -> PathBuf {
    let path = Path::new(path);
    match workdir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}
