//! Run report storage.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::StageState;
use crate::error::FatalKind;

/// Outcome of one pipeline pass (`--report <path>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub pipeline: String,
    /// One entry per stage in declaration order, including skipped stages.
    pub stages: Vec<StageReport>,
    /// Kind of the fatal error that aborted the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<FatalKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageReport {
    pub index: usize,
    pub name: String,
    pub state: StageState,
    pub call_count: u32,
    /// Exit code of the last invocation; absent when the action never ran.
    pub exit_code: Option<i32>,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

/// Load a run report from disk.
pub fn load_report(path: &Path) -> Result<RunReport> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run report {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse run report {}", path.display()))
}

/// Atomically write a run report to disk (temp file + rename).
pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    debug!(path = %path.display(), pipeline = %report.pipeline, "writing run report");
    let mut buf = serde_json::to_string_pretty(report).context("serialize run report")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run report path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp run report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run report {}", path.display()))?;
    Ok(())
}
