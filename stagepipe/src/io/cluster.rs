//! Cluster scheduler boundary.
//!
//! The engine never tracks individual jobs. It submits commands wrapped in
//! the configured submit template and later asks the scheduler how many jobs
//! under a tag are still outstanding.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::template::{TemplateVars, render};
use crate::error::FatalError;
use crate::io::config::ClusterSettings;
use crate::io::process::{ProcessRunner, RunOptions};

/// Aggregate count of outstanding jobs per tag.
pub trait JobCounter {
    fn outstanding(&self, tag: &str) -> Result<u64>;
}

/// Counts jobs by running the configured count-query shell command.
pub struct ShellJobCounter<'a> {
    runner: &'a dyn ProcessRunner,
    query_template: String,
    workdir: Option<PathBuf>,
}

impl<'a> ShellJobCounter<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, settings: &ClusterSettings) -> Self {
        Self {
            runner,
            query_template: settings.count_query.clone(),
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl JobCounter for ShellJobCounter<'_> {
    #[instrument(skip(self))]
    fn outstanding(&self, tag: &str) -> Result<u64> {
        let query = render(&self.query_template, &TemplateVars::new().with("tag", tag))?;
        let opts = RunOptions {
            workdir: self.workdir.clone(),
            capture_stderr: false,
            ..RunOptions::default()
        };
        let output = self
            .runner
            .run(&query, &opts)
            .with_context(|| format!("run count query `{query}`"))?;
        if !output.success() {
            return Err(anyhow!(
                "count query `{query}` exited with {}",
                output.exit_code
            ));
        }
        let count = parse_count(&output.stdout)?;
        debug!(tag, count, "outstanding jobs");
        Ok(count)
    }
}

/// Parse count-query stdout (`wc -l` style, surrounding whitespace allowed).
pub fn parse_count(stdout: &str) -> Result<u64> {
    let trimmed = stdout.trim();
    trimmed
        .parse::<u64>()
        .with_context(|| format!("count query output {trimmed:?} is not a count"))
}

/// Wrap `command` in the cluster submit template.
pub fn submit_command(
    settings: &ClusterSettings,
    command: &str,
    vars: &TemplateVars,
) -> Result<String, FatalError> {
    let mut vars = vars.clone();
    vars.set("command", command);
    render(&settings.submit, &vars)
}
