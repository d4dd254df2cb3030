//! Fan-out dispatch: one action invocation per target.
//!
//! Targets are dispatched sequentially in order. Local dispatches block on the
//! tool; cluster dispatches only submit, and every job shares the stage's tag
//! so a barrier postcondition can wait for the whole batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::context::{RunContext, resolve_path};
use crate::core::template::{TemplateVars, render};
use crate::core::types::DispatchMode;
use crate::error::FatalError;
use crate::io::cluster::submit_command;
use crate::io::inputs::{ensure_dir, find_input};
use crate::io::process::{RunOptions, RunOutput};

/// Per-target state handed to a dispatch.
pub struct DispatchContext<'a> {
    pub run: RunContext<'a>,
    pub stage: &'a str,
    /// Tag shared by every job of this fan-out.
    pub tag: &'a str,
    /// The target resolved against the pipeline workdir, made absolute.
    pub target_dir: PathBuf,
    /// Pipeline variables.
    pub vars: &'a BTreeMap<String, String>,
    /// Base options for local commands (workdir is the target directory).
    pub options: RunOptions,
    last_output: Option<RunOutput>,
}

impl<'a> DispatchContext<'a> {
    pub fn new(
        run: RunContext<'a>,
        stage: &'a str,
        tag: &'a str,
        workdir: Option<&Path>,
        target: &str,
        vars: &'a BTreeMap<String, String>,
        options: RunOptions,
    ) -> Self {
        let target_dir = resolve_path(workdir, target);
        let target_dir = std::path::absolute(&target_dir).unwrap_or(target_dir);
        let options = RunOptions {
            workdir: Some(target_dir.clone()),
            ..options
        };
        Self {
            run,
            stage,
            tag,
            target_dir,
            vars,
            options,
            last_output: None,
        }
    }

    /// Pipeline vars plus `target`, `target_dir`, `tag` and `stage`.
    pub fn template_vars(&self, target: &str) -> TemplateVars {
        TemplateVars::from_strings(self.vars)
            .with("target", target)
            .with("target_dir", self.target_dir.display().to_string())
            .with("tag", self.tag)
            .with("stage", self.stage)
    }

    /// Run `command` locally in the target directory and wait for it.
    pub fn run_local(&mut self, command: &str) -> Result<i32> {
        if self.options.echo_command {
            self.run.log.command(command);
        }
        let output = self
            .run
            .runner
            .run(command, &self.options)
            .with_context(|| format!("run `{command}`"))?;
        Ok(self.record(output))
    }

    /// Submit `command` to the cluster under this fan-out's tag.
    ///
    /// The returned code is the submit CLI's, so it reports whether the
    /// scheduler accepted the job. With `cluster.detach` it is always 0.
    pub fn submit(&mut self, command: &str, vars: &TemplateVars) -> Result<i32> {
        let mut vars = vars.clone();
        vars.set("tag", self.tag);
        let submit = submit_command(&self.run.settings.cluster, command, &vars)?;
        if self.options.echo_command {
            self.run.log.command(&submit);
        }
        let opts = if self.run.settings.cluster.detach {
            self.options.clone().detach()
        } else {
            self.options.clone()
        };
        let output = self
            .run
            .runner
            .run(&submit, &opts)
            .with_context(|| format!("submit `{submit}`"))?;
        Ok(self.record(output))
    }

    /// Output of the most recent command, if any was run since the last call.
    pub fn take_output(&mut self) -> Option<RunOutput> {
        self.last_output.take()
    }

    fn record(&mut self, output: RunOutput) -> i32 {
        let code = output.exit_code;
        self.last_output = Some(output);
        code
    }
}

/// Performs one dispatch for one target and returns its exit code.
///
/// An `Err` that wraps a [`FatalError`] keeps its kind; any other error is
/// an action failure.
pub trait TargetDispatch {
    fn dispatch(&self, target: &str, cx: &mut DispatchContext<'_>) -> Result<i32>;
}

/// Adapter for closure dispatches; see [`dispatch_fn`].
pub struct FnDispatch<F>(F);

impl<F> TargetDispatch for FnDispatch<F>
where
    F: Fn(&str, &mut DispatchContext<'_>) -> Result<i32>,
{
    fn dispatch(&self, target: &str, cx: &mut DispatchContext<'_>) -> Result<i32> {
        (self.0)(target, cx)
    }
}

/// Wrap a closure as a [`TargetDispatch`].
pub fn dispatch_fn<F>(f: F) -> FnDispatch<F>
where
    F: Fn(&str, &mut DispatchContext<'_>) -> Result<i32>,
{
    FnDispatch(f)
}

/// Renders a command template per target.
///
/// Templates see the pipeline vars, `target`, `target_dir`, `tag`, `stage`,
/// `outdir` (when configured) and `inputs.<name>` for each located input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateDispatch {
    pub command: String,
    #[serde(default)]
    pub mode: DispatchMode,
    /// Input name to file name, searched for under the target directory.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Directory created under each target before dispatch.
    #[serde(default)]
    pub outdir: Option<String>,
}

impl TemplateDispatch {
    pub fn new(command: impl Into<String>, mode: DispatchMode) -> Self {
        Self {
            command: command.into(),
            mode,
            inputs: BTreeMap::new(),
            outdir: None,
        }
    }

    pub fn with_input(mut self, name: &str, file_name: &str) -> Self {
        self.inputs.insert(name.to_string(), file_name.to_string());
        self
    }

    pub fn with_outdir(mut self, outdir: &str) -> Self {
        self.outdir = Some(outdir.to_string());
        self
    }
}

impl TargetDispatch for TemplateDispatch {
    #[instrument(skip_all, fields(target_id = %target, mode = ?self.mode))]
    fn dispatch(&self, target: &str, cx: &mut DispatchContext<'_>) -> Result<i32> {
        let mut vars = cx.template_vars(target);

        let mut located = BTreeMap::new();
        for (name, file_name) in &self.inputs {
            let path = find_input(&cx.target_dir, file_name).ok_or_else(|| {
                FatalError::missing_input(format!(
                    "target '{target}': no {file_name} under {}",
                    cx.target_dir.display()
                ))
            })?;
            debug!(input = %name, path = %path.display(), "located input");
            located.insert(name.clone(), path.display().to_string());
        }
        vars.set_value("inputs", &located);

        if let Some(outdir) = &self.outdir {
            let dir = cx.target_dir.join(render(outdir, &vars)?);
            ensure_dir(&dir)?;
            vars.set("outdir", dir.display().to_string());
        }

        let command = render(&self.command, &vars)?;
        match self.mode {
            DispatchMode::Local => cx.run_local(&command),
            DispatchMode::Cluster => cx.submit(&command, &vars),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalKind;
    use crate::test_support::{Harness, ScriptedCounter, ScriptedRunner};
    use std::fs;

    fn dispatch_cx<'a>(
        harness: &'a Harness,
        workdir: &Path,
        target: &str,
        vars: &'a BTreeMap<String, String>,
    ) -> DispatchContext<'a> {
        DispatchContext::new(
            harness.ctx(),
            "bet",
            "bet",
            Some(workdir),
            target,
            vars,
            RunOptions::default(),
        )
    }

    #[test]
    fn local_dispatch_renders_inputs_and_runs_in_target_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let subject = temp.path().join("subj01/dicom");
        fs::create_dir_all(&subject).expect("mkdir");
        fs::write(subject.join("b0.nii"), b"").expect("write");
        let harness = Harness::new();
        let vars = BTreeMap::from([("frac".to_string(), "0.3".to_string())]);
        let mut cx = dispatch_cx(&harness, temp.path(), "subj01", &vars);

        let dispatch =
            TemplateDispatch::new("bet {{ inputs.b0 }} -f {{ frac }}", DispatchMode::Local)
                .with_input("b0", "b0.nii");
        let code = dispatch.dispatch("subj01", &mut cx).expect("dispatch");

        assert_eq!(code, 0);
        assert_eq!(
            harness.runner.commands(),
            vec![format!("bet {} -f 0.3", subject.join("b0.nii").display())]
        );
        let opts = &harness.runner.options()[0];
        assert!(opts.wait);
        assert_eq!(opts.workdir.as_deref(), Some(temp.path().join("subj01").as_path()));
        assert!(cx.take_output().is_some());
    }

    #[test]
    fn missing_input_is_classified() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("subj01")).expect("mkdir");
        let harness = Harness::new();
        let vars = BTreeMap::new();
        let mut cx = dispatch_cx(&harness, temp.path(), "subj01", &vars);

        let dispatch = TemplateDispatch::new("bet {{ inputs.b0 }}", DispatchMode::Local)
            .with_input("b0", "b0.nii");
        let err = dispatch.dispatch("subj01", &mut cx).unwrap_err();

        let fatal = FatalError::classify(err, FatalKind::ActionFailure);
        assert_eq!(fatal.kind, FatalKind::MissingInput);
        assert!(harness.runner.commands().is_empty());
    }

    #[test]
    fn cluster_dispatch_wraps_and_waits_for_submit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let harness = Harness::with_parts(
            ScriptedRunner::default().fail_when("mosbatch", 4),
            ScriptedCounter::default(),
        );
        let vars = BTreeMap::new();
        let mut cx = dispatch_cx(&harness, temp.path(), "subj02", &vars);

        let code = TemplateDispatch::new("bet.py --subject {{ target }}", DispatchMode::Cluster)
            .dispatch("subj02", &mut cx)
            .expect("dispatch");

        assert_eq!(code, 4);
        assert_eq!(
            harness.runner.commands(),
            vec!["mosbatch -q -Jbet bet.py --subject subj02"]
        );
        assert!(harness.runner.options()[0].wait);
    }

    #[test]
    fn cluster_dispatch_detaches_when_configured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut harness = Harness::new();
        harness.settings.cluster.detach = true;
        let vars = BTreeMap::new();
        let mut cx = dispatch_cx(&harness, temp.path(), "subj02", &vars);

        TemplateDispatch::new("bet.py", DispatchMode::Cluster)
            .dispatch("subj02", &mut cx)
            .expect("dispatch");

        let opts = &harness.runner.options()[0];
        assert!(!opts.wait);
        assert!(!opts.capture_stdout);
    }

    #[test]
    fn outdir_is_created_per_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let harness = Harness::new();
        let vars = BTreeMap::new();
        let mut cx = dispatch_cx(&harness, temp.path(), "subj03", &vars);

        TemplateDispatch::new("coreg -o {{ outdir }}", DispatchMode::Local)
            .with_outdir("{{ stage }}-out")
            .dispatch("subj03", &mut cx)
            .expect("dispatch");

        let outdir = temp.path().join("subj03/bet-out");
        assert!(outdir.is_dir());
        assert_eq!(
            harness.runner.commands(),
            vec![format!("coreg -o {}", outdir.display())]
        );
    }

    #[test]
    fn closures_dispatch_through_context() {
        let temp = tempfile::tempdir().expect("tempdir");
        let harness = Harness::new();
        let vars = BTreeMap::new();
        let mut cx = dispatch_cx(&harness, temp.path(), "subj04", &vars);

        let dispatch = dispatch_fn(|target: &str, cx: &mut DispatchContext<'_>| {
            cx.run_local(&format!("echo {target}"))
        });
        assert_eq!(dispatch.dispatch("subj04", &mut cx).expect("dispatch"), 0);
        assert_eq!(harness.runner.commands(), vec!["echo subj04"]);
    }
}
