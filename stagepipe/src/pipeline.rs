//! The pipeline: ordered stages, stage selection and the fatal-error policy.
//!
//! One pass walks the stages in declaration order. For each selected stage it
//! checks preconditions, runs the action (once, or once per target), then
//! checks postconditions, which may block on a polling barrier. A failure on a
//! fatal stage aborts the pass with a classified [`FatalError`]; on a
//! non-fatal stage it is logged and the stage is left behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::context::{RunContext, resolve_path};
use crate::core::format::Pad;
use crate::core::selection::resolve_selection;
use crate::core::template::{TemplateVars, render};
use crate::core::types::{Phase, StageState};
use crate::error::{FatalError, FatalKind};
use crate::fanout::DispatchContext;
use crate::io::log_sink::{CHILD_OUTPUT, DETAIL};
use crate::io::process::{RunOptions, RunOutput};
use crate::io::report_store::{RunReport, StageReport};
use crate::predicate::{CheckContext, evaluate_all};
use crate::stage::{Action, Stage};

/// How a stage's action ended.
enum ActionOutcome {
    Succeeded,
    /// Non-fatal failure; the stage is left `Failed`.
    Failed,
}

#[derive(Debug)]
pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    fatal_on_failure: bool,
    workdir: Option<PathBuf>,
    vars: BTreeMap<String, String>,
    targets: Vec<String>,
    required_env: Vec<String>,
    required_executables: Vec<String>,
    fatal: Option<FatalKind>,
    ran: bool,
}

impl Pipeline {
    /// An empty pipeline. Failures are fatal unless configured otherwise.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            fatal_on_failure: true,
            workdir: None,
            vars: BTreeMap::new(),
            targets: Vec::new(),
            required_env: Vec::new(),
            required_executables: Vec::new(),
            fatal: None,
            ran: false,
        }
    }

    pub fn with_fatal_on_failure(mut self, fatal: bool) -> Self {
        self.fatal_on_failure = fatal;
        self
    }

    /// Resolve relative paths in predicates and targets against `dir`, and
    /// run command stages there.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.vars.extend(vars);
        self
    }

    pub fn set_targets<I, S>(&mut self, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_targets(targets);
        self
    }

    pub fn require_env(mut self, var: impl Into<String>) -> Self {
        self.required_env.push(var.into());
        self
    }

    pub fn require_executable(mut self, name: impl Into<String>) -> Self {
        self.required_executables.push(name.into());
        self
    }

    /// Append a stage. Names must be unique.
    pub fn add_stage(&mut self, stage: Stage) -> Result<(), FatalError> {
        if self.stage(stage.name()).is_some() {
            return Err(FatalError::configuration(format!(
                "pipeline '{}' already has a stage named '{}'",
                self.name,
                stage.name()
            )));
        }
        self.stages.push(stage);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.name() == name)
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Enable stages from a selection string (`"012"` or `"all"`).
    ///
    /// Replaces any earlier selection. Must happen before [`Pipeline::run`].
    pub fn select(&mut self, selection: &str) -> Result<(), FatalError> {
        let runnable = resolve_selection(selection, self.stages.len())?;
        for (stage, can_run) in self.stages.iter_mut().zip(runnable) {
            stage.set_can_run(can_run);
        }
        Ok(())
    }

    /// Check required environment and target directories before any stage.
    #[instrument(skip_all, fields(pipeline = %self.name))]
    pub fn initialize(&self, cx: &RunContext<'_>) -> Result<(), FatalError> {
        cx.log.line(&format!("INIT: {}", self.name));

        for var in &self.required_env {
            let set = cx.env.var(var).is_some();
            cx.log
                .check(&format!("Checking on ${var}..."), if set { "ok" } else { "unset" });
            if !set {
                return Err(FatalError::missing_environment(format!(
                    "environment variable '{var}' is not set"
                )));
            }
        }
        for exe in &self.required_executables {
            let found = cx.env.executable(exe).is_some();
            cx.log.check(
                &format!("Checking for {exe}..."),
                if found { "ok" } else { "not found" },
            );
            if !found {
                return Err(FatalError::missing_environment(format!(
                    "executable '{exe}' not found on PATH"
                )));
            }
        }
        for target in self.all_targets() {
            let dir = resolve_path(self.workdir(), target);
            let exists = dir.is_dir();
            cx.log.check(
                &format!("Checking on target {target}..."),
                if exists { "ok" } else { "not found" },
            );
            if !exists {
                return Err(FatalError::invalid_target(dir.display().to_string()));
            }
        }
        Ok(())
    }

    /// Execute one pass over the stages.
    ///
    /// Returns the report on success. After a fatal abort the partial state
    /// remains available through [`Pipeline::report`].
    #[instrument(skip_all, fields(pipeline = %self.name))]
    pub fn run(&mut self, cx: &RunContext<'_>) -> Result<RunReport, FatalError> {
        if self.ran {
            return Err(FatalError::configuration(format!(
                "pipeline '{}' has already run",
                self.name
            )));
        }
        self.ran = true;

        for index in 0..self.stages.len() {
            if let Err(err) = self.run_stage(index, cx) {
                warn!(stage = %self.stages[index].name(), kind = err.kind.as_str(), "fatal");
                self.fatal = Some(err.kind);
                return Err(err);
            }
        }
        info!("pipeline complete");
        Ok(self.report())
    }

    /// Per-stage outcome of the current pass.
    pub fn report(&self) -> RunReport {
        RunReport {
            pipeline: self.name.clone(),
            stages: self
                .stages
                .iter()
                .enumerate()
                .map(|(index, stage)| StageReport {
                    index,
                    name: stage.name().to_string(),
                    state: stage.state(),
                    call_count: stage.call_count(),
                    exit_code: stage.exit_code(),
                })
                .collect(),
            fatal: self.fatal,
        }
    }

    #[instrument(skip_all, fields(stage = %self.stages[index].name()))]
    fn run_stage(&mut self, index: usize, cx: &RunContext<'_>) -> Result<(), FatalError> {
        let stage = &self.stages[index];
        let name = stage.name().to_string();
        if !stage.can_run() {
            cx.log
                .log(DETAIL, &format!("Skipping stage {index}: {name}\n"), Pad::NONE);
            self.stages[index].set_state(StageState::Skipped);
            return Ok(());
        }
        let fatal = stage.fatal_override().unwrap_or(self.fatal_on_failure);
        cx.log.line(&format!("STAGE {index}: {name}"));

        let checked = evaluate_all(stage.preconditions(), Phase::Pre, &name, &self.check_cx(cx));
        if let Err(err) = checked {
            self.stages[index].set_state(StageState::PreconditionFailed);
            if fatal || err.kind == FatalKind::ConfigurationError {
                return Err(err);
            }
            warn!(detail = %err.detail, "precondition failed, skipping stage");
            cx.log.line(&format!("WARNING: {err}; skipping"));
            return Ok(());
        }

        self.stages[index].set_state(StageState::Running);
        match self.run_action(index, fatal, cx) {
            Ok(ActionOutcome::Succeeded) => {}
            Ok(ActionOutcome::Failed) => {
                self.stages[index].set_state(StageState::Failed);
                return Ok(());
            }
            Err(err) => {
                self.stages[index].set_state(StageState::Failed);
                return Err(err);
            }
        }

        self.stages[index].set_state(StageState::PostconditionPending);
        let stage = &self.stages[index];
        let checked = evaluate_all(stage.postconditions(), Phase::Post, &name, &self.check_cx(cx));
        if let Err(err) = checked {
            self.stages[index].set_state(StageState::Failed);
            if fatal || err.kind == FatalKind::ConfigurationError {
                return Err(err);
            }
            warn!(detail = %err.detail, "postcondition failed");
            cx.log.line(&format!("WARNING: {err}"));
            return Ok(());
        }

        self.stages[index].set_state(StageState::Complete);
        cx.log
            .log(DETAIL, &format!("Stage {index} complete: {name}\n"), Pad::NONE);
        Ok(())
    }

    fn check_cx<'a>(&'a self, cx: &RunContext<'a>) -> CheckContext<'a> {
        CheckContext {
            run: *cx,
            stages: &self.stages,
            workdir: self.workdir(),
        }
    }

    /// Run the action and record every invocation on the stage.
    fn run_action(
        &mut self,
        index: usize,
        fatal: bool,
        cx: &RunContext<'_>,
    ) -> Result<ActionOutcome, FatalError> {
        let (codes, outcome) = self.invoke(index, fatal, cx);
        for code in codes {
            self.stages[index].record_call(code);
        }
        outcome
    }

    /// Invoke the action, returning the exit code of each invocation that
    /// happened alongside the outcome.
    fn invoke(
        &self,
        index: usize,
        fatal: bool,
        cx: &RunContext<'_>,
    ) -> (Vec<i32>, Result<ActionOutcome, FatalError>) {
        let stage = &self.stages[index];
        let name = stage.name();
        let opts = self.run_options(stage, cx);
        let mut codes = Vec::new();
        let mut outcome = ActionOutcome::Succeeded;

        match stage.action() {
            Action::Command(template) => {
                let vars = TemplateVars::from_strings(&self.vars).with("stage", name);
                let command = match render(template, &vars) {
                    Ok(command) => command,
                    Err(err) => return (codes, Err(with_stage(err, name))),
                };
                if opts.echo_command {
                    cx.log.command(&command);
                }
                let output = match cx.runner.run(&command, &opts) {
                    Ok(output) => output,
                    Err(err) => {
                        let err = FatalError::classify(err, FatalKind::ActionFailure);
                        let err = with_stage(err, name);
                        if halts(&err, fatal) {
                            return (codes, Err(err));
                        }
                        warn!(detail = %err.detail, "command could not run");
                        cx.log.line(&format!("WARNING: {err}"));
                        return (codes, Ok(ActionOutcome::Failed));
                    }
                };
                post_output(cx, name, &output);
                codes.push(output.exit_code);
                if !output.success() {
                    let err = action_failure(name, &command, &output);
                    if fatal {
                        return (codes, Err(err));
                    }
                    warn!(code = output.exit_code, "command failed");
                    cx.log.line(&format!("WARNING: {err}"));
                    outcome = ActionOutcome::Failed;
                }
            }
            Action::FanOut(fan_out) => {
                let targets = fan_out.targets.as_deref().unwrap_or(&self.targets);
                if targets.is_empty() {
                    warn!("fan-out stage has no targets");
                }
                let tag = stage.tag();
                for target in targets {
                    cx.log
                        .log(DETAIL, &format!("Dispatching {target} ({tag})\n"), Pad::NONE);
                    let mut dcx = DispatchContext::new(
                        *cx,
                        name,
                        tag,
                        self.workdir(),
                        target,
                        &self.vars,
                        opts.clone(),
                    );
                    let result = fan_out.dispatch.dispatch(target, &mut dcx);
                    if let Some(output) = dcx.take_output() {
                        post_output(cx, name, &output);
                    }
                    let code = match result {
                        Ok(code) => code,
                        Err(err) => {
                            let err = FatalError::classify(err, FatalKind::ActionFailure);
                            let err = with_stage(err, name);
                            if halts(&err, fatal) {
                                return (codes, Err(err));
                            }
                            warn!(target_id = %target, detail = %err.detail, "dispatch failed");
                            cx.log.line(&format!("WARNING: {err}"));
                            outcome = ActionOutcome::Failed;
                            continue;
                        }
                    };
                    codes.push(code);
                    if code != 0 {
                        let err = FatalError::action_failure(format!(
                            "stage '{name}': target '{target}' exited with {code}"
                        ));
                        if fatal {
                            return (codes, Err(err));
                        }
                        warn!(target_id = %target, code, "dispatch failed");
                        cx.log.line(&format!("WARNING: {err}"));
                        outcome = ActionOutcome::Failed;
                    }
                }
            }
        }
        (codes, Ok(outcome))
    }

    fn run_options(&self, stage: &Stage, cx: &RunContext<'_>) -> RunOptions {
        RunOptions {
            echo_command: stage.echo_override().unwrap_or(cx.settings.echo_commands),
            workdir: self.workdir.clone(),
            stream_path: stage
                .log_file()
                .map(|path| resolve_path(self.workdir(), &path.to_string_lossy())),
            timeout: cx.settings.command_timeout(),
            output_limit_bytes: cx.settings.output_limit_bytes,
            ..RunOptions::default()
        }
    }

    fn all_targets(&self) -> impl Iterator<Item = &String> {
        let own = self.targets.iter();
        let staged = self.stages.iter().filter_map(|stage| match stage.action() {
            Action::FanOut(fan_out) => fan_out.targets.as_ref(),
            Action::Command(_) => None,
        });
        own.chain(staged.flatten())
    }
}

/// Whether `err` aborts the pass. Missing inputs and configuration errors
/// halt even on non-fatal stages.
fn halts(err: &FatalError, fatal: bool) -> bool {
    fatal || matches!(err.kind, FatalKind::MissingInput | FatalKind::ConfigurationError)
}

fn with_stage(err: FatalError, stage: &str) -> FatalError {
    if err.detail.contains(&format!("stage '{stage}'")) {
        return err;
    }
    FatalError::new(err.kind, format!("stage '{stage}': {}", err.detail))
}

fn action_failure(stage: &str, command: &str, output: &RunOutput) -> FatalError {
    let mut detail = if output.timed_out {
        format!("stage '{stage}': `{command}` timed out")
    } else {
        format!("stage '{stage}': `{command}` exited with {}", output.exit_code)
    };
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        detail.push('\n');
        detail.push_str(stderr);
    }
    FatalError::action_failure(detail)
}

/// Post captured child output to the pipeline log.
fn post_output(cx: &RunContext<'_>, stage: &str, output: &RunOutput) {
    if output.detached {
        return;
    }
    if cx.settings.post_stdout && !output.stdout.is_empty() {
        cx.log.log(CHILD_OUTPUT, &output.stdout, Pad::NONE);
        cx.log
            .log(CHILD_OUTPUT, &output.stdout_truncated_notice(stage), Pad::NONE);
    }
    if cx.settings.post_stderr && !output.stderr.is_empty() {
        cx.log.log(CHILD_OUTPUT, &output.stderr, Pad::NONE);
        cx.log
            .log(CHILD_OUTPUT, &output.stderr_truncated_notice(stage), Pad::NONE);
    }
}
