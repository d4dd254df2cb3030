//! Stages: a named action guarded by preconditions and postconditions.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;

use crate::core::types::StageState;
use crate::error::FatalError;
use crate::fanout::{DispatchContext, TargetDispatch, dispatch_fn};
use crate::predicate::Predicate;

/// What a stage does when it runs.
pub enum Action {
    /// One shell command template, run once.
    Command(String),
    /// One dispatch per target.
    FanOut(FanOut),
}

pub struct FanOut {
    /// Cluster tag; the stage name when unset.
    pub tag: Option<String>,
    /// Stage-specific targets; the pipeline's targets when unset.
    pub targets: Option<Vec<String>>,
    pub dispatch: Box<dyn TargetDispatch>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Command(command) => f.debug_tuple("Command").field(command).finish(),
            Action::FanOut(fan_out) => f
                .debug_struct("FanOut")
                .field("tag", &fan_out.tag)
                .field("targets", &fan_out.targets)
                .finish_non_exhaustive(),
        }
    }
}

/// A unit of work within a pipeline.
///
/// Built before the run, mutated only by the owning pipeline during its pass.
#[derive(Debug)]
pub struct Stage {
    name: String,
    can_run: bool,
    action: Action,
    preconditions: Vec<Predicate>,
    postconditions: Vec<Predicate>,
    fatal: Option<bool>,
    log_file: Option<PathBuf>,
    echo: Option<bool>,
    call_count: u32,
    exit_code: Option<i32>,
    state: StageState,
}

impl Stage {
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            can_run: false,
            action,
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            fatal: None,
            log_file: None,
            echo: None,
            call_count: 0,
            exit_code: None,
            state: StageState::Pending,
        }
    }

    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, Action::Command(command.into()))
    }

    pub fn fan_out(name: impl Into<String>, dispatch: impl TargetDispatch + 'static) -> Self {
        Self::new(
            name,
            Action::FanOut(FanOut {
                tag: None,
                targets: None,
                dispatch: Box::new(dispatch),
            }),
        )
    }

    /// Fan out with a closure dispatch.
    pub fn fan_out_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&str, &mut DispatchContext<'_>) -> Result<i32> + 'static,
    {
        Self::fan_out(name, dispatch_fn(f))
    }

    /// Override the fan-out tag. No effect on command stages.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        if let Action::FanOut(fan_out) = &mut self.action {
            fan_out.tag = Some(tag.into());
        }
        self
    }

    /// Fan out over these targets instead of the pipeline's.
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Action::FanOut(fan_out) = &mut self.action {
            fan_out.targets = Some(targets.into_iter().map(Into::into).collect());
        }
        self
    }

    pub fn precondition(mut self, predicate: Predicate) -> Self {
        self.preconditions.push(predicate);
        self
    }

    pub fn postcondition(mut self, predicate: Predicate) -> Self {
        self.postconditions.push(predicate);
        self
    }

    pub fn with_preconditions(mut self, predicates: Vec<Predicate>) -> Self {
        self.preconditions = predicates;
        self
    }

    pub fn with_postconditions(mut self, predicates: Vec<Predicate>) -> Self {
        self.postconditions = predicates;
        self
    }

    /// Use `upstream`'s postconditions as this stage's preconditions.
    pub fn preconditions_from(mut self, upstream: &Stage) -> Result<Self, FatalError> {
        if upstream.postconditions.is_empty() {
            return Err(FatalError::configuration(format!(
                "stage '{}' chains after '{}', which has no postconditions",
                self.name, upstream.name
            )));
        }
        self.preconditions = upstream.postconditions.clone();
        Ok(self)
    }

    /// Override the pipeline's fatal policy for this stage.
    pub fn fatal(mut self, fatal: bool) -> Self {
        self.fatal = Some(fatal);
        self
    }

    /// Append child output of this stage to `path`.
    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = Some(echo);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn can_run(&self) -> bool {
        self.can_run
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn preconditions(&self) -> &[Predicate] {
        &self.preconditions
    }

    pub fn postconditions(&self) -> &[Predicate] {
        &self.postconditions
    }

    /// Stage override, if any.
    pub fn fatal_override(&self) -> Option<bool> {
        self.fatal
    }

    pub fn log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref()
    }

    pub fn echo_override(&self) -> Option<bool> {
        self.echo
    }

    /// Number of action invocations in this pass.
    pub fn call_count(&self) -> u32 {
        self.call_count
    }

    /// Exit code of the last invocation.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Tag used for cluster jobs and barrier queries.
    pub fn tag(&self) -> &str {
        match &self.action {
            Action::FanOut(FanOut { tag: Some(tag), .. }) => tag,
            _ => &self.name,
        }
    }

    pub(crate) fn set_can_run(&mut self, can_run: bool) {
        self.can_run = can_run;
    }

    pub(crate) fn set_state(&mut self, state: StageState) {
        self.state = state;
    }

    pub(crate) fn record_call(&mut self, exit_code: i32) {
        self.call_count += 1;
        self.exit_code = Some(exit_code);
    }
}
