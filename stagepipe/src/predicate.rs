//! Predicates: typed boolean checks guarding a stage's action.
//!
//! A predicate is evaluated lazily and has no side effect on pipeline state
//! besides logging. Stages chain by sharing predicate lists: when stage B's
//! preconditions equal stage A's postconditions, B cannot start before A's
//! outputs are in place.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::context::{RunContext, resolve_path};
use crate::core::template::{TemplateVars, render};
use crate::core::types::Phase;
use crate::error::{FatalError, FatalKind};
use crate::io::barrier::PollingBarrier;
use crate::stage::Stage;

/// Everything a check may look at.
#[derive(Clone, Copy)]
pub struct CheckContext<'a> {
    pub run: RunContext<'a>,
    /// All stages of the running pipeline, for exit-code lookups.
    pub stages: &'a [Stage],
    /// Base directory for relative paths.
    pub workdir: Option<&'a Path>,
}

impl<'a> CheckContext<'a> {
    pub fn stage(&self, name: &str) -> Option<&'a Stage> {
        self.stages.iter().find(|stage| stage.name() == name)
    }
}

/// One kind of check.
///
/// `Ok(false)` means "not satisfied"; `Err` is reserved for checks that are
/// wired incorrectly and always halts the pipeline.
pub trait Check: fmt::Debug {
    fn check(&self, cx: &CheckContext<'_>) -> Result<bool, FatalError>;

    /// Short human description used in failure details.
    fn describe(&self) -> String;

    /// Error kind reported when this check fails as a precondition.
    fn precondition_kind(&self) -> FatalKind {
        FatalKind::PostconditionUnsatisfiable
    }
}

/// All listed paths exist.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesExist {
    pub paths: Vec<String>,
}

/// A stage's last exit code equals `expect`.
///
/// A stage that has not run holds trivially, so skipping a producer does not
/// block its consumers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExitCode {
    pub stage: String,
    #[serde(default)]
    pub expect: i32,
}

/// Outstanding cluster jobs under `tag` reach `target`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Barrier {
    pub tag: String,
    #[serde(default)]
    pub target: u64,
    /// Poll interval; the configured default when unset.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

/// Environment variables are set and executables are on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Env {
    #[serde(default)]
    pub vars: Vec<String>,
    #[serde(default)]
    pub executables: Vec<String>,
}

impl Check for FilesExist {
    fn check(&self, cx: &CheckContext<'_>) -> Result<bool, FatalError> {
        let mut all = true;
        for path in &self.paths {
            let exists = resolve_path(cx.workdir, path).exists();
            cx.run.log.check(
                &format!("Checking on {path}..."),
                if exists { "ok" } else { "not found" },
            );
            all &= exists;
        }
        Ok(all)
    }

    fn describe(&self) -> String {
        format!("files exist [{}]", self.paths.join(", "))
    }

    fn precondition_kind(&self) -> FatalKind {
        FatalKind::MissingInput
    }
}

impl Check for ExitCode {
    fn check(&self, cx: &CheckContext<'_>) -> Result<bool, FatalError> {
        let stage = cx.stage(&self.stage).ok_or_else(|| {
            FatalError::configuration(format!(
                "exit code check names unknown stage '{}'",
                self.stage
            ))
        })?;
        let holds = stage.call_count() == 0 || stage.exit_code() == Some(self.expect);
        let status = match stage.exit_code() {
            Some(code) => code.to_string(),
            None => "not run".to_string(),
        };
        cx.run
            .log
            .check(&format!("Checking exit code of '{}'...", self.stage), &status);
        Ok(holds)
    }

    fn describe(&self) -> String {
        format!("exit code of '{}' is {}", self.stage, self.expect)
    }
}

impl Check for Barrier {
    #[instrument(skip_all, fields(tag = %self.tag, target = self.target))]
    fn check(&self, cx: &CheckContext<'_>) -> Result<bool, FatalError> {
        let interval = self
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| cx.run.settings.poll_interval());
        let barrier = PollingBarrier::new(cx.run.clock, cx.run.cancel, cx.run.log);
        let outcome = barrier.block_until(
            || cx.run.counter.outstanding(&self.tag),
            self.target,
            interval,
            &self.tag,
        );
        debug!(?outcome, "barrier finished");
        cx.run.log.check(
            &format!("Waiting on '{}' jobs...", self.tag),
            if outcome.is_satisfied() { "done" } else { "cancelled" },
        );
        Ok(outcome.is_satisfied())
    }

    fn describe(&self) -> String {
        format!("outstanding '{}' jobs reach {}", self.tag, self.target)
    }
}

impl Check for Env {
    fn check(&self, cx: &CheckContext<'_>) -> Result<bool, FatalError> {
        let mut all = true;
        for var in &self.vars {
            let set = cx.run.env.var(var).is_some();
            cx.run
                .log
                .check(&format!("Checking on ${var}..."), if set { "ok" } else { "unset" });
            all &= set;
        }
        for exe in &self.executables {
            let found = cx.run.env.executable(exe).is_some();
            cx.run.log.check(
                &format!("Checking for {exe}..."),
                if found { "ok" } else { "not found" },
            );
            all &= found;
        }
        Ok(all)
    }

    fn describe(&self) -> String {
        let mut parts: Vec<String> = self.vars.iter().map(|var| format!("${var}")).collect();
        parts.extend(self.executables.iter().cloned());
        format!("environment provides [{}]", parts.join(", "))
    }

    fn precondition_kind(&self) -> FatalKind {
        FatalKind::MissingEnvironment
    }
}

/// A caller-supplied check. Equality is identity.
#[derive(Clone)]
pub struct CustomCheck(pub Arc<dyn Check>);

impl fmt::Debug for CustomCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for CustomCheck {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for CustomCheck {}

/// A predicate binding: the check kind plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    FilesExist(FilesExist),
    ExitCode(ExitCode),
    Barrier(Barrier),
    Env(Env),
    #[serde(skip)]
    Custom(CustomCheck),
}

impl Predicate {
    pub fn files_exist<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::FilesExist(FilesExist {
            paths: paths.into_iter().map(Into::into).collect(),
        })
    }

    pub fn exit_code(stage: &str, expect: i32) -> Self {
        Predicate::ExitCode(ExitCode {
            stage: stage.to_string(),
            expect,
        })
    }

    pub fn barrier(tag: &str, target: u64) -> Self {
        Predicate::Barrier(Barrier {
            tag: tag.to_string(),
            target,
            interval_secs: None,
        })
    }

    pub fn env_vars<I, S>(vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::Env(Env {
            vars: vars.into_iter().map(Into::into).collect(),
            executables: Vec::new(),
        })
    }

    pub fn custom(check: impl Check + 'static) -> Self {
        Predicate::Custom(CustomCheck(Arc::new(check)))
    }

    fn as_check(&self) -> &dyn Check {
        match self {
            Predicate::FilesExist(args) => args,
            Predicate::ExitCode(args) => args,
            Predicate::Barrier(args) => args,
            Predicate::Env(args) => args,
            Predicate::Custom(custom) => custom.0.as_ref(),
        }
    }

    pub fn check(&self, cx: &CheckContext<'_>) -> Result<bool, FatalError> {
        self.as_check().check(cx)
    }

    pub fn describe(&self) -> String {
        self.as_check().describe()
    }

    /// Error kind reported when this predicate fails in `phase`.
    pub fn failure_kind(&self, phase: Phase) -> FatalKind {
        match phase {
            Phase::Pre => self.as_check().precondition_kind(),
            Phase::Post => FatalKind::PostconditionUnsatisfiable,
        }
    }

    /// Substitute pipeline variables into every string argument.
    pub fn render(&self, vars: &TemplateVars) -> Result<Predicate, FatalError> {
        let all = |items: &[String]| -> Result<Vec<String>, FatalError> {
            items.iter().map(|item| render(item, vars)).collect()
        };
        Ok(match self {
            Predicate::FilesExist(args) => Predicate::FilesExist(FilesExist {
                paths: all(&args.paths)?,
            }),
            Predicate::ExitCode(args) => Predicate::ExitCode(ExitCode {
                stage: render(&args.stage, vars)?,
                expect: args.expect,
            }),
            Predicate::Barrier(args) => Predicate::Barrier(Barrier {
                tag: render(&args.tag, vars)?,
                ..args.clone()
            }),
            Predicate::Env(args) => Predicate::Env(Env {
                vars: all(&args.vars)?,
                executables: all(&args.executables)?,
            }),
            Predicate::Custom(custom) => Predicate::Custom(custom.clone()),
        })
    }
}

/// Evaluate `predicates` in order, stopping at the first that does not hold.
///
/// The error names the stage, the phase and the failing predicate.
pub fn evaluate_all(
    predicates: &[Predicate],
    phase: Phase,
    stage: &str,
    cx: &CheckContext<'_>,
) -> Result<(), FatalError> {
    for predicate in predicates {
        if !predicate.check(cx)? {
            return Err(FatalError::new(
                predicate.failure_kind(phase),
                format!(
                    "stage '{stage}' {} failed: {}",
                    phase.as_str(),
                    predicate.describe()
                ),
            ));
        }
    }
    Ok(())
}
