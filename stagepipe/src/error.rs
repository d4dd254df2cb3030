//! Classified fatal errors.
//!
//! Every condition that halts a pipeline is one of a fixed set of kinds, each
//! with a stable exit code and a two-part message (what the pipeline was doing,
//! what went wrong). The binary prints [`FatalError::render`] and exits with
//! [`FatalError::exit_code`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exit_codes;

/// Fatal error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    /// A required file is absent at a precondition check.
    MissingInput,
    /// A required environment variable or executable is absent.
    MissingEnvironment,
    /// A stage or predicate is wired incorrectly (programming defect).
    ConfigurationError,
    /// A named target directory does not exist.
    InvalidTarget,
    /// A stage's external process exited non-zero.
    ActionFailure,
    /// A postcondition evaluated false after the action completed.
    PostconditionUnsatisfiable,
}

impl FatalKind {
    pub fn exit_code(self) -> i32 {
        match self {
            FatalKind::MissingInput => exit_codes::MISSING_INPUT,
            FatalKind::MissingEnvironment => exit_codes::MISSING_ENVIRONMENT,
            FatalKind::ConfigurationError => exit_codes::CONFIGURATION_ERROR,
            FatalKind::InvalidTarget => exit_codes::INVALID_TARGET,
            FatalKind::ActionFailure => exit_codes::ACTION_FAILURE,
            FatalKind::PostconditionUnsatisfiable => exit_codes::POSTCONDITION_UNSATISFIABLE,
        }
    }

    /// What the pipeline was doing when the error was detected.
    pub fn action(self) -> &'static str {
        match self {
            FatalKind::MissingInput => "while checking on input files, ",
            FatalKind::MissingEnvironment => "examining environment, ",
            FatalKind::ConfigurationError => "querying a stage for its status, ",
            FatalKind::InvalidTarget => "examining the target directories, ",
            FatalKind::ActionFailure => "executing stage, ",
            FatalKind::PostconditionUnsatisfiable => "checking stage postconditions, ",
        }
    }

    /// What went wrong.
    pub fn error(self) -> &'static str {
        match self {
            FatalKind::MissingInput => "a required file could not be found.",
            FatalKind::MissingEnvironment => {
                "a required environment dependency is not available."
            }
            FatalKind::ConfigurationError => "the stage has not been fully specified.",
            FatalKind::InvalidTarget => "the directory does not exist.",
            FatalKind::ActionFailure => "an external error was detected.",
            FatalKind::PostconditionUnsatisfiable => {
                "the stage postconditions were not satisfied."
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FatalKind::MissingInput => "MissingInput",
            FatalKind::MissingEnvironment => "MissingEnvironment",
            FatalKind::ConfigurationError => "ConfigurationError",
            FatalKind::InvalidTarget => "InvalidTarget",
            FatalKind::ActionFailure => "ActionFailure",
            FatalKind::PostconditionUnsatisfiable => "PostconditionUnsatisfiable",
        }
    }
}

/// A classified error that halts the whole pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}: {}{} {detail}", .kind.as_str(), .kind.action(), .kind.error())]
pub struct FatalError {
    pub kind: FatalKind,
    /// Free-form context (stage name, offending path, captured stderr).
    pub detail: String,
}

impl FatalError {
    pub fn new(kind: FatalKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn missing_input(detail: impl Into<String>) -> Self {
        Self::new(FatalKind::MissingInput, detail)
    }

    pub fn missing_environment(detail: impl Into<String>) -> Self {
        Self::new(FatalKind::MissingEnvironment, detail)
    }

    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::new(FatalKind::ConfigurationError, detail)
    }

    pub fn invalid_target(detail: impl Into<String>) -> Self {
        Self::new(FatalKind::InvalidTarget, detail)
    }

    pub fn action_failure(detail: impl Into<String>) -> Self {
        Self::new(FatalKind::ActionFailure, detail)
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// Classify an arbitrary error: a wrapped `FatalError` keeps its kind,
    /// anything else becomes `fallback`.
    pub fn classify(err: anyhow::Error, fallback: FatalKind) -> Self {
        match err.downcast::<FatalError>() {
            Ok(fatal) => fatal,
            Err(other) => Self::new(fallback, format!("{other:#}")),
        }
    }

    /// Multi-line message printed before the process exits.
    ///
    /// ```text
    /// [mcn-subpipe] FATAL ERROR (MissingInput)
    ///     Sorry, some error seems to have occurred in <mcn-subpipe>:
    ///     while checking on input files, a required file could not be found.
    ///     stage 'convert': outB0Mask.nii
    ///     Returning to system with error code 10
    /// ```
    pub fn render(&self, pipeline: &str) -> String {
        let mut out = format!("[{pipeline}] FATAL ERROR ({})\n", self.kind.as_str());
        out.push_str(&format!(
            "\tSorry, some error seems to have occurred in <{pipeline}>:\n"
        ));
        out.push_str(&format!("\t{}{}\n", self.kind.action(), self.kind.error()));
        if !self.detail.is_empty() {
            for line in self.detail.lines() {
                out.push_str(&format!("\t{line}\n"));
            }
        }
        out.push_str(&format!(
            "\tReturning to system with error code {}\n",
            self.exit_code()
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(FatalKind::MissingInput.exit_code(), 10);
        assert_eq!(FatalKind::MissingEnvironment.exit_code(), 11);
        assert_eq!(FatalKind::ConfigurationError.exit_code(), 12);
        assert_eq!(FatalKind::InvalidTarget.exit_code(), 13);
        assert_eq!(FatalKind::ActionFailure.exit_code(), 30);
        assert_eq!(FatalKind::PostconditionUnsatisfiable.exit_code(), 31);
    }

    #[test]
    fn render_includes_kind_message_and_code() {
        let err = FatalError::missing_input("stage 'convert': outB0Mask.nii");
        let text = err.render("mcn-subpipe");
        assert!(text.starts_with("[mcn-subpipe] FATAL ERROR (MissingInput)\n"));
        assert!(text.contains("while checking on input files, a required file could not be found."));
        assert!(text.contains("\tstage 'convert': outB0Mask.nii\n"));
        assert!(text.ends_with("Returning to system with error code 10\n"));
    }

    #[test]
    fn classify_keeps_wrapped_kind() {
        let err = anyhow::Error::new(FatalError::missing_input("b0.nii"));
        let fatal = FatalError::classify(err, FatalKind::ActionFailure);
        assert_eq!(fatal.kind, FatalKind::MissingInput);
    }

    #[test]
    fn classify_falls_back_for_plain_errors() {
        let fatal = FatalError::classify(anyhow!("spawn failed"), FatalKind::ActionFailure);
        assert_eq!(fatal.kind, FatalKind::ActionFailure);
        assert_eq!(fatal.detail, "spawn failed");
    }
}
