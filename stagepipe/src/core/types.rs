//! Shared deterministic types for stage bookkeeping.
//!
//! These types define stable contracts between the pipeline, its report and
//! the predicates that inspect stage records.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one stage within a single pipeline pass.
///
/// `Pending` is the only non-terminal state a stage can be observed in before
/// the pipeline reaches it. `Running` and `PostconditionPending` are only ever
/// observed while the stage is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    /// Not selected for this run.
    Skipped,
    /// A precondition failed on a non-fatal stage (skipped with a warning).
    PreconditionFailed,
    Running,
    /// Evaluating postconditions, possibly blocked on a barrier.
    PostconditionPending,
    Complete,
    /// Action or postcondition failed on a non-fatal stage.
    Failed,
}

impl StageState {
    pub fn as_str(self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Skipped => "skipped",
            StageState::PreconditionFailed => "precondition_failed",
            StageState::Running => "running",
            StageState::PostconditionPending => "postcondition_pending",
            StageState::Complete => "complete",
            StageState::Failed => "failed",
        }
    }
}

/// Which side of the action a condition list guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pre => "precondition",
            Phase::Post => "postcondition",
        }
    }
}

/// Where a fan-out target is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Run the tool locally and wait for it.
    #[default]
    Local,
    /// Submit to the cluster scheduler (fire-and-forget).
    Cluster,
}
