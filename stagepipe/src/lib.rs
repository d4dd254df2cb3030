//! Stage-based orchestration for pipelines of external processes.
//!
//! A [`pipeline::Pipeline`] runs named [`stage::Stage`]s in declaration order.
//! Each stage is guarded by [`predicate::Predicate`] lists: preconditions
//! before its action, postconditions after. Actions are a single shell
//! command or a fan-out over targets, dispatched locally or to a cluster
//! scheduler; cluster fan-outs synchronize through a polling barrier on the
//! scheduler's outstanding-job count.
//!
//! - **[`core`]**: Pure logic (selection strings, templates, formatting).
//! - **[`io`]**: Side-effecting boundaries (processes, the scheduler, the
//!   filesystem, the environment, the pipeline log), each behind a trait.
//!
//! Every halting condition is a [`error::FatalError`] with a stable exit code.

pub mod context;
pub mod core;
pub mod definition;
pub mod error;
pub mod exit_codes;
pub mod fanout;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod predicate;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
