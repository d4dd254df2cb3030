//! Side-effecting collaborators: processes, the cluster, the filesystem,
//! the environment and the pipeline log.
//!
//! Each boundary is a trait so the engine can be driven by scripted
//! implementations in tests.

pub mod barrier;
pub mod cluster;
pub mod config;
pub mod environment;
pub mod inputs;
pub mod log_sink;
pub mod process;
pub mod report_store;
