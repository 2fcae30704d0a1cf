//! Command-line interface for jobmill.
//!
//! Provides the job driver (`run`), the in-job wrapper (`wrap`) and tools for
//! inspecting templates, queues and metadata directories.

mod commands;

pub use commands::{build_job_manager, job_status, parse_cli, run, run_with_cli, Cli};
