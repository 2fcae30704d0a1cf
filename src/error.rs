//! Error types for jobmill operations.
//!
//! Defines error types for the major subsystems:
//! - Resource semaphore admission
//! - Job-manager configuration loading and verification
//! - Job execution plumbing
//!
//! Failures of an individual job are not represented here. They are written
//! into that job's metadata directory, since execution is asynchronous and
//! nobody is waiting on a return value.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`ResourceSemaphore`](crate::resources::ResourceSemaphore).
#[derive(Debug, Error)]
pub enum SemaphoreError {
    #[error("Tried to acquire {requested} {name}, when the maximum is {max}")]
    Unsatisfiable {
        name: String,
        requested: i64,
        max: i64,
    },

    #[error("Tried to acquire a negative amount ({requested}) of {name}")]
    Negative { name: String, requested: i64 },

    #[error("Semaphore for {name} was dropped while a request was waiting")]
    Closed { name: String },
}

/// A required environment variable for a job mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingEnv {
    pub name: String,
    pub description: String,
}

fn format_missing(missing: &[MissingEnv]) -> String {
    missing
        .iter()
        .map(|m| format!("export {}={}", m.name, m.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors that can occur while loading or verifying job-manager configuration.
///
/// All of these are fatal for the backend being constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Job manager config file {} does not exist", path.display())]
    NotFound { path: PathBuf },

    #[error("Error reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config file {} does not contain valid JSON: {source}", path.display())]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Job manager config file {} should contain 'settings' field", path.display())]
    MissingSettings { path: PathBuf },

    #[error("Job manager config file {} contains invalid default threads per job", path.display())]
    InvalidThreadsPerJob { path: PathBuf },

    #[error("Job manager config file {} contains invalid default memory (GB) per job", path.display())]
    InvalidMemPerJob { path: PathBuf },

    #[error("Job manager config file {} has no job mode '{mode}'", path.display())]
    UnknownJobMode { path: PathBuf, mode: String },

    #[error("Job manager template file {} does not exist.{hint}", path.display())]
    TemplateNotFound { path: PathBuf, hint: String },

    #[error("Job manager template file {} must be named <name_of_job_manager>.template", path.display())]
    BadTemplateName { path: PathBuf },

    #[error("Job command '{command}' not found in {search_path:?}")]
    CommandNotFound {
        command: String,
        search_path: String,
    },

    #[error("Please set the following environment variables:\n{}", format_missing(.0))]
    MissingEnvironment(Vec<MissingEnv>),

    #[error("Invalid retry pattern '{pattern}': {source}")]
    InvalidRetryPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from job-execution plumbing that are surfaced to the caller.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
