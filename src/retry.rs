//! Classification of job failures as transient.
//!
//! A failure is considered transient when any line of its error text matches
//! one of a configured list of regular expressions. The list and the number
//! of automatic retries are read from `retry.json` in the job-manager
//! directory:
//!
//! ```json
//! { "default_retries": 3, "retry_on": ["^signal: ", "Stale file handle"] }
//! ```

use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::metadata::Metadata;

/// Name of the retry configuration file inside the job-manager directory.
pub const RETRY_FILE: &str = "retry.json";

/// Pattern used when no retry configuration exists.
const DEFAULT_RETRY_ON: &str = "^signal: ";

#[derive(Debug, Deserialize)]
struct RetryFile {
    #[serde(default)]
    default_retries: u32,
    #[serde(default)]
    retry_on: Vec<String>,
}

/// Decides which failures are worth retrying and how many times.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retry_on: Vec<Regex>,
    default_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on: vec![Regex::new(DEFAULT_RETRY_ON).expect("Invalid default retry regex")],
            default_retries: 0,
        }
    }
}

impl RetryPolicy {
    /// Compiles a policy from patterns.
    pub fn new<S: AsRef<str>>(patterns: &[S], default_retries: u32) -> Result<Self, ConfigError> {
        let retry_on = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|source| ConfigError::InvalidRetryPattern {
                    pattern: p.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            retry_on,
            default_retries,
        })
    }

    /// Loads `retry.json` from the job-manager directory.
    ///
    /// A missing file yields the default policy. A file that exists but
    /// cannot be read or parsed is an error.
    pub fn load(jobmanagers_dir: &Path) -> Result<Self, ConfigError> {
        let path = jobmanagers_dir.join(RETRY_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "No retry config, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let file: RetryFile = serde_json::from_str(&content)
            .map_err(|source| ConfigError::InvalidJson { path, source })?;
        Self::new(&file.retry_on, file.default_retries)
    }

    /// Returns the number of automatic retries to attempt.
    pub fn default_retries(&self) -> u32 {
        self.default_retries
    }

    /// Overrides the number of automatic retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    /// Returns true if any line of `text` matches a retry pattern.
    pub fn is_transient(&self, text: &str) -> bool {
        text.split('\n')
            .any(|line| self.retry_on.iter().any(|re| re.is_match(line)))
    }

    /// Decides whether a failed job should run again, given the number of
    /// retries already made. Also returns the job's error text.
    pub fn should_retry(&self, metadata: &Metadata, retries_so_far: u32) -> (bool, String) {
        let (transient, text) = metadata.is_error_transient(self);
        (transient && retries_so_far < self.default_retries, text)
    }
}
