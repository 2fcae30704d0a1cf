//! String-valued job lifecycle states.
//!
//! A state may carry a phase prefix (`split_running`, `chunks_queued`) so a
//! driver can track sub-phases of one stage. The predicates match on the
//! suffix, so a phase-prefixed state answers `is_running()` the same way the
//! bare state does.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The observed state of a job, derived from its metadata marker files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataState(Cow<'static, str>);

impl MetadataState {
    /// No marker files yet.
    pub const WAITING: Self = Self::constant("");
    /// A fork waiting on its dependencies.
    pub const FORK_WAITING: Self = Self::constant("waiting");
    pub const READY: Self = Self::constant("ready");
    /// Handed to the backend but not yet started.
    pub const QUEUED: Self = Self::constant("queued");
    pub const RUNNING: Self = Self::constant("running");
    pub const COMPLETE: Self = Self::constant("complete");
    pub const FAILED: Self = Self::constant("failed");
    pub const DISABLED: Self = Self::constant("disabled");

    const fn constant(s: &'static str) -> Self {
        Self(Cow::Borrowed(s))
    }

    /// Creates a state from an arbitrary string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(Cow::Owned(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns this state scoped to the given phase.
    pub fn prefixed(&self, phase: Phase) -> Self {
        Self::new(format!("{}{}", phase.prefix(), self.0))
    }

    pub fn has_prefix(&self, phase: Phase) -> bool {
        self.0.starts_with(phase.prefix())
    }

    pub fn is_running(&self) -> bool {
        self.0.ends_with(Self::RUNNING.as_str())
    }

    pub fn is_queued(&self) -> bool {
        self.0.ends_with(Self::QUEUED.as_str())
    }

    pub fn is_failed(&self) -> bool {
        self.0.ends_with(Self::FAILED.as_str())
    }

    /// Whether the job will not change state again without a reset.
    pub fn is_terminal(&self) -> bool {
        *self == Self::COMPLETE || *self == Self::FAILED || *self == Self::DISABLED
    }
}

impl Default for MetadataState {
    fn default() -> Self {
        Self::WAITING
    }
}

impl fmt::Display for MetadataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("waiting")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Execution phases of a stage which scope their own states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Chunks,
    Split,
    Join,
    Cleanup,
    Retry,
}

impl Phase {
    pub fn prefix(&self) -> &'static str {
        match self {
            Phase::Chunks => "chunks_",
            Phase::Split => "split_",
            Phase::Join => "join_",
            Phase::Cleanup => "cleanup_",
            Phase::Retry => "retry_",
        }
    }
}
