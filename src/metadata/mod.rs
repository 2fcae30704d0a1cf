//! Per-job metadata directories.
//!
//! Each job has a directory of marker files whose presence determines its
//! state. The job (or the backend acting for it) writes the markers and the
//! driver polls them. Nothing about a job's state is held in memory beyond
//! the bookkeeping needed to detect jobs that silently disappeared.

pub mod state;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::JobError;
use crate::retry::RetryPolicy;

pub use state::{MetadataState, Phase};

/// How long a running job may go without a heartbeat before it is assumed
/// dead.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Prefix for all marker file names.
pub const METADATA_FILE_PREFIX: &str = "_";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats a timestamp the way it appears in marker files.
pub fn format_time(t: SystemTime) -> String {
    DateTime::<Local>::from(t).format(TIME_FORMAT).to_string()
}

/// Marker and log files in a job's metadata directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataFile {
    /// A failed assertion. Never retried.
    Assert,
    Complete,
    Disabled,
    /// Failure text for a failed job.
    Errors,
    Heartbeat,
    /// Cluster-assigned identifier of a submitted job.
    JobId,
    JobInfo,
    /// The rendered submission script.
    JobScript,
    /// Present once the job has started running.
    Log,
    /// Present while the job is waiting on local admission.
    QueuedLocally,
    Stderr,
    Stdout,
}

impl MetadataFile {
    pub const ALL: [MetadataFile; 12] = [
        MetadataFile::Assert,
        MetadataFile::Complete,
        MetadataFile::Disabled,
        MetadataFile::Errors,
        MetadataFile::Heartbeat,
        MetadataFile::JobId,
        MetadataFile::JobInfo,
        MetadataFile::JobScript,
        MetadataFile::Log,
        MetadataFile::QueuedLocally,
        MetadataFile::Stderr,
        MetadataFile::Stdout,
    ];

    fn stem(&self) -> &'static str {
        match self {
            MetadataFile::Assert => "assert",
            MetadataFile::Complete => "complete",
            MetadataFile::Disabled => "disabled",
            MetadataFile::Errors => "errors",
            MetadataFile::Heartbeat => "heartbeat",
            MetadataFile::JobId => "jobid",
            MetadataFile::JobInfo => "jobinfo",
            MetadataFile::JobScript => "jobscript",
            MetadataFile::Log => "log",
            MetadataFile::QueuedLocally => "queued_locally",
            MetadataFile::Stderr => "stderr",
            MetadataFile::Stdout => "stdout",
        }
    }

    /// The on-disk file name, including the metadata prefix.
    pub fn file_name(&self) -> String {
        format!("{}{}", METADATA_FILE_PREFIX, self.stem())
    }
}

/// Wall-clock times for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WallClockInfo {
    pub start: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub end: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration_seconds: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Descriptive record of a job, stored in `_jobinfo`.
///
/// Written by the driver when the job is queued and updated by the job
/// wrapper once the job runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub threads: i32,
    #[serde(rename = "memGB", default)]
    pub mem_gb: i32,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub job_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallclock: Option<WallClockInfo>,
}

#[derive(Debug, Default)]
struct Tracking {
    /// Last time a heartbeat was observed.
    last_heartbeat: Option<SystemTime>,
    /// Set when a queue query did not find this job.
    not_running_since: Option<SystemTime>,
}

/// The metadata directory of a single job.
#[derive(Debug)]
pub struct Metadata {
    fqname: String,
    path: PathBuf,
    files_path: PathBuf,
    tracking: Mutex<Tracking>,
}

impl Metadata {
    /// Creates a handle for the metadata directory at `path`. Nothing is
    /// created on disk until [`mkdirs`](Self::mkdirs).
    pub fn new(fqname: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            fqname: fqname.into(),
            files_path: path.join("files"),
            path,
            tracking: Mutex::new(Tracking::default()),
        }
    }

    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The fully-qualified name of the job.
    pub fn fqname(&self) -> &str {
        &self.fqname
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The working directory for the job's own outputs.
    pub fn files_path(&self) -> &Path {
        &self.files_path
    }

    /// Creates the metadata and files directories.
    pub fn mkdirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.path)?;
        std::fs::create_dir_all(&self.files_path)
    }

    pub fn file_path(&self, file: MetadataFile) -> PathBuf {
        self.path.join(file.file_name())
    }

    pub fn exists(&self, file: MetadataFile) -> bool {
        self.file_path(file).exists()
    }

    pub fn read_raw(&self, file: MetadataFile) -> io::Result<String> {
        std::fs::read_to_string(self.file_path(file))
    }

    /// Writes a marker file, replacing any existing content.
    pub fn write_raw(&self, file: MetadataFile, text: &str) -> io::Result<()> {
        std::fs::write(self.file_path(file), text).inspect_err(|e| {
            error!(job = %self.fqname, file = %file.file_name(), error = %e, "Could not write metadata file");
        })
    }

    /// Writes the current time into a marker file.
    pub fn write_time(&self, file: MetadataFile) -> io::Result<()> {
        self.write_raw(file, &format_time(SystemTime::now()))
    }

    /// Removes a marker file. A file that does not exist is not an error.
    pub fn remove(&self, file: MetadataFile) -> io::Result<()> {
        match std::fs::remove_file(self.file_path(file)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Derives the job's state from which marker files exist.
    ///
    /// Precedence: errors or assert, then complete, disabled, log (running),
    /// jobinfo (queued). A completed job's `_jobid` is removed so it is no
    /// longer included in queue queries.
    pub fn state(&self) -> MetadataState {
        if self.exists(MetadataFile::Errors) || self.exists(MetadataFile::Assert) {
            return MetadataState::FAILED;
        }
        if self.exists(MetadataFile::Complete) {
            if self.exists(MetadataFile::JobId) {
                let _ = self.remove(MetadataFile::JobId);
            }
            return MetadataState::COMPLETE;
        }
        if self.exists(MetadataFile::Disabled) {
            return MetadataState::DISABLED;
        }
        if self.exists(MetadataFile::Log) {
            return MetadataState::RUNNING;
        }
        if self.exists(MetadataFile::JobInfo) {
            return MetadataState::QUEUED;
        }
        MetadataState::WAITING
    }

    /// Reads the cluster job id, if the job has one.
    pub fn job_id(&self) -> Option<String> {
        self.read_raw(MetadataFile::JobId)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Checks whether a running job is still producing heartbeats.
    ///
    /// The first time the job is seen running counts as a heartbeat, so a
    /// job that never writes one is still given the full timeout. Writes an
    /// error and returns true if the job is presumed dead.
    pub fn check_heartbeat(&self, now: SystemTime, timeout: Duration) -> bool {
        if self.state() != MetadataState::RUNNING {
            return false;
        }
        let heartbeat_mtime = std::fs::metadata(self.file_path(MetadataFile::Heartbeat))
            .and_then(|m| m.modified())
            .ok();
        let last = {
            let mut tracking = self.tracking();
            let last = match (tracking.last_heartbeat, heartbeat_mtime) {
                (Some(seen), Some(mtime)) => seen.max(mtime),
                (Some(seen), None) => seen,
                (None, Some(mtime)) => mtime,
                (None, None) => now,
            };
            tracking.last_heartbeat = Some(last);
            last
        };
        let stale = now.duration_since(last).unwrap_or_default() > timeout;
        if stale {
            warn!(job = %self.fqname, "No heartbeat detected");
            let _ = self.write_raw(
                MetadataFile::Errors,
                &format!(
                    "{}: No heartbeat detected for {} minutes. Assuming job has failed. \
                     This may be due to a user manually terminating the job, or the \
                     operating system or cluster terminating it due to resource or \
                     time limits.",
                    format_time(now),
                    timeout.as_secs() / 60
                ),
            );
        }
        stale
    }

    /// Records that a queue query did not find the job with this id.
    ///
    /// Ignored if the job has since been reset or finished, if its id no
    /// longer matches, or if it was already recorded missing.
    pub fn fail_not_running(&self, jobid: &str, now: SystemTime) {
        let state = self.state();
        if state != MetadataState::RUNNING && state != MetadataState::QUEUED {
            return;
        }
        if self.job_id().as_deref() != Some(jobid) {
            return;
        }
        let mut tracking = self.tracking();
        if tracking.not_running_since.is_none() {
            tracking.not_running_since = Some(now);
        }
    }

    /// Returns when a queue query first found this job missing.
    pub fn not_running_since(&self) -> Option<SystemTime> {
        self.tracking().not_running_since
    }

    /// Fails the job if it was found missing before `cutoff` and still looks
    /// queued or running.
    ///
    /// `cutoff` is the start of the current refresh minus the queue grace
    /// period. Returns true if an error was written.
    pub fn end_refresh(&self, cutoff: SystemTime) -> bool {
        let since = {
            let mut tracking = self.tracking();
            match tracking.not_running_since {
                Some(since) if since < cutoff => {
                    tracking.not_running_since = None;
                    since
                }
                _ => return false,
            }
        };
        let state = self.state();
        if state != MetadataState::RUNNING && state != MetadataState::QUEUED {
            return false;
        }
        warn!(job = %self.fqname, "Job manager no longer knows about job");
        let _ = self.write_raw(
            MetadataFile::Errors,
            &format!(
                "According to the job manager, the job for {} was not queued \
                 or running, since at least {}.",
                self.fqname,
                format_time(since)
            ),
        );
        true
    }

    /// Returns whether the job's failure looks transient, along with the
    /// error text.
    ///
    /// A job that is not failed has nothing to retry and reports true. An
    /// assertion failure is never transient.
    pub fn is_error_transient(&self, policy: &RetryPolicy) -> (bool, String) {
        if self.state() != MetadataState::FAILED {
            return (true, String::new());
        }
        if self.exists(MetadataFile::Assert) {
            return (false, String::new());
        }
        match self.read_raw(MetadataFile::Errors) {
            Ok(text) => (policy.is_transient(&text), text),
            Err(_) => (true, String::new()),
        }
    }

    /// Removes all metadata and job outputs so the job can run again.
    pub fn reset(&self) -> io::Result<()> {
        {
            let mut tracking = self.tracking();
            *tracking = Tracking::default();
        }
        match std::fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                error!(
                    job = %self.fqname,
                    error = %e,
                    "Cannot reset the job because some directory contents could not be deleted"
                );
                return Err(e);
            }
            _ => {}
        }
        info!(job = %self.fqname, "(reset)");
        self.mkdirs()
    }

    /// Resets the job if it was still waiting for local admission when the
    /// process that queued it went away. Returns true if a reset happened.
    pub fn restart_queued_local(&self) -> io::Result<bool> {
        if !self.exists(MetadataFile::QueuedLocally) {
            return Ok(false);
        }
        self.reset()?;
        Ok(true)
    }

    pub fn read_job_info(&self) -> Result<JobInfo, JobError> {
        let text = self.read_raw(MetadataFile::JobInfo)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write_job_info(&self, info: &JobInfo) -> Result<(), JobError> {
        let text = serde_json::to_string_pretty(info)?;
        self.write_raw(MetadataFile::JobInfo, &text)?;
        Ok(())
    }
}
