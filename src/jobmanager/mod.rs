//! Job execution backends.
//!
//! A [`JobManager`] is chosen once at startup: [`LocalJobManager`] runs jobs
//! as child processes on this host, gated by thread and memory semaphores;
//! [`RemoteJobManager`] renders a submission script and hands it to a
//! cluster scheduler. Both run each job on a background task and report the
//! outcome only through the job's metadata directory.

pub mod config;
pub mod local;
pub mod maxjobs;
pub mod monitor;
pub mod remote;
pub mod template;

use std::collections::BTreeMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::metadata::Metadata;

pub use config::{JobManagerConfig, JobManagerSettings, RemoteModeConfig};
pub use local::{LocalConfig, LocalJobManager};
pub use maxjobs::MaxJobsSemaphore;
pub use monitor::QueueMonitor;
pub use remote::{RemoteConfig, RemoteJobManager};
pub use template::JobTemplate;

/// Resources requested by a job.
///
/// Zero means the backend default. A negative value asks for as much as is
/// available, with its absolute value as the minimum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResources {
    pub threads: i32,
    pub mem_gb: i32,
    /// Resource flavor, mapped to cluster-specific options.
    pub special: Option<String>,
}

impl JobResources {
    pub fn new(threads: i32, mem_gb: i32) -> Self {
        Self {
            threads,
            mem_gb,
            special: None,
        }
    }

    pub fn with_special(mut self, special: impl Into<String>) -> Self {
        self.special = Some(special.into());
        self
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub shell_cmd: String,
    pub args: Vec<String>,
    /// Environment overrides for the job.
    pub env: BTreeMap<String, String>,
    pub metadata: Arc<Metadata>,
    pub resources: JobResources,
    /// Fully-qualified name of the stage fork.
    pub fqname: String,
    /// Name of the phase being run, e.g. `split` or `main`.
    pub shell_name: String,
    /// Local preflight jobs write stdout to the console.
    pub preflight: bool,
    /// Local retries already made after known-transient failures.
    pub retries: u32,
    /// Delay before this attempt starts.
    pub wait: Duration,
}

impl JobRequest {
    pub fn new(shell_cmd: impl Into<String>, metadata: Arc<Metadata>) -> Self {
        let fqname = metadata.fqname().to_string();
        Self {
            shell_cmd: shell_cmd.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            metadata,
            resources: JobResources::default(),
            fqname,
            shell_name: "main".to_string(),
            preflight: false,
            retries: 0,
            wait: Duration::ZERO,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: JobResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_shell_name(mut self, shell_name: impl Into<String>) -> Self {
        self.shell_name = shell_name.into();
        self
    }

    pub fn with_preflight(mut self, preflight: bool) -> Self {
        self.preflight = preflight;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

/// The configured execution backend.
#[derive(Clone)]
pub enum JobManager {
    Local(Arc<LocalJobManager>),
    Remote(Arc<RemoteJobManager>),
}

impl JobManager {
    /// Starts a job in the background and returns immediately.
    ///
    /// The handle completes once the local process exits or the cluster
    /// submission is done. Failures are written to the job's metadata.
    pub fn exec_job(&self, request: JobRequest) -> JoinHandle<()> {
        match self {
            JobManager::Local(m) => m.exec_job(request),
            JobManager::Remote(m) => m.exec_job(request),
        }
    }

    /// Tells the backend the job reached a terminal state.
    pub fn end_job(&self, metadata: &Metadata) {
        if let JobManager::Remote(m) = self {
            m.end_job(metadata);
        }
    }

    /// Returns which of `ids` the queue still knows about, and the query's
    /// diagnostic output. Backends without a queue query return `ids`.
    pub async fn check_queue(&self, ids: &[String]) -> (Vec<String>, String) {
        match self {
            JobManager::Local(_) => (ids.to_vec(), String::new()),
            JobManager::Remote(m) => m.check_queue(ids).await,
        }
    }

    pub fn has_queue_check(&self) -> bool {
        match self {
            JobManager::Local(_) => false,
            JobManager::Remote(m) => m.has_queue_check(),
        }
    }

    /// How long a job may be missing from the queue before it is failed.
    pub fn queue_check_grace(&self) -> Duration {
        match self {
            JobManager::Local(_) => Duration::ZERO,
            JobManager::Remote(m) => m.queue_check_grace(),
        }
    }

    /// Updates resource availability: free memory and load locally, the
    /// max-jobs gate remotely.
    pub fn refresh_resources(&self, local_mode: bool) {
        match self {
            JobManager::Local(m) => m.refresh_resources(local_mode),
            JobManager::Remote(m) => m.refresh_resources(),
        }
    }

    /// Normalizes a resource request the way the backend would.
    pub fn system_reqs(&self, resources: &JobResources) -> JobResources {
        match self {
            JobManager::Local(m) => m.system_reqs(resources),
            JobManager::Remote(m) => m.system_reqs(resources),
        }
    }

    /// Core ceiling, or 0 for remote backends.
    pub fn max_cores(&self) -> i32 {
        match self {
            JobManager::Local(m) => m.max_cores(),
            JobManager::Remote(_) => 0,
        }
    }

    /// Memory ceiling in GB, or 0 for remote backends.
    pub fn max_mem_gb(&self) -> i32 {
        match self {
            JobManager::Local(m) => m.max_mem_gb(),
            JobManager::Remote(_) => 0,
        }
    }

    pub fn settings(&self) -> &JobManagerSettings {
        match self {
            JobManager::Local(m) => m.settings(),
            JobManager::Remote(m) => m.settings(),
        }
    }

    /// Short name of the job mode, as recorded in job info.
    pub fn mode_name(&self) -> &str {
        match self {
            JobManager::Local(_) => config::LOCAL_MODE,
            JobManager::Remote(m) => m.mode_name(),
        }
    }
}

/// Sets each configured thread-count variable to `threads`, unless the job
/// overrides it.
pub fn thread_envs(
    settings: &JobManagerSettings,
    threads: i32,
    env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let count = threads.to_string();
    let mut out: BTreeMap<String, String> = settings
        .thread_envs
        .iter()
        .map(|name| (name.clone(), count.clone()))
        .collect();
    out.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

/// Formats environment variables as `KEY=value` words.
pub fn format_env(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

/// Describes how a process ended, e.g. `exit status 1` or `signal: killed`.
pub fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit status {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("signal: {}", signal_description(sig));
        }
    }
    status.to_string()
}

#[cfg(unix)]
fn signal_description(sig: i32) -> String {
    use nix::sys::signal::Signal;
    match Signal::try_from(sig) {
        Ok(Signal::SIGHUP) => "hangup".to_string(),
        Ok(Signal::SIGINT) => "interrupt".to_string(),
        Ok(Signal::SIGQUIT) => "quit".to_string(),
        Ok(Signal::SIGABRT) => "aborted".to_string(),
        Ok(Signal::SIGBUS) => "bus error".to_string(),
        Ok(Signal::SIGKILL) => "killed".to_string(),
        Ok(Signal::SIGSEGV) => "segmentation fault".to_string(),
        Ok(Signal::SIGPIPE) => "broken pipe".to_string(),
        Ok(Signal::SIGTERM) => "terminated".to_string(),
        Ok(Signal::SIGUSR1) => "user defined signal 1".to_string(),
        Ok(Signal::SIGUSR2) => "user defined signal 2".to_string(),
        Ok(other) => other.as_str().to_string(),
        Err(_) => format!("signal {}", sig),
    }
}

/// Arranges for the child to receive SIGTERM if this process dies.
#[cfg(target_os = "linux")]
pub(crate) fn set_parent_death_signal(cmd: &mut tokio::process::Command) {
    use nix::sys::signal::Signal;
    // SAFETY: prctl is async-signal-safe and the closure touches no state
    // shared with the parent.
    unsafe {
        cmd.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(Signal::SIGTERM).map_err(std::io::Error::from)
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_parent_death_signal(_cmd: &mut tokio::process::Command) {}
