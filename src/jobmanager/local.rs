//! Runs jobs as child processes of this host.
//!
//! Each job reserves threads and memory from two process-wide
//! [`ResourceSemaphore`]s before it starts, and holds them until it exits.
//! Memory and (optionally) load average are measured periodically so the
//! semaphores track what is actually free, not only what was reserved.

use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::JobManagerSettings;
use super::{describe_exit, set_parent_death_signal, thread_envs, JobRequest, JobResources};
use crate::error::ConfigError;
use crate::metadata::MetadataFile;
use crate::resources::{system, ResourceSemaphore, SystemSnapshot};
use crate::shutdown::{ShutdownCoordinator, ShutdownHandler, ShutdownReason};

/// Default signature of start failures worth retrying: an exec race on old
/// NFS clients which surfaces as errno 513.
pub const DEFAULT_TRANSIENT_SIGNATURE: &str = r"(errno|os error) 513\b";

/// Fraction of total memory used when no limit is given.
const MAX_MEM_FRACTION: f64 = 0.9;

/// Options for the local backend.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Core limit. 0 uses every logical core (or `threads_per_job` in
    /// cluster mode).
    pub max_cores: i32,
    /// Memory limit in GB. 0 uses 90% of system memory (in cluster mode,
    /// free memory capped at `memGB_per_job`).
    pub max_mem_gb: i32,
    /// Track the load average in the core semaphore.
    pub limit_load: bool,
    /// Whether this backend only runs helper jobs next to a cluster backend.
    pub cluster_mode: bool,
    /// Failures matching this are retried with backoff.
    pub transient_signature: String,
    pub max_retries: u32,
    /// Wait before the first retry. Doubles on each retry.
    pub initial_backoff: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_cores: 0,
            max_mem_gb: 0,
            limit_load: false,
            cluster_mode: false,
            transient_signature: DEFAULT_TRANSIENT_SIGNATURE.to_string(),
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

impl LocalConfig {
    pub fn with_max_cores(mut self, cores: i32) -> Self {
        self.max_cores = cores;
        self
    }

    pub fn with_max_mem_gb(mut self, mem_gb: i32) -> Self {
        self.max_mem_gb = mem_gb;
        self
    }

    pub fn with_limit_load(mut self, limit: bool) -> Self {
        self.limit_load = limit;
        self
    }

    pub fn with_cluster_mode(mut self, cluster_mode: bool) -> Self {
        self.cluster_mode = cluster_mode;
        self
    }

    pub fn with_transient_signature(mut self, pattern: impl Into<String>) -> Self {
        self.transient_signature = pattern.into();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }
}

/// Why a single attempt did not succeed.
enum Attempt {
    /// The request can never be admitted. Not retried.
    Rejected(String),
    /// The process failed to start or exited unsuccessfully.
    Failed(String),
}

/// Local execution backend.
pub struct LocalJobManager {
    max_cores: i32,
    max_mem_gb: i32,
    settings: JobManagerSettings,
    core_sem: ResourceSemaphore,
    mem_mb_sem: ResourceSemaphore,
    limit_load: bool,
    host_cpus: i64,
    transient: Regex,
    max_retries: u32,
    initial_backoff: Duration,
    last_mem_diff: AtomicI64,
    high_mem_mb: AtomicI64,
    shutdown: Arc<ShutdownCoordinator>,
}

/// Threads and memory held by a running job, returned on drop.
struct Reservation<'a> {
    manager: &'a LocalJobManager,
    threads: i64,
    mem_mb: i64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let m = self.manager;
        if self.threads > 0 {
            m.core_sem.release(self.threads);
            debug!(
                "Released {} core(s) ({}/{} in use)",
                self.threads,
                m.core_sem.in_use(),
                m.max_cores
            );
        }
        if self.mem_mb > 0 {
            m.mem_mb_sem.release(self.mem_mb);
            debug!(
                "Released {} GB ({:.1}/{} in use)",
                self.mem_mb / 1024,
                m.mem_mb_sem.in_use() as f64 / 1024.0,
                m.max_mem_gb
            );
        }
    }
}

impl LocalJobManager {
    /// Creates the backend, sizing its semaphores from `config` and the
    /// host, and registers it for shutdown notification.
    pub fn new(
        config: LocalConfig,
        settings: JobManagerSettings,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::with_snapshot(config, settings, shutdown, SystemSnapshot::capture())
    }

    /// Like [`new`](Self::new), with an explicit view of the host.
    pub fn with_snapshot(
        config: LocalConfig,
        settings: JobManagerSettings,
        shutdown: Arc<ShutdownCoordinator>,
        host: SystemSnapshot,
    ) -> Result<Arc<Self>, ConfigError> {
        let transient = Regex::new(&config.transient_signature).map_err(|source| {
            ConfigError::InvalidRetryPattern {
                pattern: config.transient_signature.clone(),
                source,
            }
        })?;

        let max_cores = if config.max_cores > 0 {
            info!("Using {} core(s), per --localcores option.", config.max_cores);
            config.max_cores
        } else if config.cluster_mode {
            settings.threads_per_job
        } else {
            info!("Using {} logical core(s) available on system.", host.cpus);
            host.cpus as i32
        };

        let max_mem_gb = if config.max_mem_gb > 0 {
            info!("Using {} GB, per --localmem option.", config.max_mem_gb);
            config.max_mem_gb
        } else if config.cluster_mode {
            let free_gb = ((host.free_mem_mb + 1023) / 1024) as i32;
            let mem = free_gb.min(settings.mem_gb_per_job).max(1);
            if mem < settings.mem_gb_per_job {
                warn!(
                    "Using {} GB for local jobs. Recommended free memory is {} GB",
                    mem, settings.mem_gb_per_job
                );
            } else {
                info!("Using {} GB for local jobs.", mem);
            }
            mem
        } else {
            let mem = ((host.total_mem_mb as f64 * MAX_MEM_FRACTION) / 1024.0) as i32;
            let mem = mem.max(1);
            info!(
                "Using {} GB, {}% of system memory.",
                mem,
                (MAX_MEM_FRACTION * 100.0) as i32
            );
            mem
        };

        if i64::from(max_mem_gb) * 1024 > host.free_mem_mb {
            warn!(
                "Configured to use {}GB of local memory, but only {:.1}GB is currently available.",
                max_mem_gb,
                host.free_mem_mb as f64 / 1024.0
            );
        }

        let manager = Arc::new(Self {
            max_cores,
            max_mem_gb,
            settings,
            core_sem: ResourceSemaphore::new(i64::from(max_cores), "threads"),
            mem_mb_sem: ResourceSemaphore::new(i64::from(max_mem_gb) * 1024, "MB of memory"),
            limit_load: config.limit_load,
            host_cpus: host.cpus,
            transient,
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff,
            last_mem_diff: AtomicI64::new(0),
            high_mem_mb: AtomicI64::new(0),
            shutdown: Arc::clone(&shutdown),
        });
        shutdown.register(manager.clone());
        Ok(manager)
    }

    pub fn max_cores(&self) -> i32 {
        self.max_cores
    }

    pub fn max_mem_gb(&self) -> i32 {
        self.max_mem_gb
    }

    pub fn settings(&self) -> &JobManagerSettings {
        &self.settings
    }

    pub fn core_semaphore(&self) -> &ResourceSemaphore {
        &self.core_sem
    }

    pub fn memory_semaphore(&self) -> &ResourceSemaphore {
        &self.mem_mb_sem
    }

    /// Normalizes a resource request.
    ///
    /// Zero takes the configured default. Negative threads take every core.
    /// Negative memory takes whatever is currently available, but at least
    /// its absolute value. Both are capped at the backend's limits.
    pub fn system_reqs(&self, resources: &JobResources) -> JobResources {
        let mut threads = match resources.threads {
            0 => self.settings.threads_per_job,
            t if t < 0 => self.max_cores,
            t => t,
        };
        if threads > self.max_cores {
            debug!("Need {} core(s) but settling for {}.", threads, self.max_cores);
            threads = self.max_cores;
        }

        let mut mem_gb = match resources.mem_gb {
            0 => self.settings.mem_gb_per_job,
            m => m,
        };
        if mem_gb < 0 {
            let avail = (self.mem_mb_sem.current_size() / 1024) as i32;
            if avail < 1 || avail < -mem_gb {
                mem_gb = -mem_gb;
            } else {
                debug!(
                    "Adaptive request for at least {} GB being given {}.",
                    -mem_gb, avail
                );
                mem_gb = avail;
            }
        }
        if mem_gb > self.max_mem_gb {
            info!(
                "Job asked for {} GB but is being given {}. Jobs which can adapt their \
                 memory usage should ask for -{}.",
                mem_gb, self.max_mem_gb, mem_gb
            );
            mem_gb = self.max_mem_gb;
        }

        JobResources {
            threads,
            mem_gb,
            special: resources.special.clone(),
        }
    }

    /// Feeds measured free memory and load into the semaphores.
    pub fn refresh_resources(&self, local_mode: bool) {
        let host = SystemSnapshot::capture();
        let used_mb = system::process_tree_rss_mb(std::process::id());
        self.high_mem_mb.fetch_max(used_mb, Ordering::Relaxed);

        let mem_diff = self.mem_mb_sem.update_free_used(host.free_mem_mb, used_mb);
        let last = self.last_mem_diff.swap(mem_diff / 128, Ordering::Relaxed);
        if mem_diff < -i64::from(self.max_mem_gb) * 1024 / 8
            && mem_diff / 128 < last
            && (local_mode || host.free_mem_mb < 2 * 1024)
        {
            info!(
                "{:.1}GB less memory than expected was free",
                -mem_diff as f64 / 1024.0
            );
            if used_mb > self.mem_mb_sem.reserved() {
                info!(
                    "This process and its children are using {:.1}GB of rss. {:.1}GB are reserved.",
                    used_mb as f64 / 1024.0,
                    self.mem_mb_sem.reserved() as f64 / 1024.0
                );
            }
        }

        if self.limit_load {
            if let Some(idle) = host.idle_cores() {
                let diff = self.core_sem.update_actual(idle);
                if diff < -i64::from(self.max_cores) / 4 && local_mode {
                    info!("{} fewer core(s) than expected were free.", -diff);
                }
            }
        }
    }

    /// Runs a job on a background task, retrying known-transient start
    /// failures.
    pub fn exec_job(self: &Arc<Self>, request: JobRequest) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_job(request).await })
    }

    async fn run_job(&self, mut request: JobRequest) {
        let metadata = Arc::clone(&request.metadata);
        loop {
            if !request.wait.is_zero() {
                tokio::time::sleep(request.wait).await;
            }
            match self.run_once(&request).await {
                Ok(()) => return,
                Err(Attempt::Rejected(text)) => {
                    let _ = metadata.write_raw(MetadataFile::Errors, &text);
                    return;
                }
                Err(Attempt::Failed(text)) => {
                    if request.retries < self.max_retries && self.transient.is_match(&text) {
                        request.retries += 1;
                        request.wait = if request.wait.is_zero() {
                            self.initial_backoff
                        } else {
                            request.wait * 2
                        };
                        info!(
                            job = %request.fqname,
                            "Job failed: {}. Retrying job in {} seconds",
                            text,
                            request.wait.as_secs()
                        );
                        continue;
                    }
                    // A job which wrote its own error knows better.
                    if !metadata.exists(MetadataFile::Errors) {
                        let _ = metadata.write_raw(MetadataFile::Errors, &text);
                    }
                    return;
                }
            }
        }
    }

    async fn reserve(&self, request: &JobRequest, res: &JobResources) -> Result<Reservation<'_>, Attempt> {
        let threads = i64::from(res.threads);
        let mem_mb = i64::from(res.mem_gb) * 1024;
        let mut reservation = Reservation {
            manager: self,
            threads: 0,
            mem_mb: 0,
        };

        debug!("Waiting for {} core(s)", threads);
        if let Err(e) = self.core_sem.acquire(threads).await {
            error!(
                "{} requested {} threads, but the job manager was only configured to use {}.",
                request.fqname, threads, self.max_cores
            );
            return Err(Attempt::Rejected(e.to_string()));
        }
        reservation.threads = threads;
        debug!(
            "Acquired {} core(s) ({}/{} in use)",
            threads,
            self.core_sem.in_use(),
            self.max_cores
        );

        debug!("Waiting for {} GB", res.mem_gb);
        if let Err(e) = self.mem_mb_sem.acquire(mem_mb).await {
            error!(
                "{} requested {} GB of memory, but the job manager was only configured to use {}.",
                request.fqname, res.mem_gb, self.max_mem_gb
            );
            return Err(Attempt::Rejected(e.to_string()));
        }
        reservation.mem_mb = mem_mb;
        debug!(
            "Acquired {} GB ({:.1}/{} in use)",
            res.mem_gb,
            self.mem_mb_sem.in_use() as f64 / 1024.0,
            self.max_mem_gb
        );
        Ok(reservation)
    }

    async fn run_once(&self, request: &JobRequest) -> Result<(), Attempt> {
        let metadata = &request.metadata;
        let res = self.system_reqs(&request.resources);
        let _reservation = self.reserve(request, &res).await?;

        let mut cmd = Command::new(&request.shell_cmd);
        cmd.args(&request.args)
            .current_dir(metadata.files_path())
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if i64::from(self.max_cores) < self.host_cpus {
            // Only enforce thread counts when sharing the host with a limit.
            cmd.envs(thread_envs(&self.settings, res.threads, &request.env));
        } else {
            cmd.envs(&request.env);
        }

        if request.preflight {
            cmd.stdout(Stdio::inherit());
            let _ = open_log(metadata, MetadataFile::Stdout, "[stdout]\n");
        } else if let Some(file) = open_log(metadata, MetadataFile::Stdout, "[stdout]\n") {
            cmd.stdout(file);
        }
        if let Some(file) = open_log(metadata, MetadataFile::Stderr, "[stderr]\n") {
            cmd.stderr(file);
        }
        set_parent_death_signal(&mut cmd);

        let mut child = {
            let _section = self.shutdown.enter_critical_section().await;
            let child = cmd
                .spawn()
                .map_err(|e| Attempt::Failed(format!("{}: {}", request.shell_cmd, e)))?;
            let _ = metadata.remove(MetadataFile::QueuedLocally);
            child
        };
        debug!(job = %request.fqname, pid = ?child.id(), "Started local job");

        let status = child
            .wait()
            .await
            .map_err(|e| Attempt::Failed(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(Attempt::Failed(describe_exit(status)))
        }
    }
}

/// Creates a job log file starting with a header line.
fn open_log(
    metadata: &crate::metadata::Metadata,
    file: MetadataFile,
    header: &str,
) -> Option<std::fs::File> {
    use std::io::Write;

    let path = metadata.file_path(file);
    match std::fs::File::create(&path) {
        Ok(mut f) => {
            if let Err(e) = f.write_all(header.as_bytes()) {
                warn!(path = %path.display(), error = %e, "Could not write log header");
            }
            Some(f)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not create job log");
            None
        }
    }
}

impl ShutdownHandler for LocalJobManager {
    fn handle_shutdown(&self, _reason: &ShutdownReason) {
        let high = self.high_mem_mb.load(Ordering::Relaxed);
        if high > 0 {
            info!(rss_mb = high, "Highest memory usage observed");
        }
    }
}
