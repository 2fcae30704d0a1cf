//! Submits jobs to a cluster scheduler.
//!
//! Each job's submission script is rendered from the job mode's template
//! and piped to the mode's submit command. Submissions may be rate limited
//! and capped by a [`MaxJobsSemaphore`]. Whether a job is still known to
//! the scheduler is answered by the mode's optional queue query script.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::{JobManagerConfig, JobManagerSettings, RemoteModeConfig};
use super::maxjobs::MaxJobsSemaphore;
use super::template::TemplateParams;
use super::{describe_exit, format_env, thread_envs, JobRequest, JobResources};
use crate::error::ConfigError;
use crate::metadata::{Metadata, MetadataFile};
use crate::shutdown::ShutdownCoordinator;

/// Placeholder in a mode's `resopt` replaced by the mapped options.
const RESOURCES_PLACEHOLDER: &str = "__RESOURCES__";

/// Memory tokens with their scale from GB.
const MEM_UNITS: [(&str, &str, i64); 4] = [
    ("MEM_GB", "MEM_GB_PER_THREAD", 1),
    ("MEM_MB", "MEM_MB_PER_THREAD", 1 << 10),
    ("MEM_KB", "MEM_KB_PER_THREAD", 1 << 20),
    ("MEM_B", "MEM_B_PER_THREAD", 1 << 30),
];

/// Options for the remote backend.
#[derive(Debug, Clone, Default)]
pub struct RemoteConfig {
    /// Memory per core in GB. When set, thread counts grow to cover a
    /// job's memory request.
    pub mem_gb_per_core: i32,
    /// Maximum outstanding jobs. 0 is unlimited.
    pub max_jobs: usize,
    /// Minimum time between submissions. Zero is unlimited.
    pub job_interval: Duration,
    /// Resource flavor mapping, `flavor:options;flavor2:options2`.
    pub job_resources: String,
    /// Account tag for `__MRO_ACCOUNT__`.
    pub account: Option<String>,
}

impl RemoteConfig {
    pub fn with_mem_gb_per_core(mut self, mem_gb: i32) -> Self {
        self.mem_gb_per_core = mem_gb;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_job_interval(mut self, interval: Duration) -> Self {
        self.job_interval = interval;
        self
    }

    pub fn with_job_resources(mut self, mapping: impl Into<String>) -> Self {
        self.job_resources = mapping.into();
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }
}

/// Parses `flavor:options;flavor2:options2`. Malformed entries are logged
/// and skipped.
pub fn parse_resource_mappings(spec: &str) -> BTreeMap<String, String> {
    let mut mappings = BTreeMap::new();
    for mapping in spec.split(';').filter(|m| !m.is_empty()) {
        let parts: Vec<&str> = mapping.split(':').collect();
        if let [flavor, options] = parts.as_slice() {
            info!("Mapping {} to {}", flavor, options);
            mappings.insert(flavor.to_string(), options.to_string());
        } else {
            warn!("Could not parse mapping: {}", mapping);
        }
    }
    mappings
}

/// Cluster execution backend.
pub struct RemoteJobManager {
    mode: RemoteModeConfig,
    settings: JobManagerSettings,
    jobmanagers_dir: PathBuf,
    mem_gb_per_core: i32,
    resource_mappings: BTreeMap<String, String>,
    account: Option<String>,
    job_sem: Option<MaxJobsSemaphore>,
    limiter: Option<Mutex<Interval>>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl RemoteJobManager {
    /// Verifies `mode` against the configuration and environment and
    /// creates the backend.
    pub fn new(
        config: &JobManagerConfig,
        mode: &str,
        options: RemoteConfig,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Result<Arc<Self>, ConfigError> {
        let verified = config.verify_job_mode(mode, options.mem_gb_per_core)?;
        Ok(Self::from_mode(config, verified, options, shutdown))
    }

    /// Creates the backend from an already verified job mode.
    pub fn from_mode(
        config: &JobManagerConfig,
        mode: RemoteModeConfig,
        options: RemoteConfig,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Arc<Self> {
        let limiter = (!options.job_interval.is_zero()).then(|| {
            let mut interval = tokio::time::interval(options.job_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Mutex::new(interval)
        });
        Arc::new(Self {
            mode,
            settings: config.settings().clone(),
            jobmanagers_dir: config.dir().to_path_buf(),
            mem_gb_per_core: options.mem_gb_per_core,
            resource_mappings: parse_resource_mappings(&options.job_resources),
            account: options.account.filter(|a| !a.is_empty()),
            job_sem: (options.max_jobs > 0).then(|| MaxJobsSemaphore::new(options.max_jobs)),
            limiter,
            shutdown,
        })
    }

    pub fn settings(&self) -> &JobManagerSettings {
        &self.settings
    }

    pub fn mode_name(&self) -> &str {
        &self.mode.mode
    }

    pub fn max_jobs_semaphore(&self) -> Option<&MaxJobsSemaphore> {
        self.job_sem.as_ref()
    }

    /// Normalizes a resource request.
    ///
    /// Negative values are taken as their absolute value. With a
    /// memory-per-core setting, threads grow to cover the memory request.
    /// Templates without a thread placeholder always get one thread.
    pub fn system_reqs(&self, resources: &JobResources) -> JobResources {
        let mut threads = match resources.threads {
            0 => self.settings.threads_per_job,
            t => t.abs(),
        };
        let mut mem_gb = resources.mem_gb.abs();
        if mem_gb < 1 {
            mem_gb = self.settings.mem_gb_per_job;
        }
        if self.mem_gb_per_core > 0 {
            threads = threads.max((mem_gb + self.mem_gb_per_core - 1) / self.mem_gb_per_core);
        }
        if !self.mode.threading_enabled {
            threads = 1;
        }
        JobResources {
            threads,
            mem_gb,
            special: resources.special.clone(),
        }
    }

    /// Computes the template parameters for a job.
    pub fn template_params(&self, request: &JobRequest) -> TemplateParams {
        let res = self.system_reqs(&request.resources);
        let metadata = &request.metadata;

        let mut mem_gb = i64::from(res.mem_gb);
        if self.mode.mem_is_vmem {
            mem_gb += i64::from(self.settings.extra_vmem_per_job);
        }
        let mem_gb_per_thread = if self.mem_gb_per_core > 0 {
            i64::from(self.mem_gb_per_core)
        } else {
            let threads = i64::from(res.threads.max(1));
            (mem_gb + threads - 1) / threads
        };

        let resources = res
            .special
            .as_deref()
            .filter(|s| !s.is_empty())
            .and_then(|special| self.resource_mappings.get(special))
            .map(|mapped| {
                self.mode
                    .resources_opt
                    .replacen(RESOURCES_PLACEHOLDER, mapped, 1)
            })
            .unwrap_or_default();

        let mut argv = format_env(&thread_envs(&self.settings, res.threads, &request.env));
        argv.push(request.shell_cmd.clone());
        argv.extend(request.args.iter().cloned());

        let mut params = TemplateParams::new();
        params.insert(
            "JOB_NAME",
            format!("{}.{}", request.fqname, request.shell_name),
        );
        params.insert("THREADS", res.threads.to_string());
        params.insert(
            "STDOUT",
            metadata.file_path(MetadataFile::Stdout).display().to_string(),
        );
        params.insert(
            "STDERR",
            metadata.file_path(MetadataFile::Stderr).display().to_string(),
        );
        params.insert("JOB_WORKDIR", metadata.files_path().display().to_string());
        params.insert("CMD", argv.join(" "));
        for (key, per_thread_key, scale) in MEM_UNITS {
            params.insert(key, (mem_gb * scale).to_string());
            params.insert(per_thread_key, (mem_gb_per_thread * scale).to_string());
        }
        params.insert("ACCOUNT", self.account.clone().unwrap_or_default());
        params.insert("RESOURCES", resources);
        params
    }

    /// Renders the submission script for a job.
    pub fn job_script(&self, request: &JobRequest) -> String {
        self.mode.template.render(&self.template_params(request))
    }

    /// Submits a job on a background task.
    ///
    /// With a max-jobs limit, the task first waits for a slot. The slot is
    /// held until [`end_job`](Self::end_job) or until a refresh finds the
    /// job no longer queued or running.
    pub fn exec_job(self: &Arc<Self>, request: JobRequest) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(sem) = &this.job_sem {
                debug!(job = %request.fqname, "Waiting for job");
                if !sem.acquire(&request.metadata).await {
                    return;
                }
                debug!(job = %request.fqname, "Job sent");
            }
            this.send_job(&request).await;
        })
    }

    async fn send_job(&self, request: &JobRequest) {
        if let Some(limiter) = &self.limiter {
            limiter.lock().await.tick().await;
            debug!(job = %request.fqname, "Job rate-limit released");
        }
        let metadata = &request.metadata;
        let script = self.job_script(request);
        let _ = metadata.write_raw(MetadataFile::JobScript, &script);

        let mut cmd = Command::new(&self.mode.submit_cmd);
        cmd.args(&self.mode.submit_args)
            .current_dir(metadata.files_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let _section = self.shutdown.enter_critical_section().await;
        let _ = metadata.remove(MetadataFile::QueuedLocally);
        match run_with_input(cmd, &script).await {
            Err(e) => {
                let _ = metadata.write_raw(
                    MetadataFile::Errors,
                    &format!("jobcmd error ({}):\n", e),
                );
            }
            Ok((status, output)) if !status.success() => {
                let _ = metadata.write_raw(
                    MetadataFile::Errors,
                    &format!("jobcmd error ({}):\n{}", describe_exit(status), output),
                );
            }
            Ok((_, output)) => record_job_id(metadata, &output),
        }
    }

    /// Releases the job's max-jobs slot.
    pub fn end_job(&self, metadata: &Metadata) {
        if let Some(sem) = &self.job_sem {
            sem.release(metadata);
        }
    }

    /// Frees max-jobs slots held by jobs which finished.
    pub fn refresh_resources(&self) {
        if let Some(sem) = &self.job_sem {
            sem.find_done();
        }
    }

    pub fn has_queue_check(&self) -> bool {
        self.mode.queue_query.is_some()
    }

    pub fn queue_check_grace(&self) -> Duration {
        self.mode.queue_query_grace
    }

    /// Pipes `ids`, one per line, to the queue query script and returns the
    /// ids it prints along with its stderr. If the query fails, every id is
    /// assumed still queued.
    pub async fn check_queue(&self, ids: &[String]) -> (Vec<String>, String) {
        let Some(query) = &self.mode.queue_query else {
            return (ids.to_vec(), String::new());
        };
        let mut cmd = Command::new(query);
        cmd.current_dir(&self.jobmanagers_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let input = ids.join("\n");

        let output = async {
            let mut child = cmd.spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
            }
            child.wait_with_output().await
        }
        .await;

        match output {
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
                if !out.status.success() {
                    warn!(query = %query.display(), status = %describe_exit(out.status), "Queue query failed");
                    return (ids.to_vec(), stderr);
                }
                let stdout = String::from_utf8_lossy(&out.stdout);
                (stdout.split('\n').map(str::to_string).collect(), stderr)
            }
            Err(e) => {
                warn!(query = %query.display(), error = %e, "Queue query failed");
                (ids.to_vec(), e.to_string())
            }
        }
    }
}

/// Runs a command with `input` on stdin, returning its exit status and its
/// stdout followed by its stderr.
async fn run_with_input(
    mut cmd: Command,
    input: &str,
) -> std::io::Result<(std::process::ExitStatus, String)> {
    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            // The command may exit without reading its input.
            debug!(error = %e, "Could not write job script to submit command");
        }
    }
    let out = child.wait_with_output().await?;
    let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&out.stderr));
    Ok((out.status, combined))
}

/// Records the first line of the submit command's output as the job id,
/// if it looks like one.
fn record_job_id(metadata: &Metadata, output: &str) {
    let first = output.trim().lines().next().unwrap_or("").trim();
    if !first.is_empty() && !first.contains(char::is_whitespace) {
        let _ = metadata.write_raw(MetadataFile::JobId, first);
    } else {
        debug!(job = %metadata.fqname(), "Submit command printed no job id");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobmanager::template::JobTemplate;

    fn mode(template: &str) -> RemoteModeConfig {
        let template = JobTemplate::new(template);
        RemoteModeConfig {
            mode: "test".to_string(),
            submit_cmd: "cat".to_string(),
            submit_args: Vec::new(),
            queue_query: None,
            queue_query_grace: Duration::ZERO,
            resources_opt: "-l __RESOURCES__".to_string(),
            threading_enabled: template.has_token("THREADS"),
            template,
            mem_is_vmem: false,
        }
    }

    fn manager(template: &str, options: RemoteConfig) -> Arc<RemoteJobManager> {
        let settings = JobManagerSettings {
            threads_per_job: 1,
            mem_gb_per_job: 4,
            thread_envs: vec!["OMP_NUM_THREADS".to_string()],
            ..Default::default()
        };
        let config = JobManagerConfig::new("/tmp/jobmanagers", settings);
        RemoteJobManager::from_mode(
            &config,
            mode(template),
            options,
            Arc::new(ShutdownCoordinator::new()),
        )
    }

    #[test]
    fn test_parse_resource_mappings() {
        let mappings = parse_resource_mappings("gpu:gpus=1;;bad;big:mem=1T;a:b:c");
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings["gpu"], "gpus=1");
        assert_eq!(mappings["big"], "mem=1T");
    }

    #[test]
    fn test_system_reqs() {
        let m = manager("__MRO_THREADS__ __MRO_MEM_GB__", RemoteConfig::default());
        assert_eq!(m.system_reqs(&JobResources::new(0, 0)), JobResources::new(1, 4));
        assert_eq!(m.system_reqs(&JobResources::new(-3, -8)), JobResources::new(3, 8));

        let m = manager(
            "__MRO_THREADS__",
            RemoteConfig::default().with_mem_gb_per_core(4),
        );
        assert_eq!(m.system_reqs(&JobResources::new(1, 10)), JobResources::new(3, 10));
        assert_eq!(m.system_reqs(&JobResources::new(4, 10)), JobResources::new(4, 10));

        let m = manager("__MRO_MEM_GB__", RemoteConfig::default());
        assert_eq!(m.system_reqs(&JobResources::new(8, 2)), JobResources::new(1, 2));
    }

    #[test]
    fn test_template_params() {
        let dir = tempfile::TempDir::new().unwrap();
        let md = Arc::new(Metadata::new("ID.p.STAGE.fork0", dir.path().join("fork0")));
        let m = manager(
            "__MRO_THREADS__",
            RemoteConfig::default()
                .with_job_resources("gpu:gpus=2")
                .with_account("lab"),
        );
        let request = JobRequest::new("/bin/stage", md.clone())
            .with_args(["--fast"])
            .with_resources(JobResources::new(2, 5).with_special("gpu"))
            .with_shell_name("split");
        let params = m.template_params(&request);
        assert_eq!(params["JOB_NAME"], "ID.p.STAGE.fork0.split");
        assert_eq!(params["THREADS"], "2");
        assert_eq!(params["MEM_GB"], "5");
        assert_eq!(params["MEM_MB"], "5120");
        assert_eq!(params["MEM_GB_PER_THREAD"], "3");
        assert_eq!(params["MEM_B_PER_THREAD"], (3i64 << 30).to_string());
        assert_eq!(params["CMD"], "OMP_NUM_THREADS=2 /bin/stage --fast");
        assert_eq!(params["ACCOUNT"], "lab");
        assert_eq!(params["RESOURCES"], "-l gpus=2");
        assert_eq!(
            params["STDOUT"],
            md.file_path(MetadataFile::Stdout).display().to_string()
        );

        let request = request.with_resources(JobResources::new(2, 5).with_special("cpu"));
        assert_eq!(m.template_params(&request)["RESOURCES"], "");
    }

    #[test]
    fn test_record_job_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let md = Metadata::new("job", dir.path().join("job"));
        md.mkdirs().unwrap();

        record_job_id(&md, "Your job 123 has been submitted\n");
        assert!(!md.exists(MetadataFile::JobId));

        record_job_id(&md, "  4567.cluster\n");
        assert_eq!(md.job_id().as_deref(), Some("4567.cluster"));
    }
}
