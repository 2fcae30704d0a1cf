//! CLI command definitions for jobmill.
//!
//! `run` is the driver side: it builds the configured backend, submits a
//! command wrapped in `jobmill wrap`, and follows the job's metadata until
//! it finishes, resubmitting transient failures. The other commands are
//! small tools around the same pieces.

use crate::error::ConfigError;
use crate::jobmanager::config::{jobmanagers_dir, LOCAL_MODE};
use crate::jobmanager::{
    JobManager, JobManagerConfig, JobRequest, JobResources, LocalConfig, LocalJobManager,
    QueueMonitor, RemoteConfig, RemoteJobManager,
};
use crate::metadata::{JobInfo, Metadata, MetadataFile, MetadataState};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownCoordinator;
use crate::wrapper::{JobWrapper, WrapOutcome};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default time between metadata polls while following a job.
const DEFAULT_POLL_MS: u64 = 1000;

/// Pipeline job admission, scheduling and lifecycle tracking.
#[derive(Parser)]
#[command(name = "jobmill")]
#[command(about = "Run pipeline stage jobs locally or on a cluster scheduler")]
#[command(version)]
#[command(
    long_about = "jobmill runs stage jobs on this host, gated by core and memory limits, or submits them to a cluster scheduler through a job template.\n\nJob state lives in marker files in each job's metadata directory.\n\nExample usage:\n  jobmill run --jobmode sge --metadata ./ID/STAGE/fork0 -- ./stage.sh input.json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a command as a job and wait for it to finish.
    Run(RunArgs),

    /// Run a command inside a job, recording its progress in the job's
    /// metadata directory. Invoked by `run`, not usually by hand.
    Wrap(WrapArgs),

    /// Print the submission script a cluster job mode would use.
    Render(RenderArgs),

    /// Ask a cluster job mode's queue query which job ids it still knows.
    #[command(name = "check-queue")]
    CheckQueue(CheckQueueArgs),

    /// Show the state of a job's metadata directory.
    Status(StatusArgs),
}

/// Backend selection and operator limits.
#[derive(clap::Args, Debug, Clone)]
pub struct BackendArgs {
    /// Job-manager directory holding config.json, templates and retry.json.
    #[arg(long, env = "JOBMILL_JOBMANAGERS")]
    pub jobmanagers: Option<PathBuf>,

    /// Job mode: `local`, a configured cluster mode, or a path to
    /// `<mode>.template`.
    #[arg(long, default_value = LOCAL_MODE)]
    pub jobmode: String,

    /// Cores to use for local jobs.
    #[arg(long)]
    pub localcores: Option<i32>,

    /// Memory (GB) to use for local jobs.
    #[arg(long)]
    pub localmem: Option<i32>,

    /// Track the load average when admitting local jobs.
    #[arg(long)]
    pub limit_loadavg: bool,

    /// Memory (GB) per cluster core. Cluster thread requests grow to cover
    /// memory requests.
    #[arg(long)]
    pub mempercore: Option<i32>,

    /// Maximum cluster jobs outstanding at once. 0 is unlimited.
    #[arg(long, default_value = "0")]
    pub maxjobs: usize,

    /// Minimum milliseconds between cluster submissions.
    #[arg(long)]
    pub jobinterval: Option<u64>,

    /// Resource flavor mapping, `flavor:options;flavor2:options2`.
    #[arg(long, env = "MRO_JOBRESOURCES", default_value = "")]
    pub jobresources: String,

    /// Account tag for cluster submissions.
    #[arg(long, env = "MRO_ACCOUNT")]
    pub account: Option<String>,
}

/// Identity and resource request of a job.
#[derive(clap::Args, Debug, Clone)]
pub struct JobArgs {
    /// Metadata directory of the job.
    #[arg(long)]
    pub metadata: PathBuf,

    /// Fully-qualified job name. Defaults to the metadata directory name.
    #[arg(long)]
    pub name: Option<String>,

    /// Threads requested. 0 is the default; negative asks for at least the
    /// absolute value, more if available.
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    pub threads: i32,

    /// Memory (GB) requested, with the same conventions as --threads.
    #[arg(long = "mem-gb", default_value = "0", allow_negative_numbers = true)]
    pub mem_gb: i32,

    /// Resource flavor, mapped through --jobresources.
    #[arg(long)]
    pub special: Option<String>,

    /// Phase name used in the cluster job name.
    #[arg(long, default_value = "main")]
    pub shell_name: String,

    /// Local preflight check: the job's stdout goes to this console.
    #[arg(long)]
    pub preflight: bool,

    /// Command to run, with its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Arguments for `jobmill run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Automatic retries of transient failures. Overrides retry.json.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Milliseconds between metadata polls.
    #[arg(long, default_value_t = DEFAULT_POLL_MS)]
    pub poll_ms: u64,

    /// Seconds between cluster queue queries.
    #[arg(long)]
    pub queue_check_secs: Option<u64>,

    #[command(flatten)]
    pub job: JobArgs,
}

/// Arguments for `jobmill wrap`.
#[derive(Parser, Debug)]
pub struct WrapArgs {
    /// Metadata directory of the job.
    #[arg(long)]
    pub metadata: PathBuf,

    /// Fully-qualified job name. Defaults to the metadata directory name.
    #[arg(long)]
    pub name: Option<String>,

    /// Seconds between heartbeats.
    #[arg(long, default_value = "120")]
    pub heartbeat_secs: u64,

    /// Command to run, with its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Arguments for `jobmill render`.
#[derive(Parser, Debug)]
pub struct RenderArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub job: JobArgs,
}

/// Arguments for `jobmill check-queue`.
#[derive(Parser, Debug)]
pub struct CheckQueueArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Job ids to look for.
    #[arg(required = true)]
    pub ids: Vec<String>,
}

/// Arguments for `jobmill status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Metadata directory of the job.
    pub metadata: PathBuf,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// State of a job, as printed by `jobmill status`.
#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub path: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_info: Option<JobInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_job_command(args).await?,
        Commands::Wrap(args) => run_wrap_command(args).await?,
        Commands::Render(args) => run_render_command(args)?,
        Commands::CheckQueue(args) => run_check_queue_command(args).await?,
        Commands::Status(args) => run_status_command(args)?,
    }
    Ok(())
}

fn job_name(metadata: &Path, name: Option<&str>) -> String {
    name.map(str::to_string).unwrap_or_else(|| {
        metadata
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| metadata.display().to_string())
    })
}

fn non_negative(key: &str, value: Option<i32>) -> Result<i32, ConfigError> {
    match value {
        Some(v) if v < 0 => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must not be negative, got {}", v),
        }),
        v => Ok(v.unwrap_or(0)),
    }
}

/// Creates the backend selected by `args`. Any configuration problem is
/// returned before a job is started.
pub fn build_job_manager(
    args: &BackendArgs,
    config: &JobManagerConfig,
    shutdown: Arc<ShutdownCoordinator>,
) -> Result<JobManager, ConfigError> {
    if args.jobmode == LOCAL_MODE {
        let local = LocalConfig::default()
            .with_max_cores(non_negative("--localcores", args.localcores)?)
            .with_max_mem_gb(non_negative("--localmem", args.localmem)?)
            .with_limit_load(args.limit_loadavg);
        let manager = LocalJobManager::new(local, config.settings().clone(), shutdown)?;
        return Ok(JobManager::Local(manager));
    }

    let mut remote = RemoteConfig::default()
        .with_mem_gb_per_core(non_negative("--mempercore", args.mempercore)?)
        .with_max_jobs(args.maxjobs)
        .with_job_interval(Duration::from_millis(args.jobinterval.unwrap_or(0)))
        .with_job_resources(args.jobresources.clone());
    if let Some(account) = &args.account {
        remote = remote.with_account(account.clone());
    }
    let manager = RemoteJobManager::new(config, &args.jobmode, remote, shutdown)?;
    Ok(JobManager::Remote(manager))
}

fn load_config(args: &BackendArgs) -> Result<JobManagerConfig, ConfigError> {
    let dir = jobmanagers_dir(args.jobmanagers.as_deref());
    JobManagerConfig::load(&dir)
}

fn job_request(job: &JobArgs, metadata: Arc<Metadata>, command: Vec<String>) -> JobRequest {
    let mut resources = JobResources::new(job.threads, job.mem_gb);
    if let Some(special) = &job.special {
        resources = resources.with_special(special.clone());
    }
    let (program, args) = match command.split_first() {
        Some((program, args)) => (program.clone(), args.to_vec()),
        None => (String::new(), Vec::new()),
    };
    JobRequest::new(program, metadata)
        .with_args(args)
        .with_resources(resources)
        .with_shell_name(job.shell_name.clone())
        .with_preflight(job.preflight)
}

/// The command line the backend runs: this executable's `wrap` command
/// around the user's command.
fn wrapped_command(job: &JobArgs, fqname: &str) -> anyhow::Result<Vec<String>> {
    let exe = std::env::current_exe()?;
    let mut argv = vec![
        exe.display().to_string(),
        "wrap".to_string(),
        "--metadata".to_string(),
        job.metadata.display().to_string(),
        "--name".to_string(),
        fqname.to_string(),
        "--".to_string(),
    ];
    argv.extend(job.command.iter().cloned());
    Ok(argv)
}

async fn run_job_command(args: RunArgs) -> anyhow::Result<()> {
    let shutdown = Arc::new(ShutdownCoordinator::new());
    shutdown.spawn_signal_listener();

    let config = load_config(&args.backend)?;
    let mut policy = RetryPolicy::load(config.dir())?;
    if let Some(retries) = args.retries {
        policy = policy.with_retries(retries);
    }
    let manager = build_job_manager(&args.backend, &config, Arc::clone(&shutdown))?;
    let local_mode = matches!(manager, JobManager::Local(_));

    let fqname = job_name(&args.job.metadata, args.job.name.as_deref());
    let metadata = Arc::new(Metadata::new(fqname.clone(), &args.job.metadata));
    if metadata.restart_queued_local()? {
        info!(job = %fqname, "Restarting job which was queued locally when its driver exited");
    }
    metadata.mkdirs()?;

    let mut monitor = QueueMonitor::new(manager.clone());
    if let Some(secs) = args.queue_check_secs {
        monitor = monitor.with_interval(Duration::from_secs(secs));
    }
    let poll = Duration::from_millis(args.poll_ms.max(1));
    let command = wrapped_command(&args.job, &fqname)?;

    let mut retries = 0;
    loop {
        let request = job_request(&args.job, Arc::clone(&metadata), command.clone());
        let res = manager.system_reqs(&request.resources);
        metadata.write_job_info(&JobInfo {
            name: fqname.clone(),
            threads: res.threads,
            mem_gb: res.mem_gb,
            job_mode: Some(manager.mode_name().to_string()),
            ..Default::default()
        })?;
        metadata.write_time(MetadataFile::QueuedLocally)?;
        info!(job = %fqname, mode = %manager.mode_name(), threads = res.threads, mem_gb = res.mem_gb, "Queued job");

        let handle = manager.exec_job(request);
        let state = follow_job(&manager, &monitor, &metadata, local_mode, &handle, poll).await;
        manager.end_job(&metadata);

        if state == MetadataState::COMPLETE || state == MetadataState::DISABLED {
            info!(job = %fqname, state = %state, "Job finished");
            println!("{}", state);
            return Ok(());
        }

        let (retry, text) = policy.should_retry(&metadata, retries);
        if retry {
            retries += 1;
            warn!(
                job = %fqname,
                "Transient error detected. Retrying ({} of {}):\n{}",
                retries,
                policy.default_retries(),
                text.trim()
            );
            metadata.reset()?;
            continue;
        }
        error!(job = %fqname, "Job failed");
        return Err(anyhow::anyhow!("Job {} failed:\n{}", fqname, text.trim()));
    }
}

/// Polls the job's metadata until it reaches a terminal state.
async fn follow_job(
    manager: &JobManager,
    monitor: &QueueMonitor,
    metadata: &Arc<Metadata>,
    local_mode: bool,
    handle: &tokio::task::JoinHandle<()>,
    poll: Duration,
) -> MetadataState {
    let jobs = [Arc::clone(metadata)];
    loop {
        tokio::time::sleep(poll).await;
        manager.refresh_resources(local_mode);
        monitor.poll(&jobs).await;
        let state = metadata.state();
        if state.is_terminal() {
            return state;
        }
        // The job may have finished between the state read and this check.
        if local_mode && handle.is_finished() && !metadata.state().is_terminal() {
            let _ = metadata.write_raw(
                MetadataFile::Errors,
                "Job exited without reporting completion.",
            );
            return MetadataState::FAILED;
        }
    }
}

async fn run_wrap_command(args: WrapArgs) -> anyhow::Result<()> {
    let shutdown = Arc::new(ShutdownCoordinator::new());
    shutdown.spawn_signal_listener();

    let fqname = job_name(&args.metadata, args.name.as_deref());
    let metadata = Arc::new(Metadata::new(fqname, &args.metadata));
    let wrapper = JobWrapper::with_heartbeat_interval(
        metadata,
        shutdown,
        Duration::from_secs(args.heartbeat_secs.max(1)),
    );
    // The outcome is in the metadata; the driver reads it from there.
    if let WrapOutcome::Failed(text) = wrapper.run(&args.command).await? {
        warn!("Job failed: {}", text.trim());
    }
    Ok(())
}

fn run_render_command(args: RenderArgs) -> anyhow::Result<()> {
    let config = load_config(&args.backend)?;
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let manager = match build_job_manager(&args.backend, &config, shutdown)? {
        JobManager::Remote(manager) => manager,
        JobManager::Local(_) => {
            return Err(anyhow::anyhow!(
                "Job mode '{}' does not use a job template",
                args.backend.jobmode
            ))
        }
    };
    let fqname = job_name(&args.job.metadata, args.job.name.as_deref());
    let metadata = Arc::new(Metadata::new(fqname, &args.job.metadata));
    let request = job_request(&args.job, metadata, args.job.command.clone());
    print!("{}", manager.job_script(&request));
    Ok(())
}

async fn run_check_queue_command(args: CheckQueueArgs) -> anyhow::Result<()> {
    let config = load_config(&args.backend)?;
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let manager = build_job_manager(&args.backend, &config, shutdown)?;
    if !manager.has_queue_check() {
        warn!(mode = %manager.mode_name(), "Job mode has no queue query; all ids are assumed queued");
    }
    let (known, raw) = manager.check_queue(&args.ids).await;
    if !raw.trim().is_empty() {
        info!("Queue query output:\n{}", raw.trim_end());
    }
    for id in known.iter().filter(|id| !id.trim().is_empty()) {
        println!("{}", id.trim());
    }
    Ok(())
}

/// Reads the state of a metadata directory.
pub fn job_status(path: &Path) -> StatusOutput {
    let metadata = Metadata::new(job_name(path, None), path);
    let state = metadata.state();
    StatusOutput {
        path: path.display().to_string(),
        state: state.to_string(),
        job_id: metadata.job_id(),
        job_info: metadata.read_job_info().ok(),
        errors: [MetadataFile::Errors, MetadataFile::Assert]
            .into_iter()
            .find_map(|file| metadata.read_raw(file).ok()),
    }
}

fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    if !args.metadata.is_dir() {
        return Err(anyhow::anyhow!(
            "Metadata directory does not exist: {}",
            args.metadata.display()
        ));
    }
    let status = job_status(&args.metadata);
    if args.json {
        let json = serde_json::to_string_pretty(&status)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json);
        return Ok(());
    }
    println!("{}: {}", status.path, status.state);
    if let Some(id) = &status.job_id {
        println!("job id: {}", id);
    }
    if let Some(errors) = &status.errors {
        println!("{}", errors.trim_end());
    }
    Ok(())
}
