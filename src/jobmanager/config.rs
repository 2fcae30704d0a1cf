//! Job-manager configuration.
//!
//! The job-manager directory holds `config.json`, one `<mode>.template` per
//! cluster job mode, an optional `retry.json` and any queue query scripts.
//!
//! ```json
//! {
//!   "settings": {
//!     "threads_per_job": 1,
//!     "memGB_per_job": 4,
//!     "thread_envs": ["OMP_NUM_THREADS"]
//!   },
//!   "jobmodes": {
//!     "sge": {
//!       "cmd": "qsub",
//!       "args": [],
//!       "queue_query": "sge_queue.py",
//!       "resopt": "-l __RESOURCES__",
//!       "envs": [{ "name": "SGE_ROOT", "description": "path/to/sge/root" }]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::template::JobTemplate;
use crate::error::{ConfigError, MissingEnv};

/// Name of the job-manager configuration file.
pub const CONFIG_FILE: &str = "config.json";

/// The job mode which runs everything on this host.
pub const LOCAL_MODE: &str = "local";

/// Environment variable naming the job-manager directory.
pub const JOBMANAGERS_ENV: &str = "JOBMILL_JOBMANAGERS";

/// Queue query grace period used when a mode does not set one.
pub const DEFAULT_QUEUE_GRACE: Duration = Duration::from_secs(60 * 60);

const TEMPLATE_SUFFIX: &str = ".template";

/// Default resource requests and thread-control variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManagerSettings {
    /// Environment variables set to the job's thread count.
    #[serde(default)]
    pub thread_envs: Vec<String>,
    /// Threads for jobs which do not ask for a specific amount.
    #[serde(default)]
    pub threads_per_job: i32,
    /// Memory (GB) for jobs which do not ask for a specific amount.
    #[serde(rename = "memGB_per_job", default)]
    pub mem_gb_per_job: i32,
    /// Extra virtual memory (GB) to request on top of the memory request.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub extra_vmem_per_job: i32,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

impl Default for JobManagerSettings {
    fn default() -> Self {
        Self {
            thread_envs: Vec::new(),
            threads_per_job: 1,
            mem_gb_per_job: 4,
            extra_vmem_per_job: 0,
        }
    }
}

/// A required environment variable for a job mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobModeEnv {
    pub name: String,
    pub description: String,
}

/// Configuration for one cluster job mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobModeConfig {
    /// Submission command.
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Queue query script, relative to the job-manager directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_query: Option<String>,
    /// Unset means [`DEFAULT_QUEUE_GRACE`] when a queue query is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_query_grace_secs: Option<u64>,
    /// Fragment substituted for `__MRO_RESOURCES__`. Its own `__RESOURCES__`
    /// placeholder is replaced by the job's mapped resource options.
    #[serde(rename = "resopt", default)]
    pub resources_opt: String,
    #[serde(default)]
    pub envs: Vec<JobModeEnv>,
    #[serde(default)]
    pub mem_is_vmem: bool,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    settings: Option<JobManagerSettings>,
    #[serde(default)]
    jobmodes: BTreeMap<String, JobModeConfig>,
}

/// The loaded and validated contents of `config.json`.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    dir: PathBuf,
    settings: JobManagerSettings,
    job_modes: BTreeMap<String, JobModeConfig>,
}

/// A cluster job mode which passed verification.
#[derive(Debug, Clone)]
pub struct RemoteModeConfig {
    pub mode: String,
    pub submit_cmd: String,
    pub submit_args: Vec<String>,
    /// Absolute path of the queue query script.
    pub queue_query: Option<PathBuf>,
    pub queue_query_grace: Duration,
    pub resources_opt: String,
    pub template: JobTemplate,
    /// False when the template has no `__MRO_THREADS__`.
    pub threading_enabled: bool,
    pub mem_is_vmem: bool,
}

impl JobManagerConfig {
    /// Builds a configuration directly, for callers that do not read
    /// `config.json`.
    pub fn new(dir: impl Into<PathBuf>, settings: JobManagerSettings) -> Self {
        Self {
            dir: dir.into(),
            settings,
            job_modes: BTreeMap::new(),
        }
    }

    /// Adds a job mode.
    pub fn with_job_mode(mut self, name: impl Into<String>, mode: JobModeConfig) -> Self {
        self.job_modes.insert(name.into(), mode);
        self
    }

    /// Reads and validates `config.json` from the job-manager directory.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound { path: path.clone() }
            } else {
                ConfigError::Read {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        info!(path = %path.display(), "Job config");

        let file: ConfigFile = serde_json::from_str(&content).map_err(|source| {
            ConfigError::InvalidJson {
                path: path.clone(),
                source,
            }
        })?;
        let settings = file
            .settings
            .ok_or_else(|| ConfigError::MissingSettings { path: path.clone() })?;
        if settings.threads_per_job <= 0 {
            return Err(ConfigError::InvalidThreadsPerJob { path });
        }
        if settings.mem_gb_per_job <= 0 {
            return Err(ConfigError::InvalidMemPerJob { path });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            settings,
            job_modes: file.jobmodes,
        })
    }

    /// The job-manager directory this configuration was loaded from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &JobManagerSettings {
        &self.settings
    }

    pub fn job_mode(&self, name: &str) -> Option<&JobModeConfig> {
        self.job_modes.get(name)
    }

    pub fn job_mode_names(&self) -> impl Iterator<Item = &str> {
        self.job_modes.keys().map(String::as_str)
    }

    /// Verifies a cluster job mode against the process environment.
    pub fn verify_job_mode(
        &self,
        mode: &str,
        mem_gb_per_core: i32,
    ) -> Result<RemoteModeConfig, ConfigError> {
        self.verify_job_mode_with(mode, mem_gb_per_core, |name| std::env::var(name).ok())
    }

    /// Verifies a cluster job mode, reading environment variables through
    /// `lookup_env`.
    ///
    /// `mode` is either a configured mode name, whose template is
    /// `<mode>.template` in the job-manager directory, or the path to a
    /// template file named `<mode>.template`.
    pub fn verify_job_mode_with<F>(
        &self,
        mode: &str,
        mem_gb_per_core: i32,
        lookup_env: F,
    ) -> Result<RemoteModeConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (mode_name, mode_config, template_path, hint) = match self.job_modes.get(mode) {
            Some(config) => {
                let template_path = self.dir.join(format!("{}{}", mode, TEMPLATE_SUFFIX));
                let hint = format!(
                    "\n\nTo set up a job manager template, please follow instructions in {}.example.",
                    template_path.display()
                );
                (mode.to_string(), config, template_path, hint)
            }
            None => {
                let template_path = PathBuf::from(mode);
                let name = template_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(TEMPLATE_SUFFIX))
                    .map(str::to_string);
                match name.as_deref().and_then(|n| self.job_modes.get(n)) {
                    Some(config) => (name.unwrap_or_default(), config, template_path, String::new()),
                    None if name.is_none() && !mode.contains('/') => {
                        return Err(ConfigError::UnknownJobMode {
                            path: self.dir.join(CONFIG_FILE),
                            mode: mode.to_string(),
                        })
                    }
                    None => return Err(ConfigError::BadTemplateName { path: template_path }),
                }
            }
        };

        if mode_config.args.is_empty() {
            info!("Job submit command = {}", mode_config.cmd);
        } else {
            info!(
                "Job submit command = {} {}",
                mode_config.cmd,
                mode_config.args.join(" ")
            );
        }
        info!("Job submit resources option = {}", mode_config.resources_opt);

        let template = match std::fs::read_to_string(&template_path) {
            Ok(text) => JobTemplate::new(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::TemplateNotFound {
                    path: template_path,
                    hint,
                })
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: template_path,
                    source,
                })
            }
        };
        info!(path = %template_path.display(), "Job template");

        let threading_enabled = template.has_token("THREADS");
        if !threading_enabled && mem_gb_per_core > 0 {
            warn!(
                "Thread reservations are not enabled in your job template. \
                 The --mempercore option will have no effect."
            );
        }
        if !template.has_token_with_prefix("MEM_GB")
            && !template.has_token_with_prefix("MEM_MB")
            && mem_gb_per_core <= 0
        {
            warn!(
                "Memory reservations are not enabled in your job template. \
                 To avoid memory over-subscription, enable memory reservations \
                 on your cluster, or use the --mempercore option."
            );
        }

        let search_path = lookup_env("PATH").unwrap_or_default();
        if find_executable(&mode_config.cmd, &search_path).is_none() {
            return Err(ConfigError::CommandNotFound {
                command: mode_config.cmd.clone(),
                search_path,
            });
        }

        require_env(&mode_config.envs, &lookup_env)?;

        let queue_query = mode_config.queue_query.as_ref().map(|q| self.dir.join(q));
        let queue_query_grace = match (&queue_query, mode_config.queue_query_grace_secs) {
            (None, _) => Duration::ZERO,
            (Some(_), None) => DEFAULT_QUEUE_GRACE,
            (Some(_), Some(secs)) => Duration::from_secs(secs),
        };

        Ok(RemoteModeConfig {
            mode: mode_name,
            submit_cmd: mode_config.cmd.clone(),
            submit_args: mode_config.args.clone(),
            queue_query,
            queue_query_grace,
            resources_opt: mode_config.resources_opt.clone(),
            template,
            threading_enabled,
            mem_is_vmem: mode_config.mem_is_vmem,
        })
    }
}

/// Checks that every required variable is set, reporting all that are not.
pub fn require_env<F>(envs: &[JobModeEnv], lookup_env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let missing: Vec<MissingEnv> = envs
        .iter()
        .filter(|env| lookup_env(&env.name).map_or(true, |v| v.is_empty()))
        .map(|env| MissingEnv {
            name: env.name.clone(),
            description: env.description.clone(),
        })
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingEnvironment(missing))
    }
}

/// Locates an executable. Names containing a path separator are checked
/// directly; others are searched for in `search_path`.
pub fn find_executable(name: &str, search_path: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    std::env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Resolves the job-manager directory from an explicit path, the
/// environment, or `./jobmanagers`.
pub fn jobmanagers_dir(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(JOBMANAGERS_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("jobmanagers"))
}
