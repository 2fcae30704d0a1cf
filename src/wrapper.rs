//! Stage-side job wrapper.
//!
//! Runs inside the job (locally as the job's command, on a cluster from the
//! submission script) and turns the wrapped command's lifetime into marker
//! files: `_log` when it starts, `_heartbeat` while it runs, and `_complete`
//! or `_errors` when it ends.

use std::io::Write;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::JobError;
use crate::jobmanager::{describe_exit, set_parent_death_signal};
use crate::metadata::{format_time, JobInfo, Metadata, MetadataFile, WallClockInfo};
use crate::resources::system;
use crate::shutdown::{ShutdownCoordinator, ShutdownHandler, ShutdownReason};

/// Default time between heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);

/// How a wrapped job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapOutcome {
    Complete,
    /// The job failed with this error text.
    Failed(String),
}

/// Runs one command on behalf of a job.
pub struct JobWrapper {
    metadata: Arc<Metadata>,
    shutdown: Arc<ShutdownCoordinator>,
    heartbeat_interval: Duration,
    started: SystemTime,
    child_pid: Mutex<Option<u32>>,
    high_rss_mb: AtomicI64,
}

impl JobWrapper {
    /// Creates a wrapper and registers it for shutdown, so the child is
    /// killed and the failure recorded if this process is signaled.
    pub fn new(metadata: Arc<Metadata>, shutdown: Arc<ShutdownCoordinator>) -> Arc<Self> {
        Self::with_heartbeat_interval(metadata, shutdown, HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat_interval(
        metadata: Arc<Metadata>,
        shutdown: Arc<ShutdownCoordinator>,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        let wrapper = Arc::new(Self {
            metadata,
            shutdown: Arc::clone(&shutdown),
            heartbeat_interval,
            started: SystemTime::now(),
            child_pid: Mutex::new(None),
            high_rss_mb: AtomicI64::new(0),
        });
        shutdown.register(wrapper.clone());
        wrapper
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Highest resident memory of the child's process tree seen so far.
    pub fn high_rss_mb(&self) -> i64 {
        self.high_rss_mb.load(Ordering::Relaxed)
    }

    /// Runs `argv` to completion in the job's files directory.
    ///
    /// Failures of the command itself are recorded in the metadata and
    /// returned as [`WrapOutcome::Failed`]. An error is returned only when
    /// `argv` is empty or the metadata directory cannot be used.
    pub async fn run(&self, argv: &[String]) -> Result<WrapOutcome, JobError> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            JobError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no command to run",
            ))
        })?;
        self.metadata.mkdirs()?;
        self.update_job_info();
        self.append_log("__start__")?;
        info!(job = %self.metadata.fqname(), command = %program, "Job started");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(self.metadata.files_path())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        set_parent_death_signal(&mut cmd);

        let spawned = {
            let _section = self.shutdown.enter_critical_section().await;
            cmd.spawn().inspect(|child| {
                *self.child_pid.lock().unwrap_or_else(|e| e.into_inner()) = child.id();
            })
        };
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let text = format!("Error starting job.\n\n{}: {}\n", program, e);
                return Ok(self.fail(text).await);
            }
        };
        self.sample_memory();

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = heartbeat.tick() => {
                    self.sample_memory();
                    if let Err(e) = self.metadata.write_time(MetadataFile::Heartbeat) {
                        warn!(error = %e, "Could not write heartbeat");
                    }
                }
            }
        };
        *self.child_pid.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                let text = format!("Job failed in stage code\n\n{}\n", e);
                return Ok(self.fail(text).await);
            }
        };
        if status.success() && !self.job_reported_failure() {
            let _section = self.shutdown.enter_critical_section().await;
            self.done();
            self.metadata.write_time(MetadataFile::Complete)?;
            info!(job = %self.metadata.fqname(), "Job complete");
            Ok(WrapOutcome::Complete)
        } else {
            let text = format!("Job failed in stage code\n\n{}\n", describe_exit(status));
            Ok(self.fail(text).await)
        }
    }

    /// Records a failure, keeping any error the job wrote itself.
    async fn fail(&self, text: String) -> WrapOutcome {
        let _section = self.shutdown.enter_critical_section().await;
        self.done();
        if let Some(own) = self.reported_error() {
            return WrapOutcome::Failed(own);
        }
        error!(job = %self.metadata.fqname(), "{}", text.trim());
        let _ = self.metadata.write_raw(MetadataFile::Errors, &text);
        WrapOutcome::Failed(text)
    }

    fn job_reported_failure(&self) -> bool {
        self.metadata.exists(MetadataFile::Errors) || self.metadata.exists(MetadataFile::Assert)
    }

    fn reported_error(&self) -> Option<String> {
        [MetadataFile::Errors, MetadataFile::Assert]
            .into_iter()
            .find_map(|file| self.metadata.read_raw(file).ok())
    }

    /// Records where and as what process the job is running.
    fn update_job_info(&self) {
        let mut info = self.metadata.read_job_info().unwrap_or_else(|_| JobInfo {
            name: self.metadata.fqname().to_string(),
            ..Default::default()
        });
        info.pid = Some(std::process::id());
        info.host = sysinfo::System::host_name();
        info.cwd = Some(self.metadata.files_path().display().to_string());
        if let Err(e) = self.metadata.write_job_info(&info) {
            warn!(error = %e, "Could not write updated job info");
        }
    }

    /// Writes the end time into the job info and the log.
    fn done(&self) {
        if let Err(e) = self.append_log("__end__") {
            debug!(error = %e, "Could not write job log");
        }
        let Ok(mut info) = self.metadata.read_job_info() else {
            return;
        };
        let end = SystemTime::now();
        info.wallclock = Some(WallClockInfo {
            start: format_time(self.started),
            end: format_time(end),
            duration_seconds: end
                .duration_since(self.started)
                .unwrap_or_default()
                .as_secs_f64(),
        });
        if let Err(e) = self.metadata.write_job_info(&info) {
            warn!(error = %e, "Could not write final job info");
        }
        let high = self.high_rss_mb();
        if high > 0 {
            debug!(job = %self.metadata.fqname(), rss_mb = high, "Peak memory");
        }
    }

    fn append_log(&self, event: &str) -> std::io::Result<()> {
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.metadata.file_path(MetadataFile::Log))?;
        writeln!(log, "{} [time] {}", format_time(SystemTime::now()), event)
    }

    fn sample_memory(&self) {
        let pid = *self.child_pid.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pid) = pid {
            self.high_rss_mb
                .fetch_max(system::process_tree_rss_mb(pid), Ordering::Relaxed);
        }
    }

    #[cfg(unix)]
    fn kill_child(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = *self.child_pid.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!(pid, error = %e, "Could not kill job");
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_child(&self) {}
}

impl ShutdownHandler for JobWrapper {
    fn handle_shutdown(&self, reason: &ShutdownReason) {
        self.kill_child();
        if let ShutdownReason::Signal(_) = reason {
            info!("{}", reason);
            self.done();
            let _ = self
                .metadata
                .write_raw(MetadataFile::Errors, &reason.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataState;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> Arc<Metadata> {
        let md = Arc::new(Metadata::new("ID.p.STAGE.fork0.chnk0", dir.path().join("chnk0")));
        md.mkdirs().unwrap();
        md.write_job_info(&JobInfo {
            name: "STAGE".to_string(),
            threads: 1,
            mem_gb: 1,
            ..Default::default()
        })
        .unwrap();
        md
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_successful_job_completes() {
        let dir = TempDir::new().unwrap();
        let md = setup(&dir);
        let wrapper = JobWrapper::new(md.clone(), Arc::new(ShutdownCoordinator::new()));

        let outcome = wrapper.run(&sh("echo hi > out.txt")).await.unwrap();
        assert_eq!(outcome, WrapOutcome::Complete);
        assert_eq!(md.state(), MetadataState::COMPLETE);
        assert!(md.files_path().join("out.txt").exists());

        let info = md.read_job_info().unwrap();
        assert_eq!(info.name, "STAGE");
        assert_eq!(info.pid, Some(std::process::id()));
        assert!(info.wallclock.is_some());
        let log = md.read_raw(MetadataFile::Log).unwrap();
        assert!(log.contains("__start__"));
        assert!(log.contains("__end__"));
    }

    #[tokio::test]
    async fn test_failed_job_records_exit_status() {
        let dir = TempDir::new().unwrap();
        let md = setup(&dir);
        let wrapper = JobWrapper::new(md.clone(), Arc::new(ShutdownCoordinator::new()));

        let outcome = wrapper.run(&sh("exit 3")).await.unwrap();
        assert!(matches!(outcome, WrapOutcome::Failed(ref t) if t.contains("exit status 3")));
        assert_eq!(md.state(), MetadataState::FAILED);
        assert!(md
            .read_raw(MetadataFile::Errors)
            .unwrap()
            .contains("exit status 3"));
    }

    #[tokio::test]
    async fn test_job_error_is_preserved() {
        let dir = TempDir::new().unwrap();
        let md = setup(&dir);
        let wrapper = JobWrapper::new(md.clone(), Arc::new(ShutdownCoordinator::new()));

        let outcome = wrapper
            .run(&sh("printf 'bad input' > ../_errors; exit 1"))
            .await
            .unwrap();
        assert_eq!(outcome, WrapOutcome::Failed("bad input".to_string()));
        assert_eq!(md.read_raw(MetadataFile::Errors).unwrap(), "bad input");
    }

    #[tokio::test]
    async fn test_missing_command_fails() {
        let dir = TempDir::new().unwrap();
        let md = setup(&dir);
        let wrapper = JobWrapper::new(md.clone(), Arc::new(ShutdownCoordinator::new()));
        let outcome = wrapper
            .run(&["/definitely/not/a/command".to_string()])
            .await
            .unwrap();
        assert!(matches!(outcome, WrapOutcome::Failed(ref t) if t.starts_with("Error starting job.")));
        assert!(wrapper.run(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_written_while_running() {
        let dir = TempDir::new().unwrap();
        let md = setup(&dir);
        let wrapper = JobWrapper::with_heartbeat_interval(
            md.clone(),
            Arc::new(ShutdownCoordinator::new()),
            Duration::from_millis(50),
        );
        let outcome = wrapper.run(&sh("sleep 0.3")).await.unwrap();
        assert_eq!(outcome, WrapOutcome::Complete);
        assert!(md.exists(MetadataFile::Heartbeat));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_kills_child_and_records_error() {
        let dir = TempDir::new().unwrap();
        let md = setup(&dir);
        let wrapper = JobWrapper::new(md.clone(), Arc::new(ShutdownCoordinator::new()));

        let running = {
            let wrapper = Arc::clone(&wrapper);
            tokio::spawn(async move { wrapper.run(&sh("sleep 30")).await })
        };
        for _ in 0..100 {
            if wrapper.child_pid.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        wrapper.handle_shutdown(&ShutdownReason::Signal("terminated"));

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            WrapOutcome::Failed("Caught signal terminated".to_string())
        );
        assert_eq!(md.state(), MetadataState::FAILED);
    }
}
