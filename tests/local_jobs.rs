//! End-to-end tests for the local backend with real `/bin/sh` jobs.

use std::sync::Arc;
use std::time::Duration;

use jobmill::jobmanager::{JobManagerSettings, LocalConfig, LocalJobManager};
use jobmill::{JobManager, JobRequest, JobResources, Metadata, MetadataFile, ShutdownCoordinator};
use tempfile::TempDir;

fn local_manager(cores: i32) -> JobManager {
    let settings = JobManagerSettings {
        thread_envs: vec!["OMP_NUM_THREADS".to_string()],
        ..Default::default()
    };
    let config = LocalConfig::default()
        .with_max_cores(cores)
        .with_max_mem_gb(2);
    JobManager::Local(
        LocalJobManager::new(config, settings, Arc::new(ShutdownCoordinator::new()))
            .expect("local manager"),
    )
}

/// A backend which retries jobs exiting with status 7.
fn retrying_manager() -> JobManager {
    let config = LocalConfig::default()
        .with_max_cores(2)
        .with_max_mem_gb(2)
        .with_transient_signature("exit status 7")
        .with_initial_backoff(Duration::from_millis(10))
        .with_max_retries(3);
    JobManager::Local(
        LocalJobManager::new(
            config,
            JobManagerSettings::default(),
            Arc::new(ShutdownCoordinator::new()),
        )
        .expect("local manager"),
    )
}

/// Counts attempts in `attempts` and exits 7 until the `succeed_on`th one.
const COUNTING_JOB: &str = "n=$(cat attempts 2>/dev/null || echo 0); n=$((n+1)); \
echo $n > attempts; [ \"$n\" -ge \"$1\" ] || exit 7";

fn counting_job(md: &Arc<Metadata>, succeed_on: u32) -> JobRequest {
    JobRequest::new("/bin/sh", Arc::clone(md))
        .with_args(vec![
            "-c".to_string(),
            COUNTING_JOB.to_string(),
            "job".to_string(),
            succeed_on.to_string(),
        ])
        .with_resources(JobResources::new(1, 1))
}

fn attempts(md: &Metadata) -> u32 {
    std::fs::read_to_string(md.files_path().join("attempts"))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

fn metadata(dir: &TempDir, name: &str) -> Arc<Metadata> {
    let md = Metadata::new(format!("ID.test.{}", name), dir.path().join(name));
    md.mkdirs().unwrap();
    md.write_time(MetadataFile::QueuedLocally).unwrap();
    Arc::new(md)
}

fn sh(md: &Arc<Metadata>, script: &str) -> JobRequest {
    JobRequest::new("/bin/sh", Arc::clone(md))
        .with_args(["-c", script])
        .with_resources(JobResources::new(1, 1))
}

#[tokio::test]
async fn test_successful_job_writes_no_errors() {
    let dir = TempDir::new().unwrap();
    let manager = local_manager(2);
    let md = metadata(&dir, "ok");

    manager
        .exec_job(sh(&md, "echo hello; echo oops >&2"))
        .await
        .unwrap();

    assert!(!md.exists(MetadataFile::Errors));
    assert!(!md.exists(MetadataFile::QueuedLocally));
    let stdout = md.read_raw(MetadataFile::Stdout).unwrap();
    assert_eq!(stdout, "[stdout]\nhello\n");
    let stderr = md.read_raw(MetadataFile::Stderr).unwrap();
    assert_eq!(stderr, "[stderr]\noops\n");
}

#[tokio::test]
async fn test_job_runs_in_files_directory() {
    let dir = TempDir::new().unwrap();
    let manager = local_manager(2);
    let md = metadata(&dir, "cwd");

    manager.exec_job(sh(&md, "echo data > out.txt")).await.unwrap();

    assert_eq!(
        std::fs::read_to_string(md.files_path().join("out.txt")).unwrap(),
        "data\n"
    );
}

#[tokio::test]
async fn test_failed_job_records_exit_status() {
    let dir = TempDir::new().unwrap();
    let manager = local_manager(2);
    let md = metadata(&dir, "fail");

    manager.exec_job(sh(&md, "exit 1")).await.unwrap();

    assert_eq!(md.read_raw(MetadataFile::Errors).unwrap(), "exit status 1");
    assert_eq!(md.state(), jobmill::MetadataState::FAILED);
}

#[tokio::test]
async fn test_job_written_errors_are_kept() {
    let dir = TempDir::new().unwrap();
    let manager = local_manager(2);
    let md = metadata(&dir, "own");

    manager
        .exec_job(sh(&md, "printf 'assertion in stage code' > ../_errors; exit 2"))
        .await
        .unwrap();

    assert_eq!(
        md.read_raw(MetadataFile::Errors).unwrap(),
        "assertion in stage code"
    );
}

#[tokio::test]
async fn test_missing_executable_fails() {
    let dir = TempDir::new().unwrap();
    let manager = local_manager(2);
    let md = metadata(&dir, "missing");

    let request = JobRequest::new("/definitely/not/here", Arc::clone(&md));
    manager.exec_job(request).await.unwrap();

    let errors = md.read_raw(MetadataFile::Errors).unwrap();
    assert!(errors.starts_with("/definitely/not/here"));
}

#[tokio::test]
async fn test_core_limit_serializes_jobs() {
    let dir = TempDir::new().unwrap();
    let manager = local_manager(1);
    let lock = dir.path().join("running");
    let script = format!(
        "if [ -e {0} ]; then exit 1; fi; touch {0}; sleep 0.2; rm {0}",
        lock.display()
    );

    let a = metadata(&dir, "a");
    let b = metadata(&dir, "b");
    let ha = manager.exec_job(sh(&a, &script));
    let hb = manager.exec_job(sh(&b, &script));
    ha.await.unwrap();
    hb.await.unwrap();

    assert!(!a.exists(MetadataFile::Errors));
    assert!(!b.exists(MetadataFile::Errors));
}

#[tokio::test]
async fn test_thread_env_set_when_cores_limited() {
    let dir = TempDir::new().unwrap();
    // A single core is below any host's CPU count only when the host has
    // more than one; skip the check otherwise.
    if num_cpus_available() <= 1 {
        return;
    }
    let manager = local_manager(1);
    let md = metadata(&dir, "env");

    manager
        .exec_job(sh(&md, "echo \"threads=$OMP_NUM_THREADS\""))
        .await
        .unwrap();

    let stdout = md.read_raw(MetadataFile::Stdout).unwrap();
    assert!(stdout.contains("threads=1"));
}

fn num_cpus_available() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[tokio::test]
async fn test_transient_failure_is_retried_until_success() {
    let dir = TempDir::new().unwrap();
    let manager = retrying_manager();
    let md = metadata(&dir, "flaky");

    manager.exec_job(counting_job(&md, 3)).await.unwrap();

    assert_eq!(attempts(&md), 3);
    assert!(!md.exists(MetadataFile::Errors));
}

#[tokio::test]
async fn test_transient_failure_stops_at_retry_ceiling() {
    let dir = TempDir::new().unwrap();
    let manager = retrying_manager();
    let md = metadata(&dir, "broken");

    manager.exec_job(counting_job(&md, 100)).await.unwrap();

    // One attempt plus three retries.
    assert_eq!(attempts(&md), 4);
    assert_eq!(md.read_raw(MetadataFile::Errors).unwrap(), "exit status 7");
}

#[tokio::test]
async fn test_request_retry_count_counts_against_ceiling() {
    let dir = TempDir::new().unwrap();
    let manager = retrying_manager();
    let md = metadata(&dir, "resumed");

    let request = counting_job(&md, 100)
        .with_retries(2)
        .with_wait(Duration::from_millis(5));
    manager.exec_job(request).await.unwrap();

    assert_eq!(attempts(&md), 2);
    assert_eq!(md.read_raw(MetadataFile::Errors).unwrap(), "exit status 7");
}

#[tokio::test]
async fn test_other_failures_are_not_retried() {
    let dir = TempDir::new().unwrap();
    let manager = retrying_manager();
    let md = metadata(&dir, "fatal");

    manager
        .exec_job(sh(&md, "n=$(cat attempts 2>/dev/null || echo 0); echo $((n+1)) > attempts; exit 1"))
        .await
        .unwrap();

    assert_eq!(attempts(&md), 1);
    assert_eq!(md.read_raw(MetadataFile::Errors).unwrap(), "exit status 1");
}

#[tokio::test]
async fn test_preflight_stdout_goes_to_console() {
    let dir = TempDir::new().unwrap();
    let manager = local_manager(2);
    let md = metadata(&dir, "preflight");

    let request = sh(&md, "echo visible; echo logged >&2").with_preflight(true);
    manager.exec_job(request).await.unwrap();

    assert!(!md.exists(MetadataFile::Errors));
    assert_eq!(md.read_raw(MetadataFile::Stdout).unwrap(), "[stdout]\n");
    assert_eq!(md.read_raw(MetadataFile::Stderr).unwrap(), "[stderr]\nlogged\n");
}
