//! Queue monitor behaviour against a remote backend with a scripted queue
//! query.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jobmill::jobmanager::{JobManagerConfig, QueueMonitor, RemoteConfig, RemoteJobManager};
use jobmill::metadata::JobInfo;
use jobmill::{JobManager, Metadata, MetadataFile, MetadataState, ShutdownCoordinator};
use tempfile::TempDir;

fn write_executable(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// A remote backend whose queue query only knows job ids listed in the
/// `known` file of the job-manager directory.
fn manager(dir: &TempDir, grace_secs: u64) -> JobManager {
    let jm = dir.path().join("jobmanagers");
    std::fs::create_dir_all(&jm).unwrap();
    write_executable(&jm.join("submit.sh"), "#!/bin/sh\ncat >/dev/null\n");
    write_executable(
        &jm.join("query.sh"),
        "#!/bin/sh\ntouch known\ngrep -x -F -f known || true\n",
    );
    let config = format!(
        r#"{{
            "settings": {{"threads_per_job": 1, "memGB_per_job": 1}},
            "jobmodes": {{
                "fake": {{
                    "cmd": "{}",
                    "queue_query": "query.sh",
                    "queue_query_grace_secs": {}
                }}
            }}
        }}"#,
        jm.join("submit.sh").display(),
        grace_secs
    );
    std::fs::write(jm.join("config.json"), config).unwrap();
    std::fs::write(jm.join("fake.template"), "__MRO_CMD__\n").unwrap();
    let config = JobManagerConfig::load(&jm).unwrap();
    JobManager::Remote(
        RemoteJobManager::new(
            &config,
            "fake",
            RemoteConfig::default(),
            Arc::new(ShutdownCoordinator::new()),
        )
        .unwrap(),
    )
}

fn set_known(dir: &TempDir, ids: &[&str]) {
    let mut text = ids.join("\n");
    text.push('\n');
    std::fs::write(dir.path().join("jobmanagers").join("known"), text).unwrap();
}

fn submitted_job(dir: &TempDir, name: &str, id: &str) -> Arc<Metadata> {
    let md = Metadata::new(name, dir.path().join(name));
    md.mkdirs().unwrap();
    md.write_job_info(&JobInfo {
        name: name.to_string(),
        ..Default::default()
    })
    .unwrap();
    md.write_raw(MetadataFile::JobId, id).unwrap();
    Arc::new(md)
}

#[tokio::test]
async fn test_job_missing_past_grace_is_failed() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 1);
    assert!(manager.has_queue_check());
    assert_eq!(manager.queue_check_grace(), Duration::from_secs(1));

    let monitor = QueueMonitor::new(manager).with_interval(Duration::ZERO);
    let kept = submitted_job(&dir, "kept", "100");
    let lost = submitted_job(&dir, "lost", "200");
    let jobs = vec![Arc::clone(&kept), Arc::clone(&lost)];
    set_known(&dir, &["100"]);

    let report = monitor.poll(&jobs).await;
    assert_eq!(report.queried, Some(2));
    assert_eq!(report.missing, vec!["lost"]);
    assert!(report.failed.is_empty());

    // Inside the grace period nothing fails.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = monitor.poll(&jobs).await;
    assert!(report.failed.is_empty());
    assert_eq!(lost.state(), MetadataState::QUEUED);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let report = monitor.poll(&jobs).await;
    assert_eq!(report.failed, vec!["lost"]);
    assert_eq!(lost.state(), MetadataState::FAILED);
    assert_eq!(kept.state(), MetadataState::QUEUED);
    let errors = lost.read_raw(MetadataFile::Errors).unwrap();
    assert!(errors.starts_with("According to the job manager, the job for lost was not queued or running"));
}

#[tokio::test]
async fn test_job_reappearing_is_not_failed_for_old_absence() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 1);
    let monitor = QueueMonitor::new(manager).with_interval(Duration::ZERO);
    let md = submitted_job(&dir, "flaky", "300");
    let jobs = vec![Arc::clone(&md)];

    set_known(&dir, &[]);
    monitor.poll(&jobs).await;
    assert!(md.not_running_since().is_some());

    // The job finished on its own before the grace period ran out.
    md.write_time(MetadataFile::Complete).unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let report = monitor.poll(&jobs).await;
    assert!(report.failed.is_empty());
    assert_eq!(md.state(), MetadataState::COMPLETE);
}

#[tokio::test]
async fn test_running_job_without_heartbeat_is_failed() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, 3600);
    let monitor = QueueMonitor::new(manager)
        .with_interval(Duration::ZERO)
        .with_heartbeat_timeout(Duration::from_millis(200));
    let md = submitted_job(&dir, "silent", "400");
    set_known(&dir, &["400"]);
    md.write_time(MetadataFile::Log).unwrap();
    let jobs = vec![Arc::clone(&md)];

    let report = monitor.poll(&jobs).await;
    assert!(report.failed.is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let report = monitor.poll(&jobs).await;
    assert_eq!(report.failed, vec!["silent"]);
    let errors = md.read_raw(MetadataFile::Errors).unwrap();
    assert!(errors.contains("No heartbeat detected"));
}
