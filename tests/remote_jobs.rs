//! Tests for the remote backend using a fake submit command.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jobmill::jobmanager::{JobManagerConfig, RemoteConfig, RemoteJobManager};
use jobmill::{JobManager, JobRequest, JobResources, Metadata, MetadataFile, ShutdownCoordinator};
use tempfile::TempDir;

const TEMPLATE: &str = "#!/bin/sh\n\
#FAKE -N __MRO_JOB_NAME__\n\
#FAKE -pe threads __MRO_THREADS__\n\
#FAKE -l mem=__MRO_MEM_GB__G\n\
#FAKE __MRO_RESOURCES__\n\
#FAKE -o __MRO_STDOUT__\n\
cd __MRO_JOB_WORKDIR__\n\
__MRO_CMD__\n";

fn write_executable(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// Sets up a job-manager directory whose `fake` mode submits with `submit`.
fn jobmanagers(dir: &TempDir, submit: &str) -> JobManagerConfig {
    let jm = dir.path().join("jobmanagers");
    std::fs::create_dir_all(&jm).unwrap();
    let submit_path = jm.join("fake_submit.sh");
    write_executable(&submit_path, submit);
    let config = format!(
        r#"{{
            "settings": {{
                "threads_per_job": 1,
                "memGB_per_job": 4,
                "thread_envs": ["OMP_NUM_THREADS"]
            }},
            "jobmodes": {{
                "fake": {{
                    "cmd": "{}",
                    "resopt": "-l __RESOURCES__"
                }}
            }}
        }}"#,
        submit_path.display()
    );
    std::fs::write(jm.join("config.json"), config).unwrap();
    std::fs::write(jm.join("fake.template"), TEMPLATE).unwrap();
    JobManagerConfig::load(&jm).unwrap()
}

fn remote(config: &JobManagerConfig, options: RemoteConfig) -> Arc<RemoteJobManager> {
    RemoteJobManager::new(config, "fake", options, Arc::new(ShutdownCoordinator::new()))
        .expect("remote manager")
}

fn metadata(dir: &TempDir, name: &str) -> Arc<Metadata> {
    let md = Metadata::new(format!("ID.p.{}.fork0", name), dir.path().join(name));
    md.mkdirs().unwrap();
    md.write_time(MetadataFile::QueuedLocally).unwrap();
    Arc::new(md)
}

#[tokio::test]
async fn test_submission_renders_script_and_records_job_id() {
    let dir = TempDir::new().unwrap();
    let config = jobmanagers(&dir, "#!/bin/sh\ncat > submitted.sh\necho 12345.fake\n");
    let manager = JobManager::Remote(remote(&config, RemoteConfig::default()));
    let md = metadata(&dir, "STAGE");

    let request = JobRequest::new("/bin/stage", Arc::clone(&md))
        .with_args(["--in", "args.json"])
        .with_resources(JobResources::new(2, 8));
    manager.exec_job(request).await.unwrap();

    assert!(!md.exists(MetadataFile::Errors));
    assert!(!md.exists(MetadataFile::QueuedLocally));
    assert_eq!(md.job_id().as_deref(), Some("12345.fake"));

    let script = md.read_raw(MetadataFile::JobScript).unwrap();
    assert!(script.contains("#FAKE -N ID.p.STAGE.fork0.main\n"));
    assert!(script.contains("#FAKE -pe threads 2\n"));
    assert!(script.contains("#FAKE -l mem=8G\n"));
    assert!(!script.contains("__MRO_RESOURCES__"));
    assert!(!script.contains("#FAKE -l __RESOURCES__"));
    assert!(script.contains(&format!(
        "#FAKE -o {}\n",
        md.file_path(MetadataFile::Stdout).display()
    )));
    assert!(script.contains("OMP_NUM_THREADS=2 /bin/stage --in args.json\n"));

    // The submit command ran in the job's files directory with the script
    // on stdin.
    let submitted = std::fs::read_to_string(md.files_path().join("submitted.sh")).unwrap();
    assert_eq!(submitted, script);
}

#[tokio::test]
async fn test_resource_mapping_is_substituted() {
    let dir = TempDir::new().unwrap();
    let config = jobmanagers(&dir, "#!/bin/sh\ncat >/dev/null\necho 7\n");
    let manager = remote(
        &config,
        RemoteConfig::default().with_job_resources("gpu:gpus=2;bad"),
    );
    let md = metadata(&dir, "GPU");

    let request = JobRequest::new("/bin/stage", Arc::clone(&md))
        .with_resources(JobResources::new(1, 4).with_special("gpu"));
    manager.exec_job(request).await.unwrap();

    let script = md.read_raw(MetadataFile::JobScript).unwrap();
    assert!(script.contains("#FAKE -l gpus=2\n"));
}

#[tokio::test]
async fn test_submit_failure_is_recorded() {
    let dir = TempDir::new().unwrap();
    let config = jobmanagers(&dir, "#!/bin/sh\ncat >/dev/null\necho 'queue full' >&2\nexit 3\n");
    let manager = JobManager::Remote(remote(&config, RemoteConfig::default()));
    let md = metadata(&dir, "STAGE");

    manager
        .exec_job(JobRequest::new("/bin/stage", Arc::clone(&md)))
        .await
        .unwrap();

    let errors = md.read_raw(MetadataFile::Errors).unwrap();
    assert!(errors.starts_with("jobcmd error (exit status 3):\n"));
    assert!(errors.contains("queue full"));
    assert!(!md.exists(MetadataFile::JobId));
}

#[tokio::test]
async fn test_unrecognized_submit_output_records_no_job_id() {
    let dir = TempDir::new().unwrap();
    let config = jobmanagers(&dir, "#!/bin/sh\ncat >/dev/null\necho 'Your job was submitted'\n");
    let manager = JobManager::Remote(remote(&config, RemoteConfig::default()));
    let md = metadata(&dir, "STAGE");

    manager
        .exec_job(JobRequest::new("/bin/stage", Arc::clone(&md)))
        .await
        .unwrap();

    assert!(!md.exists(MetadataFile::Errors));
    assert!(!md.exists(MetadataFile::JobId));
}

#[tokio::test]
async fn test_max_jobs_waits_for_finished_job() {
    let dir = TempDir::new().unwrap();
    let config = jobmanagers(&dir, "#!/bin/sh\ncat >/dev/null\necho 1\n");
    let manager = JobManager::Remote(remote(&config, RemoteConfig::default().with_max_jobs(1)));
    let a = metadata(&dir, "A");
    let b = metadata(&dir, "B");

    manager
        .exec_job(JobRequest::new("/bin/stage", Arc::clone(&a)))
        .await
        .unwrap();
    assert!(a.exists(MetadataFile::JobId));

    let hb = manager.exec_job(JobRequest::new("/bin/stage", Arc::clone(&b)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!hb.is_finished());
    assert!(b.exists(MetadataFile::QueuedLocally));

    // Still running: the slot is kept.
    a.write_time(MetadataFile::Log).unwrap();
    manager.refresh_resources(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!hb.is_finished());

    a.write_time(MetadataFile::Complete).unwrap();
    manager.refresh_resources(false);
    hb.await.unwrap();
    assert!(b.exists(MetadataFile::JobId));
}

#[tokio::test]
async fn test_end_job_releases_slot() {
    let dir = TempDir::new().unwrap();
    let config = jobmanagers(&dir, "#!/bin/sh\ncat >/dev/null\necho 1\n");
    let manager = JobManager::Remote(remote(&config, RemoteConfig::default().with_max_jobs(1)));
    let a = metadata(&dir, "A");
    let b = metadata(&dir, "B");

    manager
        .exec_job(JobRequest::new("/bin/stage", Arc::clone(&a)))
        .await
        .unwrap();
    let hb = manager.exec_job(JobRequest::new("/bin/stage", Arc::clone(&b)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!hb.is_finished());

    manager.end_job(&a);
    hb.await.unwrap();
    assert!(b.exists(MetadataFile::JobId));
}

#[tokio::test]
async fn test_unknown_job_mode_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let config = jobmanagers(&dir, "#!/bin/sh\ncat\n");
    let result = RemoteJobManager::new(
        &config,
        "pbs",
        RemoteConfig::default(),
        Arc::new(ShutdownCoordinator::new()),
    );
    assert!(matches!(
        result,
        Err(jobmill::ConfigError::UnknownJobMode { .. })
    ));
}
