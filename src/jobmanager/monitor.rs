//! Detects jobs which died without reporting.
//!
//! Cluster jobs that the scheduler no longer knows about are marked missing
//! by a periodic queue query and failed once they stay missing past the
//! backend's grace period. Running jobs whose heartbeat goes stale are
//! failed as well.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info};

use super::JobManager;
use crate::metadata::{Metadata, MetadataState, HEARTBEAT_TIMEOUT};

/// Minimum time between queue queries.
pub const QUEUE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Outcome of one monitor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Number of job ids sent to the queue query, if one ran.
    pub queried: Option<usize>,
    /// Jobs the queue query did not report.
    pub missing: Vec<String>,
    /// Jobs failed during this pass.
    pub failed: Vec<String>,
}

/// Periodic queue and heartbeat checks for a set of jobs.
pub struct QueueMonitor {
    manager: JobManager,
    interval: Duration,
    heartbeat_timeout: Duration,
    last_query: Mutex<Option<Instant>>,
    query_active: AtomicBool,
}

impl QueueMonitor {
    pub fn new(manager: JobManager) -> Self {
        Self {
            manager,
            interval: QUEUE_CHECK_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            last_query: Mutex::new(None),
            query_active: AtomicBool::new(false),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Runs one monitoring pass over `jobs`.
    ///
    /// Queries the queue if the backend supports it, no other query is in
    /// flight and the interval has passed since the last one. Then checks
    /// heartbeats and fails jobs missing from the queue since before the
    /// grace period.
    pub async fn poll(&self, jobs: &[Arc<Metadata>]) -> MonitorReport {
        let start = SystemTime::now();
        let mut report = MonitorReport::default();

        if self.manager.has_queue_check() && self.begin_query() {
            let (queried, missing) = self.query_queue(jobs, start).await;
            self.end_query();
            report.queried = Some(queried);
            report.missing = missing;
        }

        for md in jobs {
            if md.check_heartbeat(start, self.heartbeat_timeout) {
                report.failed.push(md.fqname().to_string());
            }
        }

        let grace = self.manager.queue_check_grace();
        let cutoff = start.checked_sub(grace).unwrap_or(SystemTime::UNIX_EPOCH);
        for md in jobs {
            if md.end_refresh(cutoff) {
                report.failed.push(md.fqname().to_string());
            }
        }
        report
    }

    fn begin_query(&self) -> bool {
        let due = self
            .last_query
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map_or(true, |last| last.elapsed() >= self.interval);
        due && self
            .query_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end_query(&self) {
        *self.last_query.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.query_active.store(false, Ordering::Release);
    }

    /// Returns the number of ids queried and the names of jobs found missing.
    async fn query_queue(&self, jobs: &[Arc<Metadata>], now: SystemTime) -> (usize, Vec<String>) {
        // Keyed by metadata path: several jobs may share one cluster id.
        let mut needs_query: BTreeMap<PathBuf, (String, &Arc<Metadata>)> = BTreeMap::new();
        for md in jobs {
            if needs_query.contains_key(md.path()) {
                continue;
            }
            let state = md.state();
            if state != MetadataState::QUEUED && state != MetadataState::RUNNING {
                continue;
            }
            if let Some(id) = md.job_id() {
                needs_query.insert(md.path().to_path_buf(), (id, md));
            }
        }
        if needs_query.is_empty() {
            return (0, Vec::new());
        }

        let ids: Vec<String> = needs_query
            .values()
            .map(|(id, _)| id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let queried = ids.len();
        debug!(count = queried, "Querying job manager queue");
        let (known, raw) = self.manager.check_queue(&ids).await;
        let known: HashSet<&str> = known.iter().map(|id| id.trim()).collect();
        needs_query.retain(|_, (id, _)| !known.contains(id.as_str()));
        if !needs_query.is_empty() && !raw.is_empty() {
            info!(
                "Some jobs thought to be queued were unknown to the job manager.  Raw output:\n{}\n",
                raw
            );
        }

        let mut missing = Vec::with_capacity(needs_query.len());
        for (id, md) in needs_query.values() {
            md.fail_not_running(id, now);
            missing.push(md.fqname().to_string());
        }
        missing.sort();
        (queried, missing)
    }
}
