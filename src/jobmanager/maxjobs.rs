//! Cap on the number of cluster jobs outstanding at once.
//!
//! Slots are keyed by job metadata rather than counted, so a job that is
//! resubmitted while still holding a slot does not take a second one, and
//! slots can be reclaimed by checking which holders are still running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::metadata::{Metadata, MetadataState};

struct Slots {
    running: HashMap<PathBuf, Arc<Metadata>>,
    limit: usize,
}

/// Limits the number of distinct jobs which are active at a time.
pub struct MaxJobsSemaphore {
    slots: Mutex<Slots>,
    changed: Notify,
}

/// A job can take a slot only if it was not canceled or finished while it
/// waited.
fn is_pending(metadata: &Metadata) -> bool {
    let state = metadata.state();
    state == MetadataState::QUEUED || state == MetadataState::WAITING
}

impl MaxJobsSemaphore {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                running: HashMap::new(),
                limit,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits for a slot for this job.
    ///
    /// Returns false without taking a slot if the job is no longer waiting
    /// or queued, or if the semaphore was cleared. A job which already holds
    /// a slot gets true immediately.
    pub async fn acquire(&self, metadata: &Arc<Metadata>) -> bool {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            {
                let mut slots = self.lock();
                if !is_pending(metadata) {
                    return false;
                }
                if slots.running.contains_key(metadata.path()) {
                    return true;
                }
                if slots.limit == 0 {
                    return false;
                }
                if slots.running.len() < slots.limit {
                    slots
                        .running
                        .insert(metadata.path().to_path_buf(), Arc::clone(metadata));
                    return true;
                }
            }
            debug!(job = %metadata.fqname(), "Waiting for a job slot");
            changed.await;
        }
    }

    /// Releases a job's slot, if it holds one.
    pub fn release(&self, metadata: &Metadata) {
        let removed = self.lock().running.remove(metadata.path()).is_some();
        if removed {
            self.changed.notify_waiters();
        }
    }

    /// Frees the slots of jobs which are no longer queued or running.
    pub fn find_done(&self) {
        let freed = {
            let mut slots = self.lock();
            let before = slots.running.len();
            slots.running.retain(|_, md| {
                let state = md.state();
                state == MetadataState::WAITING
                    || state == MetadataState::RUNNING
                    || state == MetadataState::QUEUED
            });
            before - slots.running.len()
        };
        if freed > 0 {
            debug!(freed, "Released job slots of finished jobs");
            self.changed.notify_waiters();
        }
    }

    /// Releases all waiters. The semaphore admits nothing afterwards.
    pub fn clear(&self) {
        self.lock().limit = 0;
        self.changed.notify_waiters();
    }

    /// Number of slots in use.
    pub fn current(&self) -> usize {
        self.lock().running.len()
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }
}
