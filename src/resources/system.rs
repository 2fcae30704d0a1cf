//! Point-in-time view of host memory, load and CPU count.

use sysinfo::{Pid, ProcessesToUpdate, System};

/// A snapshot of the host's resources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemSnapshot {
    /// Total physical memory in megabytes.
    pub total_mem_mb: i64,
    /// Memory available for new allocations in megabytes.
    pub free_mem_mb: i64,
    /// One-minute load average, or `None` where the platform has none.
    pub load1: Option<f64>,
    /// Logical CPU count.
    pub cpus: i64,
}

const BYTES_PER_MB: u64 = 1024 * 1024;

impl SystemSnapshot {
    /// Reads the current state of the host.
    pub fn capture() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let load = System::load_average();
        Self {
            total_mem_mb: (system.total_memory() / BYTES_PER_MB) as i64,
            free_mem_mb: (system.available_memory() / BYTES_PER_MB) as i64,
            load1: if load.one >= 0.0 { Some(load.one) } else { None },
            cpus: num_cpus::get() as i64,
        }
    }

    /// Total memory in whole gigabytes.
    pub fn total_mem_gb(&self) -> i64 {
        self.total_mem_mb / 1024
    }

    /// Free memory in whole gigabytes.
    pub fn free_mem_gb(&self) -> i64 {
        self.free_mem_mb / 1024
    }

    /// Cores not currently accounted for by the load average.
    ///
    /// Adds a little slack so a host with load exactly equal to its core
    /// count still admits a single-threaded job.
    pub fn idle_cores(&self) -> Option<i64> {
        self.load1
            .map(|load| (self.cpus as f64 - load + 0.9).floor() as i64)
    }
}

/// Resident memory, in megabytes, of a process and all of its descendants.
pub fn process_tree_rss_mb(root: u32) -> i64 {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let root = Pid::from_u32(root);
    let processes = system.processes();

    let mut total = 0u64;
    for (pid, process) in processes {
        let mut current = Some(*pid);
        // Bounded walk up the parent chain.
        for _ in 0..64 {
            match current {
                Some(p) if p == root => {
                    total += process.memory();
                    break;
                }
                Some(p) => current = processes.get(&p).and_then(|q| q.parent()),
                None => break,
            }
        }
    }
    (total / BYTES_PER_MB) as i64
}
