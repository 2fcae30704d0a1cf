//! jobmill: admission, scheduling and lifecycle tracking for pipeline jobs.
//!
//! Jobs run either on this host, gated by core and memory semaphores, or on
//! a cluster scheduler through a rendered submission script. Every job's
//! state is kept as marker files in its own metadata directory, which both
//! the driver and the job itself read and write.

pub mod cli;
pub mod error;
pub mod jobmanager;
pub mod metadata;
pub mod resources;
pub mod retry;
pub mod shutdown;
pub mod wrapper;

// Re-export commonly used types
pub use error::{ConfigError, JobError, SemaphoreError};
pub use jobmanager::{JobManager, JobRequest, JobResources};
pub use metadata::{Metadata, MetadataFile, MetadataState};
pub use resources::ResourceSemaphore;
pub use retry::RetryPolicy;
pub use shutdown::{ShutdownCoordinator, ShutdownHandler, ShutdownReason};
