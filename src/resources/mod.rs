//! Host resource accounting.
//!
//! Provides the admission-control semaphore used by the local backend and a
//! snapshot of the host's current memory and load.

pub mod semaphore;
pub mod system;

pub use semaphore::ResourceSemaphore;
pub use system::SystemSnapshot;
