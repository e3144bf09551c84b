//! Forward-model execution: a retrying job queue over a closed set of
//! drivers.
//!
//! The queue drives every job to a terminal state (`Success`, `Failed` or
//! `IsKilled`) under a concurrency bound, retries transient failures, honours
//! external kill requests and runs per-job completion callbacks. One manager
//! thread owns the scheduling loop; drivers report per-job status which the
//! manager folds into an atomically-consistent status table.

pub mod driver;
pub mod node;
pub mod queue;
pub mod status;

pub use driver::{Driver, DriverError, LocalDriver};
pub use node::{Callbacks, JobNode, JobSpec};
pub use queue::{JobQueue, QueueConfig, QueueError};
pub use status::{JobStatus, StatusSnapshot};
