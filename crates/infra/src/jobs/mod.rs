//! Background job plumbing: transactional outbox, recovery and dispatch.
//!
//! ## Design
//!
//! - Jobs are staged together with a pending-job record that is written in
//!   the same transaction as the domain change
//! - Records are deleted only after the push is confirmed; a periodic sweep
//!   re-pushes records that outlive the leeway window
//! - The external queue delivers at least once; handlers are idempotent
//! - Failed deliveries are retried with backoff, then dead-lettered
//!
//! ## Components
//!
//! - `JobScheduler`: stages jobs and drives the outbox protocol
//! - `JobRecoverer`: periodic sweep over orphaned pending jobs
//! - `JobQueue` / `JobSource`: external queue (in-memory or Redis Streams)
//! - `JobDispatcher`: routes fetched jobs to handlers with retry policy

pub mod dispatcher;
pub mod queue;
pub mod recoverer;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod scheduler;
pub mod types;

pub use dispatcher::{
    DispatcherConfig, DispatcherStats, HandlerError, HandlerResult, JobDispatcher, JobHandler,
};
pub use queue::{Delivery, InMemoryJobQueue, JobQueue, JobSource, QueueError};
pub use recoverer::{
    JobRecoverer, MalformedPolicy, RecovererConfig, RecoveryError, RecoveryReport,
};
#[cfg(feature = "redis")]
pub use redis_queue::{RedisJobQueue, RedisQueueConfig};
pub use scheduler::{JobScheduler, SchedulerError};
pub use types::{
    BackoffStrategy, DEFAULT_QUEUE, JobArgError, JobId, PendingJob, QueueJob, RetryPolicy,
};
