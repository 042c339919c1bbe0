//! Transactional outbox scheduler.
//!
//! Jobs are staged in memory together with their pending-job records. The
//! caller then drives the outbox protocol:
//!
//! 1. `create_pending_jobs(&mut tx)` before the domain transaction commits
//! 2. commit
//! 3. `push_jobs(&queue)`, then `delete_pending_jobs(..)` once every push
//!    succeeded (or `push_jobs_and_delete_pending_jobs` for both)
//!
//! If the process dies anywhere after step 2, the committed records are picked
//! up by the [`JobRecoverer`](super::recoverer::JobRecoverer).

use serde::Serialize;
use tracing::{debug, instrument};

use super::queue::{JobQueue, QueueError};
use super::types::{DEFAULT_QUEUE, JobId, PendingJob, QueueJob};
use crate::db::{PendingJobStore, PendingJobWriter, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to serialize job {job_type}: {source}")]
    Serialization {
        job_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("pending job store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to push job {jid}: {source}")]
    Queue {
        jid: JobId,
        #[source]
        source: QueueError,
    },
}

/// Jobs staged for one unit of work.
///
/// Staged jobs and records stay in lockstep: `jobs()[i]` and
/// `pending_jobs()[i]` describe the same job.
#[derive(Debug)]
pub struct JobScheduler {
    queue: String,
    jobs: Vec<QueueJob>,
    pending: Vec<PendingJob>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            jobs: Vec::new(),
            pending: Vec::new(),
        }
    }
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that jobs staged from now on are routed to.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stage one job. `args` is serialized to JSON; an array becomes the
    /// positional argument list, anything else a single argument.
    ///
    /// Does no I/O; fails only if the arguments or payload cannot be serialized.
    pub fn add_job<A>(&mut self, job_type: &str, args: &A) -> Result<(), SchedulerError>
    where
        A: Serialize + ?Sized,
    {
        let serialization = |source| SchedulerError::Serialization {
            job_type: job_type.to_string(),
            source,
        };

        let args = match serde_json::to_value(args).map_err(serialization)? {
            serde_json::Value::Array(values) => values,
            value => vec![value],
        };
        let job = QueueJob::new(job_type, args).with_queue(self.queue.as_str());
        let pending = PendingJob::from_job(&job).map_err(serialization)?;

        self.jobs.push(job);
        self.pending.push(pending);
        Ok(())
    }

    /// Stage one job per type with identical arguments. Stops at the first error.
    pub fn add_jobs<S, A>(&mut self, job_types: &[S], args: &A) -> Result<(), SchedulerError>
    where
        S: AsRef<str>,
        A: Serialize + ?Sized,
    {
        for job_type in job_types {
            self.add_job(job_type.as_ref(), args)?;
        }
        Ok(())
    }

    pub fn jobs(&self) -> &[QueueJob] {
        &self.jobs
    }

    pub fn pending_jobs(&self) -> &[PendingJob] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn pending_ids(&self) -> Vec<JobId> {
        self.pending.iter().map(|p| p.id.clone()).collect()
    }

    /// Insert every staged record in one statement inside the caller's transaction.
    pub async fn create_pending_jobs<W>(&self, tx: &mut W) -> Result<(), SchedulerError>
    where
        W: PendingJobWriter + ?Sized,
    {
        if self.pending.is_empty() {
            return Ok(());
        }
        tx.insert_pending_jobs(&self.pending).await?;
        debug!(count = self.pending.len(), "created pending jobs");
        Ok(())
    }

    /// Push staged jobs one at a time in staging order.
    ///
    /// The first failure aborts; later jobs are not pushed and their records remain.
    #[instrument(skip_all, fields(count = self.jobs.len()), err)]
    pub async fn push_jobs<Q>(&self, queue: &Q) -> Result<(), SchedulerError>
    where
        Q: JobQueue + ?Sized,
    {
        for job in &self.jobs {
            queue
                .push(job)
                .await
                .map_err(|source| SchedulerError::Queue {
                    jid: job.jid.clone(),
                    source,
                })?;
            debug!(jid = %job.jid, job_type = %job.job_type, "pushed job");
        }
        Ok(())
    }

    /// Delete every staged record in one statement. Only call after a successful push.
    pub async fn delete_pending_jobs<W>(&self, tx: &mut W) -> Result<(), SchedulerError>
    where
        W: PendingJobWriter + ?Sized,
    {
        if self.pending.is_empty() {
            return Ok(());
        }
        tx.delete_pending_jobs(&self.pending_ids()).await?;
        Ok(())
    }

    /// Push all staged jobs, then delete their records. Deletion is skipped if
    /// any push fails.
    pub async fn push_jobs_and_delete_pending_jobs<Q, S>(
        &self,
        queue: &Q,
        store: &S,
    ) -> Result<(), SchedulerError>
    where
        Q: JobQueue + ?Sized,
        S: PendingJobStore + ?Sized,
    {
        if self.is_empty() {
            return Ok(());
        }
        self.push_jobs(queue).await?;
        store.delete_pending_jobs(&self.pending_ids()).await?;
        Ok(())
    }
}
