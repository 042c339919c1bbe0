//! Periodic sweep that re-pushes orphaned pending jobs.
//!
//! A pending-job record older than the leeway window means the process that
//! staged it committed its transaction but never confirmed the push. The
//! recoverer pushes such records again and deletes them. Handlers must
//! therefore be idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::queue::{JobQueue, QueueError};
use super::types::JobId;
use crate::db::{PendingJobCursor, PendingJobStore, StoreError};

/// What to do with a record whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Mark the record so later sweeps ignore it; it stays for inspection.
    #[default]
    DeadLetter,
    /// Log and leave the record untouched. It is reported again every sweep.
    Skip,
}

#[derive(Debug, Clone)]
pub struct RecovererConfig {
    /// Minimum record age before it is considered orphaned.
    pub leeway: Duration,
    /// Pause between sweeps.
    pub interval: Duration,
    pub batch_size: usize,
    pub malformed: MalformedPolicy,
}

impl Default for RecovererConfig {
    fn default() -> Self {
        Self {
            leeway: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(60),
            batch_size: 100,
            malformed: MalformedPolicy::default(),
        }
    }
}

impl RecovererConfig {
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_malformed_policy(mut self, policy: MalformedPolicy) -> Self {
        self.malformed = policy;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("pending job store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to push recovered job {jid}: {source}")]
    Push {
        jid: JobId,
        #[source]
        source: QueueError,
    },

    #[error("leeway {0:?} is out of range")]
    InvalidLeeway(Duration),
}

/// Counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub pushed: usize,
    pub skipped: usize,
    pub dead_lettered: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.pushed == 0 && self.skipped == 0 && self.dead_lettered == 0
    }
}

pub struct JobRecoverer<S: ?Sized, Q: ?Sized> {
    store: Arc<S>,
    queue: Arc<Q>,
    config: RecovererConfig,
}

impl<S, Q> JobRecoverer<S, Q>
where
    S: PendingJobStore + ?Sized,
    Q: JobQueue + ?Sized,
{
    pub fn new(store: Arc<S>, queue: Arc<Q>, config: RecovererConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &RecovererConfig {
        &self.config
    }

    /// Run one full sweep over records created before `now - leeway`.
    ///
    /// A push failure aborts the sweep; records already handled stay handled.
    #[instrument(skip(self), fields(pushed, skipped, dead_lettered), err)]
    pub async fn recover_once(&self, now: DateTime<Utc>) -> Result<RecoveryReport, RecoveryError> {
        let leeway = chrono::Duration::from_std(self.config.leeway)
            .map_err(|_| RecoveryError::InvalidLeeway(self.config.leeway))?;
        let cutoff = now - leeway;
        let batch_size = self.config.batch_size.max(1);

        let mut report = RecoveryReport::default();
        let mut cursor: Option<PendingJobCursor> = None;

        loop {
            let batch = self
                .store
                .stale_pending_jobs(cutoff, cursor.as_ref(), batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(PendingJobCursor::after(last));
            let full = batch.len() == batch_size;

            for pending in &batch {
                let job = match pending.decode() {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(
                            pending_job_id = %pending.id,
                            error = %e,
                            "pending job payload cannot be decoded"
                        );
                        match self.config.malformed {
                            MalformedPolicy::DeadLetter => {
                                self.store
                                    .dead_letter_pending_job(&pending.id, &e.to_string(), now)
                                    .await?;
                                report.dead_lettered += 1;
                            }
                            MalformedPolicy::Skip => report.skipped += 1,
                        }
                        continue;
                    }
                };

                self.queue
                    .push(&job)
                    .await
                    .map_err(|source| RecoveryError::Push {
                        jid: job.jid.clone(),
                        source,
                    })?;
                self.store.delete_pending_job(&pending.id).await?;
                report.pushed += 1;
                debug!(jid = %job.jid, job_type = %job.job_type, "recovered pending job");
            }

            if !full {
                break;
            }
        }

        let span = tracing::Span::current();
        span.record("pushed", report.pushed);
        span.record("skipped", report.skipped);
        span.record("dead_lettered", report.dead_lettered);
        Ok(report)
    }

    /// Sweep every `interval` until cancelled.
    ///
    /// Push failures end the current sweep only. Store failures are terminal
    /// and returned so a supervisor can restart the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RecoveryError> {
        info!(
            leeway_secs = self.config.leeway.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "job recoverer started"
        );

        loop {
            match self.recover_once(Utc::now()).await {
                Ok(report) if !report.is_empty() => {
                    info!(
                        pushed = report.pushed,
                        skipped = report.skipped,
                        dead_lettered = report.dead_lettered,
                        "recovery sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e @ RecoveryError::Push { .. }) => {
                    warn!(error = %e, "recovery sweep aborted");
                }
                Err(e) => {
                    error!(error = %e, "job recoverer stopped");
                    return Err(e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("job recoverer stopped");
        Ok(())
    }
}
