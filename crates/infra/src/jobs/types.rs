//! Queue job and pending-job (outbox) types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default queue jobs are pushed to.
pub const DEFAULT_QUEUE: &str = "default";

/// Queue job identifier.
///
/// Assigned when the job is staged, so the pending-job row and the pushed job
/// share the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A job as pushed to the external queue.
///
/// Positional arguments are kept as JSON values; handlers decode them with
/// [`QueueJob::arg`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub jid: JobId,
    pub job_type: String,
    pub queue: String,
    pub args: Vec<serde_json::Value>,
    /// Number of failed deliveries so far.
    #[serde(default)]
    pub retry: u32,
    pub created_at: DateTime<Utc>,
}

impl QueueJob {
    pub fn new(job_type: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            jid: JobId::generate(),
            job_type: job_type.into(),
            queue: DEFAULT_QUEUE.to_string(),
            args,
            retry: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Serialize into the text stored in `pending_jobs.data`.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Rebuild a pushable job from a stored payload.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Decode the positional argument at `index`.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, index: usize) -> Result<T, JobArgError> {
        let value = self.args.get(index).ok_or(JobArgError::Missing {
            job_type: self.job_type.clone(),
            index,
        })?;
        serde_json::from_value(value.clone()).map_err(|e| JobArgError::Invalid {
            job_type: self.job_type.clone(),
            index,
            message: e.to_string(),
        })
    }

    /// Copy of this job for redelivery after a failed attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            retry: self.retry + 1,
            ..self.clone()
        }
    }
}

/// Positional argument decoding error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobArgError {
    #[error("job {job_type} is missing argument {index}")]
    Missing { job_type: String, index: usize },
    #[error("job {job_type} argument {index} is invalid: {message}")]
    Invalid {
        job_type: String,
        index: usize,
        message: String,
    },
}

/// Durable record of a staged-but-not-yet-pushed job (outbox row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub data: String,
}

impl PendingJob {
    pub fn from_job(job: &QueueJob) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: job.jid.clone(),
            created_at: job.created_at,
            data: job.to_payload()?,
        })
    }

    pub fn decode(&self) -> Result<QueueJob, serde_json::Error> {
        QueueJob::from_payload(&self.data)
    }
}

/// Backoff strategy for redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    #[default]
    Exponential,
    Linear,
}

/// Redelivery policy for failed queue jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed deliveries allowed before the job is dead-lettered.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 25,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Delay before redelivering a job that has already failed `retry` times.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry.max(1)),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1).min(31));
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }
}
