//! External job queue boundary.
//!
//! The queue is append-only from the producer side ([`JobQueue::push`]).
//! Consumers ([`JobSource`]) fetch deliveries, then either acknowledge them or
//! move them to a dead-letter destination. Delivery is at-least-once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::types::{JobId, QueueJob};

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("queue serialization error: {0}")]
    Serialization(String),

    #[error("queue deserialization error: {0}")]
    Deserialization(String),
}

/// Producer side of the external queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, job: &QueueJob) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn push(&self, job: &QueueJob) -> Result<(), QueueError> {
        (**self).push(job).await
    }
}

/// A fetched job plus the receipt needed to acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub receipt: String,
    pub job: QueueJob,
}

/// Consumer side of the external queue.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Fetch up to `max` deliveries from `queue`, waiting at most `wait` when
    /// nothing is ready.
    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Park a delivery that exhausted its retries, then acknowledge it.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> JobSource for Arc<Q>
where
    Q: JobSource + ?Sized,
{
    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        (**self).fetch(queue, max, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        (**self).dead_letter(delivery, reason).await
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<QueueJob>,
    in_flight: HashMap<String, QueueJob>,
    pushed: Vec<QueueJob>,
    dead: Vec<(QueueJob, String)>,
    failing: HashSet<JobId>,
    unavailable: bool,
    next_receipt: u64,
}

/// In-memory queue for tests/dev.
///
/// Records every successful push and supports failure injection, either for
/// the whole queue or for specific job ids.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every job pushed so far, in push order.
    pub async fn pushed(&self) -> Vec<QueueJob> {
        self.state.lock().await.pushed.clone()
    }

    pub async fn dead_letters(&self) -> Vec<(QueueJob, String)> {
        self.state.lock().await.dead.clone()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Make every push fail until re-enabled.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Make pushes of one specific job fail.
    pub async fn fail_pushes_of(&self, jid: &JobId) {
        self.state.lock().await.failing.insert(jid.clone());
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, job: &QueueJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(QueueError::Connection("queue unavailable".to_string()));
        }
        if state.failing.contains(&job.jid) {
            return Err(QueueError::Command(format!("push of {} rejected", job.jid)));
        }
        state.pushed.push(job.clone());
        state.ready.push_back(job.clone());
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl JobSource for InMemoryJobQueue {
    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                let mut deliveries = Vec::new();
                while deliveries.len() < max {
                    let Some(pos) = state.ready.iter().position(|j| j.queue == queue) else {
                        break;
                    };
                    let Some(job) = state.ready.remove(pos) else {
                        break;
                    };
                    state.next_receipt += 1;
                    let receipt = format!("mem-{}", state.next_receipt);
                    state.in_flight.insert(receipt.clone(), job.clone());
                    deliveries.push(Delivery { receipt, job });
                }
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state.lock().await.in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&delivery.receipt);
        state.dead.push((delivery.job.clone(), reason.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::DEFAULT_QUEUE;
    use serde_json::json;

    #[tokio::test]
    async fn push_then_fetch_and_ack() {
        let queue = InMemoryJobQueue::new();
        let job = QueueJob::new("detect_duplicates", vec![json!(1)]);
        queue.push(&job).await.unwrap();

        let deliveries = queue
            .fetch(DEFAULT_QUEUE, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].job, job);
        assert_eq!(queue.in_flight().await, 1);

        queue.ack(&deliveries[0]).await.unwrap();
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn fetch_times_out_when_empty() {
        let queue = InMemoryJobQueue::new();
        let deliveries = queue
            .fetch(DEFAULT_QUEUE, 10, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(deliveries.is_empty());
    }

    #[tokio::test]
    async fn fetch_only_reads_the_named_queue() {
        let queue = InMemoryJobQueue::new();
        queue
            .push(&QueueJob::new("x", vec![]).with_queue("other"))
            .await
            .unwrap();
        let mine = QueueJob::new("y", vec![]);
        queue.push(&mine).await.unwrap();

        let deliveries = queue
            .fetch(DEFAULT_QUEUE, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].job, mine);
    }

    #[tokio::test]
    async fn injected_failures() {
        let queue = InMemoryJobQueue::new();
        let job = QueueJob::new("x", vec![]);

        queue.fail_pushes_of(&job.jid).await;
        assert!(matches!(queue.push(&job).await, Err(QueueError::Command(_))));

        let other = QueueJob::new("x", vec![]);
        queue.set_unavailable(true).await;
        assert!(matches!(queue.push(&other).await, Err(QueueError::Connection(_))));
        queue.set_unavailable(false).await;
        queue.push(&other).await.unwrap();

        assert_eq!(queue.pushed().await, vec![other]);
    }

    #[tokio::test]
    async fn dead_letter_records_reason() {
        let queue = InMemoryJobQueue::new();
        queue.push(&QueueJob::new("x", vec![])).await.unwrap();
        let delivery = queue
            .fetch(DEFAULT_QUEUE, 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);

        queue.dead_letter(&delivery, "boom").await.unwrap();

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "boom");
        assert_eq!(queue.in_flight().await, 0);
    }
}
