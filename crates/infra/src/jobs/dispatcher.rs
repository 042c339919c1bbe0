//! Queue consumer that routes jobs to handlers with retry and dead-lettering.
//!
//! Handlers are looked up by job type: exact name first, then `prefix.*`
//! patterns, then the `*` wildcard. A failed job is re-pushed as its next
//! attempt after the [`RetryPolicy`] backoff, and parked on the dead-letter
//! destination once the retry budget is spent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::{Delivery, JobQueue, JobSource};
use super::types::{DEFAULT_QUEUE, QueueJob, RetryPolicy};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Executes one job type. Must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(QueueJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, job: &QueueJob) -> HandlerResult {
        (self)(job.clone()).await
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Queue to consume.
    pub queue: String,
    /// Maximum jobs in flight.
    pub concurrency: usize,
    pub retry_policy: RetryPolicy,
    /// Longest a single fetch waits for work.
    pub poll_interval: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            concurrency: 4,
            retry_policy: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            name: "job-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    running: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Retried,
    DeadLettered,
}

pub struct JobDispatcher<Q: ?Sized> {
    queue: Arc<Q>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    config: DispatcherConfig,
    counters: Arc<Counters>,
}

impl<Q> JobDispatcher<Q>
where
    Q: JobQueue + JobSource + ?Sized + 'static,
{
    pub fn new(queue: Arc<Q>, config: DispatcherConfig) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Register a handler for a job type, a `prefix.*` pattern or `*`.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.register_arc(pattern, Arc::new(handler));
    }

    pub fn register_arc(&mut self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(pattern.into(), handler);
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h.clone());
        }

        self.handlers
            .iter()
            .filter_map(|(pattern, h)| pattern.strip_suffix(".*").map(|prefix| (prefix, h)))
            .filter(|(prefix, _)| {
                job_type
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, h)| h.clone())
            .or_else(|| self.handlers.get("*").cloned())
    }

    /// Consume the queue until cancelled, then wait for in-flight jobs.
    pub async fn run(&self, cancel: CancellationToken) -> DispatcherStats {
        let config = &self.config;
        info!(
            dispatcher = %config.name,
            queue = %config.queue,
            concurrency = config.concurrency,
            "job dispatcher started"
        );

        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if cancel.is_cancelled() {
                break;
            }

            let max = semaphore.available_permits() + 1;
            let deliveries = match self
                .queue
                .fetch(&config.queue, max, config.poll_interval)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(dispatcher = %config.name, error = %e, "failed to fetch jobs");
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(config.poll_interval) => continue,
                    }
                }
            };

            let mut first = Some(permit);
            for delivery in deliveries {
                let permit = match first.take() {
                    Some(permit) => permit,
                    None => match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let handler = self.handler_for(&delivery.job.job_type);
                let queue = self.queue.clone();
                let policy = config.retry_policy.clone();
                let counters = self.counters.clone();
                let cancel = cancel.clone();

                counters.running.fetch_add(1, Ordering::Relaxed);
                tasks.spawn(async move {
                    let outcome = process(&*queue, handler, &policy, &delivery, &cancel).await;
                    record(&counters, outcome);
                    counters.running.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(dispatcher = %config.name, error = %e, "job task panicked");
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(dispatcher = %config.name, error = %e, "job task panicked");
            }
        }

        let stats = self.stats();
        info!(dispatcher = %config.name, ?stats, "job dispatcher stopped");
        stats
    }
}

fn record(counters: &Counters, outcome: Option<Outcome>) {
    counters.processed.fetch_add(1, Ordering::Relaxed);
    match outcome {
        Some(Outcome::Succeeded) => {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        Some(Outcome::Retried) => {
            counters.retried.fetch_add(1, Ordering::Relaxed);
        }
        Some(Outcome::DeadLettered) => {
            counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        }
        None => {}
    }
}

/// Run one delivery to completion. `None` when the queue rejected the
/// follow-up command; the delivery then stays unacknowledged.
async fn process<Q>(
    queue: &Q,
    handler: Option<Arc<dyn JobHandler>>,
    policy: &RetryPolicy,
    delivery: &Delivery,
    cancel: &CancellationToken,
) -> Option<Outcome>
where
    Q: JobQueue + JobSource + ?Sized,
{
    let job = &delivery.job;

    let Some(handler) = handler else {
        let reason = format!("no handler for job type {}", job.job_type);
        warn!(jid = %job.jid, job_type = %job.job_type, "no handler for job");
        return dead_letter(queue, delivery, &reason).await;
    };

    let error = match handler.handle(job).await {
        Ok(()) => {
            debug!(jid = %job.jid, job_type = %job.job_type, "job completed");
            return match queue.ack(delivery).await {
                Ok(()) => Some(Outcome::Succeeded),
                Err(e) => {
                    error!(jid = %job.jid, error = %e, "failed to acknowledge job");
                    None
                }
            };
        }
        Err(error) => error,
    };

    if !policy.should_retry(job.retry) {
        warn!(
            jid = %job.jid,
            job_type = %job.job_type,
            retry = job.retry,
            error = %error,
            "job retries exhausted"
        );
        return dead_letter(queue, delivery, &error.to_string()).await;
    }

    let next = job.next_attempt();
    let delay = policy.delay_for_retry(next.retry);
    warn!(
        jid = %job.jid,
        job_type = %job.job_type,
        retry = next.retry,
        delay_ms = millis(delay),
        error = %error,
        "job failed, scheduling retry"
    );

    // Shutdown cuts the backoff short; the retry is still handed back to the queue.
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }

    if let Err(e) = queue.push(&next).await {
        error!(jid = %job.jid, error = %e, "failed to push retry");
        return None;
    }
    match queue.ack(delivery).await {
        Ok(()) => Some(Outcome::Retried),
        Err(e) => {
            error!(jid = %job.jid, error = %e, "failed to acknowledge job");
            None
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

async fn dead_letter<Q>(queue: &Q, delivery: &Delivery, reason: &str) -> Option<Outcome>
where
    Q: JobSource + ?Sized,
{
    match queue.dead_letter(delivery, reason).await {
        Ok(()) => {
            warn!(jid = %delivery.job.jid, reason, "job dead-lettered");
            Some(Outcome::DeadLettered)
        }
        Err(e) => {
            error!(jid = %delivery.job.jid, error = %e, "failed to dead-letter job");
            None
        }
    }
}
