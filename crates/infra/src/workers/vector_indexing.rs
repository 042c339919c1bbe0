//! Adds an item's embedding to the ANN shard of its publish day, then stages
//! the follow-up jobs (duplicate detection by default) through the outbox.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use pressroom_core::ItemId;

use crate::ann::{AnnError, AnnIndexClient, VectorService};
use crate::db::{ContentStore, ContentTx, PendingJobStore, StoreError};
use crate::jobs::{
    DEFAULT_QUEUE, HandlerResult, JobHandler, JobQueue, JobScheduler, QueueJob, SchedulerError,
};

use super::duplicate_detection::DETECT_DUPLICATES_JOB;

/// Job type handled by [`VectorIndexer`].
pub const INDEX_VECTOR_JOB: &str = "index_vector";

#[derive(Debug, thiserror::Error)]
pub enum IndexingError {
    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ann(#[from] AnnError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingOutcome {
    /// No usable vector.
    Skipped,
    Indexed,
}

pub struct VectorIndexer<S, V, Q> {
    store: Arc<S>,
    ann: Arc<AnnIndexClient<V>>,
    queue: Arc<Q>,
    follow_up_queue: String,
    follow_up_jobs: Vec<String>,
}

impl<S, V, Q> VectorIndexer<S, V, Q>
where
    S: ContentStore + PendingJobStore,
    V: VectorService,
    Q: JobQueue,
{
    pub fn new(store: Arc<S>, ann: Arc<AnnIndexClient<V>>, queue: Arc<Q>) -> Self {
        Self {
            store,
            ann,
            queue,
            follow_up_queue: DEFAULT_QUEUE.to_string(),
            follow_up_jobs: vec![DETECT_DUPLICATES_JOB.to_string()],
        }
    }

    /// Queue that follow-up jobs are pushed to.
    pub fn with_follow_up_queue(mut self, queue: impl Into<String>) -> Self {
        self.follow_up_queue = queue.into();
        self
    }

    pub fn with_follow_up_jobs<I, T>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.follow_up_jobs = jobs.into_iter().map(Into::into).collect();
        self
    }

    #[instrument(skip(self), fields(item_id = %item_id), err)]
    pub async fn index(&self, item_id: ItemId) -> Result<IndexingOutcome, IndexingError> {
        let mut tx = self.store.begin().await?;
        let item = tx
            .lock_item(item_id)
            .await?
            .ok_or(IndexingError::ItemNotFound(item_id))?;

        let Some(vector) = item.usable_vector() else {
            debug!("item has no vector");
            return Ok(IndexingOutcome::Skipped);
        };

        self.ann
            .insert(item.id, &item.publish_date, &vector.data)
            .await?;

        let mut scheduler = JobScheduler::new().with_queue(self.follow_up_queue.as_str());
        scheduler.add_jobs(&self.follow_up_jobs, &[item.id])?;
        scheduler.create_pending_jobs(&mut tx).await?;
        tx.commit().await?;

        scheduler
            .push_jobs_and_delete_pending_jobs(&*self.queue, &*self.store)
            .await?;
        Ok(IndexingOutcome::Indexed)
    }
}

#[async_trait]
impl<S, V, Q> JobHandler for VectorIndexer<S, V, Q>
where
    S: ContentStore + PendingJobStore + 'static,
    V: VectorService + 'static,
    Q: JobQueue + 'static,
{
    async fn handle(&self, job: &QueueJob) -> HandlerResult {
        let item_id: ItemId = job.arg(0)?;
        self.index(item_id).await?;
        Ok(())
    }
}
