//! Near-duplicate detection for one content item.
//!
//! `locked read → decide → persist verdict → stage follow-ups → commit → push
//! → cleanup`. The item row stays locked from the read until commit, so two
//! deliveries of the same job cannot both write a verdict.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, info, instrument};

use pressroom_core::{DomainError, ItemId, SimilarityInfo};

use crate::ann::{AnnError, AnnIndexClient, SearchParams, VectorService};
use crate::db::{ContentStore, ContentTx, PendingJobStore, StoreError};
use crate::jobs::{
    DEFAULT_QUEUE, HandlerResult, JobHandler, JobQueue, JobScheduler, QueueJob, SchedulerError,
};

/// Job type handled by [`DuplicateDetector`].
pub const DETECT_DUPLICATES_JOB: &str = "detect_duplicates";

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateDetectionConfig {
    /// Days before the publish date that are searched for older neighbors.
    pub timeframe_days: u32,
    pub distance_threshold: f32,
    /// Staged when no neighbor qualifies.
    pub duplicate_jobs: Vec<String>,
    /// Staged when a neighbor qualifies.
    pub non_duplicate_jobs: Vec<String>,
}

impl Default for DuplicateDetectionConfig {
    fn default() -> Self {
        Self {
            timeframe_days: 3,
            distance_threshold: 0.2,
            duplicate_jobs: Vec::new(),
            non_duplicate_jobs: Vec::new(),
        }
    }
}

impl DuplicateDetectionConfig {
    pub fn with_timeframe_days(mut self, days: u32) -> Self {
        self.timeframe_days = days;
        self
    }

    pub fn with_distance_threshold(mut self, threshold: f32) -> Self {
        self.distance_threshold = threshold;
        self
    }

    pub fn with_duplicate_jobs<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.duplicate_jobs = jobs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_non_duplicate_jobs<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_duplicate_jobs = jobs.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    /// The search window start falls outside the representable date range.
    #[error("timeframe of {days} days before {item_id} is out of range")]
    TimeframeOutOfRange { item_id: ItemId, days: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ann(#[from] AnnError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionOutcome {
    /// Verdict already recorded, or the item has no usable vector.
    Skipped,
    /// No older neighbor within the threshold.
    Unique,
    Duplicate { parent: ItemId, distance: f32 },
}

pub struct DuplicateDetector<S, V, Q> {
    store: Arc<S>,
    ann: Arc<AnnIndexClient<V>>,
    queue: Arc<Q>,
    follow_up_queue: String,
    config: DuplicateDetectionConfig,
}

impl<S, V, Q> DuplicateDetector<S, V, Q>
where
    S: ContentStore + PendingJobStore,
    V: VectorService,
    Q: JobQueue,
{
    pub fn new(
        store: Arc<S>,
        ann: Arc<AnnIndexClient<V>>,
        queue: Arc<Q>,
        config: DuplicateDetectionConfig,
    ) -> Self {
        Self {
            store,
            ann,
            queue,
            follow_up_queue: DEFAULT_QUEUE.to_string(),
            config,
        }
    }

    /// Queue that follow-up jobs are pushed to.
    pub fn with_follow_up_queue(mut self, queue: impl Into<String>) -> Self {
        self.follow_up_queue = queue.into();
        self
    }

    #[instrument(skip(self), fields(item_id = %item_id), err)]
    pub async fn detect(&self, item_id: ItemId) -> Result<DetectionOutcome, DetectionError> {
        let mut tx = self.store.begin().await?;
        let item = tx
            .lock_item(item_id)
            .await?
            .ok_or(DetectionError::ItemNotFound(item_id))?;

        if item.similarity.is_some() {
            debug!("similarity already recorded");
            return Ok(DetectionOutcome::Skipped);
        }
        let Some(vector) = item.usable_vector() else {
            debug!("item has no vector");
            return Ok(DetectionOutcome::Skipped);
        };

        let days = self.config.timeframe_days;
        let from = Duration::try_days(i64::from(days))
            .and_then(|span| item.publish_date.checked_sub_signed(span))
            .ok_or(DetectionError::TimeframeOutOfRange {
                item_id: item.id,
                days,
            })?;
        let neighbors = self
            .ann
            .search_knn(SearchParams {
                from,
                to: item.publish_date,
                vector: &vector.data,
                distance_threshold: self.config.distance_threshold,
            })
            .await?;

        // Only older items qualify as parents; this also excludes the item itself.
        let parent = neighbors.iter().find(|n| n.item_id < item.id);

        let (info, outcome, follow_ups) = match parent {
            Some(n) => (
                SimilarityInfo::with_parent(item.id, n.item_id, n.distance)?,
                DetectionOutcome::Duplicate {
                    parent: n.item_id,
                    distance: n.distance,
                },
                &self.config.non_duplicate_jobs,
            ),
            None => (
                SimilarityInfo::without_parent(item.id),
                DetectionOutcome::Unique,
                &self.config.duplicate_jobs,
            ),
        };

        tx.insert_similarity_info(&info).await?;

        let mut scheduler = JobScheduler::new().with_queue(self.follow_up_queue.as_str());
        scheduler.add_jobs(follow_ups, &[item.id])?;
        scheduler.create_pending_jobs(&mut tx).await?;
        tx.commit().await?;

        info!(?outcome, follow_ups = scheduler.jobs().len(), "similarity recorded");

        scheduler
            .push_jobs_and_delete_pending_jobs(&*self.queue, &*self.store)
            .await?;
        Ok(outcome)
    }
}

#[async_trait]
impl<S, V, Q> JobHandler for DuplicateDetector<S, V, Q>
where
    S: ContentStore + PendingJobStore + 'static,
    V: VectorService + 'static,
    Q: JobQueue + 'static,
{
    async fn handle(&self, job: &QueueJob) -> HandlerResult {
        let item_id: ItemId = job.arg(0)?;
        self.detect(item_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::{AnnIndexConfig, InMemoryVectorService};
    use crate::db::InMemoryStore;
    use crate::jobs::InMemoryJobQueue;
    use chrono::{DateTime, TimeZone, Utc};
    use pressroom_core::ContentItem;
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryStore>,
        service: Arc<InMemoryVectorService>,
        ann: Arc<AnnIndexClient<Arc<InMemoryVectorService>>>,
        queue: Arc<InMemoryJobQueue>,
    }

    impl Fixture {
        fn new() -> Self {
            let service = Arc::new(InMemoryVectorService::new());
            let config = AnnIndexConfig::default()
                .with_prefix("dup_")
                .with_dimension(1);
            Self {
                store: Arc::new(InMemoryStore::new()),
                ann: Arc::new(AnnIndexClient::new(service.clone(), config).unwrap()),
                service,
                queue: InMemoryJobQueue::arc(),
            }
        }

        fn detector(
            &self,
            config: DuplicateDetectionConfig,
        ) -> DuplicateDetector<InMemoryStore, Arc<InMemoryVectorService>, InMemoryJobQueue> {
            DuplicateDetector::new(
                self.store.clone(),
                self.ann.clone(),
                self.queue.clone(),
                config,
            )
        }

        /// Seed an item and index its vector, placing it at `distance` from 0.
        async fn seed(&self, id: i64, at: DateTime<Utc>, distance: f32) {
            let data = vec![distance.sqrt()];
            self.store
                .insert_item(ContentItem::new(ItemId::new(id), at).with_vector(data.clone()))
                .await;
            self.ann.insert(ItemId::new(id), &at, &data).await.unwrap();
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, d, 12, 0, 0).unwrap()
    }

    fn config() -> DuplicateDetectionConfig {
        DuplicateDetectionConfig::default()
            .with_timeframe_days(2)
            .with_distance_threshold(0.5)
            .with_duplicate_jobs(["notify_unique"])
            .with_non_duplicate_jobs(["merge_story", "notify_duplicate"])
    }

    #[tokio::test]
    async fn links_to_the_closest_older_neighbor() {
        let fx = Fixture::new();
        fx.seed(1, day(1), 0.3).await;
        fx.seed(2, day(2), 0.1).await;
        fx.seed(3, day(3), 0.0).await;
        // Newer item closer than any older one must not be picked.
        fx.seed(4, day(3), 0.05).await;

        let outcome = fx.detector(config()).detect(ItemId::new(3)).await.unwrap();

        // Distances are measured from item 3's vector, which sits at 0.
        assert!(matches!(
            outcome,
            DetectionOutcome::Duplicate { parent, .. } if parent == ItemId::new(2)
        ));
        let info = fx.store.similarity_info(ItemId::new(3)).await.unwrap();
        assert_eq!(info.parent_id, Some(ItemId::new(2)));
        assert!(info.parent_id.unwrap() < info.item_id);

        let pushed: Vec<_> = fx
            .queue
            .pushed()
            .await
            .into_iter()
            .map(|j| (j.job_type, j.args))
            .collect();
        assert_eq!(
            pushed,
            vec![
                ("merge_story".to_string(), vec![json!(3)]),
                ("notify_duplicate".to_string(), vec![json!(3)]),
            ]
        );
        assert!(fx.store.pending_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn no_older_neighbor_records_unique_verdict() {
        let fx = Fixture::new();
        fx.seed(5, day(3), 0.0).await;
        fx.seed(6, day(3), 0.01).await;
        // Outside the time window.
        fx.seed(1, day(1) - Duration::days(5), 0.0).await;

        let outcome = fx.detector(config()).detect(ItemId::new(5)).await.unwrap();

        assert_eq!(outcome, DetectionOutcome::Unique);
        let info = fx.store.similarity_info(ItemId::new(5)).await.unwrap();
        assert_eq!(info, SimilarityInfo::without_parent(ItemId::new(5)));
        let types: Vec<_> = fx.queue.pushed().await.into_iter().map(|j| j.job_type).collect();
        assert_eq!(types, vec!["notify_unique"]);
    }

    #[tokio::test]
    async fn existing_verdict_is_a_no_op() {
        let fx = Fixture::new();
        fx.store
            .insert_item(
                ContentItem::new(ItemId::new(7), day(3))
                    .with_vector(vec![0.0])
                    .with_similarity(SimilarityInfo::without_parent(ItemId::new(7))),
            )
            .await;

        let outcome = fx.detector(config()).detect(ItemId::new(7)).await.unwrap();

        assert_eq!(outcome, DetectionOutcome::Skipped);
        assert_eq!(fx.store.commits().await, 0);
        assert!(fx.queue.pushed().await.is_empty());
        assert_eq!(fx.service.calls.search.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_or_empty_vector_is_a_no_op() {
        let fx = Fixture::new();
        fx.store.insert_item(ContentItem::new(ItemId::new(8), day(3))).await;
        fx.store
            .insert_item(ContentItem::new(ItemId::new(9), day(3)).with_vector(vec![]))
            .await;

        let detector = fx.detector(config());
        assert_eq!(detector.detect(ItemId::new(8)).await.unwrap(), DetectionOutcome::Skipped);
        assert_eq!(detector.detect(ItemId::new(9)).await.unwrap(), DetectionOutcome::Skipped);
        assert!(fx.store.similarity_info(ItemId::new(8)).await.is_none());
        assert!(fx.store.similarity_info(ItemId::new(9)).await.is_none());
    }

    #[tokio::test]
    async fn unknown_item_is_an_error() {
        let fx = Fixture::new();
        let err = fx.detector(config()).detect(ItemId::new(404)).await.unwrap_err();
        assert!(matches!(err, DetectionError::ItemNotFound(id) if id == ItemId::new(404)));
    }

    #[tokio::test]
    async fn search_failure_rolls_back() {
        let fx = Fixture::new();
        fx.seed(10, day(3), 0.0).await;
        fx.service.set_unavailable(true);

        let err = fx.detector(config()).detect(ItemId::new(10)).await.unwrap_err();

        assert!(matches!(err, DetectionError::Ann(_)));
        assert!(fx.store.similarity_info(ItemId::new(10)).await.is_none());
        assert!(fx.store.pending_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn push_failure_leaves_records_for_recovery() {
        let fx = Fixture::new();
        fx.seed(11, day(3), 0.0).await;
        fx.queue.set_unavailable(true).await;

        let err = fx.detector(config()).detect(ItemId::new(11)).await.unwrap_err();

        assert!(matches!(err, DetectionError::Scheduler(SchedulerError::Queue { .. })));
        assert!(fx.store.similarity_info(ItemId::new(11)).await.is_some());
        let pending = fx.store.pending_jobs().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job.decode().unwrap().job_type, "notify_unique");
    }

    #[tokio::test]
    async fn follow_ups_use_the_configured_queue() {
        let fx = Fixture::new();
        fx.seed(14, day(3), 0.0).await;

        fx.detector(config())
            .with_follow_up_queue("pressroom")
            .detect(ItemId::new(14))
            .await
            .unwrap();

        let pushed = fx.queue.pushed().await;
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].queue, "pressroom");
    }

    #[tokio::test]
    async fn oversized_timeframe_fails_without_writing() {
        let fx = Fixture::new();
        fx.seed(15, day(3), 0.0).await;
        let config = config().with_timeframe_days(u32::MAX);

        let err = fx.detector(config).detect(ItemId::new(15)).await.unwrap_err();

        assert!(matches!(
            err,
            DetectionError::TimeframeOutOfRange { item_id, days }
                if item_id == ItemId::new(15) && days == u32::MAX
        ));
        assert!(fx.store.similarity_info(ItemId::new(15)).await.is_none());
        assert_eq!(fx.service.calls.search.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_delivery_is_idempotent() {
        let fx = Fixture::new();
        fx.seed(12, day(3), 0.0).await;
        let detector = fx.detector(config());

        detector.detect(ItemId::new(12)).await.unwrap();
        assert_eq!(
            detector.detect(ItemId::new(12)).await.unwrap(),
            DetectionOutcome::Skipped
        );
        assert_eq!(fx.queue.pushed().await.len(), 1);
    }

    #[tokio::test]
    async fn handles_queue_jobs() {
        let fx = Fixture::new();
        fx.seed(13, day(3), 0.0).await;
        let detector = fx.detector(config());

        detector
            .handle(&QueueJob::new(DETECT_DUPLICATES_JOB, vec![json!(13)]))
            .await
            .unwrap();
        assert!(fx.store.similarity_info(ItemId::new(13)).await.is_some());

        let bad = QueueJob::new(DETECT_DUPLICATES_JOB, vec![json!("x")]);
        assert!(detector.handle(&bad).await.is_err());
    }
}
