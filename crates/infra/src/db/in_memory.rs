//! In-memory store for tests/dev.
//!
//! A transaction takes an exclusive lock over the whole store and works on a
//! private copy that replaces the shared state on commit. This is stricter than
//! row-level locking but gives the same guarantees for a single item.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use pressroom_core::{ContentItem, ItemId, SimilarityInfo};

use super::error::StoreError;
use super::{ContentStore, ContentTx, PendingJobCursor, PendingJobStore, PendingJobWriter};
use crate::jobs::{JobId, PendingJob};

#[derive(Debug, Clone)]
struct PendingRow {
    job: PendingJob,
    dead_lettered_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct State {
    items: BTreeMap<ItemId, DateTime<Utc>>,
    vectors: HashMap<ItemId, Vec<f32>>,
    similarity: HashMap<ItemId, SimilarityInfo>,
    pending: BTreeMap<JobId, PendingRow>,
    commits: usize,
}

impl State {
    fn insert_pending(&mut self, jobs: &[PendingJob]) -> Result<(), StoreError> {
        if let Some(dup) = jobs.iter().find(|j| self.pending.contains_key(&j.id)) {
            return Err(StoreError::Conflict(format!(
                "pending job {} already exists",
                dup.id
            )));
        }
        for job in jobs {
            self.pending.insert(
                job.id.clone(),
                PendingRow {
                    job: job.clone(),
                    dead_lettered_at: None,
                    last_error: None,
                },
            );
        }
        Ok(())
    }

    fn delete_pending(&mut self, ids: &[JobId]) {
        for id in ids {
            self.pending.remove(id);
        }
    }
}

/// Pending-job row as seen by tests, including the dead-letter marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJobSnapshot {
    pub job: PendingJob,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// In-memory content + outbox store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an item together with its preloaded associations.
    pub async fn insert_item(&self, item: ContentItem) {
        let mut state = self.state.lock().await;
        state.items.insert(item.id, item.publish_date);
        if let Some(vector) = item.vector {
            state.vectors.insert(item.id, vector.data);
        }
        if let Some(similarity) = item.similarity {
            state.similarity.insert(item.id, similarity);
        }
    }

    pub async fn similarity_info(&self, id: ItemId) -> Option<SimilarityInfo> {
        self.state.lock().await.similarity.get(&id).cloned()
    }

    /// All pending-job rows ordered by id.
    pub async fn pending_jobs(&self) -> Vec<PendingJobSnapshot> {
        self.state
            .lock()
            .await
            .pending
            .values()
            .map(|row| PendingJobSnapshot {
                job: row.job.clone(),
                dead_lettered_at: row.dead_lettered_at,
                last_error: row.last_error.clone(),
            })
            .collect()
    }

    /// Number of committed transactions.
    pub async fn commits(&self) -> usize {
        self.state.lock().await.commits
    }
}

/// Open in-memory transaction. Dropping it discards all staged changes.
#[derive(Debug)]
pub struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[async_trait]
impl ContentStore for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(InMemoryTx { guard, staged })
    }
}

#[async_trait]
impl ContentTx for InMemoryTx {
    async fn lock_item(&mut self, id: ItemId) -> Result<Option<ContentItem>, StoreError> {
        let Some(publish_date) = self.staged.items.get(&id).copied() else {
            return Ok(None);
        };
        let mut item = ContentItem::new(id, publish_date);
        if let Some(data) = self.staged.vectors.get(&id) {
            item = item.with_vector(data.clone());
        }
        item.similarity = self.staged.similarity.get(&id).cloned();
        Ok(Some(item))
    }

    async fn insert_similarity_info(&mut self, info: &SimilarityInfo) -> Result<(), StoreError> {
        if !self.staged.items.contains_key(&info.item_id) {
            return Err(StoreError::Integrity(format!(
                "item {} does not exist",
                info.item_id
            )));
        }
        if self.staged.similarity.contains_key(&info.item_id) {
            return Err(StoreError::Conflict(format!(
                "similarity info for item {} already exists",
                info.item_id
            )));
        }
        self.staged.similarity.insert(info.item_id, info.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.staged.commits += 1;
        *self.guard = self.staged;
        Ok(())
    }
}

#[async_trait]
impl PendingJobWriter for InMemoryTx {
    async fn insert_pending_jobs(&mut self, jobs: &[PendingJob]) -> Result<(), StoreError> {
        self.staged.insert_pending(jobs)
    }

    async fn delete_pending_jobs(&mut self, ids: &[JobId]) -> Result<(), StoreError> {
        self.staged.delete_pending(ids);
        Ok(())
    }
}

/// Autocommit writes, used to seed outbox rows in tests.
#[async_trait]
impl PendingJobWriter for InMemoryStore {
    async fn insert_pending_jobs(&mut self, jobs: &[PendingJob]) -> Result<(), StoreError> {
        self.state.lock().await.insert_pending(jobs)
    }

    async fn delete_pending_jobs(&mut self, ids: &[JobId]) -> Result<(), StoreError> {
        self.state.lock().await.delete_pending(ids);
        Ok(())
    }
}

#[async_trait]
impl PendingJobStore for InMemoryStore {
    async fn stale_pending_jobs(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&PendingJobCursor>,
        limit: usize,
    ) -> Result<Vec<PendingJob>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<&PendingRow> = state
            .pending
            .values()
            .filter(|row| row.dead_lettered_at.is_none() && row.job.created_at < cutoff)
            .filter(|row| match after {
                Some(c) => (row.job.created_at, &row.job.id) > (c.created_at, &c.id),
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| {
            (a.job.created_at, &a.job.id).cmp(&(b.job.created_at, &b.job.id))
        });
        Ok(rows.into_iter().take(limit).map(|r| r.job.clone()).collect())
    }

    async fn delete_pending_job(&self, id: &JobId) -> Result<(), StoreError> {
        self.state.lock().await.pending.remove(id);
        Ok(())
    }

    async fn delete_pending_jobs(&self, ids: &[JobId]) -> Result<(), StoreError> {
        self.state.lock().await.delete_pending(ids);
        Ok(())
    }

    async fn dead_letter_pending_job(
        &self,
        id: &JobId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(row) = self.state.lock().await.pending.get_mut(id) {
            row.dead_lettered_at = Some(at);
            row.last_error = Some(reason.to_string());
        }
        Ok(())
    }
}
