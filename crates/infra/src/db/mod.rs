//! Relational store boundary.
//!
//! The store is the single source of truth for the pipeline. Workers use it
//! through three seams:
//!
//! - [`PendingJobWriter`]: batched outbox writes inside an open transaction
//! - [`PendingJobStore`]: autocommit outbox access used after commit and by
//!   the recoverer
//! - [`ContentStore`] / [`ContentTx`]: transactional, row-locked access to
//!   content items and their enrichment records
//!
//! Dropping a [`ContentTx`] without calling `commit` rolls it back.

pub mod error;
pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pressroom_core::{ContentItem, ItemId, SimilarityInfo};

use crate::jobs::{JobId, PendingJob};

pub use error::StoreError;
pub use in_memory::{InMemoryStore, InMemoryTx};
pub use postgres::{PgTx, PostgresStore};

/// Keyset position in the `(created_at, id)` ordering of pending jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJobCursor {
    pub created_at: DateTime<Utc>,
    pub id: JobId,
}

impl PendingJobCursor {
    pub fn after(job: &PendingJob) -> Self {
        Self {
            created_at: job.created_at,
            id: job.id.clone(),
        }
    }
}

/// Outbox writes that must share the caller's transaction.
#[async_trait]
pub trait PendingJobWriter: Send {
    /// Insert all records with a single statement.
    async fn insert_pending_jobs(&mut self, jobs: &[PendingJob]) -> Result<(), StoreError>;

    /// Delete all records with the given ids with a single statement.
    async fn delete_pending_jobs(&mut self, ids: &[JobId]) -> Result<(), StoreError>;
}

/// Outbox access outside of a domain transaction.
#[async_trait]
pub trait PendingJobStore: Send + Sync {
    /// Pending jobs created strictly before `cutoff`, ordered by `(created_at, id)`,
    /// starting after `after`. Dead-lettered rows are excluded.
    async fn stale_pending_jobs(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&PendingJobCursor>,
        limit: usize,
    ) -> Result<Vec<PendingJob>, StoreError>;

    async fn delete_pending_job(&self, id: &JobId) -> Result<(), StoreError>;

    async fn delete_pending_jobs(&self, ids: &[JobId]) -> Result<(), StoreError>;

    /// Flag a record that can never be pushed so that stale scans skip it.
    async fn dead_letter_pending_job(
        &self,
        id: &JobId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Transaction over content items.
#[async_trait]
pub trait ContentTx: PendingJobWriter + Send {
    /// Row-lock the item (`FOR UPDATE`) and preload its vector and similarity
    /// verdict. `None` when the item does not exist.
    async fn lock_item(&mut self, id: ItemId) -> Result<Option<ContentItem>, StoreError>;

    /// Persist a similarity verdict. A second verdict for the same item is a
    /// [`StoreError::Conflict`].
    async fn insert_similarity_info(&mut self, info: &SimilarityInfo) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// Transaction factory.
#[async_trait]
pub trait ContentStore: Send + Sync {
    type Tx: ContentTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}
