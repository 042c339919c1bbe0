//! Postgres-backed content and outbox store.
//!
//! Tables (see `migrations/0001_pipeline.sql`):
//!
//! - `items(id, publish_date, ...)`
//! - `vectors(item_id UNIQUE, data REAL[])`
//! - `similarity_infos(item_id UNIQUE, parent_id NULL, distance NULL)`
//! - `pending_jobs(id PRIMARY KEY, created_at, data, dead_lettered_at, last_error)`
//!
//! ## Thread Safety
//!
//! `PostgresStore` is `Send + Sync` and cheap to clone; all operations go
//! through the SQLx connection pool. A [`PgTx`] owns one pooled connection for
//! its lifetime and rolls back on drop unless committed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, instrument};

use pressroom_core::{ContentItem, ItemId, SimilarityInfo, Vector};

use super::error::{StoreError, map_sqlx_error};
use super::{ContentStore, ContentTx, PendingJobCursor, PendingJobStore, PendingJobWriter};
use crate::jobs::{JobId, PendingJob};

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// An open Postgres transaction.
pub struct PgTx {
    inner: Transaction<'static, Postgres>,
}

#[async_trait]
impl ContentStore for PostgresStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        let inner = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgTx { inner })
    }
}

#[async_trait]
impl ContentTx for PgTx {
    #[instrument(skip(self), fields(item_id = %id), err)]
    async fn lock_item(&mut self, id: ItemId) -> Result<Option<ContentItem>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, publish_date
            FROM items
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.get())
        .fetch_optional(&mut *self.inner)
        .await
        .map_err(|e| map_sqlx_error("lock_item", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let publish_date: DateTime<Utc> = row
            .try_get("publish_date")
            .map_err(|e| map_sqlx_error("lock_item", e))?;
        let mut item = ContentItem::new(id, publish_date);

        let vector = sqlx::query("SELECT data FROM vectors WHERE item_id = $1")
            .bind(id.get())
            .fetch_optional(&mut *self.inner)
            .await
            .map_err(|e| map_sqlx_error("load_vector", e))?;
        if let Some(row) = vector {
            let data: Vec<f32> = row
                .try_get("data")
                .map_err(|e| map_sqlx_error("load_vector", e))?;
            item.vector = Some(Vector::new(id, data));
        }

        let similarity = sqlx::query(
            "SELECT parent_id, distance FROM similarity_infos WHERE item_id = $1",
        )
        .bind(id.get())
        .fetch_optional(&mut *self.inner)
        .await
        .map_err(|e| map_sqlx_error("load_similarity_info", e))?;
        if let Some(row) = similarity {
            let parent_id: Option<i64> = row
                .try_get("parent_id")
                .map_err(|e| map_sqlx_error("load_similarity_info", e))?;
            let distance: Option<f32> = row
                .try_get("distance")
                .map_err(|e| map_sqlx_error("load_similarity_info", e))?;
            item.similarity = Some(SimilarityInfo {
                item_id: id,
                parent_id: parent_id.map(ItemId::new),
                distance,
            });
        }

        Ok(Some(item))
    }

    #[instrument(skip(self, info), fields(item_id = %info.item_id, parent_id = ?info.parent_id), err)]
    async fn insert_similarity_info(&mut self, info: &SimilarityInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO similarity_infos (item_id, parent_id, distance)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(info.item_id.get())
        .bind(info.parent_id.map(ItemId::get))
        .bind(info.distance)
        .execute(&mut *self.inner)
        .await
        .map_err(|e| map_sqlx_error("insert_similarity_info", e))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.inner
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

#[async_trait]
impl PendingJobWriter for PgTx {
    async fn insert_pending_jobs(&mut self, jobs: &[PendingJob]) -> Result<(), StoreError> {
        insert_pending_jobs(&mut *self.inner, jobs).await
    }

    async fn delete_pending_jobs(&mut self, ids: &[JobId]) -> Result<(), StoreError> {
        delete_pending_jobs(&mut *self.inner, ids).await
    }
}

#[async_trait]
impl PendingJobStore for PostgresStore {
    #[instrument(skip(self, after), fields(returned), err)]
    async fn stale_pending_jobs(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<&PendingJobCursor>,
        limit: usize,
    ) -> Result<Vec<PendingJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, data
            FROM pending_jobs
            WHERE created_at < $1
                AND dead_lettered_at IS NULL
                AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3))
            ORDER BY created_at ASC, id ASC
            LIMIT $4
            "#,
        )
        .bind(cutoff)
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.id.as_str().to_string()).unwrap_or_default())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stale_pending_jobs", e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("stale_pending_jobs", e))?;
            jobs.push(PendingJob {
                id: JobId::from(id),
                created_at: row
                    .try_get("created_at")
                    .map_err(|e| map_sqlx_error("stale_pending_jobs", e))?,
                data: row
                    .try_get("data")
                    .map_err(|e| map_sqlx_error("stale_pending_jobs", e))?,
            });
        }

        Span::current().record("returned", jobs.len());
        Ok(jobs)
    }

    async fn delete_pending_job(&self, id: &JobId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_jobs WHERE id = $1")
            .bind(id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_pending_job", e))?;
        Ok(())
    }

    async fn delete_pending_jobs(&self, ids: &[JobId]) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        delete_pending_jobs(&mut *conn, ids).await
    }

    async fn dead_letter_pending_job(
        &self,
        id: &JobId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE pending_jobs
            SET dead_lettered_at = $2, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(at)
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_pending_job", e))?;
        Ok(())
    }
}

async fn insert_pending_jobs(
    conn: &mut sqlx::PgConnection,
    jobs: &[PendingJob],
) -> Result<(), StoreError> {
    if jobs.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new("INSERT INTO pending_jobs (id, created_at, data) ");
    builder.push_values(jobs, |mut row, job| {
        row.push_bind(job.id.as_str().to_string())
            .push_bind(job.created_at)
            .push_bind(job.data.clone());
    });

    builder
        .build()
        .execute(conn)
        .await
        .map_err(|e| map_sqlx_error("insert_pending_jobs", e))?;
    Ok(())
}

async fn delete_pending_jobs(
    conn: &mut sqlx::PgConnection,
    ids: &[JobId],
) -> Result<(), StoreError> {
    if ids.is_empty() {
        return Ok(());
    }

    let ids: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
    sqlx::query("DELETE FROM pending_jobs WHERE id = ANY($1)")
        .bind(&ids)
        .execute(conn)
        .await
        .map_err(|e| map_sqlx_error("delete_pending_jobs", e))?;
    Ok(())
}
