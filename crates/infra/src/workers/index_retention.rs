//! Drops ANN shards that fell out of the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ann::{AnnError, AnnIndexClient, VectorService};

#[derive(Debug, Clone)]
pub struct IndexRetentionConfig {
    /// Shards for days at least this many days before today are deleted.
    pub retention_days: u32,
    pub interval: Duration,
}

impl Default for IndexRetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            interval: Duration::from_secs(60 * 60),
        }
    }
}

pub struct IndexRetention<V> {
    ann: Arc<AnnIndexClient<V>>,
    config: IndexRetentionConfig,
}

impl<V: VectorService> IndexRetention<V> {
    pub fn new(ann: Arc<AnnIndexClient<V>>, config: IndexRetentionConfig) -> Self {
        Self { ann, config }
    }

    /// Delete every shard older than `now - retention_days`.
    ///
    /// A failed deletion is logged and the sweep moves on; the shard is
    /// retried next time. Returns the names actually deleted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>, AnnError> {
        // A window reaching past the earliest representable date expires nothing.
        let Some(cutoff) = chrono::Duration::try_days(i64::from(self.config.retention_days))
            .and_then(|span| now.checked_sub_signed(span))
        else {
            return Ok(Vec::new());
        };
        let expired = self.ann.indices_older_than(&cutoff).await?;

        let mut deleted = Vec::with_capacity(expired.len());
        for name in expired {
            match self.ann.delete_index(&name).await {
                Ok(()) => deleted.push(name),
                Err(e) => warn!(index = %name, error = %e, "failed to delete expired index"),
            }
        }

        if !deleted.is_empty() {
            info!(count = deleted.len(), "deleted expired indices");
        }
        Ok(deleted)
    }

    /// Sweep every `interval` until cancelled. Listing failures end only the
    /// current sweep.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if let Err(e) = self.sweep(Utc::now()).await {
                warn!(error = %e, "index retention sweep failed");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::{AnnIndexConfig, InMemoryVectorService};
    use chrono::TimeZone;
    use pressroom_core::ItemId;

    async fn setup(days: &[u32]) -> (Arc<InMemoryVectorService>, IndexRetention<Arc<InMemoryVectorService>>) {
        let service = Arc::new(InMemoryVectorService::new());
        let config = AnnIndexConfig::default().with_prefix("ret_").with_dimension(1);
        let ann = Arc::new(AnnIndexClient::new(service.clone(), config).unwrap());
        for &d in days {
            let at = Utc.with_ymd_and_hms(2024, 6, d, 0, 0, 0).unwrap();
            ann.insert(ItemId::new(i64::from(d)), &at, &[0.0]).await.unwrap();
        }
        let retention = IndexRetention::new(
            ann,
            IndexRetentionConfig {
                retention_days: 2,
                ..Default::default()
            },
        );
        (service, retention)
    }

    #[tokio::test]
    async fn deletes_shards_outside_window() {
        let (service, retention) = setup(&[1, 2, 3, 4, 5]).await;
        let now = Utc.with_ymd_and_hms(2024, 6, 5, 10, 0, 0).unwrap();

        let deleted = retention.sweep(now).await.unwrap();

        assert_eq!(deleted, vec!["ret_2024-06-01", "ret_2024-06-02"]);
        let mut left = service.indices().await.unwrap();
        left.sort();
        assert_eq!(left, vec!["ret_2024-06-03", "ret_2024-06-04", "ret_2024-06-05"]);
    }

    #[tokio::test]
    async fn continues_past_failed_deletions() {
        let (service, retention) = setup(&[1, 2, 3]).await;
        service.fail_deletes_of("ret_2024-06-01").await;
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap();

        let deleted = retention.sweep(now).await.unwrap();

        assert_eq!(deleted, vec!["ret_2024-06-02", "ret_2024-06-03"]);
        assert_eq!(service.indices().await.unwrap(), vec!["ret_2024-06-01"]);
    }

    #[tokio::test]
    async fn unbounded_window_keeps_everything() {
        let (service, _) = setup(&[1, 2]).await;
        let config = AnnIndexConfig::default().with_prefix("ret_").with_dimension(1);
        let ann = Arc::new(AnnIndexClient::new(service.clone(), config).unwrap());
        let retention = IndexRetention::new(
            ann,
            IndexRetentionConfig {
                retention_days: u32::MAX,
                ..Default::default()
            },
        );

        assert!(retention.sweep(Utc::now()).await.unwrap().is_empty());
        assert_eq!(service.indices().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let (service, retention) = setup(&[1]).await;
        service.set_unavailable(true);
        assert!(retention.sweep(Utc::now()).await.is_err());
    }
}
