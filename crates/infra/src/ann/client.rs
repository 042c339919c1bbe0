//! Day-sharded ANN index client.
//!
//! Each UTC calendar day has its own index on the remote service. The client
//! keeps a process-local set of shard names it has seen; the set is refreshed
//! from the service on a miss and is never treated as authoritative.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use pressroom_core::ItemId;

use super::service::{AnnError, CreateIndexRequest, SpaceType, VectorService};
use super::shard::{day_of, days_in_range, index_day, index_name, merge_hits};

#[derive(Debug, Clone, PartialEq)]
pub struct AnnIndexConfig {
    /// Prepended to the `YYYY-MM-DD` day of every shard.
    pub prefix: String,
    pub dimension: usize,
    pub ef_construction: usize,
    pub m: usize,
    /// Capacity of one shard. Also used as `k` for searches.
    pub max_elements: usize,
    pub seed: u64,
    pub space: SpaceType,
}

impl Default for AnnIndexConfig {
    fn default() -> Self {
        Self {
            prefix: "items_".to_string(),
            dimension: 384,
            ef_construction: 200,
            m: 16,
            max_elements: 10_000,
            seed: 100,
            space: SpaceType::L2,
        }
    }
}

impl AnnIndexConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    pub fn with_space(mut self, space: SpaceType) -> Self {
        self.space = space;
        self
    }

    pub fn validate(&self) -> Result<(), AnnError> {
        if self.dimension == 0 {
            return Err(AnnError::InvalidConfig("dimension must be positive".into()));
        }
        if self.max_elements == 0 {
            return Err(AnnError::InvalidConfig("max_elements must be positive".into()));
        }
        Ok(())
    }
}

/// Search window and query.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams<'a> {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub vector: &'a [f32],
    pub distance_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub item_id: ItemId,
    pub distance: f32,
}

pub struct AnnIndexClient<S> {
    service: S,
    config: AnnIndexConfig,
    known: RwLock<HashSet<String>>,
}

impl<S: VectorService> AnnIndexClient<S> {
    pub fn new(service: S, config: AnnIndexConfig) -> Result<Self, AnnError> {
        config.validate()?;
        Ok(Self {
            service,
            config,
            known: RwLock::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &AnnIndexConfig {
        &self.config
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Shard name for the UTC day of `at`.
    pub fn index_name<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> String {
        index_name(&self.config.prefix, at)
    }

    /// Replace the local shard set with the service's listing.
    async fn refresh(&self) -> Result<(), AnnError> {
        let names = self.service.indices().await?;
        let mut known = self.known.write().await;
        *known = names
            .into_iter()
            .filter(|name| index_day(name, &self.config.prefix).is_some())
            .collect();
        Ok(())
    }

    async fn is_known(&self, name: &str) -> bool {
        self.known.read().await.contains(name)
    }

    /// Make sure the shard exists: local set, then a refresh, then creation.
    async fn ensure_index(&self, name: &str) -> Result<(), AnnError> {
        if self.is_known(name).await {
            return Ok(());
        }
        self.refresh().await?;
        if self.is_known(name).await {
            return Ok(());
        }

        let request = CreateIndexRequest {
            name: name.to_string(),
            dimension: self.config.dimension,
            ef_construction: self.config.ef_construction,
            m: self.config.m,
            max_elements: self.config.max_elements,
            seed: self.config.seed,
            space: self.config.space,
            auto_id: false,
        };
        match self.service.create_index(&request).await {
            Ok(()) => debug!(index = name, "created index"),
            Err(e) if e.is_already_exists() => {
                debug!(index = name, "index created concurrently");
            }
            Err(e) => return Err(e),
        }

        self.known.write().await.insert(name.to_string());
        Ok(())
    }

    /// Add `vector` under `id` to the shard of `at`, creating the shard when
    /// needed, then flush the shard so the vector is searchable.
    #[instrument(skip(self, vector), fields(item_id = %id, index), err)]
    pub async fn insert<Tz: TimeZone>(
        &self,
        id: ItemId,
        at: &DateTime<Tz>,
        vector: &[f32],
    ) -> Result<(), AnnError>
    where
        Tz::Offset: Send + Sync,
    {
        let name = self.index_name(at);
        tracing::Span::current().record("index", name.as_str());

        self.ensure_index(&name).await?;
        self.service
            .insert_vector_with_id(&name, id.get(), vector)
            .await?;
        self.service.flush_index(&name).await
    }

    /// KNN over every shard whose day lies in `[from, to]`.
    ///
    /// Hits farther than the threshold are dropped; the rest are sorted by
    /// distance, then id. No shard in range is an empty result.
    #[instrument(skip(self, params), fields(from = %params.from, to = %params.to, shards), err)]
    pub async fn search_knn(&self, params: SearchParams<'_>) -> Result<Vec<Neighbor>, AnnError> {
        let days = days_in_range(day_of(&params.from), day_of(&params.to))?;
        if days.is_empty() {
            return Ok(Vec::new());
        }

        let candidates: Vec<String> = days
            .iter()
            .map(|day| format!("{}{}", self.config.prefix, day.format("%Y-%m-%d")))
            .collect();

        let all_known = {
            let known = self.known.read().await;
            candidates.iter().all(|name| known.contains(name))
        };
        if !all_known {
            self.refresh().await?;
        }

        let shards: Vec<String> = {
            let known = self.known.read().await;
            candidates
                .into_iter()
                .filter(|name| known.contains(name))
                .collect()
        };
        tracing::Span::current().record("shards", shards.len());

        let mut per_shard = Vec::with_capacity(shards.len());
        for shard in &shards {
            let hits = self
                .service
                .search_knn(shard, params.vector, self.config.max_elements)
                .await?;
            per_shard.push(hits);
        }

        Ok(merge_hits(per_shard, params.distance_threshold)
            .into_iter()
            .map(|hit| Neighbor {
                item_id: ItemId::new(hit.id),
                distance: hit.distance,
            })
            .collect())
    }

    /// Known shards whose day is strictly before the UTC day of `at`.
    pub async fn indices_older_than<Tz: TimeZone>(
        &self,
        at: &DateTime<Tz>,
    ) -> Result<Vec<String>, AnnError>
    where
        Tz::Offset: Send + Sync,
    {
        let cutoff = day_of(at);
        self.refresh().await?;

        let known = self.known.read().await;
        let mut old: Vec<String> = known
            .iter()
            .filter(|name| index_day(name, &self.config.prefix).is_some_and(|day| day < cutoff))
            .cloned()
            .collect();
        old.sort();
        Ok(old)
    }

    #[instrument(skip(self), err)]
    pub async fn delete_index(&self, name: &str) -> Result<(), AnnError> {
        self.service.delete_index(name).await?;
        self.known.write().await.remove(name);
        Ok(())
    }

    pub async fn flush_all_indices(&self) -> Result<(), AnnError> {
        self.refresh().await?;
        let names: Vec<String> = self.known.read().await.iter().cloned().collect();
        for name in &names {
            self.service.flush_index(name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::in_memory::InMemoryVectorService;
    use chrono::{Duration, FixedOffset};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn client(service: &Arc<InMemoryVectorService>) -> AnnIndexClient<Arc<InMemoryVectorService>> {
        let config = AnnIndexConfig::default()
            .with_prefix("test_")
            .with_dimension(1)
            .with_max_elements(100);
        AnnIndexClient::new(service.clone(), config).unwrap()
    }

    fn day(d: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, hour, 0, 0).unwrap()
    }

    #[test]
    fn rejects_invalid_config() {
        let service = Arc::new(InMemoryVectorService::new());
        let config = AnnIndexConfig::default().with_dimension(0);
        assert!(matches!(
            AnnIndexClient::new(service, config),
            Err(AnnError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn insert_creates_shard_once_and_flushes() {
        let service = Arc::new(InMemoryVectorService::new());
        let client = client(&service);

        client.insert(ItemId::new(1), &day(1, 3), &[0.1]).await.unwrap();
        client.insert(ItemId::new(2), &day(1, 20), &[0.2]).await.unwrap();

        assert_eq!(service.calls.create_index.load(Ordering::SeqCst), 1);
        assert_eq!(service.calls.flush.load(Ordering::SeqCst), 2);
        assert_eq!(service.len("test_2024-05-01").await, 2);
    }

    #[tokio::test]
    async fn cache_miss_consults_remote_listing() {
        let service = Arc::new(InMemoryVectorService::new());
        let first = client(&service);
        let second = client(&service);

        first.insert(ItemId::new(1), &day(2, 0), &[0.0]).await.unwrap();
        second.insert(ItemId::new(2), &day(2, 1), &[0.0]).await.unwrap();

        assert_eq!(service.calls.create_index.load(Ordering::SeqCst), 1);
        assert_eq!(service.len("test_2024-05-02").await, 2);
    }

    #[tokio::test]
    async fn creation_race_is_tolerated() {
        let service = Arc::new(InMemoryVectorService::new());
        let client = client(&service);
        let name = client.index_name(&day(2, 0));

        // Another process created the shard; the listing does not show it yet.
        service
            .create_index(&CreateIndexRequest {
                name: name.clone(),
                dimension: 1,
                ef_construction: 200,
                m: 16,
                max_elements: 100,
                seed: 100,
                space: SpaceType::L2,
                auto_id: false,
            })
            .await
            .unwrap();
        service.hide_listing(true);

        client.insert(ItemId::new(1), &day(2, 0), &[0.0]).await.unwrap();
        assert_eq!(service.len(&name).await, 1);
    }

    #[tokio::test]
    async fn insert_maps_offsets_to_utc_day() {
        let service = Arc::new(InMemoryVectorService::new());
        let client = client(&service);
        let berlin = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = berlin.with_ymd_and_hms(2024, 5, 3, 1, 0, 0).unwrap();

        client.insert(ItemId::new(9), &local, &[0.5]).await.unwrap();
        assert_eq!(service.len("test_2024-05-02").await, 1);
    }

    #[tokio::test]
    async fn search_with_no_shards_in_range_is_empty() {
        let service = Arc::new(InMemoryVectorService::new());
        let client = client(&service);
        client.insert(ItemId::new(1), &day(1, 0), &[0.0]).await.unwrap();

        let hits = client
            .search_knn(SearchParams {
                from: day(5, 0),
                to: day(6, 0),
                vector: &[0.0],
                distance_threshold: 1.0,
            })
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(service.calls.search.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_merges_shards_in_range() {
        let service = Arc::new(InMemoryVectorService::new());
        let client = client(&service);
        // 1-D L2 distance is squared, so sqrt(d) lands at distance d from 0.
        let fixture = [
            (1, 0.1, 1),
            (2, 0.3, 1),
            (3, 0.6, 1),
            (4, 0.2, 2),
            (5, 0.4, 2),
            (6, 0.7, 2),
            (7, 0.3, 3),
            (8, 0.8, 3),
            (9, 0.9, 3),
        ];
        for (id, distance, d) in fixture {
            let x = f32::sqrt(distance);
            client.insert(ItemId::new(id), &day(d, 12), &[x]).await.unwrap();
        }
        client.insert(ItemId::new(10), &day(4, 12), &[0.0]).await.unwrap();

        let hits = client
            .search_knn(SearchParams {
                from: day(1, 0),
                to: day(3, 23),
                vector: &[0.0],
                distance_threshold: 0.5,
            })
            .await
            .unwrap();

        let ids: Vec<i64> = hits.iter().map(|n| n.item_id.get()).collect();
        assert_eq!(ids, vec![1, 4, 2, 7, 5]);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[tokio::test]
    async fn lists_only_strictly_older_shards() {
        let service = Arc::new(InMemoryVectorService::new());
        let client = client(&service);
        for d in 1..=3 {
            client.insert(ItemId::new(d as i64), &day(d, 0), &[0.0]).await.unwrap();
        }

        let old = client.indices_older_than(&day(3, 23)).await.unwrap();
        assert_eq!(old, vec!["test_2024-05-01", "test_2024-05-02"]);

        client.delete_index("test_2024-05-01").await.unwrap();
        let old = client.indices_older_than(&(day(3, 0) + Duration::days(1))).await.unwrap();
        assert_eq!(old, vec!["test_2024-05-02", "test_2024-05-03"]);
    }

    #[tokio::test]
    async fn flush_all_visits_every_shard() {
        let service = Arc::new(InMemoryVectorService::new());
        let client = client(&service);
        client.insert(ItemId::new(1), &day(1, 0), &[0.0]).await.unwrap();
        client.insert(ItemId::new(2), &day(2, 0), &[0.0]).await.unwrap();
        let before = service.calls.flush.load(Ordering::SeqCst);

        client.flush_all_indices().await.unwrap();
        assert_eq!(service.calls.flush.load(Ordering::SeqCst), before + 2);
    }

    #[tokio::test]
    async fn overly_wide_search_is_rejected_without_calls() {
        let service = Arc::new(InMemoryVectorService::new());
        let client = client(&service);

        let err = client
            .search_knn(SearchParams {
                from: day(1, 0) - Duration::days(400),
                to: day(1, 0),
                vector: &[0.0],
                distance_threshold: 1.0,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AnnError::RangeTooWide { days: 401, .. }));
        assert_eq!(service.calls.indices.load(Ordering::SeqCst), 0);
        assert_eq!(service.calls.search.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn service_failures_propagate() {
        let service = Arc::new(InMemoryVectorService::new());
        let client = client(&service);
        service.set_unavailable(true);
        assert!(matches!(
            client.insert(ItemId::new(1), &day(1, 0), &[0.0]).await,
            Err(AnnError::Transport(_))
        ));
    }
}
