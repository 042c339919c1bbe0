//! Exact brute-force vector service for tests/dev.
//!
//! Inserts are staged per index and become searchable only after
//! `flush_index`, which is how the remote service behaves.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::service::{AnnError, CreateIndexRequest, Hit, SpaceType, VectorService};

#[derive(Debug, Clone)]
struct Index {
    params: CreateIndexRequest,
    vectors: BTreeMap<i64, Vec<f32>>,
    staged: BTreeMap<i64, Vec<f32>>,
}

/// Call counters, used by tests to assert on remote traffic.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub create_index: AtomicUsize,
    pub insert: AtomicUsize,
    pub search: AtomicUsize,
    pub flush: AtomicUsize,
    pub indices: AtomicUsize,
    pub delete: AtomicUsize,
}

#[derive(Debug, Default)]
pub struct InMemoryVectorService {
    indices: RwLock<BTreeMap<String, Index>>,
    unavailable: AtomicBool,
    hide_listing: AtomicBool,
    failing_deletes: RwLock<HashSet<String>>,
    pub calls: CallCounts,
}

impl InMemoryVectorService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `indices` return an empty listing, as a lagging replica would.
    pub fn hide_listing(&self, hidden: bool) {
        self.hide_listing.store(hidden, Ordering::SeqCst);
    }

    /// Make deletion of one index fail.
    pub async fn fail_deletes_of(&self, index: &str) {
        self.failing_deletes.write().await.insert(index.to_string());
    }

    /// Number of searchable vectors in `index`.
    pub async fn len(&self, index: &str) -> usize {
        self.indices
            .read()
            .await
            .get(index)
            .map_or(0, |i| i.vectors.len())
    }

    fn check_available(&self) -> Result<(), AnnError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AnnError::Transport("vector service unavailable".to_string()));
        }
        Ok(())
    }
}

fn distance(space: SpaceType, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match space {
        SpaceType::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        SpaceType::Ip => 1.0 - dot,
        SpaceType::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                1.0
            } else {
                1.0 - dot / (norm_a * norm_b)
            }
        }
    }
}

#[async_trait]
impl VectorService for InMemoryVectorService {
    async fn create_index(&self, request: &CreateIndexRequest) -> Result<(), AnnError> {
        self.check_available()?;
        self.calls.create_index.fetch_add(1, Ordering::SeqCst);

        let mut indices = self.indices.write().await;
        if indices.contains_key(&request.name) {
            return Err(AnnError::AlreadyExists(request.name.clone()));
        }
        indices.insert(
            request.name.clone(),
            Index {
                params: request.clone(),
                vectors: BTreeMap::new(),
                staged: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn insert_vector_with_id(
        &self,
        index: &str,
        id: i64,
        vector: &[f32],
    ) -> Result<(), AnnError> {
        self.check_available()?;
        self.calls.insert.fetch_add(1, Ordering::SeqCst);

        let mut indices = self.indices.write().await;
        let idx = indices
            .get_mut(index)
            .ok_or_else(|| AnnError::IndexNotFound(index.to_string()))?;
        if vector.len() != idx.params.dimension {
            return Err(AnnError::Service {
                status: 400,
                message: format!(
                    "vector has dimension {}, index expects {}",
                    vector.len(),
                    idx.params.dimension
                ),
            });
        }
        if idx.vectors.len() + idx.staged.len() >= idx.params.max_elements {
            return Err(AnnError::Service {
                status: 507,
                message: format!("index {index} is full"),
            });
        }
        idx.staged.insert(id, vector.to_vec());
        Ok(())
    }

    async fn search_knn(
        &self,
        index: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<Hit>, AnnError> {
        self.check_available()?;
        self.calls.search.fetch_add(1, Ordering::SeqCst);

        let indices = self.indices.read().await;
        let idx = indices
            .get(index)
            .ok_or_else(|| AnnError::IndexNotFound(index.to_string()))?;

        let mut hits: Vec<Hit> = idx
            .vectors
            .iter()
            .map(|(&id, v)| Hit {
                id,
                distance: distance(idx.params.space, vector, v),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn flush_index(&self, index: &str) -> Result<(), AnnError> {
        self.check_available()?;
        self.calls.flush.fetch_add(1, Ordering::SeqCst);

        let mut indices = self.indices.write().await;
        let idx = indices
            .get_mut(index)
            .ok_or_else(|| AnnError::IndexNotFound(index.to_string()))?;
        let staged = std::mem::take(&mut idx.staged);
        idx.vectors.extend(staged);
        Ok(())
    }

    async fn indices(&self) -> Result<Vec<String>, AnnError> {
        self.check_available()?;
        self.calls.indices.fetch_add(1, Ordering::SeqCst);
        if self.hide_listing.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(self.indices.read().await.keys().cloned().collect())
    }

    async fn delete_index(&self, index: &str) -> Result<(), AnnError> {
        self.check_available()?;
        self.calls.delete.fetch_add(1, Ordering::SeqCst);

        if self.failing_deletes.read().await.contains(index) {
            return Err(AnnError::Service {
                status: 500,
                message: format!("cannot delete {index}"),
            });
        }
        self.indices
            .write()
            .await
            .remove(index)
            .map(|_| ())
            .ok_or_else(|| AnnError::IndexNotFound(index.to_string()))
    }
}
