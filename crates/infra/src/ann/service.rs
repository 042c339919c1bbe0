//! Vector-search service RPC surface.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AnnError {
    #[error("index {0} already exists")]
    AlreadyExists(String),

    #[error("index {0} not found")]
    IndexNotFound(String),

    #[error("vector service transport error: {0}")]
    Transport(String),

    #[error("vector service error ({status}): {message}")]
    Service { status: u16, message: String },

    #[error("failed to decode vector service response: {0}")]
    Decode(String),

    #[error("invalid index configuration: {0}")]
    InvalidConfig(String),

    #[error("search range of {days} days exceeds the {max} day limit")]
    RangeTooWide { days: i64, max: i64 },
}

impl AnnError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl From<reqwest::Error> for AnnError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Distance function of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    /// Squared euclidean distance.
    #[default]
    L2,
    /// `1 - dot(a, b)`.
    Ip,
    /// `1 - cos(a, b)`.
    Cosine,
}

impl std::str::FromStr for SpaceType {
    type Err = AnnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" => Ok(Self::L2),
            "ip" => Ok(Self::Ip),
            "cosine" => Ok(Self::Cosine),
            other => Err(AnnError::InvalidConfig(format!("unknown space type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIndexRequest {
    pub name: String,
    pub dimension: usize,
    pub ef_construction: usize,
    pub m: usize,
    pub max_elements: usize,
    pub seed: u64,
    pub space: SpaceType,
    /// Always false: callers supply item ids.
    pub auto_id: bool,
}

/// One KNN result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: i64,
    pub distance: f32,
}

/// Remote ANN service. Each index is an independent HNSW graph.
#[async_trait]
pub trait VectorService: Send + Sync {
    /// Fails with [`AnnError::AlreadyExists`] when the name is taken.
    async fn create_index(&self, request: &CreateIndexRequest) -> Result<(), AnnError>;

    async fn insert_vector_with_id(
        &self,
        index: &str,
        id: i64,
        vector: &[f32],
    ) -> Result<(), AnnError>;

    async fn search_knn(&self, index: &str, vector: &[f32], k: usize)
    -> Result<Vec<Hit>, AnnError>;

    async fn flush_index(&self, index: &str) -> Result<(), AnnError>;

    async fn indices(&self) -> Result<Vec<String>, AnnError>;

    async fn delete_index(&self, index: &str) -> Result<(), AnnError>;
}

#[async_trait]
impl<V> VectorService for Arc<V>
where
    V: VectorService + ?Sized,
{
    async fn create_index(&self, request: &CreateIndexRequest) -> Result<(), AnnError> {
        (**self).create_index(request).await
    }

    async fn insert_vector_with_id(
        &self,
        index: &str,
        id: i64,
        vector: &[f32],
    ) -> Result<(), AnnError> {
        (**self).insert_vector_with_id(index, id, vector).await
    }

    async fn search_knn(
        &self,
        index: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<Hit>, AnnError> {
        (**self).search_knn(index, vector, k).await
    }

    async fn flush_index(&self, index: &str) -> Result<(), AnnError> {
        (**self).flush_index(index).await
    }

    async fn indices(&self) -> Result<Vec<String>, AnnError> {
        (**self).indices().await
    }

    async fn delete_index(&self, index: &str) -> Result<(), AnnError> {
        (**self).delete_index(index).await
    }
}
