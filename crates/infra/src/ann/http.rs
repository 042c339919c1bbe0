//! HTTP/JSON client for the vector-search sidecar.
//!
//! One `POST {base_url}/{operation}` endpoint per RPC. Non-success statuses
//! carry the error message in the body.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::service::{AnnError, CreateIndexRequest, Hit, VectorService};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpVectorService {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct IndexRef<'a> {
    index: &'a str,
}

#[derive(Serialize)]
struct InsertRequest<'a> {
    index: &'a str,
    id: i64,
    vector: &'a [f32],
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    index: &'a str,
    vector: &'a [f32],
    k: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct IndicesResponse {
    indices: Vec<String>,
}

#[derive(Deserialize)]
struct Empty {}

impl HttpVectorService {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AnnError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AnnError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnnError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn call<B, T>(&self, operation: &str, index: Option<&str>, body: &B) -> Result<T, AnnError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, operation);
        let resp = self.client.post(&url).json(body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = error_message(resp.text().await);
            return Err(classify(status.as_u16(), message, index));
        }

        Ok(resp.json().await?)
    }
}

/// Body of an error response, or the reason it could not be read.
fn error_message<E: std::fmt::Display>(body: Result<String, E>) -> String {
    match body {
        Ok(body) => body,
        Err(e) => format!("failed to read error body: {e}"),
    }
}

/// Map an error status to the variant callers branch on.
fn classify(status: u16, message: String, index: Option<&str>) -> AnnError {
    let index = index.unwrap_or_default().to_string();
    match status {
        409 => AnnError::AlreadyExists(index),
        _ if message.to_ascii_lowercase().contains("already exists") => {
            AnnError::AlreadyExists(index)
        }
        404 => AnnError::IndexNotFound(index),
        _ => AnnError::Service { status, message },
    }
}

#[async_trait]
impl VectorService for HttpVectorService {
    #[instrument(skip(self, request), fields(index = %request.name), err)]
    async fn create_index(&self, request: &CreateIndexRequest) -> Result<(), AnnError> {
        let _: Empty = self
            .call("create_index", Some(&request.name), request)
            .await?;
        Ok(())
    }

    async fn insert_vector_with_id(
        &self,
        index: &str,
        id: i64,
        vector: &[f32],
    ) -> Result<(), AnnError> {
        let _: Empty = self
            .call("insert_vector_with_id", Some(index), &InsertRequest { index, id, vector })
            .await?;
        Ok(())
    }

    async fn search_knn(
        &self,
        index: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<Hit>, AnnError> {
        let resp: SearchResponse = self
            .call("search_knn", Some(index), &SearchRequest { index, vector, k })
            .await?;
        Ok(resp.hits)
    }

    async fn flush_index(&self, index: &str) -> Result<(), AnnError> {
        let _: Empty = self
            .call("flush_index", Some(index), &IndexRef { index })
            .await?;
        Ok(())
    }

    async fn indices(&self) -> Result<Vec<String>, AnnError> {
        let resp: IndicesResponse = self.call("indices", None, &serde_json::json!({})).await?;
        Ok(resp.indices)
    }

    #[instrument(skip(self), err)]
    async fn delete_index(&self, index: &str) -> Result<(), AnnError> {
        let _: Empty = self
            .call("delete_index", Some(index), &IndexRef { index })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_status_means_already_exists() {
        assert!(classify(409, String::new(), Some("idx")).is_already_exists());
        assert!(classify(500, "Index Already Exists".into(), Some("idx")).is_already_exists());
    }

    #[test]
    fn missing_index_and_other_failures() {
        assert!(matches!(
            classify(404, "no such index".into(), Some("idx")),
            AnnError::IndexNotFound(ref name) if name == "idx"
        ));
        assert!(matches!(
            classify(503, "overloaded".into(), None),
            AnnError::Service { status: 503, .. }
        ));
    }

    #[test]
    fn unreadable_error_body_is_reported() {
        let message = error_message::<&str>(Err("connection reset"));
        assert_eq!(message, "failed to read error body: connection reset");
        assert!(matches!(
            classify(502, message, Some("idx")),
            AnnError::Service { status: 502, ref message } if message.contains("connection reset")
        ));
        assert_eq!(error_message::<&str>(Ok("overloaded".into())), "overloaded");
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let service = HttpVectorService::new("http://localhost:8080/").unwrap();
        assert_eq!(service.base_url, "http://localhost:8080");
    }
}
