pub(crate) mod types;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::AiError;
use crate::traits::{EmbedAgent, RerankAgent};

pub use types::RerankScore;
use types::*;

const VOYAGE_API_URL: &str = "https://api.voyageai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "voyage-3-large";
const DEFAULT_RERANK_MODEL: &str = "rerank-2";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Voyage AI embeddings and reranking.
#[derive(Clone)]
pub struct Voyage {
    api_key: String,
    base_url: String,
    embedding_model: String,
    rerank_model: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl Voyage {
    pub fn new(api_key: impl Into<String>) -> Result<Self, AiError> {
        Self::build(api_key.into(), DEFAULT_TIMEOUT)
    }

    fn build(api_key: String, timeout: Duration) -> Result<Self, AiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AiError::Config(e.to_string()))?;
        Ok(Self {
            api_key,
            base_url: VOYAGE_API_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            rerank_model: DEFAULT_RERANK_MODEL.to_string(),
            timeout,
            http,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_rerank_model(mut self, model: impl Into<String>) -> Self {
        self.rerank_model = model.into();
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AiError> {
        let rebuilt = Self::build(self.api_key, timeout)?;
        Ok(Self {
            base_url: self.base_url,
            embedding_model: self.embedding_model,
            rerank_model: self.rerank_model,
            ..rebuilt
        })
    }

    fn headers(&self) -> Result<HeaderMap, AiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| AiError::Config("API key contains invalid header characters".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, AiError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await
            .map_err(|e| AiError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| AiError::from_reqwest(e, self.timeout))
    }

    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AiError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.embedding_model, count = texts.len(), "Voyage embedding request");

        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts,
            input_type: Some("document"),
        };
        let mut response: EmbeddingResponse = self.post("embeddings", &request).await?;
        if response.data.len() != texts.len() {
            return Err(AiError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.data.len()
            )));
        }
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Score `documents` against `query`. Results are in descending relevance.
    pub async fn rerank_documents(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<Vec<RerankScore>, AiError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.rerank_model, count = documents.len(), "Voyage rerank request");

        let request = RerankRequest {
            model: &self.rerank_model,
            query,
            documents,
        };
        let response: RerankResponse = self.post("rerank", &request).await?;
        if let Some(bad) = response.data.iter().find(|s| s.index >= documents.len()) {
            return Err(AiError::Parse(format!("rerank index {} out of range", bad.index)));
        }
        let mut scores = response.data;
        scores.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(scores)
    }
}

#[async_trait]
impl EmbedAgent for Voyage {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AiError> {
        let mut vectors = self.embed_texts(&[text.to_string()]).await?;
        vectors.pop().ok_or(AiError::MissingOutput)
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AiError> {
        self.embed_texts(&texts).await
    }
}

#[async_trait]
impl RerankAgent for Voyage {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<RerankScore>, AiError> {
        self.rerank_documents(query, documents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_request_serializes_input_array() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let request = EmbeddingRequest {
            model: "voyage-3-large",
            input: &texts,
            input_type: Some("document"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["input"].as_array().unwrap().len(), 2);
        assert_eq!(json["input_type"], "document");
    }

    #[test]
    fn rerank_response_parses() {
        let raw = r#"{"object":"list","data":[{"index":1,"relevance_score":0.91},{"index":0,"relevance_score":0.42}],"model":"rerank-2"}"#;
        let response: RerankResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.data[0], RerankScore { index: 1, relevance_score: 0.91 });
    }

    #[test]
    fn builder_keeps_models_across_timeout_change() {
        let voyage = Voyage::new("pa-test")
            .unwrap()
            .with_embedding_model("voyage-3")
            .with_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(voyage.embedding_model, "voyage-3");
        assert_eq!(voyage.timeout, Duration::from_secs(5));
    }

    #[test]
    fn empty_inputs_skip_the_network() {
        let voyage = Voyage::new("pa-test")
            .unwrap()
            .with_base_url("http://127.0.0.1:9");
        let vectors = tokio_test::block_on(voyage.embed_texts(&[])).unwrap();
        assert!(vectors.is_empty());
        let scores = tokio_test::block_on(voyage.rerank_documents("q", &[])).unwrap();
        assert!(scores.is_empty());
    }
}
