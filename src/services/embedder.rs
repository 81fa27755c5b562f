use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::Embedding;

/// The endpoint refuses batches larger than this.
const MAX_BATCH: usize = 100;

/// Turns text into fixed-width vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embeds several texts, preserving input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Reply of the endpoint's health route.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbedderHealth {
    pub status: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dimensions: Option<usize>,
}

/// Client for the sentence-embedding HTTP service.
pub struct HttpEmbedder {
    client: Client,
    base_url: String,
}

impl HttpEmbedder {
    pub fn new(base_url: &Url) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        })
    }

    pub async fn health(&self) -> Result<EmbedderHealth> {
        let response = self.client.get(format!("{}/", self.base_url)).send().await?;
        if !response.status().is_success() {
            return Err(AppError::EmbeddingApi(format!(
                "health check failed: HTTP {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        route: &str,
        body: &Req,
    ) -> Result<Resp> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, route))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::EmbeddingApi(format!("HTTP {}: {}", status, error_text)));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        if text.trim().is_empty() {
            return Err(AppError::InvalidInput("cannot embed empty text".to_string()));
        }
        let response: EmbedResponse = self.post("embed", &EmbedRequest { text }).await?;
        Embedding::new(response.embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH) {
            let response: BatchEmbedResponse = self
                .post("batch_embed", &BatchEmbedRequest { texts: chunk })
                .await?;
            if response.embeddings.len() != chunk.len() {
                return Err(AppError::EmbeddingApi(format!(
                    "asked for {} embeddings, received {}",
                    chunk.len(),
                    response.embeddings.len()
                )));
            }
            for values in response.embeddings {
                embeddings.push(Embedding::new(values)?);
            }
        }
        Ok(embeddings)
    }
}
