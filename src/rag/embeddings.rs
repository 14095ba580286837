use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Config;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Turns texts into fixed-size vectors. Never fails: callers get zero
/// vectors when the backend is unreachable.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn dimensions(&self) -> usize;

    fn model_name(&self) -> String;

    async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client.
#[derive(Clone)]
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    max_retries: u32,
    initial_backoff: Duration,
}

impl EmbeddingClient {
    pub fn from_config(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.embedding_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            client,
            base_url: config.llm_base_url(),
            api_key: config.llm_api_key.clone(),
            model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
            max_retries: config.embedding_max_retries,
            initial_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    async fn request(&self, input: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let body = EmbeddingRequest { model: &self.model, input, dimensions: self.dimensions };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("embedding server returned {}: {}", status, text);
        }

        let mut parsed: EmbeddingResponse = resp.json().await?;
        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

/// Empty or blank inputs become a single space; the API rejects empty strings.
pub fn sanitize_inputs(texts: &[String]) -> Vec<String> {
    texts
        .iter()
        .map(|t| {
            let trimmed = t.trim();
            if trimmed.is_empty() {
                " ".to_string()
            } else {
                trimmed.to_string()
            }
        })
        .collect()
}

/// Pads with zeros or truncates to exactly `dimensions`.
pub fn fit_dimensions(mut embedding: Vec<f32>, dimensions: usize) -> Vec<f32> {
    embedding.resize(dimensions, 0.0);
    embedding
}

#[async_trait]
impl EmbeddingService for EmbeddingClient {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    async fn embed_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }
        let input = sanitize_inputs(texts);

        let mut backoff = self.initial_backoff;
        for attempt in 0..=self.max_retries {
            match self.request(&input).await {
                Ok(mut embeddings) => {
                    embeddings.resize(texts.len(), Vec::new());
                    return embeddings
                        .into_iter()
                        .map(|e| fit_dimensions(e, self.dimensions))
                        .collect();
                }
                Err(e) if attempt < self.max_retries => {
                    tracing::warn!(attempt = attempt + 1, "Embedding request failed, retrying in {:?}: {}", backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    tracing::warn!("Embedding request failed after {} attempts: {}", attempt + 1, e);
                }
            }
        }

        tracing::warn!(count = texts.len(), "Using zero vectors for failed embedding batch");
        vec![vec![0.0; self.dimensions]; texts.len()]
    }
}
