#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use super::EmbeddingModel;
use crate::FeedbackError;
use crate::config::OllamaConfig;

/// Output size of `nomic-embed-text`
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 768;

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u64 = 2;
const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Blocking client for the Ollama HTTP API
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    model: String,
    batch_size: u32,
    agent: ureq::Agent,
    retry_attempts: u32,
    backoff_unit: Duration,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Entry of `/api/tags`
#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
}

impl ModelInfo {
    /// Ollama reports untagged pulls as `:latest`
    fn serves(&self, model: &str) -> bool {
        let strip = |name: &str| name.strip_suffix(":latest").unwrap_or(name).to_string();
        strip(&self.name) == strip(model)
    }
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let base_url = config
            .ollama_url()
            .context("Invalid Ollama address in configuration")?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.request_timeout_secs)))
            .build()
            .into();

        Ok(Self {
            base_url,
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
            agent,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        })
    }

    /// Points the client at an explicit base URL, e.g. a mock server
    #[inline]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Delay before the first retry; later retries double it
    #[inline]
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Succeeds when the server answers and has the configured model pulled
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        let models = self
            .list_models()
            .with_context(|| format!("Ollama at {} is unreachable", self.base_url))?;

        if models.iter().any(|m| m.serves(&self.model)) {
            info!("Ollama at {} serves {}", self.base_url, self.model);
            return Ok(());
        }

        let pulled: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        warn!("Embedding model {} has not been pulled ({} models available)", self.model, pulled.len());
        Err(anyhow::anyhow!(
            "Embedding model '{}' not found on the server (run `ollama pull {}`); pulled: {:?}",
            self.model,
            self.model,
            pulled
        ))
    }

    /// Models pulled on the server
    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("/api/tags")?;
        let body = self
            .make_request_with_retry(|| {
                self.agent
                    .get(url.as_str())
                    .call()
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Model listing request failed")?;

        let response: ModelsResponse =
            serde_json::from_str(&body).context("Unexpected /api/tags response")?;
        debug!("Ollama reports {} models", response.models.len());
        Ok(response.models)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Cannot build Ollama endpoint {path}"))
    }

    #[inline]
    pub fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Generating embedding for text (length: {})", text.len());

        self.embed_request(&[text.to_string()])?
            .pop()
            .context("Ollama returned no embedding")
    }

    /// Embeds `texts` in server-sized batches, preserving order
    #[inline]
    pub fn generate_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let mut results = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size as usize) {
            let batch = self
                .embed_request(chunk)
                .with_context(|| format!("Failed to process batch of {} texts", chunk.len()))?;
            results.extend(batch);
        }

        Ok(results)
    }

    fn embed_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint("/api/embed")?;

        let request_json = serde_json::to_string(&EmbedRequest {
            model: &self.model,
            input: texts,
        })
        .context("Failed to serialize embedding request")?;

        let response_text = self
            .make_request_with_retry(|| {
                self.agent
                    .post(url.as_str())
                    .header("Content-Type", "application/json")
                    .send(&request_json)
                    .and_then(|mut resp| resp.body_mut().read_to_string())
            })
            .context("Failed to generate embeddings")?;

        let response: EmbedResponse =
            serde_json::from_str(&response_text).context("Failed to parse embedding response")?;

        if response.embeddings.len() != texts.len() {
            return Err(anyhow::anyhow!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.embeddings.len()
            ));
        }

        Ok(response.embeddings)
    }

    fn make_request_with_retry<F>(&self, mut request_fn: F) -> Result<String>
    where
        F: FnMut() -> Result<String, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("HTTP request attempt {}/{}", attempt, self.retry_attempts);

            match request_fn() {
                Ok(response_text) => return Ok(response_text),
                Err(error) => {
                    let should_retry = match &error {
                        ureq::Error::StatusCode(status) if *status >= 500 => {
                            warn!(
                                "Server error (status {}), attempt {}/{}",
                                status, attempt, self.retry_attempts
                            );
                            true
                        }
                        ureq::Error::StatusCode(status) => {
                            warn!("Client error (status {}), not retrying", status);
                            return Err(anyhow::anyhow!("Client error: HTTP {}", status));
                        }
                        ureq::Error::ConnectionFailed
                        | ureq::Error::HostNotFound
                        | ureq::Error::Timeout(_)
                        | ureq::Error::Io(_) => {
                            warn!(
                                "Transport error: {}, attempt {}/{}",
                                error, attempt, self.retry_attempts
                            );
                            true
                        }
                        _ => false,
                    };

                    if !should_retry {
                        return Err(anyhow::anyhow!("Non-retryable error: {}", error));
                    }

                    last_error = Some(anyhow::anyhow!("Request error: {}", error));

                    if attempt < self.retry_attempts {
                        let delay = self.backoff_unit * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1) as u32;
                        debug!("Waiting {:?} before retry", delay);
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        error!("All retry attempts failed for request to {}", self.base_url);

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Request failed after retries")))
    }
}

/// Async [`EmbeddingModel`] over the blocking [`OllamaClient`]
#[derive(Debug, Clone)]
pub struct OllamaModel {
    client: Arc<OllamaClient>,
    dimension: usize,
}

impl OllamaModel {
    #[inline]
    pub fn new(client: OllamaClient, dimension: usize) -> Self {
        Self {
            client: Arc::new(client),
            dimension,
        }
    }

    #[inline]
    pub fn from_config(config: &OllamaConfig) -> Result<Self> {
        let client = OllamaClient::new(config)?;
        Ok(Self::new(client, config.embedding_dimension as usize))
    }

    #[inline]
    pub fn client(&self) -> &OllamaClient {
        &self.client
    }

    /// Runs the health check off the async runtime
    #[inline]
    pub async fn health_check(&self) -> crate::Result<()> {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || client.health_check())
            .await
            .map_err(|e| FeedbackError::Embedding(format!("Health check task failed: {e}")))?
            .map_err(|e| FeedbackError::Embedding(format!("{e:#}")))
    }
}

#[async_trait]
impl EmbeddingModel for OllamaModel {
    fn name(&self) -> &str {
        self.client.model()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn warm_up(&self) -> crate::Result<()> {
        self.health_check().await
    }

    async fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        let client = Arc::clone(&self.client);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || client.generate_embedding(&text))
            .await
            .map_err(|e| FeedbackError::Embedding(format!("Embedding task failed: {e}")))?
            .map_err(|e| FeedbackError::Embedding(format!("{e:#}")))
    }

    async fn embed_batch(&self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
        let client = Arc::clone(&self.client);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || client.generate_embeddings_batch(&texts))
            .await
            .map_err(|e| FeedbackError::Embedding(format!("Embedding task failed: {e}")))?
            .map_err(|e| FeedbackError::Embedding(format!("{e:#}")))
    }
}
