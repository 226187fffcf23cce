//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] identity trait and the [`Embedder`]
//! front door the indexer and retriever call:
//!
//! - **openai** — `POST {base_url}/embeddings` with `{model, input[]}`.
//! - **gemini** — `POST {base_url}/models/{model}:batchEmbedContents`.
//! - **local** — in-process fastembed model, no network (behind the
//!   `local-embeddings` feature).
//!
//! # Fallback chain
//!
//! The requested provider is tried at construction; if it cannot be
//! initialized (missing key, missing feature) the declared `fallback`
//! provider is tried and `{fallback_from, fallback_reason}` are exposed in
//! status. Runtime failures are **not** retried on another provider — a
//! degraded query would silently rank differently — they propagate after
//! the retry ladder below.
//!
//! # Retry strategy
//!
//! Remote providers retry transient failures with exponential backoff:
//! HTTP 429 and 5xx retry; other 4xx fail immediately; network errors
//! retry. Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5).
//!
//! # Fingerprint
//!
//! [`EmbeddingProvider::fingerprint`] is a stable hash over
//! `(provider_id, model, base_url, curated headers)`. The embedding cache
//! is partitioned by it, so two deployments sharing a store but pointing
//! at different endpoints never read each other's vectors.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Identity of a concrete embedding backend.
pub trait EmbeddingProvider: Send + Sync {
    /// Stable provider id: `"openai"`, `"gemini"`, or `"local"`.
    fn id(&self) -> &str;
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Cache-partitioning fingerprint, see module docs.
    fn fingerprint(&self) -> &str;
}

/// Resolved embedding capability with fallback provenance.
pub struct Embedder {
    provider: Box<dyn EmbeddingProvider>,
    config: EmbeddingConfig,
    /// Provider id originally requested, when a fallback was taken.
    pub fallback_from: Option<String>,
    /// Why the requested provider was unavailable.
    pub fallback_reason: Option<String>,
}

impl Embedder {
    /// Resolve the configured provider, degrading to the declared fallback
    /// on initialization failure.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        match create_provider(config, &config.provider) {
            Ok(provider) => Ok(Self {
                provider,
                config: config.clone(),
                fallback_from: None,
                fallback_reason: None,
            }),
            Err(primary_err) => {
                let Some(fallback) = config.fallback.as_deref() else {
                    return Err(primary_err);
                };
                if fallback == config.provider {
                    return Err(primary_err);
                }
                let primary_reason = primary_err.to_string();
                let provider = create_provider(config, fallback).map_err(|fallback_err| {
                    anyhow::anyhow!(
                        "embedding provider '{}' failed ({}); fallback '{}' failed ({})",
                        config.provider,
                        primary_reason,
                        fallback,
                        fallback_err
                    )
                })?;
                Ok(Self {
                    provider,
                    config: config.clone(),
                    fallback_from: Some(config.provider.clone()),
                    fallback_reason: Some(primary_err.to_string()),
                })
            }
        }
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn fingerprint(&self) -> &str {
        self.provider.fingerprint()
    }

    /// Embed a batch of texts. Length- and order-preserving; every vector
    /// has the same dimensionality and is non-empty.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = match self.provider.id() {
            "openai" => embed_openai(&self.config, self.provider.model_name(), texts).await?,
            "gemini" => embed_gemini(&self.config, self.provider.model_name(), texts).await?,
            "local" => embed_local(&self.config, self.provider.model_name(), texts).await?,
            other => bail!("Unknown embedding provider: {}", other),
        };
        validate_batch(texts, &vectors)?;
        Ok(vectors)
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }
}

/// A provider never returns a short batch or an empty vector for non-empty
/// input; the indexer relies on this to keep chunk rows and vectors in step.
fn validate_batch(texts: &[String], vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != texts.len() {
        bail!(
            "embedding batch returned {} vectors for {} inputs",
            vectors.len(),
            texts.len()
        );
    }
    let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
    for (text, vector) in texts.iter().zip(vectors.iter()) {
        if vector.is_empty() && !text.is_empty() {
            bail!("embedding provider returned an empty vector");
        }
        if vector.len() != dims {
            bail!(
                "embedding batch has mixed dimensionality ({} vs {})",
                vector.len(),
                dims
            );
        }
    }
    Ok(())
}

fn create_provider(config: &EmbeddingConfig, id: &str) -> Result<Box<dyn EmbeddingProvider>> {
    match id {
        "openai" => Ok(Box::new(OpenAiProvider::new(config)?)),
        "gemini" => Ok(Box::new(GeminiProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Stable hash over the provider identity; hex-truncated for readability in
/// cache keys and status output.
pub fn provider_fingerprint(
    id: &str,
    model: &str,
    base_url: &str,
    headers: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(base_url.as_bytes());
    for (key, value) in headers {
        hasher.update([0u8]);
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

// ============ OpenAI-compatible provider ============

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";

struct OpenAiProvider {
    model: String,
    fingerprint: String,
}

impl OpenAiProvider {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for openai provider"))?;
        openai_api_key(config)?;
        let base = openai_base_url(config);
        let fingerprint = provider_fingerprint("openai", &model, &base, &config.remote.headers);
        Ok(Self { model, fingerprint })
    }
}

impl EmbeddingProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn openai_base_url(config: &EmbeddingConfig) -> String {
    config
        .remote
        .base_url
        .clone()
        .unwrap_or_else(|| OPENAI_DEFAULT_BASE.to_string())
}

fn openai_api_key(config: &EmbeddingConfig) -> Result<String> {
    let var = config
        .remote
        .api_key_env
        .as_deref()
        .unwrap_or("OPENAI_API_KEY");
    std::env::var(var).map_err(|_| anyhow::anyhow!("{} environment variable not set", var))
}

async fn embed_openai(
    config: &EmbeddingConfig,
    model: &str,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let api_key = openai_api_key(config)?;
    let url = format!("{}/embeddings", openai_base_url(config).trim_end_matches('/'));
    let body = serde_json::json!({ "model": model, "input": texts });

    let json = request_with_retry(config, &url, &body, |req| {
        req.header("Authorization", format!("Bearer {}", api_key))
    })
    .await?;

    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let values = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        embeddings.push(parse_f32_array(values));
    }
    Ok(embeddings)
}

// ============ Gemini-compatible provider ============

const GEMINI_DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

struct GeminiProvider {
    model: String,
    fingerprint: String,
}

impl GeminiProvider {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for gemini provider"))?;
        gemini_api_key(config)?;
        let base = gemini_base_url(config);
        let fingerprint = provider_fingerprint("gemini", &model, &base, &config.remote.headers);
        Ok(Self { model, fingerprint })
    }
}

impl EmbeddingProvider for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn gemini_base_url(config: &EmbeddingConfig) -> String {
    config
        .remote
        .base_url
        .clone()
        .unwrap_or_else(|| GEMINI_DEFAULT_BASE.to_string())
}

fn gemini_api_key(config: &EmbeddingConfig) -> Result<String> {
    let var = config
        .remote
        .api_key_env
        .as_deref()
        .unwrap_or("GEMINI_API_KEY");
    std::env::var(var).map_err(|_| anyhow::anyhow!("{} environment variable not set", var))
}

async fn embed_gemini(
    config: &EmbeddingConfig,
    model: &str,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let api_key = gemini_api_key(config)?;
    let url = format!(
        "{}/models/{}:batchEmbedContents",
        gemini_base_url(config).trim_end_matches('/'),
        model
    );
    let requests: Vec<_> = texts
        .iter()
        .map(|text| {
            serde_json::json!({
                "model": format!("models/{}", model),
                "content": { "parts": [ { "text": text } ] }
            })
        })
        .collect();
    let body = serde_json::json!({ "requests": requests });

    let json = request_with_retry(config, &url, &body, |req| {
        req.header("x-goog-api-key", api_key.clone())
    })
    .await?;

    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for item in embeddings {
        let values = item
            .get("values")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing values"))?;
        result.push(parse_f32_array(values));
    }
    Ok(result)
}

// ============ Shared HTTP plumbing ============

async fn request_with_retry(
    config: &EmbeddingConfig,
    url: &str,
    body: &serde_json::Value,
    decorate: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
) -> Result<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        for (key, value) in &config.remote.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let request = decorate(request);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err =
                        Some(anyhow::anyhow!("embedding API error {}: {}", status, body_text));
                    continue;
                }
                let body_text = response.text().await.unwrap_or_default();
                bail!("embedding API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
}

fn parse_f32_array(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Local provider (fastembed) ============

#[cfg(feature = "local-embeddings")]
struct LocalProvider {
    model: String,
    fingerprint: String,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = local_model_name(config);
        local_fastembed_model(&model)?;
        let fingerprint = provider_fingerprint("local", &model, "in-process", &BTreeMap::new());
        Ok(Self { model, fingerprint })
    }
}

#[cfg(feature = "local-embeddings")]
impl EmbeddingProvider for LocalProvider {
    fn id(&self) -> &str {
        "local"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(feature = "local-embeddings")]
fn local_model_name(config: &EmbeddingConfig) -> String {
    config
        .local
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string())
}

#[cfg(feature = "local-embeddings")]
fn local_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
async fn embed_local(
    config: &EmbeddingConfig,
    model: &str,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let fastembed_model = local_fastembed_model(model)?;
    let batch_size = config.batch_size;
    let texts = texts.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        model
            .embed(texts, Some(batch_size))
            .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
    })
    .await?
}

#[cfg(not(feature = "local-embeddings"))]
async fn embed_local(
    _config: &EmbeddingConfig,
    _model: &str,
    _texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    bail!("Local embedding provider requires --features local-embeddings")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let headers = BTreeMap::new();
        let a = provider_fingerprint("openai", "text-embedding-3-small", "https://api.x", &headers);
        let b = provider_fingerprint("openai", "text-embedding-3-small", "https://api.x", &headers);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn fingerprint_changes_with_each_component() {
        let headers = BTreeMap::new();
        let base = provider_fingerprint("openai", "m", "https://api.x", &headers);
        assert_ne!(base, provider_fingerprint("gemini", "m", "https://api.x", &headers));
        assert_ne!(base, provider_fingerprint("openai", "m2", "https://api.x", &headers));
        assert_ne!(base, provider_fingerprint("openai", "m", "https://api.y", &headers));

        let mut with_header = BTreeMap::new();
        with_header.insert("x-org".to_string(), "acme".to_string());
        assert_ne!(
            base,
            provider_fingerprint("openai", "m", "https://api.x", &with_header)
        );
    }

    #[test]
    fn header_order_does_not_matter() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());
        assert_eq!(
            provider_fingerprint("openai", "m", "u", &a),
            provider_fingerprint("openai", "m", "u", &b)
        );
    }

    #[test]
    fn short_batch_rejected() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let vectors = vec![vec![0.1, 0.2]];
        assert!(validate_batch(&texts, &vectors).is_err());
    }

    #[test]
    fn empty_vector_rejected() {
        let texts = vec!["a".to_string()];
        let vectors = vec![vec![]];
        assert!(validate_batch(&texts, &vectors).is_err());
    }

    #[test]
    fn mixed_dims_rejected() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let vectors = vec![vec![0.1, 0.2], vec![0.1]];
        assert!(validate_batch(&texts, &vectors).is_err());
    }

    #[test]
    fn uniform_batch_accepted() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let vectors = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
        assert!(validate_batch(&texts, &vectors).is_ok());
    }
}
