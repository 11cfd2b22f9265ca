use crate::error::MemoryError;
use async_trait::async_trait;

use std::net::IpAddr;
use std::time::Duration;

/// One ceiling for the whole request; connect gets a slice of it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Trait for embedding providers — convert text to fixed-length vectors.
///
/// A provider's `dimensions()` is a constant for the lifetime of the
/// instance; every vector returned by `embed` has exactly that length.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name
    fn name(&self) -> &str;

    /// Embedding dimensions
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts into vectors
    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Embed a single text
    async fn embed_one(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut results = self.embed(&[text]).await?;
        results
            .pop()
            .ok_or_else(|| MemoryError::Embedding("empty embedding result".into()).into())
    }
}

// ── Noop provider (keyword-only fallback) ────────────────────

pub struct NoopEmbedding;

#[async_trait]
impl EmbeddingProvider for NoopEmbedding {
    fn name(&self) -> &str {
        "none"
    }

    fn dimensions(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(Vec::new())
    }
}

// ── Custom endpoint vetting ──────────────────────────────────

/// Why an operator-supplied embedding host is refused, or `None` if it is
/// acceptable. An embedding endpoint receives the API key and arbitrary
/// memory content, so anything that could point back into the local
/// network or a cloud metadata service is off the table.
fn deny_reason(host: &str) -> Option<&'static str> {
    let host = host
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']');

    for (denied, reason) in [
        ("localhost", "loopback host"),
        ("metadata.google.internal", "cloud metadata host"),
    ] {
        if host.eq_ignore_ascii_case(denied) {
            return Some(reason);
        }
    }

    match host.to_ascii_lowercase().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            let reserved = ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast();
            reserved.then_some("reserved ipv4 range")
        }
        Ok(IpAddr::V6(ip)) => {
            let head = ip.segments()[0];
            let reserved = ip.is_loopback()
                || ip.is_unspecified()
                || (head & 0xffc0) == 0xfe80   // link-local fe80::/10
                || (head & 0xfe00) == 0xfc00; // unique-local fc00::/7
            reserved.then_some("reserved ipv6 range")
        }
        // Plain DNS name: allowed, resolution risk accepted
        Err(_) => None,
    }
}

/// Vet a `custom:` base URL before any request carries credentials to it.
fn vet_base_url(raw: &str, require_https: bool) -> anyhow::Result<reqwest::Url> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|_| MemoryError::Embedding(format!("unparseable base URL '{}'", raw.trim())))?;

    if url.scheme() != "https" && (require_https || url.scheme() != "http") {
        return Err(
            MemoryError::Embedding(format!("refusing '{}' scheme for base URL", url.scheme()))
                .into(),
        );
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(MemoryError::Embedding("base URL carries userinfo".into()).into());
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(MemoryError::Embedding("base URL carries query or fragment".into()).into());
    }

    let host = url
        .host_str()
        .ok_or_else(|| MemoryError::Embedding("base URL has no host".into()))?;
    if let Some(reason) = deny_reason(host) {
        return Err(MemoryError::Embedding(format!("base URL host denied: {reason}")).into());
    }

    Ok(url)
}

// ── OpenAI-compatible embedding provider ─────────────────────

pub struct OpenAiEmbedding {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedding {
    pub fn new(base_url: &str, api_key: &str, model: &str, dims: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT / 5)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dims,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(format!("embedding request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(MemoryError::Embedding(format!("embedding API error {status}")).into());
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(format!("embedding response unreadable: {e}")))?;
        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| MemoryError::Embedding("embedding response missing 'data'".into()))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| MemoryError::Embedding("embedding item malformed".into()))?;

            #[allow(clippy::cast_possible_truncation)]
            let vec: Vec<f32> = embedding
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();

            if vec.is_empty() {
                return Err(MemoryError::Embedding("provider returned empty vector".into()).into());
            }
            if self.dims > 0 && vec.len() != self.dims {
                return Err(MemoryError::Embedding(format!(
                    "provider returned {} dimensions, expected {}",
                    vec.len(),
                    self.dims
                ))
                .into());
            }

            embeddings.push(vec);
        }

        Ok(embeddings)
    }
}

// ── Factory ──────────────────────────────────────────────────

pub fn create_embedding_provider(
    provider: &str,
    api_key: Option<&str>,
    model: &str,
    dims: usize,
) -> Box<dyn EmbeddingProvider> {
    match provider {
        "openai" => {
            let key = api_key.unwrap_or("");
            Box::new(OpenAiEmbedding::new(
                "https://api.openai.com",
                key,
                model,
                dims,
            ))
        }
        name if name.starts_with("custom:") => {
            let raw = name.strip_prefix("custom:").unwrap_or("");
            let key = api_key.unwrap_or("");

            match vet_base_url(raw, !cfg!(test)) {
                Ok(url) => Box::new(OpenAiEmbedding::new(url.as_str(), key, model, dims)),
                Err(reason) => {
                    tracing::warn!("custom embedding provider rejected: {reason}");
                    Box::new(NoopEmbedding)
                }
            }
        }
        _ => Box::new(NoopEmbedding),
    }
}
