//! Embedding providers and the best-effort embedding index.
//!
//! Providers implement the core [`Embedder`] trait:
//! - **[`DisabledProvider`]**: always unavailable; the default.
//! - **[`OllamaProvider`]**: `POST {url}/api/embed` on a local Ollama.
//! - **[`OpenAIProvider`]**: `POST https://api.openai.com/v1/embeddings`.
//! - **`LocalProvider`**: in-process fastembed, behind the
//!   `local-embeddings` feature.
//!
//! [`EmbeddingIndex`] keeps one vector per document that owns its
//! identifier. Every failure is reported as [`EmbeddingUnavailable`] and
//! never affects the committed document record.
//!
//! # Retry Strategy
//!
//! The HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, ... (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use pmo_index_core::embedding::{rank_nearest, truncate_chars, Embedder};
use pmo_index_core::models::{DocType, Document};
use pmo_index_core::store::{Store, StoredVector};

use crate::config::EmbeddingConfig;

#[derive(Debug, Error)]
pub enum EmbeddingUnavailable {
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),
    #[error("embedding backend failed: {0}")]
    Backend(String),
    #[error("vector store failed: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOutcome {
    Stored,
    /// The stored vector was computed from the same text.
    Unchanged,
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

#[async_trait]
impl Embedder for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ HTTP retry loop ============

async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} connection error ({}): {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
}

fn json_vector(value: &serde_json::Value) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("embedding is not an array"))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Ollama Provider ============

pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            url: config.url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_with_retry(
            &self.client,
            &format!("{}/api/embed", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(json_vector)
        .collect()
}

// ============ OpenAI Provider ============

/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_with_retry(
            &self.client,
            "https://api.openai.com/v1/embeddings",
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_response(&json)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = data
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(i as u64);
            let embedding = item
                .get("embedding")
                .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
            Ok((index, json_vector(embedding)?))
        })
        .collect::<Result<Vec<_>>>()?;

    // Sort by index to ensure order matches input
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        config_to_fastembed_model(&config.model)?;
        Ok(Self {
            model_name: config.model.clone(),
            dims: config.dims,
            model: Arc::new(Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text" | "nomic-embed-text-v1.5" => {
            Ok(fastembed::EmbeddingModel::NomicEmbedTextV15)
        }
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let fastembed_model = config_to_fastembed_model(&self.model_name)?;
        let slot = Arc::clone(&self.model);
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
                )
                .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow!("local embedding model missing"))?;
            model
                .embed(texts, None)
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

/// Create the [`Embedder`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Embedding Index ============

/// Text embedded for a document: title, then body, capped at `max_chars`.
pub fn embedding_text(doc: &Document, max_chars: usize) -> String {
    let full = format!("{}\n\n{}", doc.title, doc.body.trim());
    truncate_chars(&full, max_chars).to_string()
}

/// One vector per identifier-owning document, persisted through the
/// [`Store`] vector operations.
#[derive(Clone)]
pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn Store>,
    enabled: bool,
    max_chars: usize,
    timeout: Duration,
}

impl EmbeddingIndex {
    pub fn new(config: &EmbeddingConfig, store: Arc<dyn Store>) -> Result<Self> {
        let embedder = create_provider(config)?;
        Ok(Self {
            embedder,
            store,
            enabled: config.is_enabled(),
            max_chars: config.max_chars,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn with_embedder(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn Store>,
        max_chars: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            enabled: true,
            max_chars,
            timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    fn text_hash(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.embedder.model_name().as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingUnavailable> {
        if !self.enabled {
            return Err(EmbeddingUnavailable::Disabled);
        }
        let texts = [text.to_string()];
        let result = tokio::time::timeout(self.timeout, self.embedder.embed(&texts))
            .await
            .map_err(|_| EmbeddingUnavailable::Timeout(self.timeout))?
            .map_err(|e| EmbeddingUnavailable::Backend(e.to_string()))?;
        result
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingUnavailable::Backend("empty embedding response".into()))
    }

    /// Embed `text` for `path` unless the stored vector already came from
    /// the same text.
    pub async fn upsert_vector(
        &self,
        path: &str,
        doc_type: DocType,
        identifier: &str,
        text: &str,
    ) -> Result<VectorOutcome, EmbeddingUnavailable> {
        if !self.enabled {
            return Err(EmbeddingUnavailable::Disabled);
        }
        let text = truncate_chars(text, self.max_chars);
        let text_hash = self.text_hash(text);

        let stored_hash = self
            .store
            .vector_hash(path)
            .await
            .map_err(|e| EmbeddingUnavailable::Store(e.to_string()))?;
        if stored_hash.as_deref() == Some(text_hash.as_str()) {
            debug!(path, "embedding unchanged");
            return Ok(VectorOutcome::Unchanged);
        }

        let vector = self.embed_one(text).await?;
        self.store
            .upsert_vector(&StoredVector {
                path: path.to_string(),
                doc_type,
                identifier: identifier.to_string(),
                model: self.embedder.model_name().to_string(),
                dims: vector.len(),
                text_hash,
                vector,
            })
            .await
            .map_err(|e| EmbeddingUnavailable::Store(e.to_string()))?;
        Ok(VectorOutcome::Stored)
    }

    pub async fn upsert_document(&self, doc: &Document) -> Result<VectorOutcome, EmbeddingUnavailable> {
        let text = embedding_text(doc, self.max_chars);
        self.upsert_vector(&doc.path, doc.doc_type, &doc.identifier, &text)
            .await
    }

    pub async fn remove(&self, path: &str) -> Result<(), EmbeddingUnavailable> {
        self.store
            .remove_vector(path)
            .await
            .map_err(|e| EmbeddingUnavailable::Store(e.to_string()))
    }

    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, EmbeddingUnavailable> {
        self.embed_one(truncate_chars(query, self.max_chars)).await
    }

    /// The `k` identifiers most similar to `query`, by cosine similarity
    /// (desc) then identifier. An empty index returns nothing without
    /// calling the provider.
    pub async fn nearest(&self, query: &str, k: usize) -> Result<Vec<(String, f32)>, EmbeddingUnavailable> {
        let vectors = self
            .store
            .vectors()
            .await
            .map_err(|e| EmbeddingUnavailable::Store(e.to_string()))?;
        if vectors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let qv = self.embed_query(query).await?;
        Ok(rank_nearest(&qv, &vectors, k))
    }
}

enum EmbedJob {
    Upsert(Document),
    Remove(String),
    /// Load the current record for a path (a promoted owner) and embed it.
    Refresh(String),
}

/// Runs [`EmbeddingIndex`] work on a background task so a slow or
/// unreachable provider never holds up indexing. Jobs are applied one at a
/// time in submission order; the task starts with the first job.
#[derive(Clone)]
pub struct EmbeddingQueue {
    index: EmbeddingIndex,
    tx: mpsc::UnboundedSender<EmbedJob>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<EmbedJob>>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl EmbeddingQueue {
    pub fn new(index: EmbeddingIndex) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            index,
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    pub fn upsert(&self, doc: Document) {
        self.submit(EmbedJob::Upsert(doc));
    }

    pub fn remove(&self, path: &str) {
        self.submit(EmbedJob::Remove(path.to_string()));
    }

    pub fn refresh(&self, path: &str) {
        self.submit(EmbedJob::Refresh(path.to_string()));
    }

    /// Jobs submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn submit(&self, job: EmbedJob) {
        self.start();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            finish_one(&self.pending, &self.idle);
        }
    }

    fn start(&self) {
        let rx = match self.rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut rx) = rx else {
            return;
        };
        // The task holds no sender, so it ends once every queue handle is dropped.
        let index = self.index.clone();
        let pending = Arc::clone(&self.pending);
        let idle = Arc::clone(&self.idle);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(&index, job).await;
                finish_one(&pending, &idle);
            }
        });
    }
}

fn finish_one(pending: &AtomicUsize, idle: &Notify) {
    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
        idle.notify_waiters();
    }
}

async fn run_job(index: &EmbeddingIndex, job: EmbedJob) {
    let doc = match job {
        EmbedJob::Upsert(doc) => doc,
        EmbedJob::Remove(path) => {
            if let Err(e) = index.remove(&path).await {
                warn!(path = %path, error = %e, "could not remove vector");
            }
            return;
        }
        EmbedJob::Refresh(path) => match index.store.get_by_path(&path).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return,
            Err(e) => {
                warn!(path = %path, error = %e, "could not load promoted owner");
                return;
            }
        },
    };
    if let Err(e) = index.upsert_document(&doc).await {
        warn!(path = %doc.path, error = %e, "embedding unavailable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmo_index_core::parse::parse;
    use pmo_index_core::store::memory::InMemoryStore;

    /// Counts calls; vector is `[len, vowels]`.
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    vec![t.len() as f32, vowels as f32]
                })
                .collect())
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![vec![1.0]])
        }
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let out = parse_ollama_response(&json).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({"data": [
            {"index": 1, "embedding": [2.0]},
            {"index": 0, "embedding": [1.0]},
        ]});
        let out = parse_openai_response(&json).unwrap();
        assert_eq!(out, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_create_disabled_provider() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
    }

    #[test]
    fn test_embedding_text_truncates() {
        let doc = parse(&"x".repeat(2000), DocType::Log, "logs/a.md").unwrap();
        assert_eq!(embedding_text(&doc, 500).chars().count(), 500);
    }

    #[tokio::test]
    async fn test_unchanged_text_skips_provider() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let index = EmbeddingIndex::with_embedder(embedder.clone(), store.clone(), 500, Duration::from_secs(1));

        let first = index.upsert_vector("risks/a.md", DocType::Risk, "risk:a", "vendor").await.unwrap();
        let second = index.upsert_vector("risks/a.md", DocType::Risk, "risk:a", "vendor").await.unwrap();
        assert_eq!(first, VectorOutcome::Stored);
        assert_eq!(second, VectorOutcome::Unchanged);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nearest_on_empty_index() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let index = EmbeddingIndex::with_embedder(embedder.clone(), store, 500, Duration::from_secs(1));
        assert!(index.nearest("anything", 5).await.unwrap().is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_is_unavailable() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let index = EmbeddingIndex::new(&EmbeddingConfig::default(), store).unwrap();
        let err = index.upsert_vector("a.md", DocType::Unknown, "unknown:a", "x").await.unwrap_err();
        assert!(matches!(err, EmbeddingUnavailable::Disabled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unavailable() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let index = EmbeddingIndex::with_embedder(Arc::new(SlowEmbedder), store.clone(), 500, Duration::from_millis(100));
        let err = index.upsert_vector("a.md", DocType::Unknown, "unknown:a", "x").await.unwrap_err();
        assert!(matches!(err, EmbeddingUnavailable::Timeout(_)));
        assert!(store.vectors().await.unwrap().is_empty());
    }
}
