/// Near-duplicate detection module
///
/// This module handles:
/// - Exact containment checks against posting history
/// - Embedding candidate and history text (OpenAI embeddings API, batched)
/// - Cosine similarity thresholding
/// - Caching history embeddings in process and, optionally, in Postgres

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::BotError;

/// Threshold used when none is configured
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.9;

/// Outcome of comparing one candidate against the history
///
/// A byte-for-byte match with history is a duplicate at any threshold, 1.0
/// included. Only semantic scores go through the strict `>` comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityVerdict {
    pub is_duplicate: bool,
    /// Highest similarity observed (1.0 for an exact match, 0.0 when nothing was compared)
    pub max_similarity: f32,
}

impl SimilarityVerdict {
    fn unique(max_similarity: f32) -> Self {
        Self {
            is_duplicate: false,
            max_similarity,
        }
    }
}

/// Which comparisons the filter runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheck {
    Exact,
    Semantic,
    /// Exact first, semantic only when there is no exact hit
    Both,
}

impl std::str::FromStr for DuplicateCheck {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(DuplicateCheck::Exact),
            "semantic" => Ok(DuplicateCheck::Semantic),
            "both" => Ok(DuplicateCheck::Both),
            other => bail!(
                "unknown duplicate check '{}' (expected 'exact', 'semantic' or 'both')",
                other
            ),
        }
    }
}

/// Decides whether a candidate repeats something already posted
#[async_trait]
pub trait DuplicateFilter: Send + Sync {
    async fn check(
        &self,
        candidate_text: &str,
        history: &[String],
        threshold: f32,
    ) -> Result<SimilarityVerdict, BotError>;
}

/// Produces one fixed-length vector per input text, in input order
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifies the vector space; vectors from different models never compare
    fn model(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BotError>;
}

/// Durable store of history embeddings keyed by embedding model and exact text
#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    async fn lookup(
        &self,
        model: &str,
        texts: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<f32>>>;
    async fn store(&self, model: &str, entries: &[(String, Vec<f32>)]) -> anyhow::Result<()>;
}

/// True iff `candidate_text` equals some history entry byte for byte
pub fn exists_exact(candidate_text: &str, history: &[String]) -> bool {
    history.iter().any(|h| h == candidate_text)
}

/// Cosine similarity in [-1, 1]; 0.0 for empty, mismatched or zero-norm vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = f64::from(*x);
        let y = f64::from(*y);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if !denom.is_finite() || denom < f64::EPSILON {
        return 0.0;
    }

    let raw = dot / denom;
    if !raw.is_finite() {
        return 0.0;
    }

    raw.clamp(-1.0, 1.0) as f32
}

/// Strictly greater: a score equal to the threshold is not a duplicate
pub fn exceeds_threshold(score: f32, threshold: f32) -> bool {
    score > threshold
}

/// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Embeddings via the OpenAI `/v1/embeddings` endpoint
pub struct OpenAiEmbedder {
    api_key: String,
    model: String,
    base_url: String,
    http_client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(http_client: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BotError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = OpenAIEmbeddingRequest {
            input: texts,
            model: &self.model,
        };

        let response = self
            .http_client
            .post(format!("{}/v1/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| BotError::Filter(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(BotError::Filter(format!(
                "OpenAI API error (status {}): {}",
                status, error_text
            )));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| BotError::Filter(format!("Failed to read response body: {}", e)))?;

        let response: OpenAIEmbeddingResponse =
            serde_json::from_str(&response_text).map_err(|e| {
                BotError::Filter(format!(
                    "Failed to parse embedding response ({}). Response was: {}",
                    e, response_text
                ))
            })?;

        let mut data = response.data;
        if data.len() != texts.len() {
            return Err(BotError::Filter(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }
        data.sort_by_key(|d| d.index);

        log::debug!("Embedded {} texts with {}", texts.len(), self.model);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Exact and/or semantic duplicate filter with history embedding caches
pub struct NearDuplicateFilter<E> {
    embedder: E,
    mode: DuplicateCheck,
    memory: Mutex<HashMap<String, Vec<f32>>>,
    persistent: Option<Arc<dyn EmbeddingCache>>,
}

impl<E: Embedder> NearDuplicateFilter<E> {
    pub fn new(embedder: E, mode: DuplicateCheck) -> Self {
        Self {
            embedder,
            mode,
            memory: Mutex::new(HashMap::new()),
            persistent: None,
        }
    }

    /// Back the in-process cache with a durable one
    pub fn with_persistent_cache(mut self, cache: Arc<dyn EmbeddingCache>) -> Self {
        self.persistent = Some(cache);
        self
    }

    /// Highest cosine similarity between the candidate and any history entry
    async fn max_semantic_similarity(
        &self,
        candidate_text: &str,
        history: &[String],
    ) -> Result<f32, BotError> {
        let model = self.embedder.model();
        let mut memory = self.memory.lock().await;

        let mut seen = HashSet::new();
        let mut missing: Vec<String> = history
            .iter()
            .filter(|h| !memory.contains_key(h.as_str()) && seen.insert(h.as_str()))
            .cloned()
            .collect();

        if let (false, Some(cache)) = (missing.is_empty(), &self.persistent) {
            match cache.lookup(model, &missing).await {
                Ok(found) => {
                    log::debug!("Loaded {} cached history embeddings", found.len());
                    memory.extend(found);
                    missing.retain(|t| !memory.contains_key(t));
                }
                Err(e) => log::warn!("Embedding cache lookup failed, re-embedding: {:#}", e),
            }
        }

        // One round trip: candidate first, then every uncached history entry
        let mut batch = Vec::with_capacity(missing.len() + 1);
        batch.push(candidate_text.to_string());
        batch.extend(missing.iter().cloned());

        let vectors = self.embedder.embed(&batch).await?;
        if vectors.len() != batch.len() {
            return Err(BotError::Filter(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            )));
        }

        let mut vectors = vectors.into_iter();
        let candidate_vec = vectors.next().unwrap_or_default();
        let mut fresh: Vec<(String, Vec<f32>)> = missing.into_iter().zip(vectors).collect();

        // Cached vectors of another dimension came from a different model
        let mut stale_seen = HashSet::new();
        let stale: Vec<String> = history
            .iter()
            .filter(|h| {
                memory
                    .get(h.as_str())
                    .is_some_and(|v| v.len() != candidate_vec.len())
                    && stale_seen.insert(h.as_str())
            })
            .cloned()
            .collect();

        if !stale.is_empty() {
            log::warn!(
                "Re-embedding {} cached history entries with a mismatched dimension (expected {})",
                stale.len(),
                candidate_vec.len()
            );
            let refreshed = self.embedder.embed(&stale).await?;
            if refreshed.len() != stale.len() {
                return Err(BotError::Filter(format!(
                    "embedder returned {} vectors for {} texts",
                    refreshed.len(),
                    stale.len()
                )));
            }
            fresh.extend(stale.into_iter().zip(refreshed));
        }

        if let (false, Some(cache)) = (fresh.is_empty(), &self.persistent) {
            if let Err(e) = cache.store(model, &fresh).await {
                log::warn!("Failed to persist {} history embeddings: {:#}", fresh.len(), e);
            }
        }
        memory.extend(fresh);

        let max = history
            .iter()
            .filter_map(|h| memory.get(h))
            .map(|v| cosine_similarity(&candidate_vec, v))
            .fold(f32::MIN, f32::max);

        Ok(max)
    }
}

#[async_trait]
impl<E: Embedder> DuplicateFilter for NearDuplicateFilter<E> {
    async fn check(
        &self,
        candidate_text: &str,
        history: &[String],
        threshold: f32,
    ) -> Result<SimilarityVerdict, BotError> {
        if history.is_empty() {
            return Ok(SimilarityVerdict::unique(0.0));
        }

        if self.mode != DuplicateCheck::Semantic && exists_exact(candidate_text, history) {
            log::debug!("Candidate matches a history entry exactly");
            return Ok(SimilarityVerdict {
                is_duplicate: true,
                max_similarity: 1.0,
            });
        }

        if self.mode == DuplicateCheck::Exact {
            return Ok(SimilarityVerdict::unique(0.0));
        }

        let max_similarity = self
            .max_semantic_similarity(candidate_text, history)
            .await?;

        log::debug!(
            "Max similarity {:.4} against {} history entries (threshold {})",
            max_similarity,
            history.len(),
            threshold
        );

        Ok(SimilarityVerdict {
            is_duplicate: exceeds_threshold(max_similarity, threshold),
            max_similarity,
        })
    }
}
