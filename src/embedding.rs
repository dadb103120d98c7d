//! Sentence embedding boundary.
//!
//! Scoring only needs `embed(text) -> fixed-length vector` to be deterministic
//! for identical input. Two backends ship with the crate: [`ProviderEmbedder`]
//! forwards to an embeddings endpoint, [`HashingEmbedder`] is an offline
//! bag-of-words embedding that needs no network at all.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{error::EmbeddingError, types::EmbeddingRequest, LLMProvider};

/// Dimension of the `all-MiniLM-L6-v2` family, used as the offline default.
pub const DEFAULT_DIMENSION: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn dimension(&self) -> Option<usize>;

    fn name(&self) -> &'static str;
}

/// Compute the cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths, empty input or zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }
}

/// Embeddings served by an [`LLMProvider`] (OpenAI-compatible `/embeddings`).
pub struct ProviderEmbedder {
    provider: Arc<dyn LLMProvider>,
    model: String,
    dimension: Option<usize>,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            dimension: None,
        }
    }

    /// Reject vectors whose length differs from `dimension`.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if !self.provider.capabilities().supports_embeddings {
            return Err(EmbeddingError::Unavailable(format!(
                "{} has no embeddings endpoint",
                self.provider.name()
            )));
        }

        let request = EmbeddingRequest::new(self.model.clone(), vec![text.to_string()]);
        let response = self.provider.create_embeddings(request).await?;

        let vector = response
            .data
            .into_iter()
            .min_by_key(|embedding| embedding.index)
            .map(|embedding| embedding.embedding)
            .ok_or_else(|| EmbeddingError::Unavailable("empty embeddings response".to_string()))?;

        if vector.is_empty() || vector.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::InvalidVector(format!(
                "{} returned an empty or non-finite vector",
                self.provider.name()
            )));
        }
        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(EmbeddingError::InvalidVector(format!(
                    "expected {expected} dimensions, got {}",
                    vector.len()
                )));
            }
        }

        Ok(vector)
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "provider"
    }
}

/// Offline embedding: hashed bag of words with sublinear term frequency,
/// L2-normalised. Identical input always yields the identical vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut counts = vec![0u32; self.dimension];
        for token in tokenize(text) {
            let slot = (fnv1a(token.as_bytes()) % self.dimension as u64) as usize;
            counts[slot] += 1;
        }

        let mut vector: Vec<f32> = counts
            .into_iter()
            .map(|count| if count == 0 { 0.0 } else { 1.0 + (count as f32).ln() })
            .collect();

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace(['\u{2019}', '\u{2018}'], "'")
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|word| word.trim_matches('\''))
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

// FNV-1a keeps slot assignment stable across processes, unlike std's hasher.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}
