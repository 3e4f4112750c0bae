//! Embedding helpers for vector recall
//!
//! Embeddings are stored as little-endian f32 blobs and scored with
//! in-process cosine similarity. An HTTP embedding route is optional;
//! without one, recall degrades to lexical-only scoring.

use serde::Deserialize;

use crate::{Error, Result};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in `[-1.0, 1.0]` where 1.0 is identical direction.
/// Returns 0.0 if either vector has zero magnitude or lengths differ.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;

    for (ai, bi) in a.iter().zip(b.iter()) {
        let ai = f64::from(*ai);
        let bi = f64::from(*bi);
        dot += ai * bi;
        norm_a += ai * ai;
        norm_b += bi * bi;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }

    #[allow(clippy::cast_possible_truncation)]
    {
        (dot / denom) as f32
    }
}

/// Pack an embedding into a little-endian byte blob
#[must_use]
pub fn to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack an embedding blob
#[must_use]
pub fn from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// HTTP embedding client (OpenAI-compatible `/embeddings` shape)
#[derive(Debug, Clone)]
pub struct Embedder {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl Embedder {
    /// Create a client for the given endpoint
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key,
        }
    }

    /// Embed one text
    ///
    /// # Errors
    ///
    /// Returns error on request failure or empty response
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "input": text }));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let response: EmbeddingResponse = request.send().await?.error_for_status()?.json().await?;
        response
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| Error::Memory("embedding response was empty".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let embedding = vec![0.5_f32, -1.25, 3.0];
        assert_eq!(from_bytes(&to_bytes(&embedding)), embedding);
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0_f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 0.001);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }

    #[test]
    fn cosine_mismatched_lengths_is_zero() {
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).abs() < f32::EPSILON);
    }
}
