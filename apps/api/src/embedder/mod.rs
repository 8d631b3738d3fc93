//! Embedders map free text to a fixed-dimension vector.
//!
//! The embedding model is an external capability. Ingestion, search and rebuild
//! all go through the `Embedder` trait so the backend can be swapped at startup:
//! - `HttpEmbedder`: OpenAI-compatible `/v1/embeddings` endpoint (LM Studio, vLLM, ...).
//! - `HashEmbedder`: deterministic FNV-1a bag-of-words, always available, no model files.
//!
//! `FeedbackServices` carries the selected backend as `Arc<dyn Embedder>`.

use async_trait::async_trait;
use thiserror::Error;

pub mod hash;
pub mod http;

pub use hash::HashEmbedder;
pub use http::HttpEmbedder;

#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("Embedder unavailable: {0}")]
    Unavailable(String),

    #[error("Embedder returned {got} dimensions, expected {expected}")]
    Dimension { expected: usize, got: usize },
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;

    /// Short identifier logged at startup.
    fn name(&self) -> &str;
}

/// Scales `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector_untouched() {
        let mut v = vec![0.0; 4];
        l2_normalize(&mut v);
        assert!(v.iter().all(|&x| x == 0.0));
    }
}
