// Embedding models
// Ollama-backed and offline hashing models behind one async trait

pub mod hashing;
pub mod ollama;


use async_trait::async_trait;

use crate::Result;

pub use hashing::HashingModel;
pub use ollama::{OllamaClient, OllamaModel};

/// Produces fixed-length vectors for text.
///
/// Implementations may return unnormalised vectors; the store normalises them.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Checks the model can serve requests; called once when a store initializes
    async fn warm_up(&self) -> Result<()> {
        Ok(())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// L2-normalises `vector` in place. Zero vectors are left untouched.
#[inline]
pub fn normalize(vector: &mut [f32]) {
    let norm = vector
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt();
    if norm > f64::EPSILON && norm.is_finite() {
        for value in vector.iter_mut() {
            *value = (f64::from(*value) / norm) as f32;
        }
    }
}
