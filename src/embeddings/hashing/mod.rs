
use std::collections::HashMap;

use async_trait::async_trait;

use super::{EmbeddingModel, normalize};
use crate::Result;
use crate::similarity::tokenize;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;
const BIGRAM_WEIGHT: f32 = 0.5;

/// Offline model that hashes terms into fixed buckets.
///
/// Lexical only: two texts are close when they share words, not meaning.
/// Used when Ollama is unreachable and in tests.
#[derive(Debug, Clone, Copy)]
pub struct HashingModel {
    dimension: usize,
}

impl HashingModel {
    #[inline]
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Unit-length term-frequency vector; all zeros for text without tokens
    #[inline]
    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        let tokens = tokenize(text);
        if tokens.is_empty() {
            return vector;
        }

        let mut frequencies: HashMap<String, f32> = HashMap::new();
        for token in &tokens {
            *frequencies.entry(token.clone()).or_default() += 1.0;
        }
        for pair in tokens.windows(2) {
            *frequencies.entry(format!("{} {}", pair[0], pair[1])).or_default() += BIGRAM_WEIGHT;
        }

        let total = tokens.len() as f32;
        for (term, count) in &frequencies {
            // Longer terms carry more signal than stopwords
            let weight = 1.0 + (term.chars().count() as f32).ln();
            vector[self.bucket(term)] += (count / total) * weight;
        }

        normalize(&mut vector);
        vector
    }

    fn bucket(&self, term: &str) -> usize {
        let mut hash = FNV_OFFSET_BASIS;
        for byte in term.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        (hash % self.dimension as u64) as usize
    }
}

#[async_trait]
impl EmbeddingModel for HashingModel {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.vectorize(text)).collect())
    }
}
