// Similarity metrics
// Pure text and vector similarity functions shared by learning, search and dedup

pub mod concepts;


use std::collections::HashSet;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use concepts::{Concept, ConceptCategory, extract_concepts};

pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.85;
pub const DEFAULT_PATTERN_DUPLICATE_THRESHOLD: f64 = 0.70;
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.60;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityError {
    #[error("Vector dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Blend weights for [`combined_similarity`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimilarityWeights {
    pub jaccard: f64,
    pub edit: f64,
    pub concept: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            jaccard: 0.4,
            edit: 0.2,
            concept: 0.4,
        }
    }
}

impl SimilarityWeights {
    #[inline]
    pub fn total(&self) -> f64 {
        self.jaccard + self.edit + self.concept
    }
}

/// Decision thresholds used by the callers of [`combined_similarity`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimilarityConfig {
    pub weights: SimilarityWeights,
    pub dedup_threshold: f64,
    pub pattern_duplicate_threshold: f64,
    pub fuzzy_threshold: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            weights: SimilarityWeights::default(),
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            pattern_duplicate_threshold: DEFAULT_PATTERN_DUPLICATE_THRESHOLD,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
        }
    }
}

impl SimilarityConfig {
    #[inline]
    pub fn combined(&self, a: &str, b: &str) -> f64 {
        combined_similarity(a, b, &self.weights)
    }

    #[inline]
    pub fn is_duplicate(&self, a: &str, b: &str) -> bool {
        self.combined(a, b) >= self.dedup_threshold
    }

    #[inline]
    pub fn is_pattern_duplicate(&self, a: &str, b: &str) -> bool {
        self.combined(a, b) >= self.pattern_duplicate_threshold
    }

    #[inline]
    pub fn is_fuzzy_match(&self, a: &str, b: &str) -> bool {
        self.combined(a, b) >= self.fuzzy_threshold
    }
}

/// Lowercase alphanumeric tokens. Hyphens and apostrophes inside a word are kept.
#[inline]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\''))
        .map(|t| t.trim_matches(|c: char| c == '-' || c == '\''))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard<T: Eq + std::hash::Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Jaccard similarity of the lowercase token sets
#[inline]
pub fn token_set_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokenize(a).into_iter().collect();
    let set_b: HashSet<String> = tokenize(b).into_iter().collect();
    jaccard(&set_a, &set_b)
}

/// Character-level Levenshtein distance
#[inline]
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Levenshtein distance divided by the longer length, in [0, 1]
#[inline]
pub fn normalized_edit_distance(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    levenshtein_distance(a, b) as f64 / max_len as f64
}

#[inline]
pub fn edit_similarity(a: &str, b: &str) -> f64 {
    1.0 - normalized_edit_distance(&a.to_lowercase(), &b.to_lowercase())
}

/// Jaccard over extracted clinical concepts, falling back to token Jaccard
/// when neither text mentions a known concept.
#[inline]
pub fn domain_concept_overlap(a: &str, b: &str) -> f64 {
    let concepts_a = extract_concepts(a);
    let concepts_b = extract_concepts(b);

    if concepts_a.is_empty() && concepts_b.is_empty() {
        return token_set_jaccard(a, b);
    }

    let set_a: HashSet<&Concept> = concepts_a.iter().collect();
    let set_b: HashSet<&Concept> = concepts_b.iter().collect();
    jaccard(&set_a, &set_b)
}

fn ngrams(tokens: &[String], n: usize) -> HashSet<String> {
    if n == 0 || tokens.len() < n {
        return HashSet::new();
    }
    tokens.windows(n).map(|w| w.join(" ")).collect()
}

/// Jaccard over token n-grams. Texts shorter than `n` compare their whole token sequence.
#[inline]
pub fn ngram_overlap(a: &str, b: &str, n: usize) -> f64 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);

    let grams_a = ngrams(&tokens_a, n);
    let grams_b = ngrams(&tokens_b, n);

    if grams_a.is_empty() || grams_b.is_empty() {
        return if tokens_a == tokens_b { 1.0 } else { 0.0 };
    }

    jaccard(&grams_a, &grams_b)
}

fn lcs_length<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for item_a in a {
        for (j, item_b) in b.iter().enumerate() {
            current[j + 1] = if item_a == item_b {
                previous[j] + 1
            } else {
                previous[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Token-level longest common subsequence length over the longer token count
#[inline]
pub fn longest_common_subsequence_ratio(a: &str, b: &str) -> f64 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    let max_len = tokens_a.len().max(tokens_b.len());
    if max_len == 0 {
        return 1.0;
    }
    lcs_length(&tokens_a, &tokens_b) as f64 / max_len as f64
}

/// Ordered section headings of a clinical note: markdown headings, `HEADING:` lines
/// and short all-caps lines without digits.
#[inline]
pub fn section_headings(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| {
            if let Some(heading) = line.strip_prefix('#') {
                let heading = heading.trim_start_matches('#').trim();
                return (!heading.is_empty()).then(|| heading.to_lowercase());
            }
            if let Some((head, rest)) = line.split_once(':') {
                let head = head.trim();
                let words = head.split_whitespace().count();
                if !head.is_empty()
                    && words <= 4
                    && rest.trim().is_empty()
                    && head.chars().next().is_some_and(char::is_uppercase)
                {
                    return Some(head.to_lowercase());
                }
            }
            let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
            let is_caps_heading = letters.len() >= 3
                && letters.iter().all(|c| c.is_uppercase())
                && !line.chars().any(|c| c.is_ascii_digit())
                && line.split_whitespace().count() <= 5;
            is_caps_heading.then(|| line.to_lowercase())
        })
        .collect()
}

/// Compares ordered section sequences and section counts
#[inline]
pub fn structural_similarity(a: &str, b: &str) -> f64 {
    let sections_a = section_headings(a);
    let sections_b = section_headings(b);

    if sections_a.is_empty() && sections_b.is_empty() {
        return 1.0;
    }
    if sections_a.is_empty() || sections_b.is_empty() {
        return 0.0;
    }

    let max_len = sections_a.len().max(sections_b.len());
    let order = lcs_length(&sections_a, &sections_b) as f64 / max_len as f64;
    let count = sections_a.len().min(sections_b.len()) as f64 / max_len as f64;

    0.5f64.mul_add(order, 0.5 * count)
}

/// Cosine similarity of two vectors, clamped to [0, 1].
///
/// Vectors of different lengths are rejected. A zero-norm vector yields 0.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot = x.mul_add(y, dot);
        norm_a = x.mul_add(x, norm_a);
        norm_b = y.mul_add(y, norm_b);
    }

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator < f64::EPSILON || !denominator.is_finite() {
        return Ok(0.0);
    }

    let similarity = dot / denominator;
    if similarity.is_nan() {
        Ok(0.0)
    } else {
        Ok(similarity.clamp(0.0, 1.0))
    }
}

/// Weighted blend of token Jaccard, edit similarity and concept overlap
#[inline]
pub fn combined_similarity(a: &str, b: &str, weights: &SimilarityWeights) -> f64 {
    let total = weights.total();
    if total <= 0.0 {
        return token_set_jaccard(a, b);
    }

    let score = weights.jaccard * token_set_jaccard(a, b)
        + weights.edit * edit_similarity(a, b)
        + weights.concept * domain_concept_overlap(a, b);

    (score / total).clamp(0.0, 1.0)
}

/// Pairwise combined similarity for every unordered pair, mostly useful for diagnostics
#[inline]
pub fn pairwise_similarities(texts: &[&str], weights: &SimilarityWeights) -> Vec<(usize, usize, f64)> {
    (0..texts.len())
        .tuple_combinations()
        .map(|(i, j)| (i, j, combined_similarity(texts[i], texts[j], weights)))
        .collect()
}
