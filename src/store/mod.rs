// Embedding store
// Bounded, brute-force semantic search over named collections of scrubbed text

pub mod backend;


use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::anonymizer::{AnonymizeOptions, Anonymizer, Redacted};
use crate::embeddings::{EmbeddingModel, normalize};
use crate::similarity::cosine_similarity;
use crate::{FeedbackError, Result};

pub use backend::{MemoryBackend, VectorBackend};

/// Metadata keys that carry a collection's domain key, in lookup order
pub const DOMAIN_KEYS: [&str; 3] = ["field", "type", "pathology"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Refuse inserts into a full collection
    Reject,
    /// Drop the oldest document to make room
    #[default]
    EvictOldest,
}

impl fmt::Display for EvictionPolicy {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject => f.write_str("reject"),
            Self::EvictOldest => f.write_str("evict_oldest"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound on documents per collection; search cost is linear in it
    pub max_collection_size: usize,
    pub eviction: EvictionPolicy,
    pub embed_timeout_secs: u64,
    pub default_top_k: usize,
    pub default_min_similarity: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_collection_size: 5_000,
            eviction: EvictionPolicy::EvictOldest,
            embed_timeout_secs: 30,
            default_top_k: 10,
            default_min_similarity: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Notes,
    Patterns,
    Entities,
    Summaries,
}

impl Collection {
    pub const ALL: [Self; 4] = [Self::Notes, Self::Patterns, Self::Entities, Self::Summaries];

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Notes => "notes",
            Self::Patterns => "patterns",
            Self::Entities => "entities",
            Self::Summaries => "summaries",
        }
    }
}

impl fmt::Display for Collection {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = FeedbackError;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|collection| collection.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FeedbackError::Store(format!("unknown collection '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    pub collection: Collection,
    pub text: Redacted,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl VectorDocument {
    /// First of `field`, `type` or `pathology` present in the metadata
    #[inline]
    pub fn domain_key(&self) -> Option<&str> {
        DOMAIN_KEYS
            .iter()
            .find_map(|key| self.metadata.get(*key))
            .map(String::as_str)
    }

    fn matches(&self, filter: &BTreeMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.metadata.get(key) == Some(value))
    }
}

/// Input to [`EmbeddingStore::store_document`]
#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    /// Generated when absent; an existing id is replaced
    pub id: Option<String>,
    pub text: Redacted,
    pub metadata: BTreeMap<String, String>,
    /// Reused when its length matches the model, otherwise regenerated
    pub embedding: Option<Vec<f32>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewDocument {
    #[inline]
    pub fn new(text: Redacted) -> Self {
        Self {
            text,
            ..Self::default()
        }
    }

    #[inline]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredDocument {
    pub document: VectorDocument,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    /// Falls back to the store's `default_top_k`
    pub top_k: Option<usize>,
    /// Falls back to the store's `default_min_similarity`
    pub min_similarity: Option<f64>,
    /// Exact match on metadata keys
    pub filter: BTreeMap<String, String>,
}

impl SearchOptions {
    #[inline]
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    #[inline]
    pub fn min_similarity(mut self, min_similarity: f64) -> Self {
        self.min_similarity = Some(min_similarity);
        self
    }

    #[inline]
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterOptions {
    pub min_cluster_size: usize,
    pub similarity_threshold: f64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            min_cluster_size: 2,
            similarity_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub document_ids: Vec<String>,
    pub centroid: Vec<f32>,
}

impl Cluster {
    #[inline]
    pub fn size(&self) -> usize {
        self.document_ids.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatistics {
    pub ready: bool,
    pub model: String,
    pub dimension: usize,
    pub collections: BTreeMap<Collection, usize>,
    pub max_collection_size: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub failed: usize,
}

/// Semantic index over redacted text.
///
/// Loads every collection into memory on first use and scores queries by
/// cosine similarity against each document, so collections are capped by
/// [`StoreConfig::max_collection_size`].
pub struct EmbeddingStore {
    model: Arc<dyn EmbeddingModel>,
    backend: Arc<dyn VectorBackend>,
    config: StoreConfig,
    init: OnceCell<std::result::Result<(), String>>,
    collections: RwLock<HashMap<Collection, Vec<VectorDocument>>>,
}

impl fmt::Debug for EmbeddingStore {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingStore")
            .field("model", &self.model.name())
            .field("dimension", &self.model.dimension())
            .field("config", &self.config)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl EmbeddingStore {
    #[inline]
    pub fn new(
        model: Arc<dyn EmbeddingModel>,
        backend: Arc<dyn VectorBackend>,
        config: StoreConfig,
    ) -> Self {
        Self {
            model,
            backend,
            config,
            init: OnceCell::new(),
            collections: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    /// Loads persisted collections. Runs at most once per store; concurrent
    /// callers wait for the same attempt and every later call sees its outcome.
    #[inline]
    pub async fn initialize(&self) -> Result<()> {
        let outcome = self
            .init
            .get_or_init(|| async {
                match self.load_collections().await {
                    Ok(total) => {
                        info!(
                            "Embedding store ready with {} documents (model {}, dimension {})",
                            total,
                            self.model.name(),
                            self.model.dimension()
                        );
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Embedding store initialization failed: {}", e);
                        Err(e.to_string())
                    }
                }
            })
            .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(reason) => Err(FeedbackError::StoreNotReady(reason.clone())),
        }
    }

    /// True once initialization has completed successfully
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self.init.get(), Some(Ok(())))
    }

    async fn load_collections(&self) -> Result<usize> {
        let expected = self.model.dimension();
        if expected == 0 {
            return Err(FeedbackError::Embedding(
                "embedding model reports zero dimension".to_string(),
            ));
        }

        self.model.warm_up().await?;

        if let Some(stored) = self.backend.stored_dimension().await? {
            if stored != expected {
                return Err(FeedbackError::DimensionMismatch {
                    expected,
                    actual: stored,
                });
            }
        }

        let mut loaded = HashMap::new();
        let mut total = 0;
        for collection in Collection::ALL {
            let mut documents = self.backend.load(collection).await?;
            documents.retain(|document| {
                let keep = document.embedding.len() == expected;
                if !keep {
                    warn!(
                        "Skipping document {} in {}: dimension {} != {}",
                        document.id,
                        collection,
                        document.embedding.len(),
                        expected
                    );
                }
                keep
            });
            documents.sort_by_key(|document| document.timestamp);
            total += documents.len();
            debug!("Loaded {} documents into {}", documents.len(), collection);
            loaded.insert(collection, documents);
        }

        *self.collections.write().await = loaded;
        Ok(total)
    }

    /// Embeds `text` with the injected model, bounded by `embed_timeout_secs`.
    ///
    /// The result is L2-normalised and always has the model's dimension.
    #[inline]
    pub async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        self.initialize().await?;

        let timeout = Duration::from_secs(self.config.embed_timeout_secs);
        let mut vector = tokio::time::timeout(timeout, self.model.embed(text))
            .await
            .map_err(|_| FeedbackError::Timeout {
                operation: "embedding generation".to_string(),
            })??;

        self.check_dimension(&vector)?;
        normalize(&mut vector);
        Ok(vector)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        let expected = self.model.dimension();
        if vector.len() == expected {
            Ok(())
        } else {
            Err(FeedbackError::DimensionMismatch {
                expected,
                actual: vector.len(),
            })
        }
    }

    /// Adds a document, returning its id.
    ///
    /// A full collection either rejects the insert or evicts its oldest
    /// document, per [`StoreConfig::eviction`].
    #[inline]
    pub async fn store_document(&self, collection: Collection, document: NewDocument) -> Result<String> {
        self.initialize().await?;

        let embedding = match document.embedding {
            Some(mut embedding) if embedding.len() == self.model.dimension() => {
                normalize(&mut embedding);
                embedding
            }
            _ => self.generate_embedding(document.text.as_str()).await?,
        };

        let stored = VectorDocument {
            id: document.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            collection,
            text: document.text,
            embedding,
            metadata: document.metadata,
            timestamp: document.timestamp.unwrap_or_else(Utc::now),
        };

        // Backend first, so a failed write leaves memory as it was
        let mut collections = self.collections.write().await;
        let documents = collections.entry(collection).or_default();
        let others = |documents: &[VectorDocument]| {
            documents.iter().filter(|existing| existing.id != stored.id).count()
        };

        if others(documents.as_slice()) >= self.config.max_collection_size {
            match self.config.eviction {
                EvictionPolicy::Reject => {
                    return Err(FeedbackError::Store(format!(
                        "collection {} is full ({} documents)",
                        collection, self.config.max_collection_size
                    )));
                }
                EvictionPolicy::EvictOldest => {
                    while others(documents.as_slice()) >= self.config.max_collection_size {
                        let Some(oldest) = Self::oldest_index(documents, &stored.id) else {
                            break;
                        };
                        self.backend.delete(collection, &documents[oldest].id).await?;
                        let evicted = documents.remove(oldest);
                        debug!("Evicted document {} from {}", evicted.id, collection);
                    }
                }
            }
        }

        self.backend.insert(&stored).await?;
        documents.retain(|existing| existing.id != stored.id);
        let id = stored.id.clone();
        documents.push(stored);
        debug!("Stored document {} in {}", id, collection);
        Ok(id)
    }

    fn oldest_index(documents: &[VectorDocument], keep: &str) -> Option<usize> {
        documents
            .iter()
            .enumerate()
            .filter(|(_, document)| document.id != keep)
            .min_by_key(|(_, document)| document.timestamp)
            .map(|(index, _)| index)
    }

    /// Ranks `collection` against the embedding of `query`
    #[inline]
    pub async fn semantic_search(
        &self,
        collection: Collection,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredDocument>> {
        let query_vector = self.generate_embedding(query).await?;
        self.rank(collection, &query_vector, options, None).await
    }

    /// Neighbours of a stored document, never including the document itself
    #[inline]
    pub async fn find_similar(
        &self,
        collection: Collection,
        id: &str,
        options: &SearchOptions,
    ) -> Result<Vec<ScoredDocument>> {
        self.initialize().await?;

        let embedding = {
            let collections = self.collections.read().await;
            collections
                .get(&collection)
                .and_then(|documents| documents.iter().find(|document| document.id == id))
                .map(|document| document.embedding.clone())
        };
        let embedding = embedding.ok_or_else(|| {
            FeedbackError::Store(format!("document {id} not found in {collection}"))
        })?;

        self.rank(collection, &embedding, options, Some(id)).await
    }

    async fn rank(
        &self,
        collection: Collection,
        query: &[f32],
        options: &SearchOptions,
        exclude: Option<&str>,
    ) -> Result<Vec<ScoredDocument>> {
        let top_k = options.top_k.unwrap_or(self.config.default_top_k);
        let min_similarity = options
            .min_similarity
            .unwrap_or(self.config.default_min_similarity);

        let collections = self.collections.read().await;
        let Some(documents) = collections.get(&collection) else {
            return Ok(Vec::new());
        };

        let mut scored = Vec::new();
        for document in documents {
            if exclude == Some(document.id.as_str()) || !document.matches(&options.filter) {
                continue;
            }
            let similarity = cosine_similarity(query, &document.embedding)?;
            if similarity >= min_similarity {
                scored.push((similarity, document));
            }
        }

        scored.sort_by(|(a_score, a_doc), (b_score, b_doc)| {
            b_score
                .total_cmp(a_score)
                .then_with(|| b_doc.timestamp.cmp(&a_doc.timestamp))
        });
        scored.truncate(top_k);

        debug!(
            "Search in {} returned {} of {} documents",
            collection,
            scored.len(),
            documents.len()
        );

        Ok(scored
            .into_iter()
            .map(|(similarity, document)| ScoredDocument {
                document: document.clone(),
                similarity,
            })
            .collect())
    }

    /// Greedy single-link clustering.
    ///
    /// Each unprocessed document, oldest first, seeds a cluster that absorbs
    /// every other unprocessed document within `similarity_threshold` of it.
    /// Clusters smaller than `min_cluster_size` are dropped.
    #[inline]
    pub async fn cluster_documents(
        &self,
        collection: Collection,
        options: ClusterOptions,
    ) -> Result<Vec<Cluster>> {
        self.initialize().await?;

        let collections = self.collections.read().await;
        let Some(stored) = collections.get(&collection) else {
            return Ok(Vec::new());
        };
        let mut documents: Vec<&VectorDocument> = stored.iter().collect();
        documents.sort_by_key(|document| document.timestamp);

        let mut processed = vec![false; documents.len()];
        let mut clusters = Vec::new();

        for seed in 0..documents.len() {
            if processed[seed] {
                continue;
            }
            processed[seed] = true;
            let mut members = vec![seed];

            for candidate in (seed + 1)..documents.len() {
                if processed[candidate] {
                    continue;
                }
                let similarity =
                    cosine_similarity(&documents[seed].embedding, &documents[candidate].embedding)?;
                if similarity >= options.similarity_threshold {
                    processed[candidate] = true;
                    members.push(candidate);
                }
            }

            if members.len() >= options.min_cluster_size.max(1) {
                let vectors: Vec<&[f32]> = members
                    .iter()
                    .map(|&index| documents[index].embedding.as_slice())
                    .collect();
                clusters.push(Cluster {
                    document_ids: members
                        .iter()
                        .map(|&index| documents[index].id.clone())
                        .collect(),
                    centroid: centroid(&vectors),
                });
            }
        }

        clusters.sort_by(|a, b| b.size().cmp(&a.size()));
        debug!("Found {} clusters in {}", clusters.len(), collection);
        Ok(clusters)
    }

    #[inline]
    pub async fn delete_document(&self, collection: Collection, id: &str) -> Result<bool> {
        self.initialize().await?;

        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(&collection) else {
            return Ok(false);
        };
        let Some(position) = documents.iter().position(|document| document.id == id) else {
            return Ok(false);
        };

        self.backend.delete(collection, id).await?;
        documents.remove(position);
        Ok(true)
    }

    /// Removes every document in `collection`, returning how many were dropped
    #[inline]
    pub async fn clear_collection(&self, collection: Collection) -> Result<usize> {
        self.initialize().await?;

        let mut collections = self.collections.write().await;
        self.backend.clear(collection).await?;
        let removed = collections.remove(&collection).map_or(0, |documents| documents.len());
        info!("Cleared {} documents from {}", removed, collection);
        Ok(removed)
    }

    /// Reports readiness without forcing initialization
    #[inline]
    pub async fn get_statistics(&self) -> StoreStatistics {
        let ready = self.is_ready();
        let collections = self.collections.read().await;
        let counts = Collection::ALL
            .into_iter()
            .map(|collection| {
                let count = if ready {
                    collections.get(&collection).map_or(0, Vec::len)
                } else {
                    0
                };
                (collection, count)
            })
            .collect();

        StoreStatistics {
            ready,
            model: self.model.name().to_string(),
            dimension: self.model.dimension(),
            collections: counts,
            max_collection_size: self.config.max_collection_size,
        }
    }

    /// Documents of `collection`, oldest first
    #[inline]
    pub async fn export_collection(&self, collection: Collection) -> Result<Vec<VectorDocument>> {
        self.initialize().await?;

        let collections = self.collections.read().await;
        let mut documents = collections.get(&collection).cloned().unwrap_or_default();
        documents.sort_by_key(|document| document.timestamp);
        Ok(documents)
    }

    /// Re-scrubs and stores each document in turn.
    ///
    /// Not atomic: documents committed before a failure stay committed, and
    /// failures are counted rather than aborting the rest.
    #[inline]
    pub async fn import_collection(
        &self,
        collection: Collection,
        documents: Vec<VectorDocument>,
        anonymizer: &mut Anonymizer,
    ) -> Result<ImportSummary> {
        self.initialize().await?;

        let mut summary = ImportSummary::default();
        let options = AnonymizeOptions::default();

        for document in documents {
            let text = anonymizer.scrub(document.text.as_str(), &options);
            let embedding = (document.embedding.len() == self.model.dimension()
                && text == document.text)
                .then_some(document.embedding);

            let new_document = NewDocument {
                id: Some(document.id),
                text,
                metadata: document.metadata,
                embedding,
                timestamp: Some(document.timestamp),
            };

            match self.store_document(collection, new_document).await {
                Ok(_) => summary.imported += 1,
                Err(e) => {
                    warn!("Failed to import document into {}: {}", collection, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Imported {} documents into {} ({} failed)",
            summary.imported, collection, summary.failed
        );
        Ok(summary)
    }
}

/// Componentwise mean; empty input yields an empty vector
#[inline]
pub fn centroid(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return Vec::new();
    };
    let mut sum = vec![0.0f64; first.len()];
    for vector in vectors {
        for (total, value) in sum.iter_mut().zip(vector.iter()) {
            *total += f64::from(*value);
        }
    }
    let count = vectors.len() as f64;
    sum.into_iter().map(|total| (total / count) as f32).collect()
}
