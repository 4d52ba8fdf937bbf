// Feedback service
// Wires the anonymizer, tracker, learning engine, vector store and metrics together

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::anonymizer::{AnonymizeOptions, Anonymizer, Redacted};
use crate::config::Config;
use crate::database::{Database, LanceBackend};
use crate::embeddings::{EmbeddingModel, OllamaModel};
use crate::feedback::tracker::record_text;
use crate::feedback::{
    Correction, CorrectionAnalysis, CorrectionRecord, CorrectionTracker, FieldAccuracy,
    FieldValue, LearningEngine, LearningOutcome, LearningState, Pattern, PatternSuggestion,
};
use crate::metrics::{EffectivenessReport, MetricsSnapshot, PerformanceMetrics, TrendReport};
use crate::similarity::{SimilarityConfig, combined_similarity};
use crate::store::{Collection, EmbeddingStore, NewDocument, SearchOptions, VectorDocument};
use crate::{FeedbackError, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Correction log section of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionsSection {
    pub records: Vec<CorrectionRecord>,
    #[serde(default)]
    pub applications: BTreeMap<String, u64>,
}

/// Everything the subsystem has learned, as exchanged with other installations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub learning: Option<LearningState>,
    #[serde(default)]
    pub corrections: Option<CorrectionsSection>,
    #[serde(default)]
    pub vector_collections: Option<BTreeMap<Collection, Vec<VectorDocument>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub corrections: usize,
    pub patterns: usize,
    pub vectors_imported: usize,
    pub vectors_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackOutcome {
    pub record_id: String,
    pub learning: LearningOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    Semantic,
    Lexical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarCorrection {
    pub record: CorrectionRecord,
    pub similarity: f64,
    pub method: SearchMethod,
}

/// Entry point for hosts.
///
/// Locks are always taken in the order tracker, learning, metrics.
#[derive(Debug)]
pub struct FeedbackService {
    tracker: Mutex<CorrectionTracker>,
    learning: Mutex<LearningEngine>,
    metrics: Mutex<PerformanceMetrics>,
    similarity: SimilarityConfig,
    default_window_days: u32,
    store: Option<EmbeddingStore>,
    database: Option<Database>,
}

impl FeedbackService {
    /// Builds the service from injected parts with empty in-memory state
    #[inline]
    pub fn new(config: &Config, store: Option<EmbeddingStore>, database: Option<Database>) -> Self {
        Self {
            tracker: Mutex::new(CorrectionTracker::new(Anonymizer::new())),
            learning: Mutex::new(LearningEngine::new(config.learning.clone(), config.similarity)),
            metrics: Mutex::new(PerformanceMetrics::new(config.metrics.clone())),
            similarity: config.similarity,
            default_window_days: config.metrics.default_window_days,
            store,
            database,
        }
    }

    /// Opens the production stack: SQLite under the base directory, LanceDB
    /// vectors and the Ollama embedding model.
    ///
    /// The vector store is optional. If it cannot be built or initialised,
    /// similarity search falls back to lexical scoring.
    #[inline]
    pub async fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(config.get_base_dir())?;
        let database = Database::new(config.database_path()).await?;
        let store = Self::open_store(config).await;

        let service = Self::new(config, store, Some(database));
        service.load_state().await?;
        Ok(service)
    }

    async fn open_store(config: &Config) -> Option<EmbeddingStore> {
        let model = match OllamaModel::from_config(&config.ollama) {
            Ok(model) => model,
            Err(e) => {
                warn!("Embedding model unavailable, using lexical similarity: {:#}", e);
                return None;
            }
        };

        let backend =
            match LanceBackend::open(&config.vector_database_path(), model.dimension()).await {
                Ok(backend) => backend,
                Err(e) => {
                    warn!("Vector database unavailable, using lexical similarity: {}", e);
                    return None;
                }
            };

        let store = EmbeddingStore::new(Arc::new(model), Arc::new(backend), config.store.clone());
        if let Err(e) = store.initialize().await {
            warn!("Vector store not ready, using lexical similarity: {}", e);
        }
        Some(store)
    }

    /// Reloads corrections, patterns and metrics history from SQLite
    #[inline]
    pub async fn load_state(&self) -> Result<()> {
        let Some(database) = &self.database else {
            return Ok(());
        };

        let records = database.list_corrections().await?;
        let applications = database.applications().await?;
        let patterns = database.list_patterns().await?;
        let history = database.list_metrics().await?;

        let mut tracker = self.tracker.lock().await;
        let mut learning = self.learning.lock().await;
        let mut metrics = self.metrics.lock().await;
        tracker.restore(records, applications);
        learning.restore(patterns);
        metrics.restore(history);

        info!(
            "Loaded {} corrections and {} patterns",
            tracker.all_records().len(),
            learning.patterns().len()
        );
        Ok(())
    }

    #[inline]
    pub fn store(&self) -> Option<&EmbeddingStore> {
        self.store.as_ref()
    }

    #[inline]
    pub fn database(&self) -> Option<&Database> {
        self.database.as_ref()
    }

    /// Records a correction and lets the learning engine react to it.
    ///
    /// The correction is persisted before it enters the in-memory log, so a
    /// database failure leaves the log and patterns untouched. Only that
    /// failure is returned; pattern and vector writes that fail are logged
    /// and skipped.
    #[inline]
    pub async fn track_correction(&self, correction: Correction) -> Result<TrackOutcome> {
        let record = self.tracker.lock().await.prepare(correction);

        if let Some(database) = &self.database {
            database.insert_correction(&record).await?;
        }

        let (outcome, pattern) = {
            let mut tracker = self.tracker.lock().await;
            tracker.append(record.clone());
            let history: Vec<&CorrectionRecord> = tracker.records_for(&record.field_path).collect();

            let mut learning = self.learning.lock().await;
            let outcome = learning.learn_from_correction(&record, &history);
            let pattern = match &outcome {
                LearningOutcome::Minted { pattern_id }
                | LearningOutcome::Reinforced { pattern_id } => learning.get(pattern_id).cloned(),
                LearningOutcome::OneOff => None,
            };
            (outcome, pattern)
        };

        if let (Some(database), Some(pattern)) = (&self.database, &pattern) {
            if let Err(e) = database.save_pattern(pattern).await {
                warn!("Failed to persist pattern {}: {:#}", pattern.id, e);
            }
        }

        self.index_correction(&record).await;
        if let (LearningOutcome::Minted { .. }, Some(pattern)) = (&outcome, &pattern) {
            self.index_pattern(pattern).await;
        }

        Ok(TrackOutcome {
            record_id: record.id,
            learning: outcome,
        })
    }

    async fn index_correction(&self, record: &CorrectionRecord) {
        if record.source_context.is_empty() {
            return;
        }
        let mut document = NewDocument::new(record.source_context.clone())
            .with_metadata("field", record.field_path.clone())
            .with_metadata("type", record.features.transformation.as_str());
        if let Some(pathology) = &record.pathology {
            document = document.with_metadata("pathology", pathology.clone());
        }
        document.id = Some(record.id.clone());
        document.timestamp = Some(record.created_at);

        self.index(Collection::Notes, document).await;
    }

    async fn index_pattern(&self, pattern: &Pattern) {
        let mut document = NewDocument::new(Redacted::from_trusted(pattern.signature.clone()))
            .with_metadata("field", pattern.field_path.clone());
        if let Some(pathology) = &pattern.pathology {
            document = document.with_metadata("pathology", pathology.clone());
        }
        document.id = Some(pattern.id.clone());
        document.timestamp = Some(pattern.created_at);

        self.index(Collection::Patterns, document).await;
    }

    async fn index(&self, collection: Collection, document: NewDocument) {
        let Some(store) = &self.store else {
            return;
        };
        match store.store_document(collection, document).await {
            Ok(id) => debug!("Indexed {} in {}", id, collection),
            Err(FeedbackError::StoreNotReady(_)) => {
                debug!("Vector store not ready, {} not indexed", collection);
            }
            Err(e) => warn!("Failed to index document in {}: {}", collection, e),
        }
    }

    /// Adds extractor applications for a field and returns the new total
    #[inline]
    pub async fn record_applications(&self, field_path: &str, count: u64) -> Result<u64> {
        let total = self
            .tracker
            .lock()
            .await
            .record_applications(field_path, count);
        if let Some(database) = &self.database {
            database.set_applications(field_path, total).await?;
        }
        Ok(total)
    }

    #[inline]
    pub async fn enabled_patterns(&self, field_path: &str, pathology: Option<&str>) -> Vec<Pattern> {
        self.learning
            .lock()
            .await
            .enabled_patterns(field_path, pathology)
            .into_iter()
            .cloned()
            .collect()
    }

    #[inline]
    pub async fn all_patterns(&self) -> Vec<Pattern> {
        self.learning.lock().await.patterns().to_vec()
    }

    #[inline]
    pub async fn apply_patterns(
        &self,
        field_path: &str,
        pathology: Option<&str>,
        context: &str,
        current: &FieldValue,
    ) -> Vec<PatternSuggestion> {
        self.learning
            .lock()
            .await
            .apply_patterns(field_path, pathology, context, current)
    }

    /// Records whether applying a pattern turned out correct
    #[inline]
    pub async fn pattern_feedback(&self, pattern_id: &str, succeeded: bool) -> Result<Pattern> {
        let pattern = self
            .learning
            .lock()
            .await
            .apply_feedback(pattern_id, succeeded)?;

        if let Some(database) = &self.database {
            if let Err(e) = database.save_pattern(&pattern).await {
                warn!("Failed to persist feedback for pattern {}: {:#}", pattern.id, e);
            }
        }
        Ok(pattern)
    }

    #[inline]
    pub async fn overall_accuracy(&self) -> f64 {
        self.tracker.lock().await.overall_accuracy()
    }

    #[inline]
    pub async fn field_accuracy(&self, field_path: &str) -> FieldAccuracy {
        self.tracker.lock().await.field_accuracy(field_path)
    }

    #[inline]
    pub async fn analyze_corrections(&self) -> CorrectionAnalysis {
        self.tracker.lock().await.analyze_corrections()
    }

    /// Computes a metrics snapshot and appends it to the history
    #[inline]
    pub async fn compute_metrics(&self) -> MetricsSnapshot {
        let snapshot = {
            let tracker = self.tracker.lock().await;
            self.metrics.lock().await.compute(&tracker)
        };

        if let Some(database) = &self.database {
            if let Err(e) = database.insert_metrics(&snapshot).await {
                warn!("Failed to persist metrics snapshot: {:#}", e);
            }
        }
        snapshot
    }

    /// Accuracy trend over `window_days`, or the configured default window
    #[inline]
    pub async fn accuracy_trend(&self, window_days: Option<u32>) -> TrendReport {
        let window_days = window_days.unwrap_or(self.default_window_days);
        self.metrics.lock().await.accuracy_trend(window_days)
    }

    #[inline]
    pub async fn learning_effectiveness(&self) -> EffectivenessReport {
        self.metrics.lock().await.learning_effectiveness()
    }

    /// Corrections whose context resembles `text`.
    ///
    /// Uses the vector store when it is ready and falls back to lexical
    /// combined similarity otherwise. `text` is scrubbed before use.
    #[inline]
    pub async fn find_similar_corrections(&self, text: &str, limit: usize) -> Vec<SimilarCorrection> {
        let query = self
            .tracker
            .lock()
            .await
            .anonymizer_mut()
            .scrub(text, &AnonymizeOptions::default());

        // Embedding can take seconds; the tracker stays unlocked meanwhile
        if let Some(store) = self.store.as_ref().filter(|store| store.is_ready()) {
            let options = SearchOptions::default().top_k(limit);
            match store.semantic_search(Collection::Notes, query.as_str(), &options).await {
                Ok(results) => {
                    let tracker = self.tracker.lock().await;
                    return results
                        .into_iter()
                        .filter_map(|scored| {
                            tracker.get(&scored.document.id).map(|record| SimilarCorrection {
                                record: record.clone(),
                                similarity: scored.similarity,
                                method: SearchMethod::Semantic,
                            })
                        })
                        .collect();
                }
                Err(e) => warn!("Semantic search failed, using lexical similarity: {}", e),
            }
        }

        let tracker = self.tracker.lock().await;
        let mut results: Vec<SimilarCorrection> = tracker
            .all_records()
            .iter()
            .map(|record| SimilarCorrection {
                similarity: combined_similarity(query.as_str(), &record_text(record), &self.similarity.weights),
                record: record.clone(),
                method: SearchMethod::Lexical,
            })
            .filter(|result| result.similarity > 0.0)
            .collect();
        results.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        });
        results.truncate(limit);
        results
    }

    /// Exports learning state, the correction log and, when the store is
    /// ready, every vector collection.
    #[inline]
    pub async fn export_snapshot(&self) -> Result<Snapshot> {
        let (learning, corrections) = {
            let tracker = self.tracker.lock().await;
            let learning = self.learning.lock().await;
            (
                learning.export_learning(),
                CorrectionsSection {
                    records: tracker.all_records().to_vec(),
                    applications: tracker
                        .applications()
                        .iter()
                        .map(|(field, count)| (field.clone(), *count))
                        .collect(),
                },
            )
        };

        let vector_collections = match self.store.as_ref().filter(|store| store.is_ready()) {
            Some(store) => {
                let mut collections = BTreeMap::new();
                for collection in Collection::ALL {
                    collections.insert(collection, store.export_collection(collection).await?);
                }
                Some(collections)
            }
            None => None,
        };

        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            learning: Some(learning),
            corrections: Some(corrections),
            vector_collections,
        })
    }

    /// Checks a snapshot's shape without applying it
    #[inline]
    pub fn validate_snapshot(snapshot: &Snapshot) -> Result<()> {
        if snapshot.version == 0 || snapshot.version > SNAPSHOT_VERSION {
            return Err(FeedbackError::Import(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.learning.is_none() && snapshot.corrections.is_none() {
            return Err(FeedbackError::Import(
                "snapshot has neither a learning nor a corrections section".to_string(),
            ));
        }
        if let Some(learning) = &snapshot.learning {
            LearningEngine::validate(learning)?;
        }
        if let Some(corrections) = &snapshot.corrections {
            if let Some(record) = corrections
                .records
                .iter()
                .find(|record| record.id.trim().is_empty() || record.field_path.trim().is_empty())
            {
                return Err(FeedbackError::Import(format!(
                    "correction '{}' lacks an id or field path",
                    record.id
                )));
            }
        }
        Ok(())
    }

    /// Merges a snapshot into the current state.
    ///
    /// The whole snapshot is validated before anything changes. Corrections
    /// and pattern texts are scrubbed again on the way in. Vector documents
    /// are committed one by one, so a failure part way leaves earlier ones
    /// stored.
    #[inline]
    pub async fn import_snapshot(&self, snapshot: Snapshot) -> Result<ImportReport> {
        Self::validate_snapshot(&snapshot)?;
        let mut report = ImportReport::default();

        let (added_records, changed_patterns, applications) = {
            let mut tracker = self.tracker.lock().await;
            let mut learning = self.learning.lock().await;

            let added_records = match snapshot.corrections {
                Some(section) => {
                    let applications: HashMap<String, u64> =
                        section.applications.into_iter().collect();
                    tracker.import_records(section.records, &applications)
                }
                None => Vec::new(),
            };

            let changed_patterns = match snapshot.learning {
                Some(mut state) => {
                    for pattern in &mut state.patterns {
                        pattern.scrub(tracker.anonymizer_mut());
                    }
                    learning.import_learning(state)?
                }
                None => Vec::new(),
            };

            (added_records, changed_patterns, tracker.applications().clone())
        };
        report.corrections = added_records.len();
        report.patterns = changed_patterns.len();

        if let Some(database) = &self.database {
            for record in &added_records {
                database.insert_correction(record).await?;
            }
            for (field, total) in &applications {
                database.set_applications(field, *total).await?;
            }
            for pattern in &changed_patterns {
                if let Err(e) = database.save_pattern(pattern).await {
                    warn!("Failed to persist imported pattern {}: {:#}", pattern.id, e);
                }
            }
        }

        if let (Some(collections), Some(store)) = (snapshot.vector_collections, &self.store) {
            if store.is_ready() {
                let mut tracker = self.tracker.lock().await;
                for (collection, documents) in collections {
                    let summary = store
                        .import_collection(collection, documents, tracker.anonymizer_mut())
                        .await?;
                    report.vectors_imported += summary.imported;
                    report.vectors_failed += summary.failed;
                }
            } else {
                warn!("Vector store not ready, skipping vector collections in snapshot");
            }
        } else {
            for record in &added_records {
                self.index_correction(record).await;
            }
        }

        info!(
            "Imported snapshot: {} corrections, {} patterns, {} vectors",
            report.corrections, report.patterns, report.vectors_imported
        );
        Ok(report)
    }

    /// Forgets every correction, pattern, metric and vector
    #[inline]
    pub async fn clear_all(&self) -> Result<()> {
        {
            let mut tracker = self.tracker.lock().await;
            let mut learning = self.learning.lock().await;
            let mut metrics = self.metrics.lock().await;
            tracker.clear();
            learning.clear_all();
            metrics.clear();
        }

        if let Some(database) = &self.database {
            database.clear_all().await?;
            if let Err(e) = database.optimize().await {
                warn!("Failed to optimize database after clearing: {:#}", e);
            }
        }

        if let Some(store) = self.store.as_ref().filter(|store| store.is_ready()) {
            for collection in Collection::ALL {
                if let Err(e) = store.clear_collection(collection).await {
                    warn!("Failed to clear {} collection: {}", collection, e);
                }
            }
        }
        Ok(())
    }

    /// Forgets the anonymizer's token mappings; call between unrelated patients.
    #[inline]
    pub async fn clear_anonymizer_caches(&self) {
        self.tracker.lock().await.clear_anonymizer_caches();
    }
}
