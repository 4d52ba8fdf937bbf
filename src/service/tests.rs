use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use super::*;
use crate::embeddings::HashingModel;
use crate::store::{MemoryBackend, StoreConfig};

const CONTEXTS: [&str; 3] = [
    "CT head shows diffuse SAH. Angiogram: left MCA aneurysm, 7mm.",
    "Known left MCA aneurysm with SAH on admission.",
    "Repeat imaging confirms the left MCA aneurysm.",
];

/// Embedding server that never comes up
struct OfflineModel;

#[async_trait]
impl EmbeddingModel for OfflineModel {
    fn name(&self) -> &str {
        "offline"
    }

    fn dimension(&self) -> usize {
        16
    }

    async fn warm_up(&self) -> Result<()> {
        Err(FeedbackError::Embedding("connection refused".to_string()))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(FeedbackError::Embedding("connection refused".to_string()))
    }
}

/// Holds back embeddings of texts mentioning `held` until the gate opens
struct GatedModel {
    inner: HashingModel,
    held: &'static str,
    gate: Arc<Notify>,
}

#[async_trait]
impl EmbeddingModel for GatedModel {
    fn name(&self) -> &str {
        "gated"
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains(self.held) {
            self.gate.notified().await;
        }
        self.inner.embed(text).await
    }
}

fn hashing_store() -> EmbeddingStore {
    EmbeddingStore::new(
        Arc::new(HashingModel::new(256)),
        Arc::new(MemoryBackend::new()),
        StoreConfig::default(),
    )
}

async fn ready_service() -> FeedbackService {
    let store = hashing_store();
    store.initialize().await.expect("hashing store should initialise");
    FeedbackService::new(&Config::default(), Some(store), None)
}

fn offline_service() -> FeedbackService {
    let store = EmbeddingStore::new(
        Arc::new(OfflineModel),
        Arc::new(MemoryBackend::new()),
        StoreConfig::default(),
    );
    FeedbackService::new(&Config::default(), Some(store), None)
}

fn location(context: &str) -> Correction {
    Correction::new("pathology.location", "left side", "left MCA", context).with_pathology("SAH")
}

async fn track_all(service: &FeedbackService) -> Vec<TrackOutcome> {
    let mut outcomes = Vec::new();
    for context in CONTEXTS {
        outcomes.push(
            service
                .track_correction(location(context))
                .await
                .expect("tracking should succeed"),
        );
    }
    outcomes
}

#[tokio::test]
async fn repeated_corrections_become_an_enabled_pattern() {
    let service = ready_service().await;
    let outcomes = track_all(&service).await;
    assert_eq!(outcomes[0].learning, LearningOutcome::OneOff);
    assert!(matches!(outcomes[2].learning, LearningOutcome::Minted { .. }));

    let patterns = service
        .enabled_patterns("pathology.location", Some("SAH"))
        .await;
    assert!(!patterns.is_empty());
    assert!(
        patterns[0]
            .rule
            .evaluate("Follow-up angiogram of the MCA", "")
            .expect("rule should be valid")
    );

    let suggestions = service
        .apply_patterns(
            "pathology.location",
            Some("SAH"),
            "new admission, right MCA aneurysm",
            &FieldValue::from("right side"),
        )
        .await;
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].value, FieldValue::from("left MCA"));

    let stats = service.store().expect("store configured").get_statistics().await;
    assert_eq!(stats.collections[&Collection::Notes], 3);
    assert_eq!(stats.collections[&Collection::Patterns], 1);
}

#[tokio::test]
async fn unavailable_store_degrades_to_lexical_search() {
    let service = offline_service();
    let outcomes = track_all(&service).await;
    assert!(matches!(outcomes[2].learning, LearningOutcome::Minted { .. }));
    assert!(!service.store().expect("store configured").is_ready());

    let results = service
        .find_similar_corrections("left MCA aneurysm", 5)
        .await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.method == SearchMethod::Lexical));
    assert!(results[0].similarity >= results[2].similarity);
}

#[tokio::test]
async fn ready_store_searches_semantically() {
    let service = ready_service().await;
    track_all(&service).await;
    service
        .track_correction(Correction::new(
            "medications",
            "aspirin",
            "nimodipine",
            "Started nimodipine for vasospasm prophylaxis",
        ))
        .await
        .expect("tracking should succeed");

    let results = service
        .find_similar_corrections("nimodipine vasospasm", 2)
        .await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].method, SearchMethod::Semantic);
    assert_eq!(results[0].record.field_path, "medications");
}

#[tokio::test]
async fn tracking_proceeds_while_search_waits_on_embedding() {
    let gate = Arc::new(Notify::new());
    let store = EmbeddingStore::new(
        Arc::new(GatedModel {
            inner: HashingModel::new(256),
            held: "vasospasm",
            gate: Arc::clone(&gate),
        }),
        Arc::new(MemoryBackend::new()),
        StoreConfig::default(),
    );
    store.initialize().await.expect("gated store should initialise");
    let service = FeedbackService::new(&Config::default(), Some(store), None);

    let search = service.find_similar_corrections("vasospasm", 3);
    let track = async {
        let tracked = tokio::time::timeout(
            Duration::from_secs(5),
            service.track_correction(location(CONTEXTS[0])),
        )
        .await;
        gate.notify_one();
        tracked
    };
    let (results, tracked) = tokio::join!(search, track);

    let outcome = tracked
        .expect("tracking should not wait for the search")
        .expect("tracking should succeed");
    assert_eq!(outcome.learning, LearningOutcome::OneOff);
    assert!(results.iter().all(|r| r.method == SearchMethod::Semantic));
}

#[tokio::test]
async fn search_query_is_scrubbed() {
    let service = offline_service();
    service
        .track_correction(Correction::new("diagnosis", "SAH", "aSAH", "MRN: 12345678 aSAH"))
        .await
        .expect("tracking should succeed");
    let results = service
        .find_similar_corrections("MRN: 12345678 aSAH", 1)
        .await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].record.source_context.as_str().contains("12345678"));
}

#[tokio::test]
async fn pattern_feedback_requires_known_pattern() {
    let service = ready_service().await;
    let err = service
        .pattern_feedback("nope", true)
        .await
        .expect_err("unknown pattern");
    assert!(matches!(err, FeedbackError::PatternNotFound(_)));
}

#[tokio::test]
async fn accuracy_and_metrics() {
    let service = ready_service().await;
    assert_eq!(
        service
            .record_applications("pathology.location", 10)
            .await
            .expect("should record"),
        10
    );
    track_all(&service).await;

    assert!((service.overall_accuracy().await - 0.7).abs() < 1e-9);
    let field = service.field_accuracy("pathology.location").await;
    assert_eq!(field.corrections, 3);

    let snapshot = service.compute_metrics().await;
    assert!((snapshot.accuracy - 0.7).abs() < 1e-9);
    let trend = service.accuracy_trend(None).await;
    assert_eq!(trend.window_days, 30);
    assert_eq!(trend.samples, 1);
    assert_eq!(
        service.learning_effectiveness().await.effectiveness,
        crate::metrics::Effectiveness::InsufficientData
    );

    let analysis = service.analyze_corrections().await;
    assert_eq!(analysis.total, 3);
}

#[tokio::test]
async fn snapshot_without_sections_is_rejected() {
    let service = ready_service().await;
    service
        .record_applications("diagnosis", 4)
        .await
        .expect("should record");
    service
        .track_correction(Correction::new("diagnosis", "SAH", "aSAH", ""))
        .await
        .expect("tracking should succeed");
    let before = service.overall_accuracy().await;

    let empty = Snapshot {
        version: SNAPSHOT_VERSION,
        exported_at: Utc::now(),
        learning: None,
        corrections: None,
        vector_collections: Some(BTreeMap::new()),
    };
    let err = service
        .import_snapshot(empty)
        .await
        .expect_err("no learning or corrections");
    assert!(matches!(err, FeedbackError::Import(_)));
    assert!((service.overall_accuracy().await - before).abs() < f64::EPSILON);
}

#[tokio::test]
async fn learning_only_snapshot_leaves_accuracy_unchanged() {
    let source = ready_service().await;
    track_all(&source).await;
    let mut snapshot = source.export_snapshot().await.expect("should export");
    snapshot.corrections = None;

    let target = ready_service().await;
    target
        .record_applications("pathology.location", 5)
        .await
        .expect("should record");
    target
        .track_correction(location(CONTEXTS[0]))
        .await
        .expect("tracking should succeed");
    let before = target.overall_accuracy().await;

    let report = target.import_snapshot(snapshot).await.expect("should import");
    assert_eq!(report.corrections, 0);
    assert_eq!(report.patterns, 1);
    assert!((target.overall_accuracy().await - before).abs() < f64::EPSILON);
    assert_eq!(target.all_patterns().await.len(), 1);
}

#[tokio::test]
async fn export_import_round_trip() {
    let source = ready_service().await;
    source
        .record_applications("pathology.location", 8)
        .await
        .expect("should record");
    track_all(&source).await;
    let snapshot = source.export_snapshot().await.expect("should export");
    let json = serde_json::to_string(&snapshot).expect("should serialize");
    let parsed: Snapshot = serde_json::from_str(&json).expect("should parse");

    let target = ready_service().await;
    let report = target.import_snapshot(parsed).await.expect("should import");
    assert_eq!(report.corrections, 3);
    assert_eq!(report.patterns, 1);
    assert_eq!(report.vectors_imported, 4);
    assert_eq!(report.vectors_failed, 0);
    assert!((target.overall_accuracy().await - source.overall_accuracy().await).abs() < 1e-9);

    let again = target.export_snapshot().await.expect("should export");
    let repeat = target.import_snapshot(again).await.expect("should import");
    assert_eq!(repeat.corrections, 0);
    assert_eq!(repeat.patterns, 0);
}

#[tokio::test]
async fn state_survives_restart() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let path = temp_dir.path().join("feedback.db");

    let pattern_id = {
        let database = Database::new(&path).await.expect("should open database");
        let service = FeedbackService::new(&Config::default(), None, Some(database));
        service
            .record_applications("pathology.location", 12)
            .await
            .expect("should record");
        track_all(&service).await;
        let pattern = service
            .enabled_patterns("pathology.location", None)
            .await
            .pop()
            .expect("pattern should be minted");
        service
            .pattern_feedback(&pattern.id, true)
            .await
            .expect("should apply feedback");
        service.compute_metrics().await;
        pattern.id
    };

    let database = Database::new(&path).await.expect("should reopen database");
    let service = FeedbackService::new(&Config::default(), None, Some(database));
    service.load_state().await.expect("should load state");

    assert_eq!(service.field_accuracy("pathology.location").await.applications, 12);
    assert_eq!(service.analyze_corrections().await.total, 3);
    let patterns = service.all_patterns().await;
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].id, pattern_id);
    assert_eq!(patterns[0].success_count, 1);
    assert_eq!(service.accuracy_trend(None).await.samples, 1);
}

#[tokio::test]
async fn failed_persistence_leaves_memory_untouched() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let database = Database::new(temp_dir.path().join("feedback.db"))
        .await
        .expect("should open database");
    let service = FeedbackService::new(&Config::default(), None, Some(database.clone()));
    for context in &CONTEXTS[..2] {
        service
            .track_correction(location(context))
            .await
            .expect("tracking should succeed");
    }

    database.pool().close().await;
    service
        .track_correction(location(CONTEXTS[2]))
        .await
        .expect_err("closed database should fail tracking");

    assert_eq!(service.analyze_corrections().await.total, 2);
    assert!(service.all_patterns().await.is_empty());
}

#[tokio::test]
async fn clear_all_resets_everything() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let database = Database::new(temp_dir.path().join("feedback.db"))
        .await
        .expect("should open database");
    let store = hashing_store();
    store.initialize().await.expect("should initialise");
    let service = FeedbackService::new(&Config::default(), Some(store), Some(database));
    track_all(&service).await;

    service.clear_all().await.expect("should clear");

    assert!(service.all_patterns().await.is_empty());
    assert_eq!(service.analyze_corrections().await.total, 0);
    let database = service.database().expect("database configured");
    assert_eq!(database.count_corrections().await.expect("should count"), 0);
    let stats = service.store().expect("store configured").get_statistics().await;
    assert_eq!(stats.collections.values().sum::<usize>(), 0);
}
