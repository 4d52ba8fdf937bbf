#![expect(
    clippy::tests_outside_test_module,
    reason = "integration tests are only compiled in test mode"
)]

// Embedding store persisted through LanceDB

use std::sync::Arc;

use clinical_feedback::FeedbackError;
use clinical_feedback::anonymizer::{AnonymizeOptions, Anonymizer};
use clinical_feedback::database::LanceBackend;
use clinical_feedback::embeddings::HashingModel;
use clinical_feedback::store::{
    ClusterOptions, Collection, EmbeddingStore, EvictionPolicy, NewDocument, SearchOptions,
    StoreConfig,
};
use tempfile::TempDir;

async fn lance_store(temp_dir: &TempDir, dimension: usize, config: StoreConfig) -> EmbeddingStore {
    let backend = LanceBackend::open(&temp_dir.path().join("vectors"), dimension)
        .await
        .expect("should open vector database");
    EmbeddingStore::new(
        Arc::new(HashingModel::new(dimension)),
        Arc::new(backend),
        config,
    )
}

fn document(anonymizer: &mut Anonymizer, id: &str, text: &str) -> NewDocument {
    let mut document = NewDocument::new(anonymizer.scrub(text, &AnonymizeOptions::default()))
        .with_metadata("field", "diagnosis");
    document.id = Some(id.to_string());
    document
}

#[tokio::test]
async fn documents_reload_after_restart() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut anonymizer = Anonymizer::new();

    {
        let store = lance_store(&temp_dir, 64, StoreConfig::default()).await;
        store.initialize().await.expect("should initialise");
        for (id, text) in [
            ("a", "aneurysmal subarachnoid haemorrhage, Fisher grade 3"),
            ("b", "subarachnoid haemorrhage with hydrocephalus, EVD inserted"),
            ("c", "lumbar disc prolapse, L4/5 microdiscectomy"),
        ] {
            store
                .store_document(Collection::Notes, document(&mut anonymizer, id, text))
                .await
                .expect("should store");
        }
    }

    let store = lance_store(&temp_dir, 64, StoreConfig::default()).await;
    store.initialize().await.expect("should initialise");

    let stats = store.get_statistics().await;
    assert!(stats.ready);
    assert_eq!(stats.collections[&Collection::Notes], 3);

    let results = store
        .semantic_search(
            Collection::Notes,
            "subarachnoid haemorrhage",
            &SearchOptions::default().top_k(2),
        )
        .await
        .expect("should search");
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|result| result.document.id != "c"));

    let filtered = store
        .semantic_search(
            Collection::Notes,
            "subarachnoid haemorrhage",
            &SearchOptions::default().filter("field", "procedure"),
        )
        .await
        .expect("should search");
    assert!(filtered.is_empty());
}

#[tokio::test]
async fn changed_model_dimension_is_refused() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut anonymizer = Anonymizer::new();

    {
        let store = lance_store(&temp_dir, 64, StoreConfig::default()).await;
        store
            .store_document(Collection::Notes, document(&mut anonymizer, "a", "SAH"))
            .await
            .expect("should store");
    }

    let store = lance_store(&temp_dir, 32, StoreConfig::default()).await;
    let err = store.initialize().await.expect_err("dimension changed");
    assert!(matches!(err, FeedbackError::StoreNotReady(_)));
    assert!(err.to_string().contains("dimension"));
    assert!(!store.is_ready());
}

#[tokio::test]
async fn eviction_is_persisted() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = StoreConfig {
        max_collection_size: 2,
        eviction: EvictionPolicy::EvictOldest,
        ..StoreConfig::default()
    };
    let mut anonymizer = Anonymizer::new();

    {
        let store = lance_store(&temp_dir, 64, config.clone()).await;
        for (offset, id) in ["first", "second", "third"].into_iter().enumerate() {
            let mut doc = document(&mut anonymizer, id, "vasospasm on day 6");
            doc.timestamp = Some(
                chrono::Utc::now() - chrono::Duration::hours(10 - offset as i64),
            );
            store
                .store_document(Collection::Summaries, doc)
                .await
                .expect("should store");
        }
    }

    let store = lance_store(&temp_dir, 64, config).await;
    let ids: Vec<String> = store
        .export_collection(Collection::Summaries)
        .await
        .expect("should export")
        .into_iter()
        .map(|document| document.id)
        .collect();
    assert_eq!(ids, vec!["second".to_string(), "third".to_string()]);
}

#[tokio::test]
async fn clusters_group_persisted_documents() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut anonymizer = Anonymizer::new();
    let store = lance_store(&temp_dir, 128, StoreConfig::default()).await;

    for (id, text) in [
        ("sah-1", "left MCA aneurysm coiled"),
        ("sah-2", "left MCA aneurysm coiled"),
        ("spine", "cervical myelopathy, C5/6 ACDF"),
    ] {
        store
            .store_document(Collection::Entities, document(&mut anonymizer, id, text))
            .await
            .expect("should store");
    }

    let clusters = store
        .cluster_documents(Collection::Entities, ClusterOptions::default())
        .await
        .expect("should cluster");
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].size(), 2);
    assert!(clusters[0].document_ids.iter().all(|id| id.starts_with("sah")));
}
