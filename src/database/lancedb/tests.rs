use super::*;
use tempfile::TempDir;

fn document(id: &str, collection: Collection, dimension: usize) -> VectorDocument {
    VectorDocument {
        id: id.to_string(),
        collection,
        text: Redacted::from_trusted(format!("[PATIENT_1] note {id}")),
        embedding: (0..dimension).map(|i| i as f32 / dimension as f32).collect(),
        metadata: BTreeMap::from([("field".to_string(), "diagnosis".to_string())]),
        timestamp: DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .expect("valid timestamp")
            .with_timezone(&Utc),
    }
}

#[tokio::test]
async fn empty_database_has_no_dimension() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let backend = LanceBackend::open(&temp_dir.path().join("vectors"), 5)
        .await
        .expect("should open");

    assert_eq!(backend.stored_dimension().await.expect("should read"), None);
    assert!(backend.load(Collection::Notes).await.expect("should load").is_empty());
    assert!(!backend.delete(Collection::Notes, "x").await.expect("should delete"));
}

#[tokio::test]
async fn documents_survive_reopen() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let path = temp_dir.path().join("vectors");

    {
        let backend = LanceBackend::open(&path, 5).await.expect("should open");
        backend
            .insert(&document("a", Collection::Notes, 5))
            .await
            .expect("should insert");
        backend
            .insert(&document("b", Collection::Patterns, 5))
            .await
            .expect("should insert");
    }

    let backend = LanceBackend::open(&path, 5).await.expect("should reopen");
    assert_eq!(backend.stored_dimension().await.expect("should read"), Some(5));

    let notes = backend.load(Collection::Notes).await.expect("should load");
    assert_eq!(notes.len(), 1);
    let note = &notes[0];
    assert_eq!(note.id, "a");
    assert_eq!(note.collection, Collection::Notes);
    assert_eq!(note.text.as_str(), "[PATIENT_1] note a");
    assert_eq!(note.embedding.len(), 5);
    assert_eq!(note.metadata["field"], "diagnosis");
    assert_eq!(note.timestamp, document("a", Collection::Notes, 5).timestamp);
}

#[tokio::test]
async fn insert_replaces_and_delete_removes() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let backend = LanceBackend::open(temp_dir.path(), 5)
        .await
        .expect("should open");

    let mut doc = document("a", Collection::Entities, 5);
    backend.insert(&doc).await.expect("should insert");
    doc.text = Redacted::from_trusted("updated");
    backend.insert(&doc).await.expect("should insert");

    let loaded = backend.load(Collection::Entities).await.expect("should load");
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].text.as_str(), "updated");

    assert!(backend.delete(Collection::Entities, "a").await.expect("should delete"));
    assert!(backend.load(Collection::Entities).await.expect("should load").is_empty());
}

#[tokio::test]
async fn clear_drops_only_one_collection() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let backend = LanceBackend::open(temp_dir.path(), 5)
        .await
        .expect("should open");

    backend
        .insert(&document("a", Collection::Notes, 5))
        .await
        .expect("should insert");
    backend
        .insert(&document("b", Collection::Summaries, 5))
        .await
        .expect("should insert");

    backend.clear(Collection::Notes).await.expect("should clear");
    assert!(backend.load(Collection::Notes).await.expect("should load").is_empty());
    assert_eq!(backend.load(Collection::Summaries).await.expect("should load").len(), 1);
}

#[tokio::test]
async fn wrong_dimension_is_rejected() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let backend = LanceBackend::open(temp_dir.path(), 5)
        .await
        .expect("should open");

    let err = backend
        .insert(&document("a", Collection::Notes, 3))
        .await
        .expect_err("dimension differs");
    assert!(matches!(
        err,
        FeedbackError::DimensionMismatch {
            expected: 5,
            actual: 3
        }
    ));
}

#[test]
fn id_predicate_escapes_quotes() {
    assert_eq!(id_predicate("o'brien"), "id = 'o''brien'");
}
