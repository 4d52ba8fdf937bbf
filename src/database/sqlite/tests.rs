use super::*;
use anyhow::Result;
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use tempfile::TempDir;

use crate::anonymizer::Anonymizer;
use crate::feedback::{Correction, CorrectionTracker, FieldValue, MatchRule};
use crate::metrics::FieldResult;

async fn create_test_database() -> Result<(TempDir, Database)> {
    let temp_dir = TempDir::new()?;
    let database = Database::new(temp_dir.path().join("feedback.db")).await?;
    Ok((temp_dir, database))
}

fn tracked(corrections: Vec<Correction>) -> Vec<CorrectionRecord> {
    let mut tracker = CorrectionTracker::new(Anonymizer::new());
    for correction in corrections {
        tracker.track(correction);
    }
    tracker.all_records().to_vec()
}

fn pattern(id: &str) -> Pattern {
    Pattern {
        id: id.to_string(),
        field_path: "pathology.location".to_string(),
        pathology: Some("SAH".to_string()),
        signature: "left side => left MCA".to_string(),
        rule: MatchRule::ContextRegex {
            pattern: r"(?i)(?=[\s\S]*\bmca\b)".to_string(),
            value: "left MCA".to_string(),
        },
        learned_value: FieldValue::from("left MCA"),
        confidence: 0.5,
        success_count: 0,
        application_count: 0,
        enabled: true,
        origin_correction_ids: vec!["c1".to_string()],
        created_at: Utc::now(),
        last_applied_at: None,
    }
}

#[tokio::test]
async fn integration_schema_migration() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%'",
    )
    .fetch_all(database.pool())
    .await?;

    let expected_tables: HashSet<&'static str> = [
        "corrections",
        "patterns",
        "field_applications",
        "metrics_snapshots",
    ]
    .into_iter()
    .collect();

    let actual_tables: HashSet<&str> = tables.iter().map(|t| t.as_str()).collect();
    assert_eq!(actual_tables, expected_tables);

    let indexes: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'",
    )
    .fetch_all(database.pool())
    .await?;
    assert!(indexes.iter().any(|i| i == "idx_corrections_field_path"));
    assert!(indexes.iter().any(|i| i == "idx_patterns_pathology"));

    Ok(())
}

#[tokio::test]
async fn corrections_are_insert_only() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    let now = Utc::now();
    let records = tracked(vec![
        Correction::new("diagnosis", "SAH", "aSAH", "MRN: 12345678, SAH").at(now),
        Correction::new("grade", "2", "3", "WFNS 3").at(now - Duration::hours(1)),
    ]);

    for record in &records {
        assert!(database.insert_correction(record).await?);
    }
    let mut changed = records[0].clone();
    changed.after = FieldValue::from("something else");
    assert!(!database.insert_correction(&changed).await?);

    let stored = database.list_corrections().await?;
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].field_path, "grade");
    assert_eq!(stored[1].after, FieldValue::from("aSAH"));
    assert!(!stored[1].source_context.as_str().contains("12345678"));

    assert_eq!(database.corrections_for_field("diagnosis").await?.len(), 1);
    assert_eq!(database.count_corrections().await?, 2);
    Ok(())
}

#[tokio::test]
async fn patterns_are_upserted() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let mut saved = pattern("p1");
    database.save_pattern(&saved).await?;
    saved.application_count = 10;
    saved.success_count = 3;
    saved.enabled = false;
    saved.last_applied_at = Some(Utc::now());
    database.save_pattern(&saved).await?;
    database.save_pattern(&pattern("p2")).await?;

    let loaded = database.get_pattern("p1").await?.expect("pattern should exist");
    assert_eq!(loaded.application_count, 10);
    assert_eq!(loaded.success_count, 3);
    assert!(!loaded.enabled);
    assert_eq!(loaded.rule, saved.rule);
    assert!(loaded.last_applied_at.is_some());

    assert_eq!(database.list_patterns().await?.len(), 2);
    assert!(database.get_pattern("missing").await?.is_none());

    let enabled =
        queries::PatternQueries::list_enabled_for_field(database.pool(), "pathology.location")
            .await?;
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].id, "p2");
    Ok(())
}

#[tokio::test]
async fn application_totals_are_replaced() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    database.set_applications("diagnosis", 4).await?;
    database.set_applications("diagnosis", 9).await?;
    database.set_applications("grade", 1).await?;

    let totals = database.applications().await?;
    assert_eq!(totals.len(), 2);
    assert_eq!(totals["diagnosis"], 9);
    Ok(())
}

#[tokio::test]
async fn metrics_history_round_trip() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    let earlier = MetricsSnapshot {
        accuracy: 0.5,
        precision: 0.25,
        recall: 0.75,
        f1: 0.375,
        per_field: BTreeMap::from([(
            "diagnosis".to_string(),
            FieldResult {
                true_positives: 1,
                ..FieldResult::default()
            },
        )]),
        timestamp: Utc::now() - Duration::days(2),
    };
    let later = MetricsSnapshot {
        accuracy: 0.75,
        per_field: BTreeMap::new(),
        timestamp: Utc::now(),
        ..earlier.clone()
    };

    database.insert_metrics(&later).await?;
    database.insert_metrics(&earlier).await?;

    let history = database.list_metrics().await?;
    assert_eq!(history.len(), 2);
    assert!((history[0].accuracy - 0.5).abs() < f64::EPSILON);
    assert!((history[0].precision - 0.25).abs() < f64::EPSILON);
    assert_eq!(history[0].per_field["diagnosis"].true_positives, 1);
    assert!((history[1].accuracy - 0.75).abs() < f64::EPSILON);
    Ok(())
}

#[tokio::test]
async fn clear_all_empties_every_table() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    for record in tracked(vec![Correction::new("a", "x", "y", "")]) {
        database.insert_correction(&record).await?;
    }
    database.save_pattern(&pattern("p1")).await?;
    database.set_applications("a", 3).await?;

    database.clear_all().await?;

    assert_eq!(database.count_corrections().await?, 0);
    assert!(database.list_patterns().await?.is_empty());
    assert!(database.applications().await?.is_empty());
    assert!(database.list_metrics().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn corrupt_rows_are_skipped() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    database.save_pattern(&pattern("good")).await?;
    let mut broken = models::PatternRow::from_pattern(&pattern("bad"))?;
    broken.rule = "not json".to_string();
    queries::PatternQueries::upsert(database.pool(), &broken).await?;

    let patterns = database.list_patterns().await?;
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].id, "good");
    assert!(database.get_pattern("bad").await.is_err());
    Ok(())
}

#[tokio::test]
async fn optimize_after_clear_keeps_database_usable() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    for record in tracked(vec![Correction::new("a", "x", "y", "")]) {
        database.insert_correction(&record).await?;
    }
    database.clear_all().await?;
    database.optimize().await?;

    for record in tracked(vec![Correction::new("b", "x", "z", "")]) {
        assert!(database.insert_correction(&record).await?);
    }
    assert_eq!(database.count_corrections().await?, 1);
    Ok(())
}
