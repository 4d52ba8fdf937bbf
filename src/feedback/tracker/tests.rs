use std::collections::HashMap;

use chrono::{Duration, TimeZone};

use super::*;
use crate::analysis::TransformationType;
use crate::anonymizer::Redacted;

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0)
        .single()
        .expect("valid date")
        + Duration::days(n)
}

fn tracker() -> CorrectionTracker {
    CorrectionTracker::new(Anonymizer::new())
}

#[test]
fn track_scrubs_context_and_analyses() {
    let mut tracker = tracker();
    let record = tracker
        .track(Correction::new(
            "pathology.location",
            "left side",
            "left MCA",
            "Reviewed Mr Jones, MRN: 12345678. CT shows left MCA aneurysm.",
        ))
        .clone();

    assert!(!record.source_context.as_str().contains("12345678"));
    assert!(!record.source_context.as_str().contains("Jones"));
    assert!(record.source_context.as_str().contains("MCA aneurysm"));
    assert_eq!(record.features.added_tokens, vec!["mca".to_string()]);
    assert_eq!(record.features.removed_tokens, vec!["side".to_string()]);
    assert!(record.diff.has_changes());
    assert_eq!(tracker.all_records().len(), 1);
}

#[test]
fn date_reformat_is_classified_from_raw_values() {
    let mut tracker = tracker();
    let record = tracker
        .track(Correction::new(
            "procedure.date",
            "12/03/2024",
            "2024-03-12",
            "Coiling performed 12/03/2024.",
        ))
        .clone();

    assert_eq!(record.redacted_before, record.redacted_after);
    assert!(!record.redacted_after.as_text().contains("2024"));
    assert_eq!(record.features.transformation, TransformationType::DateFormatting);
    assert!(record.diff.has_changes());
    assert!(!record.source_context.as_str().contains("12/03/2024"));
}

#[test]
fn prepare_does_not_append() {
    let mut tracker = tracker();
    let record = tracker.prepare(Correction::new("diagnosis", "SAH", "aneurysmal SAH", ""));
    assert!(tracker.all_records().is_empty());

    let id = record.id.clone();
    tracker.append(record);
    assert_eq!(tracker.all_records().len(), 1);
    assert!(tracker.get(&id).is_some());
}

#[test]
fn accuracy_without_data_is_perfect() {
    let tracker = tracker();
    assert!((tracker.overall_accuracy() - 1.0).abs() < f64::EPSILON);
    let field = tracker.field_accuracy("diagnosis");
    assert!((field.accuracy - 1.0).abs() < f64::EPSILON);
    assert_eq!(field.trend, Trend::InsufficientData);
}

#[test]
fn accuracy_uses_reported_applications() {
    let mut tracker = tracker();
    tracker.record_applications("diagnosis", 6);
    assert_eq!(tracker.record_applications("diagnosis", 4), 10);
    tracker.track(Correction::new("diagnosis", "SAH", "aSAH", ""));
    tracker.track(Correction::new("diagnosis", "SAH", "aSAH", ""));

    let field = tracker.field_accuracy("diagnosis");
    assert!((field.accuracy - 0.8).abs() < 1e-9);
    assert_eq!(field.corrections, 2);
    assert_eq!(field.applications, 10);
    assert!((tracker.overall_accuracy() - 0.8).abs() < 1e-9);
}

#[test]
fn corrections_without_applications_score_zero() {
    let mut tracker = tracker();
    tracker.track(Correction::new("grade", "2", "3", ""));
    assert!(tracker.field_accuracy("grade").accuracy.abs() < f64::EPSILON);
}

#[test]
fn field_trend_compares_halves_of_time_span() {
    let mut tracker = tracker();
    for offset in [0, 1, 2, 100] {
        tracker.track(Correction::new("improving", "a", "b", "").at(day(offset)));
    }
    for offset in [0, 98, 99, 100] {
        tracker.track(Correction::new("declining", "a", "b", "").at(day(offset)));
    }
    for offset in [0, 1, 99, 100] {
        tracker.track(Correction::new("stable", "a", "b", "").at(day(offset)));
    }
    for offset in [0, 1, 2] {
        tracker.track(Correction::new("sparse", "a", "b", "").at(day(offset)));
    }

    assert_eq!(tracker.field_accuracy("improving").trend, Trend::Improving);
    assert_eq!(tracker.field_accuracy("declining").trend, Trend::Declining);
    assert_eq!(tracker.field_accuracy("stable").trend, Trend::Stable);
    assert_eq!(tracker.field_accuracy("sparse").trend, Trend::InsufficientData);
}

#[test]
fn analysis_flags_dominant_field_and_transformation() {
    let mut tracker = tracker();
    for _ in 0..4 {
        tracker.track(Correction::new("pathology.type", "sah", "SAH", ""));
    }
    tracker.track(Correction::new("grade", "sah", "SAH", ""));

    let analysis = tracker.analyze_corrections();
    assert_eq!(analysis.total, 5);
    assert_eq!(analysis.by_field["pathology.type"], 4);
    assert_eq!(analysis.by_transformation[TransformationType::CaseChange.as_str()], 5);

    let field = analysis
        .recommendations
        .iter()
        .find(|r| r.subject == RecommendationSubject::Field)
        .expect("dominant field should be flagged");
    assert_eq!(field.key, "pathology.type");
    assert_eq!(field.priority, Priority::High);
    assert!(
        analysis
            .recommendations
            .iter()
            .all(|r| r.key != "grade")
    );
    assert!(
        analysis
            .recommendations
            .iter()
            .any(|r| r.subject == RecommendationSubject::Transformation)
    );
}

#[test]
fn analysis_needs_enough_corrections() {
    let mut tracker = tracker();
    for _ in 0..4 {
        tracker.track(Correction::new("grade", "2", "3", ""));
    }
    assert!(tracker.analyze_corrections().recommendations.is_empty());
}

#[test]
fn medium_priority_between_thresholds() {
    let mut tracker = tracker();
    tracker.track(Correction::new("a", "x", "y", ""));
    tracker.track(Correction::new("a", "x", "y", ""));
    tracker.track(Correction::new("b", "x", "y", ""));
    tracker.track(Correction::new("c", "x", "y", ""));
    tracker.track(Correction::new("d", "x", "y", ""));

    let analysis = tracker.analyze_corrections();
    let field = analysis
        .recommendations
        .iter()
        .find(|r| r.subject == RecommendationSubject::Field)
        .expect("field a should be flagged");
    assert_eq!(field.key, "a");
    assert_eq!(field.priority, Priority::Medium);
}

#[test]
fn import_skips_known_ids_and_rescrubs() {
    let mut source = tracker();
    source.track(Correction::new("diagnosis", "SAH", "aSAH", "benign context").at(day(1)));
    let mut exported: Vec<CorrectionRecord> = source.all_records().to_vec();
    exported[0].source_context = Redacted::from_trusted("Call 07700 900123 re MRN: 12345678");

    let mut target = tracker();
    target.record_applications("diagnosis", 3);
    let added = target.import_records(
        exported.clone(),
        &HashMap::from([("diagnosis".to_string(), 7u64)]),
    );
    assert_eq!(added.len(), 1);
    assert!(!added[0].source_context.as_str().contains("12345678"));
    assert_eq!(target.applications()["diagnosis"], 7);

    let again = target.import_records(exported, &HashMap::new());
    assert!(again.is_empty());
    assert_eq!(target.all_records().len(), 1);
}

#[test]
fn restore_orders_chronologically() {
    let mut source = tracker();
    source.track(Correction::new("a", "x", "y", "").at(day(5)));
    source.track(Correction::new("a", "x", "z", "").at(day(1)));

    let mut restored = tracker();
    restored.restore(source.all_records().to_vec(), HashMap::new());
    assert_eq!(restored.all_records()[0].created_at, day(1));
    assert_eq!(restored.corrections_for("a"), 2);
}

#[test]
fn clear_forgets_everything() {
    let mut tracker = tracker();
    tracker.record_applications("a", 2);
    tracker.track(Correction::new("a", "x", "y", "Mr Jones"));
    tracker.clear();
    assert!(tracker.all_records().is_empty());
    assert!(tracker.applications().is_empty());
    assert_eq!(tracker.anonymizer_mut().cached_values(), 0);
}

#[test]
fn record_text_includes_signature() {
    let mut tracker = tracker();
    let record = tracker
        .track(Correction::new("a", "x", "y", "context here").with_pathology("SAH"))
        .clone();
    let text = record_text(&record);
    assert!(text.contains("x => y"));
    assert!(text.contains("context here"));
    assert!(text.ends_with("SAH"));
}
