use chrono::Duration;

use super::*;
use crate::anonymizer::Anonymizer;
use crate::feedback::{Correction, CorrectionTracker};

const CONTEXTS: [&str; 4] = [
    "CT head shows diffuse SAH. Angiogram: left MCA aneurysm, 7mm.",
    "Known left MCA aneurysm with SAH on admission.",
    "Repeat imaging confirms the left MCA aneurysm.",
    "Coiling planned for left MCA aneurysm.",
];

struct Harness {
    tracker: CorrectionTracker,
    engine: LearningEngine,
}

impl Harness {
    fn new() -> Self {
        Self {
            tracker: CorrectionTracker::new(Anonymizer::new()),
            engine: LearningEngine::new(LearningConfig::default(), SimilarityConfig::default()),
        }
    }

    fn learn(&mut self, correction: Correction) -> LearningOutcome {
        let record = self.tracker.track(correction).clone();
        let history: Vec<&CorrectionRecord> = self.tracker.records_for(&record.field_path).collect();
        self.engine.learn_from_correction(&record, &history)
    }

    fn location(&mut self, context: &str) -> LearningOutcome {
        self.learn(
            Correction::new("pathology.location", "left side", "left MCA", context)
                .with_pathology("SAH"),
        )
    }
}

fn pattern(id: &str, rule: MatchRule) -> Pattern {
    Pattern {
        id: id.to_string(),
        field_path: "pathology.location".to_string(),
        pathology: Some("SAH".to_string()),
        signature: "left side => left MCA".to_string(),
        rule,
        learned_value: FieldValue::from("left MCA"),
        confidence: 0.5,
        success_count: 0,
        application_count: 0,
        enabled: true,
        origin_correction_ids: Vec::new(),
        created_at: Utc::now(),
        last_applied_at: None,
    }
}

fn mca_rule() -> MatchRule {
    MatchRule::ContextRegex {
        pattern: r"(?i)(?=[\s\S]*\bmca\b)".to_string(),
        value: "left MCA".to_string(),
    }
}

#[test]
fn three_similar_corrections_mint_one_pattern() {
    let mut harness = Harness::new();
    assert_eq!(harness.location(CONTEXTS[0]), LearningOutcome::OneOff);
    assert_eq!(harness.location(CONTEXTS[1]), LearningOutcome::OneOff);
    assert!(harness.engine.patterns().is_empty());

    let outcome = harness.location(CONTEXTS[2]);
    assert!(matches!(outcome, LearningOutcome::Minted { .. }));

    let patterns = harness.engine.patterns();
    assert_eq!(patterns.len(), 1);
    let minted = &patterns[0];
    assert!(minted.enabled);
    assert_eq!(minted.origin_correction_ids.len(), 3);
    assert_eq!(minted.pathology.as_deref(), Some("SAH"));
    assert!(minted.confidence > 0.0 && minted.confidence < 1.0);
    assert!((minted.success_rate()).abs() < f64::EPSILON);
}

#[test]
fn learned_rule_anchors_on_introduced_term() {
    let mut harness = Harness::new();
    for context in &CONTEXTS[..3] {
        harness.location(context);
    }

    let enabled = harness.engine.enabled_patterns("pathology.location", Some("SAH"));
    assert_eq!(enabled.len(), 1);
    let rule = &enabled[0].rule;
    assert!(matches!(rule, MatchRule::ContextRegex { .. }));
    assert!(rule.evaluate("angiogram shows an MCA bifurcation aneurysm", "").expect("valid rule"));
    assert!(!rule.evaluate("right PCOM aneurysm", "").expect("valid rule"));
}

#[test]
fn further_similar_correction_reinforces() {
    let mut harness = Harness::new();
    for context in &CONTEXTS[..3] {
        harness.location(context);
    }
    let before = harness.engine.patterns()[0].confidence;

    let outcome = harness.location(CONTEXTS[3]);
    assert!(matches!(outcome, LearningOutcome::Reinforced { .. }));
    assert_eq!(harness.engine.patterns().len(), 1);
    let pattern = &harness.engine.patterns()[0];
    assert_eq!(pattern.origin_correction_ids.len(), 4);
    assert!(pattern.confidence > before);
}

#[test]
fn mixed_pathology_pattern_is_reinforced_not_duplicated() {
    let mut harness = Harness::new();
    let pathologies = ["SAH", "TBI", "SAH", "SAH", "SAH", "SAH"];
    let outcomes: Vec<LearningOutcome> = pathologies
        .iter()
        .enumerate()
        .map(|(i, pathology)| {
            harness.learn(
                Correction::new("pathology.location", "left side", "left MCA", CONTEXTS[i % 4])
                    .with_pathology(*pathology),
            )
        })
        .collect();

    assert_eq!(outcomes[0], LearningOutcome::OneOff);
    assert_eq!(outcomes[1], LearningOutcome::OneOff);
    assert!(matches!(outcomes[2], LearningOutcome::Minted { .. }));
    assert!(
        outcomes[3..]
            .iter()
            .all(|outcome| matches!(outcome, LearningOutcome::Reinforced { .. }))
    );

    let patterns = harness.engine.patterns();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].pathology, None);
    assert_eq!(patterns[0].origin_correction_ids.len(), 6);
}

#[test]
fn pathology_specific_pattern_ignores_other_pathologies() {
    let mut harness = Harness::new();
    for context in &CONTEXTS[..3] {
        harness.location(context);
    }

    let outcome = harness.learn(
        Correction::new("pathology.location", "left side", "left MCA", CONTEXTS[3])
            .with_pathology("sah"),
    );
    assert!(matches!(outcome, LearningOutcome::Reinforced { .. }));

    let outcome = harness.learn(
        Correction::new("pathology.location", "left side", "left MCA", CONTEXTS[3])
            .with_pathology("TBI"),
    );
    assert!(!matches!(outcome, LearningOutcome::Reinforced { .. }));
    let sah = harness
        .engine
        .patterns()
        .iter()
        .find(|pattern| pattern.pathology.as_deref() == Some("SAH"))
        .expect("should keep the SAH pattern");
    assert_eq!(sah.origin_correction_ids.len(), 4);
}

#[test]
fn date_reformat_is_one_off_for_learning() {
    let mut harness = Harness::new();
    for _ in 0..3 {
        assert_eq!(
            harness.learn(Correction::new("procedure.date", "12/03/2024", "2024-03-12", "")),
            LearningOutcome::OneOff
        );
    }
    assert!(harness.engine.patterns().is_empty());
}

#[test]
fn dissimilar_corrections_do_not_support_each_other() {
    let mut harness = Harness::new();
    harness.learn(Correction::new("pathology.location", "left side", "left MCA", CONTEXTS[0]));
    harness.learn(Correction::new("pathology.location", "frontal", "right ICA terminus", CONTEXTS[1]));
    let outcome = harness.learn(Correction::new(
        "pathology.location",
        "posterior",
        "basilar tip",
        CONTEXTS[2],
    ));
    assert_eq!(outcome, LearningOutcome::OneOff);
    assert!(harness.engine.patterns().is_empty());
}

#[test]
fn other_fields_do_not_count_as_support() {
    let mut harness = Harness::new();
    harness.learn(Correction::new("a", "left side", "left MCA", CONTEXTS[0]));
    harness.learn(Correction::new("b", "left side", "left MCA", CONTEXTS[1]));
    let outcome = harness.learn(Correction::new("c", "left side", "left MCA", CONTEXTS[2]));
    assert_eq!(outcome, LearningOutcome::OneOff);
}

#[test]
fn unchanged_value_is_one_off() {
    let mut harness = Harness::new();
    for _ in 0..3 {
        assert_eq!(
            harness.learn(Correction::new("grade", "3", "3", "WFNS 3")),
            LearningOutcome::OneOff
        );
    }
}

#[test]
fn substitution_rule_without_shared_anchor() {
    let mut harness = Harness::new();
    for context in ["", "no mention", "unrelated text"] {
        harness.learn(Correction::new("grade", "wfns 2", "WFNS II", context));
    }
    let pattern = &harness.engine.patterns()[0];
    assert_eq!(
        pattern.rule,
        MatchRule::ValueSubstitution {
            from: "wfns 2".to_string(),
            to: "WFNS II".to_string()
        }
    );
    assert!(pattern.rule.evaluate("", " WFNS 2 ").expect("substitution never fails"));
    assert!(!pattern.rule.evaluate("", "WFNS 3").expect("substitution never fails"));
}

#[test]
fn feedback_on_unknown_pattern_fails() {
    let mut engine = LearningEngine::default();
    let err = engine.apply_feedback("missing", true).expect_err("no such pattern");
    assert!(matches!(err, FeedbackError::PatternNotFound(id) if id == "missing"));
}

#[test]
fn feedback_updates_counts_and_confidence() {
    let mut engine = LearningEngine::default();
    engine.restore(vec![pattern("p1", mca_rule())]);

    let after_success = engine.apply_feedback("p1", true).expect("should apply");
    assert_eq!(after_success.application_count, 1);
    assert_eq!(after_success.success_count, 1);
    assert!((after_success.confidence - 0.52).abs() < 1e-9);
    assert!(after_success.last_applied_at.is_some());

    let after_failure = engine.apply_feedback("p1", false).expect("should apply");
    assert_eq!(after_failure.application_count, 2);
    assert_eq!(after_failure.success_count, 1);
    assert!((after_failure.confidence - 0.47).abs() < 1e-9);
    assert!((after_failure.success_rate() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn retires_after_ten_applications_below_half() {
    let mut engine = LearningEngine::default();
    engine.restore(vec![pattern("p1", mca_rule())]);

    for i in 0..9 {
        let state = engine.apply_feedback("p1", i < 4).expect("should apply");
        assert!(state.enabled, "still enabled after {} applications", i + 1);
    }
    let retired = engine.apply_feedback("p1", false).expect("should apply");
    assert_eq!(retired.application_count, 10);
    assert!(retired.success_rate() < 0.5);
    assert!(!retired.enabled);
    assert!(engine.enabled_patterns("pathology.location", None).is_empty());
    assert_eq!(engine.patterns().len(), 1);
}

#[test]
fn half_success_rate_stays_enabled() {
    let mut engine = LearningEngine::default();
    engine.restore(vec![pattern("p1", mca_rule())]);
    for i in 0..10 {
        engine.apply_feedback("p1", i % 2 == 0).expect("should apply");
    }
    assert!(engine.get("p1").expect("exists").enabled);
}

#[test]
fn enabled_patterns_filter_and_rank() {
    let mut generic = pattern("generic", mca_rule());
    generic.pathology = None;
    generic.confidence = 0.9;
    let mut other = pattern("other", mca_rule());
    other.pathology = Some("tumour".to_string());
    let mut disabled = pattern("disabled", mca_rule());
    disabled.enabled = false;

    let mut engine = LearningEngine::default();
    engine.restore(vec![pattern("sah", mca_rule()), generic, other, disabled]);

    let ids: Vec<&str> = engine
        .enabled_patterns("pathology.location", Some("sah"))
        .iter()
        .map(|p| p.id.as_str())
        .collect();
    assert_eq!(ids, vec!["generic", "sah"]);
    assert_eq!(engine.enabled_patterns("pathology.location", None).len(), 3);
    assert!(engine.enabled_patterns("grade", None).is_empty());
}

#[test]
fn malformed_rules_are_skipped() {
    let broken = pattern(
        "broken",
        MatchRule::ContextRegex {
            pattern: "(unclosed".to_string(),
            value: "x".to_string(),
        },
    );
    let mut engine = LearningEngine::default();
    engine.restore(vec![broken, pattern("good", mca_rule())]);

    let suggestions = engine.apply_patterns(
        "pathology.location",
        Some("SAH"),
        "left MCA aneurysm",
        &FieldValue::from("left side"),
    );
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].pattern_id, "good");
    assert_eq!(suggestions[0].value, FieldValue::from("left MCA"));
}

#[test]
fn suggestion_equal_to_current_value_is_dropped() {
    let mut engine = LearningEngine::default();
    engine.restore(vec![pattern("good", mca_rule())]);
    let suggestions = engine.apply_patterns(
        "pathology.location",
        None,
        "left MCA aneurysm",
        &FieldValue::from("left MCA"),
    );
    assert!(suggestions.is_empty());
}

#[test]
fn import_is_all_or_nothing() {
    let mut engine = LearningEngine::default();
    engine.restore(vec![pattern("existing", mca_rule())]);

    let mut invalid = pattern("bad", mca_rule());
    invalid.confidence = 1.5;
    let state = LearningState {
        version: LEARNING_STATE_VERSION,
        exported_at: Utc::now(),
        patterns: vec![pattern("new", mca_rule()), invalid],
    };

    let err = engine.import_learning(state).expect_err("invalid confidence");
    assert!(matches!(err, FeedbackError::Import(_)));
    assert_eq!(engine.patterns().len(), 1);
    assert!(engine.get("new").is_none());
}

#[test]
fn import_rejects_bad_shapes() {
    let mut inflated = pattern("inflated", mca_rule());
    inflated.success_count = 3;
    inflated.application_count = 2;
    let bad_regex = pattern(
        "regex",
        MatchRule::ContextRegex {
            pattern: "[".to_string(),
            value: String::new(),
        },
    );

    for patterns in [
        vec![inflated],
        vec![bad_regex],
        vec![pattern("dup", mca_rule()), pattern("dup", mca_rule())],
    ] {
        let state = LearningState {
            version: LEARNING_STATE_VERSION,
            exported_at: Utc::now(),
            patterns,
        };
        assert!(LearningEngine::validate(&state).is_err());
    }

    let future = LearningState {
        version: LEARNING_STATE_VERSION + 1,
        exported_at: Utc::now(),
        patterns: Vec::new(),
    };
    assert!(LearningEngine::validate(&future).is_err());
}

#[test]
fn import_merges_by_application_count() {
    let mut local = pattern("shared", mca_rule());
    local.application_count = 5;
    local.success_count = 5;
    let mut engine = LearningEngine::default();
    engine.restore(vec![local]);

    let mut stale = pattern("shared", mca_rule());
    stale.application_count = 2;
    let changed = engine
        .import_learning(LearningState {
            version: LEARNING_STATE_VERSION,
            exported_at: Utc::now(),
            patterns: vec![stale, pattern("fresh", mca_rule())],
        })
        .expect("should import");
    assert_eq!(changed.len(), 1);
    assert_eq!(engine.get("shared").expect("exists").application_count, 5);

    let mut newer = pattern("shared", mca_rule());
    newer.application_count = 8;
    newer.success_count = 1;
    newer.created_at -= Duration::days(1);
    engine
        .import_learning(LearningState {
            version: LEARNING_STATE_VERSION,
            exported_at: Utc::now(),
            patterns: vec![newer],
        })
        .expect("should import");
    assert_eq!(engine.get("shared").expect("exists").application_count, 8);
    assert_eq!(engine.patterns().len(), 2);
}

#[test]
fn export_round_trips_through_json() {
    let mut engine = LearningEngine::default();
    engine.restore(vec![pattern("p1", mca_rule())]);
    let json = serde_json::to_string(&engine.export_learning()).expect("should serialize");
    assert!(json.contains(r#""kind":"context_regex""#));

    let state: LearningState = serde_json::from_str(&json).expect("should parse");
    let mut fresh = LearningEngine::default();
    fresh.import_learning(state).expect("should import");
    assert_eq!(fresh.patterns(), engine.patterns());
}

#[test]
fn scrub_removes_identifiers_from_imported_pattern() {
    let mut imported = pattern(
        "p1",
        MatchRule::ValueSubstitution {
            from: "MRN: 12345678".to_string(),
            to: "MRN: 87654321".to_string(),
        },
    );
    imported.learned_value = FieldValue::from("MRN: 87654321");
    imported.scrub(&mut Anonymizer::new());

    assert!(!imported.rule.value().contains("87654321"));
    assert!(!imported.learned_value.as_text().contains("87654321"));
}

#[test]
fn clear_all_drops_patterns() {
    let mut engine = LearningEngine::default();
    engine.restore(vec![pattern("a", mca_rule()), pattern("b", mca_rule())]);
    assert_eq!(engine.clear_all(), 2);
    assert!(engine.patterns().is_empty());
}
