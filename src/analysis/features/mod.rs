
use std::collections::BTreeSet;
use std::sync::LazyLock;

use fancy_regex::Regex;
use serde::{Deserialize, Serialize};

use crate::similarity::{concepts, token_set_jaccard, tokenize};

/// Ratio above which a corrected value counts as "much longer" than the original
const EXPANSION_RATIO: f64 = 1.5;
const BASE_DIFFICULTY: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentPattern {
    Date,
    Age,
    Measurement,
    Grade,
    Procedure,
    Medication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformationType {
    CaseChange,
    AbbreviationExpansion,
    NumberExtraction,
    DateFormatting,
    PartialCorrection,
    MinorCorrection,
    CompleteReplacement,
}

impl TransformationType {
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CaseChange => "case_change",
            Self::AbbreviationExpansion => "abbreviation_expansion",
            Self::NumberExtraction => "number_extraction",
            Self::DateFormatting => "date_formatting",
            Self::PartialCorrection => "partial_correction",
            Self::MinorCorrection => "minor_correction",
            Self::CompleteReplacement => "complete_replacement",
        }
    }
}

impl std::fmt::Display for TransformationType {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hedging and assertion cues found in the source context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertaintyIndicators {
    pub hedges: Vec<String>,
    pub negations: Vec<String>,
    pub assertions: Vec<String>,
}

impl CertaintyIndicators {
    #[inline]
    pub fn is_uncertain(&self) -> bool {
        self.hedges.len() > self.assertions.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBag {
    pub before_length: usize,
    pub after_length: usize,
    pub added_tokens: Vec<String>,
    pub removed_tokens: Vec<String>,
    pub before_patterns: BTreeSet<ContentPattern>,
    pub after_patterns: BTreeSet<ContentPattern>,
    pub transformation: TransformationType,
    pub certainty: CertaintyIndicators,
    pub extraction_difficulty: f64,
}

macro_rules! content_regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($pattern).ok());
    };
}

content_regex!(
    DATE_SHAPE,
    r"(?i)\b(\d{1,4}[/\-.]\d{1,2}[/\-.]\d{1,4}|\d{1,2}\s+(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{2,4}|(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2},?\s+\d{4})\b"
);
content_regex!(
    AGE_SHAPE,
    r"(?i)\b(\d{1,3}\s*(-\s*)?(years?|yrs?|y)(\s*-?\s*old)?|\d{1,3}\s*y/?o|aged\s+\d{1,3})\b"
);
content_regex!(
    MEASUREMENT_SHAPE,
    r"(?i)\b\d+(\.\d+)?\s*(mm|cm|ml|mg|mcg|g|kg|mmhg|l|%)(?![a-z])"
);
content_regex!(
    GRADE_SHAPE,
    r"(?i)\b(grade|wfns|hunt\s*(and|&)\s*hess|fisher|gcs|stage)\s*:?\s*([ivx]+|\d+)\b"
);

fn regex_matches(regex: &LazyLock<Option<Regex>>, text: &str) -> bool {
    regex
        .as_ref()
        .is_some_and(|r| r.is_match(text).unwrap_or(false))
}

/// Content-shape tags present in a value
#[inline]
pub fn content_patterns(text: &str) -> BTreeSet<ContentPattern> {
    let mut patterns = BTreeSet::new();
    if regex_matches(&DATE_SHAPE, text) {
        patterns.insert(ContentPattern::Date);
    }
    if regex_matches(&AGE_SHAPE, text) {
        patterns.insert(ContentPattern::Age);
    }
    if regex_matches(&MEASUREMENT_SHAPE, text) {
        patterns.insert(ContentPattern::Measurement);
    }
    if regex_matches(&GRADE_SHAPE, text) {
        patterns.insert(ContentPattern::Grade);
    }
    for concept in concepts::extract_concepts(text) {
        match concept.category {
            concepts::ConceptCategory::Procedure => {
                patterns.insert(ContentPattern::Procedure);
            }
            concepts::ConceptCategory::Medication => {
                patterns.insert(ContentPattern::Medication);
            }
            _ => {}
        }
    }
    patterns
}

const HEDGES: &[&str] = &[
    "possible",
    "possibly",
    "probable",
    "probably",
    "likely",
    "suspected",
    "suspicious",
    "query",
    "?",
    "may",
    "might",
    "cannot exclude",
    "uncertain",
    "equivocal",
];
const NEGATIONS: &[&str] = &["no", "not", "without", "denies", "negative", "absent", "nil"];
const ASSERTIONS: &[&str] = &[
    "confirmed",
    "definite",
    "definitely",
    "demonstrated",
    "diagnosed",
    "consistent with",
    "shows",
    "evident",
];

fn find_cues(padded: &str, tokens: &[String], cues: &[&str]) -> Vec<String> {
    cues.iter()
        .filter(|cue| {
            if cue.contains(' ') {
                padded.contains(&format!(" {cue} "))
            } else if cue.chars().all(char::is_alphanumeric) {
                tokens.iter().any(|t| t == *cue)
            } else {
                padded.contains(*cue)
            }
        })
        .map(|cue| (*cue).to_string())
        .collect()
}

#[inline]
pub fn certainty_indicators(context: &str) -> CertaintyIndicators {
    let tokens = tokenize(context);
    let padded = format!(" {} ", tokens.join(" "));
    let padded = if context.contains('?') {
        format!("{padded}?")
    } else {
        padded
    };

    CertaintyIndicators {
        hedges: find_cues(&padded, &tokens, HEDGES),
        negations: find_cues(&padded, &tokens, NEGATIONS),
        assertions: find_cues(&padded, &tokens, ASSERTIONS),
    }
}

/// Classifies an edit, checking rules in a fixed order
#[inline]
pub fn classify_transformation(before: &str, after: &str) -> TransformationType {
    let before_trimmed = before.trim();
    let after_trimmed = after.trim();

    if before_trimmed.to_lowercase() == after_trimmed.to_lowercase() {
        return TransformationType::CaseChange;
    }

    let before_len = before_trimmed.chars().count();
    let after_len = after_trimmed.chars().count();
    if before_len > 0
        && after_len as f64 >= before_len as f64 * EXPANSION_RATIO
        && after_trimmed
            .to_lowercase()
            .contains(&before_trimmed.to_lowercase())
    {
        return TransformationType::AbbreviationExpansion;
    }

    let digits_before = before_trimmed.chars().any(|c| c.is_ascii_digit());
    let digits_after = after_trimmed.chars().any(|c| c.is_ascii_digit());
    if !digits_before && digits_after {
        return TransformationType::NumberExtraction;
    }
    if digits_before && regex_matches(&DATE_SHAPE, after_trimmed) {
        return TransformationType::DateFormatting;
    }

    let similarity = token_set_jaccard(before_trimmed, after_trimmed);
    if similarity < 0.3 {
        TransformationType::CompleteReplacement
    } else if similarity < 0.7 {
        TransformationType::PartialCorrection
    } else {
        TransformationType::MinorCorrection
    }
}

fn is_abbreviation(token: &str) -> bool {
    let letters = token.chars().filter(|c| c.is_alphabetic()).count();
    (2..=5).contains(&letters)
        && token
            .chars()
            .filter(|c| c.is_alphabetic())
            .all(char::is_uppercase)
}

/// Difficulty of extracting the value from `context`, in [0.3, 1.0].
///
/// Longer contexts and denser clinical vocabulary make extraction harder.
#[inline]
pub fn extraction_difficulty(context: &str) -> f64 {
    let words: Vec<&str> = context.split_whitespace().collect();
    if words.is_empty() {
        return BASE_DIFFICULTY;
    }

    let length_factor = (words.len() as f64 / 500.0).min(1.0) * 0.3;

    let medical = words
        .iter()
        .filter(|w| {
            let cleaned = w.trim_matches(|c: char| !c.is_alphanumeric());
            !cleaned.is_empty() && concepts::is_clinical_term(cleaned)
        })
        .count();
    let abbreviations = words
        .iter()
        .filter(|w| is_abbreviation(w.trim_matches(|c: char| !c.is_alphanumeric())))
        .count();

    let medical_density = medical as f64 / words.len() as f64;
    let abbreviation_density = abbreviations as f64 / words.len() as f64;

    (BASE_DIFFICULTY + length_factor + medical_density * 0.2 + abbreviation_density * 0.2).min(1.0)
}

/// Derives the feature bag for one correction
#[inline]
pub fn extract_features(before: &str, after: &str, context: &str) -> FeatureBag {
    let before_tokens: BTreeSet<String> = tokenize(before).into_iter().collect();
    let after_tokens: BTreeSet<String> = tokenize(after).into_iter().collect();

    FeatureBag {
        before_length: before.chars().count(),
        after_length: after.chars().count(),
        added_tokens: after_tokens.difference(&before_tokens).cloned().collect(),
        removed_tokens: before_tokens.difference(&after_tokens).cloned().collect(),
        before_patterns: content_patterns(before),
        after_patterns: content_patterns(after),
        transformation: classify_transformation(before, after),
        certainty: certainty_indicators(context),
        extraction_difficulty: extraction_difficulty(context),
    }
}
