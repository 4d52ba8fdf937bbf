// Correction feedback
// Clinician corrections, the per-field correction log and the pattern learning loop

pub mod learning;
pub mod tracker;
pub mod value;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::{DiffResult, FeatureBag};
use crate::anonymizer::Redacted;

pub use learning::{
    LearningConfig, LearningEngine, LearningOutcome, LearningState, MatchRule, Pattern,
    PatternSuggestion,
};
pub use tracker::{
    CorrectionAnalysis, CorrectionTracker, FieldAccuracy, Priority, Recommendation,
    RecommendationSubject,
};
pub use value::FieldValue;

/// How the corrected value was originally produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Rule,
    Llm,
    Hybrid,
    #[default]
    Unknown,
}

impl ExtractionMethod {
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Llm => "llm",
            Self::Hybrid => "hybrid",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for ExtractionMethod {
    type Err = crate::FeedbackError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rule" => Ok(Self::Rule),
            "llm" => Ok(Self::Llm),
            "hybrid" => Ok(Self::Hybrid),
            "unknown" => Ok(Self::Unknown),
            other => Err(crate::FeedbackError::Other(anyhow::anyhow!(
                "Unknown extraction method: {other}"
            ))),
        }
    }
}

/// One clinician edit of an extracted field, as received from review.
///
/// `source_context` is raw here; it is scrubbed before anything is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub field_path: String,
    pub before: FieldValue,
    pub after: FieldValue,
    #[serde(default)]
    pub source_context: String,
    #[serde(default)]
    pub pathology: Option<String>,
    #[serde(default)]
    pub extraction_method: ExtractionMethod,
    #[serde(default)]
    pub confidence_before: Option<f64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Correction {
    #[inline]
    pub fn new(
        field_path: impl Into<String>,
        before: impl Into<FieldValue>,
        after: impl Into<FieldValue>,
        source_context: impl Into<String>,
    ) -> Self {
        Self {
            field_path: field_path.into(),
            before: before.into(),
            after: after.into(),
            source_context: source_context.into(),
            pathology: None,
            extraction_method: ExtractionMethod::Unknown,
            confidence_before: None,
            created_at: Utc::now(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_pathology(mut self, pathology: impl Into<String>) -> Self {
        self.pathology = Some(pathology.into());
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_method(mut self, method: ExtractionMethod) -> Self {
        self.extraction_method = method;
        self
    }

    /// Extractor confidence, clamped to [0, 1]
    #[inline]
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_before = Some(confidence.clamp(0.0, 1.0));
        self
    }

    #[inline]
    #[must_use]
    pub const fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// A tracked correction with its scrubbed context and derived analysis.
///
/// Records are append-only. `features` and `diff` are computed from the
/// raw values; everything compared when learning uses the redacted ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub id: String,
    pub field_path: String,
    pub before: FieldValue,
    pub after: FieldValue,
    pub redacted_before: FieldValue,
    pub redacted_after: FieldValue,
    pub source_context: Redacted,
    pub pathology: Option<String>,
    pub extraction_method: ExtractionMethod,
    pub confidence_before: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub features: FeatureBag,
    pub diff: DiffResult,
}

impl CorrectionRecord {
    /// `before => after` over the redacted values, the text compared when learning
    #[inline]
    pub fn signature(&self) -> String {
        format!(
            "{} => {}",
            self.redacted_before.as_text(),
            self.redacted_after.as_text()
        )
    }
}
