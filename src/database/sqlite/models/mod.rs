
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::anonymizer::Redacted;
use crate::feedback::{CorrectionRecord, Pattern};
use crate::metrics::MetricsSnapshot;

/// `corrections` row; structured columns hold JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CorrectionRow {
    pub id: String,
    pub field_path: String,
    pub before_value: String,
    pub after_value: String,
    pub redacted_before: String,
    pub redacted_after: String,
    pub source_context: String,
    pub pathology: Option<String>,
    pub extraction_method: String,
    pub confidence_before: Option<f64>,
    pub features: String,
    pub diff: String,
    pub created_at: DateTime<Utc>,
}

impl CorrectionRow {
    #[inline]
    pub fn from_record(record: &CorrectionRecord) -> Result<Self> {
        Ok(Self {
            id: record.id.clone(),
            field_path: record.field_path.clone(),
            before_value: serde_json::to_string(&record.before)
                .context("Failed to encode original value")?,
            after_value: serde_json::to_string(&record.after)
                .context("Failed to encode corrected value")?,
            redacted_before: serde_json::to_string(&record.redacted_before)
                .context("Failed to encode redacted original value")?,
            redacted_after: serde_json::to_string(&record.redacted_after)
                .context("Failed to encode redacted corrected value")?,
            source_context: record.source_context.to_string(),
            pathology: record.pathology.clone(),
            extraction_method: record.extraction_method.as_str().to_string(),
            confidence_before: record.confidence_before,
            features: serde_json::to_string(&record.features)
                .context("Failed to encode features")?,
            diff: serde_json::to_string(&record.diff).context("Failed to encode diff")?,
            created_at: record.created_at,
        })
    }

    #[inline]
    pub fn into_record(self) -> Result<CorrectionRecord> {
        let id = self.id;
        Ok(CorrectionRecord {
            before: decode(&id, "before_value", &self.before_value)?,
            after: decode(&id, "after_value", &self.after_value)?,
            redacted_before: decode(&id, "redacted_before", &self.redacted_before)?,
            redacted_after: decode(&id, "redacted_after", &self.redacted_after)?,
            features: decode(&id, "features", &self.features)?,
            diff: decode(&id, "diff", &self.diff)?,
            extraction_method: self.extraction_method.parse().unwrap_or_default(),
            source_context: Redacted::from_trusted(self.source_context),
            field_path: self.field_path,
            pathology: self.pathology,
            confidence_before: self.confidence_before,
            created_at: self.created_at,
            id,
        })
    }
}

fn decode<T: DeserializeOwned>(id: &str, column: &str, json: &str) -> Result<T> {
    serde_json::from_str(json).with_context(|| format!("Invalid {column} JSON in row {id}"))
}

/// `patterns` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PatternRow {
    pub id: String,
    pub field_path: String,
    pub pathology: Option<String>,
    pub signature: String,
    pub rule: String,
    pub learned_value: String,
    pub confidence: f64,
    pub success_count: i64,
    pub application_count: i64,
    pub enabled: bool,
    pub origin_correction_ids: String,
    pub created_at: DateTime<Utc>,
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl PatternRow {
    #[inline]
    pub fn from_pattern(pattern: &Pattern) -> Result<Self> {
        Ok(Self {
            id: pattern.id.clone(),
            field_path: pattern.field_path.clone(),
            pathology: pattern.pathology.clone(),
            signature: pattern.signature.clone(),
            rule: serde_json::to_string(&pattern.rule).context("Failed to encode match rule")?,
            learned_value: serde_json::to_string(&pattern.learned_value)
                .context("Failed to encode learned value")?,
            confidence: pattern.confidence,
            success_count: i64::from(pattern.success_count),
            application_count: i64::from(pattern.application_count),
            enabled: pattern.enabled,
            origin_correction_ids: serde_json::to_string(&pattern.origin_correction_ids)
                .context("Failed to encode origin correction ids")?,
            created_at: pattern.created_at,
            last_applied_at: pattern.last_applied_at,
        })
    }

    #[inline]
    pub fn into_pattern(self) -> Result<Pattern> {
        Ok(Pattern {
            rule: decode(&self.id, "rule", &self.rule)?,
            learned_value: decode(&self.id, "learned_value", &self.learned_value)?,
            origin_correction_ids: decode(&self.id, "origin_correction_ids", &self.origin_correction_ids)?,
            success_count: u32::try_from(self.success_count).unwrap_or(0),
            application_count: u32::try_from(self.application_count).unwrap_or(u32::MAX),
            id: self.id,
            field_path: self.field_path,
            pathology: self.pathology,
            signature: self.signature,
            confidence: self.confidence,
            enabled: self.enabled,
            created_at: self.created_at,
            last_applied_at: self.last_applied_at,
        })
    }
}

/// `field_applications` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FieldApplications {
    pub field_path: String,
    pub applications: i64,
    pub updated_at: DateTime<Utc>,
}

/// `metrics_snapshots` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MetricsRow {
    pub id: i64,
    pub accuracy: f64,
    pub precision_score: f64,
    pub recall: f64,
    pub f1: f64,
    pub per_field: String,
    pub recorded_at: DateTime<Utc>,
}

impl MetricsRow {
    #[inline]
    pub fn into_snapshot(self) -> Result<MetricsSnapshot> {
        Ok(MetricsSnapshot {
            accuracy: self.accuracy,
            precision: self.precision_score,
            recall: self.recall,
            f1: self.f1,
            per_field: decode(&self.id.to_string(), "per_field", &self.per_field)?,
            timestamp: self.recorded_at,
        })
    }
}
