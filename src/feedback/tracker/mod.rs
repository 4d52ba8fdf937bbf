#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Correction, CorrectionRecord};
use crate::analysis::{compute_diff, extract_features};
use crate::anonymizer::{AnonymizeOptions, Anonymizer};
use crate::metrics::Trend;

/// Fewest corrections on a field before an early/late trend is reported
const MIN_TREND_CORRECTIONS: usize = 4;
/// Fewest corrections before recommendations are produced
const MIN_RECOMMENDATION_CORRECTIONS: usize = 5;
const RECOMMENDATION_SHARE: f64 = 0.4;
const HIGH_PRIORITY_SHARE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldAccuracy {
    pub accuracy: f64,
    pub trend: Trend,
    pub corrections: usize,
    pub applications: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSubject {
    Field,
    Transformation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub subject: RecommendationSubject,
    pub key: String,
    pub share: f64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionAnalysis {
    pub total: usize,
    pub by_transformation: BTreeMap<String, usize>,
    pub by_field: BTreeMap<String, usize>,
    pub recommendations: Vec<Recommendation>,
}

/// Append-only correction log with per-field accuracy bookkeeping.
///
/// Applications (how often the extractor produced a field) are reported by
/// the caller; corrections are counted from the log itself.
#[derive(Debug, Default)]
pub struct CorrectionTracker {
    anonymizer: Anonymizer,
    records: Vec<CorrectionRecord>,
    applications: HashMap<String, u64>,
}

/// 1 - corrections / applications, with corrections bounding the denominator from below
fn accuracy(corrections: usize, applications: u64) -> f64 {
    let corrections = corrections as f64;
    let denominator = (applications as f64).max(corrections);
    if denominator <= 0.0 {
        1.0
    } else {
        1.0 - corrections / denominator
    }
}

impl CorrectionTracker {
    #[inline]
    pub fn new(anonymizer: Anonymizer) -> Self {
        Self {
            anonymizer,
            records: Vec::new(),
            applications: HashMap::new(),
        }
    }

    /// Scrubs and analyses `correction`, then appends it to the log.
    #[inline]
    pub fn track(&mut self, correction: Correction) -> &CorrectionRecord {
        let record = self.prepare(correction);
        self.append(record)
    }

    /// Scrubs and analyses `correction` without adding it to the log.
    ///
    /// Features and diff come from the raw values; scrubbing would fold
    /// e.g. two spellings of a date into the same placeholder.
    #[inline]
    pub fn prepare(&mut self, correction: Correction) -> CorrectionRecord {
        let options = AnonymizeOptions::default();
        let source_context = self.anonymizer.scrub(&correction.source_context, &options);
        let redacted_before = self.anonymizer.anonymize_value(&correction.before, &options);
        let redacted_after = self.anonymizer.anonymize_value(&correction.after, &options);

        let before_text = correction.before.as_text();
        let after_text = correction.after.as_text();
        let features = extract_features(&before_text, &after_text, source_context.as_str());
        let diff = compute_diff(&before_text, &after_text);

        CorrectionRecord {
            id: Uuid::new_v4().to_string(),
            field_path: correction.field_path,
            before: correction.before,
            after: correction.after,
            redacted_before,
            redacted_after,
            source_context,
            pathology: correction.pathology,
            extraction_method: correction.extraction_method,
            confidence_before: correction.confidence_before,
            created_at: correction.created_at,
            features,
            diff,
        }
    }

    /// Appends a record produced by [`Self::prepare`]
    #[inline]
    pub fn append(&mut self, record: CorrectionRecord) -> &CorrectionRecord {
        debug!(
            "Tracked correction {} on {} ({})",
            record.id, record.field_path, record.features.transformation
        );

        self.records.push(record);
        let index = self.records.len() - 1;
        &self.records[index]
    }

    /// Adds `count` extractor applications of `field_path`
    #[inline]
    pub fn record_applications(&mut self, field_path: &str, count: u64) -> u64 {
        let total = self.applications.entry(field_path.to_string()).or_insert(0);
        *total = total.saturating_add(count);
        *total
    }

    #[inline]
    pub fn applications(&self) -> &HashMap<String, u64> {
        &self.applications
    }

    #[inline]
    pub fn corrections_for(&self, field_path: &str) -> usize {
        self.records
            .iter()
            .filter(|r| r.field_path == field_path)
            .count()
    }

    /// Accuracy across every field; 1.0 when nothing has been recorded
    #[inline]
    pub fn overall_accuracy(&self) -> f64 {
        let applications = self.applications.values().copied().fold(0u64, u64::saturating_add);
        accuracy(self.records.len(), applications)
    }

    #[inline]
    pub fn field_accuracy(&self, field_path: &str) -> FieldAccuracy {
        let records: Vec<&CorrectionRecord> = self.records_for(field_path).collect();
        let applications = self.applications.get(field_path).copied().unwrap_or(0);

        FieldAccuracy {
            accuracy: accuracy(records.len(), applications),
            trend: correction_trend(&records),
            corrections: records.len(),
            applications,
        }
    }

    /// Groups the log by transformation and field and flags dominant groups
    #[inline]
    pub fn analyze_corrections(&self) -> CorrectionAnalysis {
        let total = self.records.len();
        let mut by_transformation = BTreeMap::new();
        let mut by_field = BTreeMap::new();
        for record in &self.records {
            *by_transformation
                .entry(record.features.transformation.as_str().to_string())
                .or_insert(0) += 1;
            *by_field.entry(record.field_path.clone()).or_insert(0) += 1;
        }

        let mut recommendations = Vec::new();
        if total >= MIN_RECOMMENDATION_CORRECTIONS {
            for (key, count) in &by_field {
                if let Some(priority) = dominance(*count, total) {
                    recommendations.push(Recommendation {
                        priority,
                        subject: RecommendationSubject::Field,
                        key: key.clone(),
                        share: *count as f64 / total as f64,
                        message: format!(
                            "Field '{key}' accounts for {count} of {total} corrections; review its extraction rules"
                        ),
                    });
                }
            }
            for (key, count) in &by_transformation {
                if let Some(priority) = dominance(*count, total) {
                    recommendations.push(Recommendation {
                        priority,
                        subject: RecommendationSubject::Transformation,
                        key: key.clone(),
                        share: *count as f64 / total as f64,
                        message: format!(
                            "{count} of {total} corrections are {key}; consider a dedicated normalisation step"
                        ),
                    });
                }
            }
            recommendations.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| b.share.total_cmp(&a.share))
            });
        }

        CorrectionAnalysis {
            total,
            by_transformation,
            by_field,
            recommendations,
        }
    }

    /// Records for one field in the order they were tracked
    #[inline]
    pub fn records_for<'a>(
        &'a self,
        field_path: &'a str,
    ) -> impl Iterator<Item = &'a CorrectionRecord> + 'a {
        self.records
            .iter()
            .filter(move |record| record.field_path == field_path)
    }

    #[inline]
    pub fn all_records(&self) -> &[CorrectionRecord] {
        &self.records
    }

    #[inline]
    pub fn get(&self, id: &str) -> Option<&CorrectionRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    /// Replaces the in-memory state with records and counts loaded from storage
    #[inline]
    pub fn restore(&mut self, mut records: Vec<CorrectionRecord>, applications: HashMap<String, u64>) {
        records.sort_by_key(|record| record.created_at);
        info!(
            "Restored {} corrections across {} fields",
            records.len(),
            applications.len()
        );
        self.records = records;
        self.applications = applications;
    }

    /// Merges records from a snapshot.
    ///
    /// Records whose id is already known are skipped. New ones have their
    /// context and values scrubbed again and their analysis recomputed.
    /// Application counts take the larger of the two totals per field.
    /// Returns the records that were added.
    #[inline]
    pub fn import_records(
        &mut self,
        records: Vec<CorrectionRecord>,
        applications: &HashMap<String, u64>,
    ) -> Vec<CorrectionRecord> {
        let options = AnonymizeOptions::default();
        let mut added = Vec::new();

        for record in records {
            let seen = self.get(&record.id).is_some()
                || added.iter().any(|r: &CorrectionRecord| r.id == record.id);
            if seen {
                continue;
            }

            let source_context = self.anonymizer.scrub(record.source_context.as_str(), &options);
            let redacted_before = self.anonymizer.anonymize_value(&record.redacted_before, &options);
            let redacted_after = self.anonymizer.anonymize_value(&record.redacted_after, &options);
            let before_text = record.before.as_text();
            let after_text = record.after.as_text();

            added.push(CorrectionRecord {
                features: extract_features(&before_text, &after_text, source_context.as_str()),
                diff: compute_diff(&before_text, &after_text),
                source_context,
                redacted_before,
                redacted_after,
                ..record
            });
        }

        for (field, count) in applications {
            let total = self.applications.entry(field.clone()).or_insert(0);
            *total = (*total).max(*count);
        }

        self.records.extend(added.iter().cloned());
        self.records.sort_by_key(|record| record.created_at);
        info!("Imported {} corrections", added.len());
        added
    }

    #[inline]
    pub fn clear(&mut self) {
        self.records.clear();
        self.applications.clear();
        self.anonymizer.clear_caches();
    }

    /// Forgets the anonymizer's token mappings; call between unrelated patients.
    #[inline]
    pub fn clear_anonymizer_caches(&mut self) {
        self.anonymizer.clear_caches();
    }

    #[inline]
    pub fn anonymizer_mut(&mut self) -> &mut Anonymizer {
        &mut self.anonymizer
    }
}

fn dominance(count: usize, total: usize) -> Option<Priority> {
    let share = count as f64 / total as f64;
    if share >= HIGH_PRIORITY_SHARE {
        Some(Priority::High)
    } else if share >= RECOMMENDATION_SHARE {
        Some(Priority::Medium)
    } else {
        None
    }
}

/// Compares correction counts in the earlier and later halves of the field's time span.
///
/// Fewer corrections later means the field is improving.
fn correction_trend(records: &[&CorrectionRecord]) -> Trend {
    if records.len() < MIN_TREND_CORRECTIONS {
        return Trend::InsufficientData;
    }

    let (Some(first), Some(last)) = (
        records.iter().map(|r| r.created_at).min(),
        records.iter().map(|r| r.created_at).max(),
    ) else {
        return Trend::InsufficientData;
    };
    if first == last {
        return Trend::Stable;
    }

    let midpoint: DateTime<Utc> = first + (last - first) / 2;
    let early = records.iter().filter(|r| r.created_at <= midpoint).count();
    let late = records.len() - early;

    match late.cmp(&early) {
        std::cmp::Ordering::Less => Trend::Improving,
        std::cmp::Ordering::Greater => Trend::Declining,
        std::cmp::Ordering::Equal => Trend::Stable,
    }
}

/// Flattened redacted values of a record, used where a single text is needed
#[inline]
pub fn record_text(record: &CorrectionRecord) -> String {
    let mut parts = vec![record.field_path.clone(), record.signature()];
    if !record.source_context.is_empty() {
        parts.push(record.source_context.to_string());
    }
    if let Some(pathology) = &record.pathology {
        parts.push(pathology.clone());
    }
    parts.join("\n")
}
