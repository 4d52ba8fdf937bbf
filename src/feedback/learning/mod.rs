#[cfg(test)]
mod tests;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CorrectionRecord, FieldValue};
use crate::anonymizer::{AnonymizeOptions, Anonymizer};
use crate::similarity::{SimilarityConfig, tokenize};
use crate::{FeedbackError, Result};

pub const LEARNING_STATE_VERSION: u32 = 1;

/// Smoothing term in `confidence = avg_similarity * w / (w + k)`
const EVIDENCE_SMOOTHING: f64 = 2.0;
const MIN_ANCHOR_LENGTH: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LearningConfig {
    /// Combined similarity a prior correction needs to count as support
    pub similarity_threshold: f64,
    /// Supporting corrections, including the new one, needed to mint a pattern
    pub min_support: usize,
    pub retirement_min_applications: u32,
    pub retirement_success_rate: f64,
    pub confirm_boost: f64,
    pub reject_penalty: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            min_support: 3,
            retirement_min_applications: 10,
            retirement_success_rate: 0.5,
            confirm_boost: 0.02,
            reject_penalty: 0.05,
        }
    }
}

/// When a learned pattern fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchRule {
    /// Fires when the source context matches `pattern`
    ContextRegex { pattern: String, value: String },
    /// Fires when the current value equals `from`, ignoring case and surrounding whitespace
    ValueSubstitution { from: String, to: String },
}

impl MatchRule {
    /// Evaluates the rule. A pattern that does not compile or exceeds the
    /// backtracking limit is an error.
    #[inline]
    pub fn evaluate(&self, context: &str, current: &str) -> std::result::Result<bool, fancy_regex::Error> {
        match self {
            Self::ContextRegex { pattern, .. } => Regex::new(pattern)?.is_match(context),
            Self::ValueSubstitution { from, .. } => {
                Ok(!from.trim().is_empty() && current.trim().eq_ignore_ascii_case(from.trim()))
            }
        }
    }

    /// Value the rule proposes, as text
    #[inline]
    pub fn value(&self) -> &str {
        match self {
            Self::ContextRegex { value, .. } => value,
            Self::ValueSubstitution { to, .. } => to,
        }
    }
}

impl std::fmt::Display for MatchRule {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ContextRegex { pattern, value } => write!(f, "context ~ /{pattern}/ -> '{value}'"),
            Self::ValueSubstitution { from, to } => write!(f, "'{from}' -> '{to}'"),
        }
    }
}

/// A learned, confidence-scored extraction rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub field_path: String,
    pub pathology: Option<String>,
    /// Redacted `before => after` text of the correction that minted it
    pub signature: String,
    pub rule: MatchRule,
    pub learned_value: FieldValue,
    pub confidence: f64,
    pub success_count: u32,
    pub application_count: u32,
    pub enabled: bool,
    pub origin_correction_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_applied_at: Option<DateTime<Utc>>,
}

impl Pattern {
    /// successes / applications, 0 before the first application
    #[inline]
    pub fn success_rate(&self) -> f64 {
        if self.application_count == 0 {
            0.0
        } else {
            f64::from(self.success_count) / f64::from(self.application_count)
        }
    }

    /// Scrubs the learned value and the rule's literal texts.
    ///
    /// Applied to patterns arriving from outside the process.
    #[inline]
    pub fn scrub(&mut self, anonymizer: &mut Anonymizer) {
        let options = AnonymizeOptions::default();
        self.learned_value = anonymizer.anonymize_value(&self.learned_value, &options);
        self.signature = anonymizer.scrub(&self.signature, &options).into_inner();
        self.rule = match &self.rule {
            MatchRule::ContextRegex { pattern, value } => MatchRule::ContextRegex {
                pattern: pattern.clone(),
                value: anonymizer.scrub(value, &options).into_inner(),
            },
            MatchRule::ValueSubstitution { from, to } => MatchRule::ValueSubstitution {
                from: anonymizer.scrub(from, &options).into_inner(),
                to: anonymizer.scrub(to, &options).into_inner(),
            },
        };
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("pattern without an id".to_string());
        }
        if self.field_path.trim().is_empty() {
            return Err(format!("pattern {} has no field path", self.id));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "pattern {} has confidence {} outside [0, 1]",
                self.id, self.confidence
            ));
        }
        if self.success_count > self.application_count {
            return Err(format!(
                "pattern {} has more successes ({}) than applications ({})",
                self.id, self.success_count, self.application_count
            ));
        }
        if let MatchRule::ContextRegex { pattern, .. } = &self.rule {
            Regex::new(pattern)
                .map_err(|e| format!("pattern {} has an invalid rule: {e}", self.id))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearningOutcome {
    Minted { pattern_id: String },
    Reinforced { pattern_id: String },
    OneOff,
}

/// A value proposed by an enabled pattern for the current document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSuggestion {
    pub pattern_id: String,
    pub field_path: String,
    pub value: FieldValue,
    pub confidence: f64,
}

/// Serialisable learning state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningState {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub patterns: Vec<Pattern>,
}

/// Mints, scores and retires patterns from tracked corrections
#[derive(Debug, Default)]
pub struct LearningEngine {
    config: LearningConfig,
    similarity: SimilarityConfig,
    patterns: Vec<Pattern>,
}

impl LearningEngine {
    #[inline]
    pub fn new(config: LearningConfig, similarity: SimilarityConfig) -> Self {
        Self {
            config,
            similarity,
            patterns: Vec::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// Learns from a newly tracked record.
    ///
    /// `history` holds earlier records of any field; the record itself is
    /// ignored if present. A pattern whose signature duplicates the
    /// record's is reinforced. Otherwise a new pattern is minted once
    /// enough similar same-field corrections exist. Patterns only hold
    /// redacted values, so a change that vanishes under scrubbing (a date
    /// reformat, say) is a one-off.
    #[inline]
    pub fn learn_from_correction(
        &mut self,
        record: &CorrectionRecord,
        history: &[&CorrectionRecord],
    ) -> LearningOutcome {
        let signature = record.signature();
        if record.redacted_before == record.redacted_after {
            return LearningOutcome::OneOff;
        }

        if let Some(pattern_id) = self.reinforce(record, &signature) {
            return LearningOutcome::Reinforced { pattern_id };
        }

        let mut support: Vec<(&CorrectionRecord, f64)> = history
            .iter()
            .copied()
            .filter(|other| other.id != record.id && other.field_path == record.field_path)
            .filter_map(|other| {
                let similarity = self.similarity.combined(&signature, &other.signature());
                (similarity >= self.config.similarity_threshold).then_some((other, similarity))
            })
            .collect();

        if support.len() + 1 < self.config.min_support {
            debug!(
                "Correction {} on {} has {} supporting corrections, not learning yet",
                record.id,
                record.field_path,
                support.len()
            );
            return LearningOutcome::OneOff;
        }

        let average_similarity =
            support.iter().map(|(_, similarity)| similarity).sum::<f64>() / support.len().max(1) as f64;
        support.push((record, 1.0));
        support.sort_by_key(|(r, _)| r.created_at);

        let records: Vec<&CorrectionRecord> = support.iter().map(|(r, _)| *r).collect();
        let pattern = self.mint(record, signature, &records, average_similarity);
        let pattern_id = pattern.id.clone();

        info!(
            "Minted pattern {} for {} from {} corrections (confidence {:.2})",
            pattern.id,
            pattern.field_path,
            records.len(),
            pattern.confidence
        );
        self.patterns.push(pattern);

        LearningOutcome::Minted { pattern_id }
    }

    /// A pattern without a pathology matches every pathology, as in
    /// [`Self::enabled_patterns`].
    fn reinforce(&mut self, record: &CorrectionRecord, signature: &str) -> Option<String> {
        let similarity = self.similarity;
        let boost = self.config.confirm_boost;

        let pattern = self
            .patterns
            .iter_mut()
            .filter(|p| p.field_path == record.field_path)
            .filter(|p| match (p.pathology.as_deref(), record.pathology.as_deref()) {
                (None, _) => true,
                (Some(ours), Some(theirs)) => ours.eq_ignore_ascii_case(theirs),
                (Some(_), None) => false,
            })
            .map(|p| {
                let score = similarity.combined(&p.signature, signature);
                (p, score)
            })
            .filter(|(_, score)| *score >= similarity.pattern_duplicate_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(p, _)| p)?;

        if !pattern.origin_correction_ids.contains(&record.id) {
            pattern.origin_correction_ids.push(record.id.clone());
        }
        pattern.learned_value = pattern.learned_value.merge(&record.redacted_after);
        pattern.confidence = (pattern.confidence + boost).clamp(0.0, 1.0);

        debug!(
            "Reinforced pattern {} with correction {}",
            pattern.id, record.id
        );
        Some(pattern.id.clone())
    }

    fn mint(
        &self,
        record: &CorrectionRecord,
        signature: String,
        support: &[&CorrectionRecord],
        average_similarity: f64,
    ) -> Pattern {
        let evidence: f64 = support
            .iter()
            .map(|r| 0.5 + r.features.extraction_difficulty / 2.0)
            .sum();
        let confidence =
            (average_similarity * evidence / (evidence + EVIDENCE_SMOOTHING)).clamp(0.0, 1.0);

        let pathology = record.pathology.clone().filter(|pathology| {
            support
                .iter()
                .all(|r| r.pathology.as_deref() == Some(pathology.as_str()))
        });

        Pattern {
            id: Uuid::new_v4().to_string(),
            field_path: record.field_path.clone(),
            pathology,
            signature,
            rule: synthesize_rule(record, support),
            learned_value: record.redacted_after.clone(),
            confidence,
            success_count: 0,
            application_count: 0,
            enabled: true,
            origin_correction_ids: support.iter().map(|r| r.id.clone()).collect(),
            created_at: Utc::now(),
            last_applied_at: None,
        }
    }

    /// Records the outcome of one application of a pattern.
    ///
    /// Retires the pattern once it has enough applications and its success
    /// rate falls below the configured floor.
    #[inline]
    pub fn apply_feedback(&mut self, pattern_id: &str, succeeded: bool) -> Result<Pattern> {
        let config = &self.config;
        let pattern = self
            .patterns
            .iter_mut()
            .find(|p| p.id == pattern_id)
            .ok_or_else(|| FeedbackError::PatternNotFound(pattern_id.to_string()))?;

        pattern.application_count = pattern.application_count.saturating_add(1);
        if succeeded {
            pattern.success_count = pattern.success_count.saturating_add(1);
            pattern.confidence = (pattern.confidence + config.confirm_boost).min(1.0);
        } else {
            pattern.confidence = (pattern.confidence - config.reject_penalty).max(0.0);
        }
        pattern.last_applied_at = Some(Utc::now());

        if pattern.enabled
            && pattern.application_count >= config.retirement_min_applications
            && pattern.success_rate() < config.retirement_success_rate
        {
            pattern.enabled = false;
            info!(
                "Retired pattern {} on {} (success rate {:.2} over {} applications)",
                pattern.id,
                pattern.field_path,
                pattern.success_rate(),
                pattern.application_count
            );
        }

        Ok(pattern.clone())
    }

    /// Enabled patterns for a field, best first.
    ///
    /// Patterns without a pathology apply to every pathology; passing
    /// `None` returns patterns for all pathologies.
    #[inline]
    pub fn enabled_patterns(&self, field_path: &str, pathology: Option<&str>) -> Vec<&Pattern> {
        let mut patterns: Vec<&Pattern> = self
            .patterns
            .iter()
            .filter(|p| p.enabled && p.field_path == field_path)
            .filter(|p| match (p.pathology.as_deref(), pathology) {
                (Some(ours), Some(wanted)) => ours.eq_ignore_ascii_case(wanted),
                _ => true,
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.success_rate().total_cmp(&a.success_rate()))
        });
        patterns
    }

    /// Evaluates enabled patterns against a document.
    ///
    /// Patterns with malformed rules are skipped. Suggestions equal to the
    /// current value are dropped.
    #[inline]
    pub fn apply_patterns(
        &self,
        field_path: &str,
        pathology: Option<&str>,
        context: &str,
        current: &FieldValue,
    ) -> Vec<PatternSuggestion> {
        let current_text = current.as_text();
        let mut suggestions = Vec::new();

        for pattern in self.enabled_patterns(field_path, pathology) {
            match pattern.rule.evaluate(context, &current_text) {
                Ok(true) if &pattern.learned_value != current => {
                    suggestions.push(PatternSuggestion {
                        pattern_id: pattern.id.clone(),
                        field_path: pattern.field_path.clone(),
                        value: pattern.learned_value.clone(),
                        confidence: pattern.confidence,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Skipping pattern {} with malformed rule: {}", pattern.id, e);
                }
            }
        }

        suggestions
    }

    #[inline]
    pub fn get(&self, pattern_id: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.id == pattern_id)
    }

    #[inline]
    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Replaces all patterns with ones loaded from storage
    #[inline]
    pub fn restore(&mut self, patterns: Vec<Pattern>) {
        self.patterns = patterns;
    }

    #[inline]
    pub fn export_learning(&self) -> LearningState {
        LearningState {
            version: LEARNING_STATE_VERSION,
            exported_at: Utc::now(),
            patterns: self.patterns.clone(),
        }
    }

    /// Checks a state without applying it
    #[inline]
    pub fn validate(state: &LearningState) -> Result<()> {
        if state.version == 0 || state.version > LEARNING_STATE_VERSION {
            return Err(FeedbackError::Import(format!(
                "unsupported learning state version {}",
                state.version
            )));
        }

        let mut ids = BTreeSet::new();
        for pattern in &state.patterns {
            pattern.validate().map_err(FeedbackError::Import)?;
            if !ids.insert(pattern.id.as_str()) {
                return Err(FeedbackError::Import(format!(
                    "duplicate pattern id {}",
                    pattern.id
                )));
            }
        }
        Ok(())
    }

    /// Merges an exported state. Nothing changes unless every pattern validates.
    ///
    /// On an id collision the copy with more applications wins. Returns the
    /// patterns that were added or replaced.
    #[inline]
    pub fn import_learning(&mut self, state: LearningState) -> Result<Vec<Pattern>> {
        Self::validate(&state)?;

        let mut changed = Vec::new();
        for pattern in state.patterns {
            match self.patterns.iter_mut().find(|p| p.id == pattern.id) {
                Some(existing) => {
                    if pattern.application_count > existing.application_count {
                        *existing = pattern.clone();
                        changed.push(pattern);
                    }
                }
                None => {
                    self.patterns.push(pattern.clone());
                    changed.push(pattern);
                }
            }
        }

        info!("Imported {} patterns", changed.len());
        Ok(changed)
    }

    /// Drops every pattern
    #[inline]
    pub fn clear_all(&mut self) -> usize {
        let removed = self.patterns.len();
        self.patterns.clear();
        info!("Cleared {} patterns", removed);
        removed
    }
}

/// Builds the rule for a minted pattern.
///
/// Anchors are tokens of the corrected value that occur in every
/// supporting context. Tokens missing from the original value are
/// preferred, since they are what the correction introduced.
fn synthesize_rule(record: &CorrectionRecord, support: &[&CorrectionRecord]) -> MatchRule {
    let after_text = record.redacted_after.as_text();
    let before_tokens: BTreeSet<String> = tokenize(&record.redacted_before.as_text())
        .into_iter()
        .collect();
    let contexts: Vec<BTreeSet<String>> = support
        .iter()
        .map(|r| tokenize(r.source_context.as_str()).into_iter().collect())
        .collect();

    let mut shared: Vec<String> = Vec::new();
    for token in tokenize(&after_text) {
        if token.chars().count() >= MIN_ANCHOR_LENGTH
            && !shared.contains(&token)
            && contexts.iter().all(|context| context.contains(&token))
        {
            shared.push(token);
        }
    }

    let introduced: Vec<&String> = shared
        .iter()
        .filter(|token| !before_tokens.contains(*token))
        .collect();
    let anchors: Vec<&String> = if introduced.is_empty() {
        shared.iter().collect()
    } else {
        introduced
    };

    if anchors.is_empty() {
        return MatchRule::ValueSubstitution {
            from: record.redacted_before.as_text(),
            to: after_text,
        };
    }

    let lookaheads: String = anchors
        .iter()
        .map(|anchor| format!(r"(?=[\s\S]*\b{}\b)", fancy_regex::escape(anchor)))
        .collect();

    MatchRule::ContextRegex {
        pattern: format!("(?i){lookaheads}"),
        value: after_text,
    }
}
