// Performance metrics
// Accuracy snapshots over the correction log, with trend and learning-effectiveness reports


use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::feedback::CorrectionTracker;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Mean accuracy change that counts as improving or declining
    pub trend_threshold: f64,
    /// Snapshots compared at each end of the history
    pub effectiveness_sample: usize,
    /// Improvement above which learning counts as effective
    pub effective_improvement: f64,
    pub default_window_days: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            trend_threshold: 0.05,
            effectiveness_sample: 10,
            effective_improvement: 0.02,
            default_window_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

impl std::fmt::Display for Trend {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Trend::Improving => write!(f, "improving"),
            Trend::Declining => write!(f, "declining"),
            Trend::Stable => write!(f, "stable"),
            Trend::InsufficientData => write!(f, "insufficient data"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effectiveness {
    Effective,
    Moderate,
    Minimal,
    InsufficientData,
}

impl std::fmt::Display for Effectiveness {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Effectiveness::Effective => write!(f, "effective"),
            Effectiveness::Moderate => write!(f, "moderate"),
            Effectiveness::Minimal => write!(f, "minimal"),
            Effectiveness::InsufficientData => write!(f, "insufficient data"),
        }
    }
}

/// Confusion counts and derived scores for one field
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl FieldResult {
    fn from_counts(true_positives: u64, false_positives: u64, false_negatives: u64, accuracy: f64) -> Self {
        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, true_positives + false_negatives);
        Self {
            true_positives,
            false_positives,
            false_negatives,
            accuracy,
            precision,
            recall,
            f1: f1(precision, recall),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub per_field: BTreeMap<String, FieldResult>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub trend: Trend,
    pub window_days: u32,
    pub samples: usize,
    pub earlier_mean: Option<f64>,
    pub later_mean: Option<f64>,
    pub change: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectivenessReport {
    pub effectiveness: Effectiveness,
    pub samples: usize,
    pub baseline: Option<f64>,
    pub current: Option<f64>,
    pub improvement: Option<f64>,
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        1.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall <= 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Snapshot history and the reports computed from it
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    config: MetricsConfig,
    history: Vec<MetricsSnapshot>,
}

impl PerformanceMetrics {
    #[inline]
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Computes a snapshot from the tracker and appends it to the history.
    ///
    /// A correction whose original value was empty is a missed extraction
    /// (false negative); one whose corrected value is empty is a spurious
    /// extraction (false positive); a changed value counts as both.
    /// Uncorrected applications are true positives.
    #[inline]
    pub fn compute(&mut self, tracker: &CorrectionTracker) -> MetricsSnapshot {
        let mut fields: BTreeSet<&str> = tracker
            .all_records()
            .iter()
            .map(|record| record.field_path.as_str())
            .collect();
        fields.extend(tracker.applications().keys().map(String::as_str));

        let mut per_field = BTreeMap::new();
        let (mut tp, mut fp, mut fn_) = (0u64, 0u64, 0u64);
        for field in fields {
            let (mut false_positives, mut false_negatives) = (0u64, 0u64);
            for record in tracker.records_for(field) {
                match (record.before.is_empty(), record.after.is_empty()) {
                    (true, _) => false_negatives += 1,
                    (false, true) => false_positives += 1,
                    (false, false) => {
                        false_positives += 1;
                        false_negatives += 1;
                    }
                }
            }

            let accuracy = tracker.field_accuracy(field);
            let true_positives = accuracy
                .applications
                .saturating_sub(accuracy.corrections as u64);

            tp += true_positives;
            fp += false_positives;
            fn_ += false_negatives;
            per_field.insert(
                field.to_string(),
                FieldResult::from_counts(true_positives, false_positives, false_negatives, accuracy.accuracy),
            );
        }

        let overall = FieldResult::from_counts(tp, fp, fn_, tracker.overall_accuracy());
        let snapshot = MetricsSnapshot {
            accuracy: overall.accuracy,
            precision: overall.precision,
            recall: overall.recall,
            f1: overall.f1,
            per_field,
            timestamp: Utc::now(),
        };

        debug!(
            "Metrics snapshot: accuracy {:.3}, f1 {:.3} over {} fields",
            snapshot.accuracy,
            snapshot.f1,
            snapshot.per_field.len()
        );
        self.history.push(snapshot.clone());
        snapshot
    }

    /// Appends an externally computed snapshot
    #[inline]
    pub fn record(&mut self, snapshot: MetricsSnapshot) {
        self.history.push(snapshot);
        self.history.sort_by_key(|s| s.timestamp);
    }

    #[inline]
    pub fn history(&self) -> &[MetricsSnapshot] {
        &self.history
    }

    #[inline]
    pub fn restore(&mut self, mut history: Vec<MetricsSnapshot>) {
        history.sort_by_key(|s| s.timestamp);
        self.history = history;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.history.clear();
    }

    #[inline]
    pub fn accuracy_trend(&self, window_days: u32) -> TrendReport {
        self.accuracy_trend_at(window_days, Utc::now())
    }

    /// Compares mean accuracy in the earlier and later halves of the window ending at `now`
    #[inline]
    pub fn accuracy_trend_at(&self, window_days: u32, now: DateTime<Utc>) -> TrendReport {
        let since = now - Duration::days(i64::from(window_days));
        let window: Vec<f64> = self
            .history
            .iter()
            .filter(|s| s.timestamp >= since && s.timestamp <= now)
            .map(|s| s.accuracy)
            .collect();

        if window.len() < 2 {
            return TrendReport {
                trend: Trend::InsufficientData,
                window_days,
                samples: window.len(),
                earlier_mean: None,
                later_mean: None,
                change: None,
            };
        }

        let (earlier, later) = window.split_at(window.len() / 2);
        let earlier_mean = mean(earlier.iter().copied()).unwrap_or(0.0);
        let later_mean = mean(later.iter().copied()).unwrap_or(0.0);
        let change = later_mean - earlier_mean;

        let trend = if change > self.config.trend_threshold {
            Trend::Improving
        } else if change < -self.config.trend_threshold {
            Trend::Declining
        } else {
            Trend::Stable
        };

        TrendReport {
            trend,
            window_days,
            samples: window.len(),
            earlier_mean: Some(earlier_mean),
            later_mean: Some(later_mean),
            change: Some(change),
        }
    }

    /// Compares the mean accuracy of the oldest and newest samples of the whole history
    #[inline]
    pub fn learning_effectiveness(&self) -> EffectivenessReport {
        let sample = self.config.effectiveness_sample.max(1);
        let samples = self.history.len();
        if samples < sample {
            return EffectivenessReport {
                effectiveness: Effectiveness::InsufficientData,
                samples,
                baseline: None,
                current: None,
                improvement: None,
            };
        }

        let baseline = mean(self.history[..sample].iter().map(|s| s.accuracy)).unwrap_or(0.0);
        let current = mean(self.history[samples - sample..].iter().map(|s| s.accuracy)).unwrap_or(0.0);
        let improvement = current - baseline;

        let effectiveness = if improvement > self.config.effective_improvement {
            Effectiveness::Effective
        } else if improvement > 0.0 {
            Effectiveness::Moderate
        } else {
            Effectiveness::Minimal
        };

        EffectivenessReport {
            effectiveness,
            samples,
            baseline: Some(baseline),
            current: Some(current),
            improvement: Some(improvement),
        }
    }
}
