use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::anonymizer::{AnonymizeOptions, Anonymizer};
use crate::config::Config;
use crate::feedback::{Correction, LearningOutcome};
use crate::metrics::Trend;
use crate::service::{FeedbackService, SearchMethod, Snapshot};
use crate::store::{ClusterOptions, Collection, SearchOptions};

/// A correction file holds one correction or a list of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CorrectionInput {
    Many(Vec<Correction>),
    One(Correction),
}

impl CorrectionInput {
    fn into_vec(self) -> Vec<Correction> {
        match self {
            Self::Many(corrections) => corrections,
            Self::One(correction) => vec![correction],
        }
    }
}

async fn open_service() -> Result<FeedbackService> {
    let config = Config::load_default().context("Failed to load configuration")?;
    FeedbackService::open(&config)
        .await
        .context("Failed to open feedback store")
}

fn progress_bar(len: u64, template: &str) -> ProgressBar {
    if !console::user_attended_stderr() {
        return ProgressBar::hidden();
    }
    match ProgressStyle::with_template(template) {
        Ok(progress_style) => ProgressBar::new(len).with_style(progress_style),
        Err(_) => ProgressBar::new(len),
    }
}

/// Print the redacted form of `text`
#[inline]
pub fn scrub_text(text: &str, reference_date: Option<NaiveDate>) -> Result<()> {
    let mut anonymizer = Anonymizer::new();
    let result = anonymizer.anonymize(text, &AnonymizeOptions { reference_date });

    println!("{}", result.anonymized);
    eprintln!();
    eprintln!(
        "{} {} items ({} names, {} dates, {} identifiers, {} locations)",
        style("Redacted").bold(),
        result.metadata.items_anonymized,
        result.metadata.names_replaced,
        result.metadata.dates_replaced,
        result.metadata.ids_replaced,
        result.metadata.locations_replaced
    );
    Ok(())
}

/// Track every correction in a JSON file
#[inline]
pub async fn track_corrections(path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let corrections = serde_json::from_str::<CorrectionInput>(&contents)
        .with_context(|| format!("Invalid correction JSON in {}", path.display()))?
        .into_vec();

    if corrections.is_empty() {
        println!("No corrections found in {}", path.display());
        return Ok(());
    }

    let service = open_service().await?;
    let bar = progress_bar(corrections.len() as u64, "{bar:40} {pos}/{len} Tracking corrections");

    let (mut minted, mut reinforced) = (0usize, 0usize);
    for correction in corrections {
        let field = correction.field_path.clone();
        let outcome = service
            .track_correction(correction)
            .await
            .with_context(|| format!("Failed to track correction on {field}"))?;
        match outcome.learning {
            LearningOutcome::Minted { pattern_id } => {
                minted += 1;
                bar.println(format!(
                    "{} pattern {} for {}",
                    style("Learned").green(),
                    pattern_id,
                    field
                ));
            }
            LearningOutcome::Reinforced { .. } => reinforced += 1,
            LearningOutcome::OneOff => {}
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    println!(
        "Tracked {} corrections ({} new patterns, {} reinforced)",
        bar.position(),
        minted,
        reinforced
    );
    Ok(())
}

/// Record how many times the extractor filled a field
#[inline]
pub async fn record_applications(field: &str, count: u64) -> Result<()> {
    let service = open_service().await?;
    let total = service.record_applications(field, count).await?;
    let accuracy = service.field_accuracy(field).await;

    println!("{}: {} applications recorded", style(field).cyan(), total);
    println!(
        "   Accuracy: {:.1}% ({} corrections)",
        accuracy.accuracy * 100.0,
        accuracy.corrections
    );
    Ok(())
}

/// List learned patterns
#[inline]
pub async fn list_patterns(field: Option<&str>, pathology: Option<&str>) -> Result<()> {
    let service = open_service().await?;
    let patterns = match field {
        Some(field) => service.enabled_patterns(field, pathology).await,
        None => service.all_patterns().await,
    };

    if patterns.is_empty() {
        println!("No patterns learned yet.");
        println!("Patterns appear once similar corrections recur on the same field.");
        return Ok(());
    }

    println!("Learned Patterns ({} total):", patterns.len());
    println!();

    for pattern in &patterns {
        let status = if pattern.enabled {
            style("enabled").green()
        } else {
            style("retired").red()
        };
        println!("{} [{}]", style(&pattern.id).bold(), status);
        println!("   Field: {}", pattern.field_path);
        if let Some(pathology) = &pattern.pathology {
            println!("   Pathology: {pathology}");
        }
        println!("   Rule: {}", pattern.rule);
        println!("   Confidence: {:.2}", pattern.confidence);
        println!(
            "   Applied: {} ({} succeeded)",
            pattern.application_count, pattern.success_count
        );
        println!("   Evidence: {} corrections", pattern.origin_correction_ids.len());
        println!();
    }
    Ok(())
}

/// Report whether applying a pattern was correct
#[inline]
pub async fn pattern_feedback(pattern_id: &str, succeeded: bool) -> Result<()> {
    let service = open_service().await?;
    let pattern = service.pattern_feedback(pattern_id, succeeded).await?;

    println!(
        "Pattern {}: confidence {:.2}, {}/{} successful",
        pattern.id, pattern.confidence, pattern.success_count, pattern.application_count
    );
    if !pattern.enabled {
        println!(
            "{}",
            style("Pattern retired after too many failed applications").yellow()
        );
    }
    Ok(())
}

/// Print accuracy, trend and correction analysis
#[inline]
pub async fn show_report(window_days: Option<u32>) -> Result<()> {
    let service = open_service().await?;
    let snapshot = service.compute_metrics().await;
    let trend = service.accuracy_trend(window_days).await;
    let effectiveness = service.learning_effectiveness().await;
    let analysis = service.analyze_corrections().await;

    println!("{}", style("Extraction Performance").bold().cyan());
    println!("   Accuracy:  {:.1}%", snapshot.accuracy * 100.0);
    println!("   Precision: {:.3}", snapshot.precision);
    println!("   Recall:    {:.3}", snapshot.recall);
    println!("   F1:        {:.3}", snapshot.f1);
    println!();

    let trend_label = match trend.trend {
        Trend::Improving => style(trend.trend.to_string()).green(),
        Trend::Declining => style(trend.trend.to_string()).red(),
        Trend::Stable | Trend::InsufficientData => style(trend.trend.to_string()).dim(),
    };
    println!(
        "Trend over {} days: {} ({} snapshots)",
        trend.window_days, trend_label, trend.samples
    );
    if let Some(change) = trend.change {
        println!("   Change: {:+.1} points", change * 100.0);
    }
    println!(
        "Learning effectiveness: {} ({} snapshots)",
        effectiveness.effectiveness, effectiveness.samples
    );
    println!();

    if !snapshot.per_field.is_empty() {
        println!("{}", style("Fields").bold());
        for (field, result) in &snapshot.per_field {
            println!(
                "   {:<32} accuracy {:>5.1}%  f1 {:.3}",
                field,
                result.accuracy * 100.0,
                result.f1
            );
        }
        println!();
    }

    println!("Corrections: {}", analysis.total);
    for (transformation, count) in &analysis.by_transformation {
        println!("   {transformation}: {count}");
    }

    if !analysis.recommendations.is_empty() {
        println!();
        println!("{}", style("Recommendations").bold().yellow());
        for recommendation in &analysis.recommendations {
            println!(
                "   [{:?}] {}",
                recommendation.priority, recommendation.message
            );
        }
    }
    Ok(())
}

/// Search a vector collection, or the correction log when searching notes
#[inline]
pub async fn search(collection: Collection, query: &str, top_k: usize) -> Result<()> {
    let service = open_service().await?;

    if collection == Collection::Notes {
        let results = service.find_similar_corrections(query, top_k).await;
        if results.is_empty() {
            println!("No similar corrections found.");
            return Ok(());
        }
        if results.iter().any(|result| result.method == SearchMethod::Lexical) {
            println!("{}", style("Vector store unavailable, using lexical similarity").yellow());
        }
        for result in &results {
            println!(
                "{:.3}  {}  {}",
                result.similarity,
                style(&result.record.field_path).cyan(),
                result.record.signature()
            );
        }
        return Ok(());
    }

    let Some(store) = service.store() else {
        bail!("Vector store is not configured");
    };
    let results = store
        .semantic_search(collection, query, &SearchOptions::default().top_k(top_k))
        .await
        .context("Semantic search failed")?;

    if results.is_empty() {
        println!("No matching documents in {collection}.");
        return Ok(());
    }
    for result in &results {
        println!(
            "{:.3}  {}  {}",
            result.similarity,
            style(&result.document.id).dim(),
            result.document.text
        );
    }
    Ok(())
}

/// Group similar documents of a collection
#[inline]
pub async fn show_clusters(collection: Collection) -> Result<()> {
    let service = open_service().await?;
    let Some(store) = service.store() else {
        bail!("Vector store is not configured");
    };
    let clusters = store
        .cluster_documents(collection, ClusterOptions::default())
        .await
        .context("Clustering failed")?;

    if clusters.is_empty() {
        println!("No clusters found in {collection}.");
        return Ok(());
    }

    println!("Clusters in {} ({} total):", collection, clusters.len());
    for (index, cluster) in clusters.iter().enumerate() {
        println!();
        println!("{} ({} documents)", style(format!("Cluster {}", index + 1)).bold(), cluster.size());
        for id in &cluster.document_ids {
            println!("   {id}");
        }
    }
    Ok(())
}

/// Write a snapshot of everything learned to `path`
#[inline]
pub async fn export_snapshot(path: &Path) -> Result<()> {
    let service = open_service().await?;
    let snapshot = service.export_snapshot().await?;

    let json = serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;

    let patterns = snapshot.learning.as_ref().map_or(0, |learning| learning.patterns.len());
    let corrections = snapshot
        .corrections
        .as_ref()
        .map_or(0, |section| section.records.len());
    println!(
        "Exported {} corrections and {} patterns to {}",
        corrections,
        patterns,
        style(path.display()).cyan()
    );
    if snapshot.vector_collections.is_none() {
        println!("{}", style("Vector store unavailable, vectors not exported").yellow());
    }
    Ok(())
}

/// Merge a snapshot file into the local state
#[inline]
pub async fn import_snapshot(path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid snapshot JSON in {}", path.display()))?;
    FeedbackService::validate_snapshot(&snapshot)?;

    let service = open_service().await?;

    let spinner = progress_bar(0, "{spinner} {msg}");
    spinner.set_message("Importing snapshot");
    spinner.enable_steady_tick(Duration::from_millis(120));
    let result = service.import_snapshot(snapshot).await;
    spinner.finish_and_clear();

    let report = result?;
    info!("Imported snapshot from {}", path.display());

    println!("{}", style("✓ Snapshot imported").green());
    println!("   Corrections: {}", report.corrections);
    println!("   Patterns: {}", report.patterns);
    println!("   Vectors: {}", report.vectors_imported);
    if report.vectors_failed > 0 {
        warn!("{} vector documents failed to import", report.vectors_failed);
        println!(
            "   {}",
            style(format!("{} vectors failed", report.vectors_failed)).yellow()
        );
    }
    Ok(())
}
