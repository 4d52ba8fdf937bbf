use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{ArgGroup, Parser, Subcommand};
use clinical_feedback::commands::{
    export_snapshot, import_snapshot, list_patterns, pattern_feedback, record_applications,
    scrub_text, search, show_clusters, show_report, track_corrections,
};
use clinical_feedback::config::{Config, run_interactive_config, show_config};
use clinical_feedback::store::Collection;

#[derive(Parser)]
#[command(name = "clinical-feedback")]
#[command(about = "Learns from clinician corrections to extracted note fields")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure Ollama connection and learning settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Print the redacted form of a piece of text
    Scrub {
        text: String,
        /// Dates become day offsets from this date (YYYY-MM-DD)
        #[arg(long)]
        reference_date: Option<NaiveDate>,
    },
    /// Track corrections from a JSON file (one object or an array)
    Track { file: PathBuf },
    /// Record how many times the extractor filled a field
    Applications { field: String, count: u64 },
    /// List learned patterns
    Patterns {
        /// Only enabled patterns for this field
        #[arg(long)]
        field: Option<String>,
        /// Restrict to a pathology (requires --field)
        #[arg(long, requires = "field")]
        pathology: Option<String>,
    },
    /// Report whether an applied pattern was correct
    #[command(group(ArgGroup::new("result").required(true).args(["success", "failure"])))]
    Feedback {
        pattern_id: String,
        #[arg(long)]
        success: bool,
        #[arg(long)]
        failure: bool,
    },
    /// Show accuracy, trends and recommendations
    Report {
        /// Trend window in days
        #[arg(long)]
        window_days: Option<u32>,
    },
    /// Search a collection (notes, patterns, entities, summaries)
    Search {
        collection: Collection,
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    /// Group similar documents of a collection
    Clusters { collection: Collection },
    /// Export learned state to a JSON snapshot
    Export { path: PathBuf },
    /// Import a JSON snapshot
    Import { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&Config::load_default()?);
            } else {
                run_interactive_config()?;
            }
        }
        Commands::Scrub {
            text,
            reference_date,
        } => {
            scrub_text(&text, reference_date)?;
        }
        Commands::Track { file } => {
            track_corrections(&file).await?;
        }
        Commands::Applications { field, count } => {
            record_applications(&field, count).await?;
        }
        Commands::Patterns { field, pathology } => {
            list_patterns(field.as_deref(), pathology.as_deref()).await?;
        }
        Commands::Feedback {
            pattern_id,
            success,
            ..
        } => {
            pattern_feedback(&pattern_id, success).await?;
        }
        Commands::Report { window_days } => {
            show_report(window_days).await?;
        }
        Commands::Search {
            collection,
            query,
            top_k,
        } => {
            search(collection, &query, top_k).await?;
        }
        Commands::Clusters { collection } => {
            show_clusters(collection).await?;
        }
        Commands::Export { path } => {
            export_snapshot(&path).await?;
        }
        Commands::Import { path } => {
            import_snapshot(&path).await?;
        }
    }

    Ok(())
}
