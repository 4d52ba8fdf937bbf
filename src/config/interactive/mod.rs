
use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};

use super::{Config, ConfigError, OllamaConfig};
use crate::store::EvictionPolicy;

#[inline]
pub fn run_interactive_config() -> Result<()> {
    eprintln!("{}", style("Clinical Feedback Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config()?;

    eprintln!("{}", style("Ollama Configuration").bold().yellow());
    eprintln!("Configure the local Ollama instance used for note embeddings.");
    eprintln!();

    configure_ollama(&mut config.ollama)?;

    eprintln!();
    eprintln!("{}", style("Vector Store").bold().yellow());
    configure_store(&mut config)?;

    eprintln!();
    eprintln!("{}", style("Learning").bold().yellow());
    configure_learning(&mut config)?;

    eprintln!();
    eprintln!("{}", style("Testing configuration...").yellow());

    if test_ollama_connection(&config.ollama) {
        eprintln!("{}", style("✓ Ollama connection successful!").green());
    } else {
        eprintln!(
            "{}",
            style("⚠ Warning: Could not connect to Ollama").yellow()
        );
        eprintln!("Corrections are still tracked; similarity search falls back to lexical matching.");
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config: &Config) {
    eprintln!("{}", style("Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Ollama Settings:").bold().yellow());
    eprintln!("  Host: {}", style(&config.ollama.host).cyan());
    eprintln!("  Port: {}", style(config.ollama.port).cyan());
    eprintln!("  Model: {}", style(&config.ollama.model).cyan());
    eprintln!("  Batch Size: {}", style(config.ollama.batch_size).cyan());
    eprintln!(
        "  Embedding Dimension: {}",
        style(config.ollama.embedding_dimension).cyan()
    );
    match config.ollama_url() {
        Ok(url) => eprintln!("  Ollama URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  Ollama URL: {} ({})", style("Invalid").red(), e),
    }

    eprintln!();
    eprintln!("{}", style("Store Settings:").bold().yellow());
    eprintln!(
        "  Max Collection Size: {}",
        style(config.store.max_collection_size).cyan()
    );
    eprintln!("  Eviction: {}", style(config.store.eviction).cyan());
    eprintln!(
        "  Embed Timeout: {}s",
        style(config.store.embed_timeout_secs).cyan()
    );

    eprintln!();
    eprintln!("{}", style("Learning Settings:").bold().yellow());
    eprintln!(
        "  Similarity Threshold: {}",
        style(config.learning.similarity_threshold).cyan()
    );
    eprintln!("  Minimum Support: {}", style(config.learning.min_support).cyan());
    eprintln!(
        "  Retirement: {} applications below {} success",
        style(config.learning.retirement_min_applications).cyan(),
        style(config.learning.retirement_success_rate).cyan()
    );

    eprintln!();
    eprintln!("{}", style("Metrics Settings:").bold().yellow());
    eprintln!(
        "  Trend Threshold: ±{}",
        style(config.metrics.trend_threshold).cyan()
    );
    eprintln!(
        "  Default Window: {} days",
        style(config.metrics.default_window_days).cyan()
    );

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );
    eprintln!(
        "Database: {}",
        style(config.database_path().display()).dim()
    );
}

fn load_existing_config() -> Result<Config> {
    let dir = Config::config_dir().context("Failed to determine config directory")?;
    Config::load(&dir).map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No valid configuration found. Using defaults.").yellow()
            );
            Ok(Config {
                base_dir: dir.clone(),
                ..Config::default()
            })
        },
        |config| {
            eprintln!("{}", style("Found existing configuration.").green());
            Ok(config)
        },
    )
}

fn configure_ollama(ollama: &mut OllamaConfig) -> Result<()> {
    let protocols = &["http", "https"];
    let default_index = protocols
        .iter()
        .position(|&p| p == ollama.protocol)
        .unwrap_or(0);

    let protocol_index = Select::new()
        .with_prompt("Ollama protocol")
        .default(default_index)
        .items(protocols)
        .interact()?;

    let protocol = protocols[protocol_index].to_string();

    let host: String = Input::new()
        .with_prompt("Ollama host")
        .default(ollama.host.clone())
        .validate_with(|input: &String| -> Result<(), ConfigError> {
            let candidate = OllamaConfig {
                protocol: protocol.clone(),
                host: input.clone(),
                ..OllamaConfig::default()
            };
            candidate.validate()
        })
        .interact_text()?;

    let port: u16 = Input::new()
        .with_prompt("Ollama port")
        .default(ollama.port)
        .validate_with(|input: &u16| -> Result<(), &str> {
            if *input == 0 {
                Err("Port must be greater than 0")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let model: String = Input::new()
        .with_prompt("Embedding model")
        .default(ollama.model.clone())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Model name cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let dimension: u32 = Input::new()
        .with_prompt("Embedding dimension (fixed once the store is created)")
        .default(ollama.embedding_dimension)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if (64..=4096).contains(input) {
                Ok(())
            } else {
                Err("Dimension must be between 64 and 4096")
            }
        })
        .interact_text()?;

    ollama.set_protocol(protocol)?;
    ollama.set_host(host)?;
    ollama.set_port(port)?;
    ollama.set_model(model)?;
    ollama.set_embedding_dimension(dimension)?;

    Ok(())
}

fn configure_store(config: &mut Config) -> Result<()> {
    let max_collection_size: usize = Input::new()
        .with_prompt("Maximum documents per collection")
        .default(config.store.max_collection_size)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if (1..=100_000).contains(input) {
                Ok(())
            } else {
                Err("Collection size must be between 1 and 100000")
            }
        })
        .interact_text()?;

    let policies = [EvictionPolicy::EvictOldest, EvictionPolicy::Reject];
    let labels: Vec<String> = policies.iter().map(ToString::to_string).collect();
    let default_index = policies
        .iter()
        .position(|p| *p == config.store.eviction)
        .unwrap_or(0);

    let policy_index = Select::new()
        .with_prompt("When a collection is full")
        .default(default_index)
        .items(&labels)
        .interact()?;

    config.store.max_collection_size = max_collection_size;
    config.store.eviction = policies[policy_index];
    Ok(())
}

fn configure_learning(config: &mut Config) -> Result<()> {
    let threshold: f64 = Input::new()
        .with_prompt("Similarity threshold for grouping corrections")
        .default(config.learning.similarity_threshold)
        .validate_with(|input: &f64| -> Result<(), &str> {
            if (0.0..=1.0).contains(input) {
                Ok(())
            } else {
                Err("Threshold must be between 0 and 1")
            }
        })
        .interact_text()?;

    let min_support: usize = Input::new()
        .with_prompt("Corrections required before a pattern is learned")
        .default(config.learning.min_support)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if *input >= 2 {
                Ok(())
            } else {
                Err("Minimum support must be at least 2")
            }
        })
        .interact_text()?;

    config.learning.similarity_threshold = threshold;
    config.learning.min_support = min_support;
    Ok(())
}

fn test_ollama_connection(ollama: &OllamaConfig) -> bool {
    let url = format!(
        "{}://{}:{}/api/version",
        ollama.protocol, ollama.host, ollama.port
    );

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(&url).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) => (400..500).contains(&code),
        Err(_) => false,
    }
}
