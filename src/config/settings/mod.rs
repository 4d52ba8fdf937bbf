
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::embeddings::ollama::DEFAULT_EMBEDDING_DIMENSION;
use crate::feedback::learning::LearningConfig;
use crate::metrics::MetricsConfig;
use crate::similarity::SimilarityConfig;
use crate::store::StoreConfig;

/// Environment variable that overrides the base directory
pub const HOME_ENV_VAR: &str = "CLINICAL_FEEDBACK_HOME";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
    pub embedding_dimension: u32,
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "nomic-embed-text:latest".to_string(),
            batch_size: 16,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 64 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid request timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidRequestTimeout(u64),
    #[error("Invalid max collection size: {0} (must be between 1 and 100000)")]
    InvalidCollectionSize(usize),
    #[error("Invalid embedding timeout: {0} (must be between 1 and 600 seconds)")]
    InvalidEmbedTimeout(u64),
    #[error("Invalid default top_k: {0} (must be between 1 and 1000)")]
    InvalidTopK(usize),
    #[error("Invalid {name}: {value} (must be between 0 and 1)")]
    InvalidThreshold { name: &'static str, value: f64 },
    #[error("Similarity weights must not all be zero or negative")]
    InvalidWeights,
    #[error("Invalid minimum support: {0} (must be at least 2)")]
    InvalidMinSupport(usize),
    #[error("Invalid retirement minimum applications: {0} (must be at least 1)")]
    InvalidRetirementApplications(u32),
    #[error("Invalid effectiveness sample size: {0} (must be at least 1)")]
    InvalidEffectivenessSample(usize),
    #[error("Invalid default window: {0} days (must be between 1 and 3650)")]
    InvalidWindowDays(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            ollama: OllamaConfig::default(),
            store: StoreConfig::default(),
            similarity: SimilarityConfig::default(),
            learning: LearningConfig::default(),
            metrics: MetricsConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}

fn check_unit(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold { name, value })
    }
}

impl Config {
    /// Base directory: `$CLINICAL_FEEDBACK_HOME`, else the platform config dir
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        if let Some(home) = std::env::var_os(HOME_ENV_VAR).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(home));
        }

        dirs::config_dir()
            .map(|dir| dir.join("clinical-feedback"))
            .or_else(|| dirs::home_dir().map(|home| home.join(".clinical-feedback")))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Loads `config.toml` from the default base directory
    #[inline]
    pub fn load_default() -> Result<Self> {
        let dir = Self::config_dir().context("Failed to determine config directory")?;
        Self::load(dir)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;
        self.validate_store()?;
        self.validate_similarity()?;
        self.validate_learning()?;
        self.validate_metrics()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<(), ConfigError> {
        let store = &self.store;

        if !(1..=100_000).contains(&store.max_collection_size) {
            return Err(ConfigError::InvalidCollectionSize(store.max_collection_size));
        }

        if !(1..=600).contains(&store.embed_timeout_secs) {
            return Err(ConfigError::InvalidEmbedTimeout(store.embed_timeout_secs));
        }

        if !(1..=1000).contains(&store.default_top_k) {
            return Err(ConfigError::InvalidTopK(store.default_top_k));
        }

        check_unit("default_min_similarity", store.default_min_similarity)
    }

    fn validate_similarity(&self) -> Result<(), ConfigError> {
        let similarity = &self.similarity;
        let weights = &similarity.weights;

        if weights.jaccard < 0.0 || weights.edit < 0.0 || weights.concept < 0.0 {
            return Err(ConfigError::InvalidWeights);
        }
        if weights.total() <= 0.0 {
            return Err(ConfigError::InvalidWeights);
        }

        check_unit("dedup_threshold", similarity.dedup_threshold)?;
        check_unit(
            "pattern_duplicate_threshold",
            similarity.pattern_duplicate_threshold,
        )?;
        check_unit("fuzzy_threshold", similarity.fuzzy_threshold)?;
        Ok(())
    }

    fn validate_learning(&self) -> Result<(), ConfigError> {
        let learning = &self.learning;

        check_unit("similarity_threshold", learning.similarity_threshold)?;

        if learning.min_support < 2 {
            return Err(ConfigError::InvalidMinSupport(learning.min_support));
        }

        if learning.retirement_min_applications == 0 {
            return Err(ConfigError::InvalidRetirementApplications(
                learning.retirement_min_applications,
            ));
        }

        check_unit("retirement_success_rate", learning.retirement_success_rate)?;
        check_unit("confirm_boost", learning.confirm_boost)?;
        check_unit("reject_penalty", learning.reject_penalty)?;
        Ok(())
    }

    fn validate_metrics(&self) -> Result<(), ConfigError> {
        let metrics = &self.metrics;

        check_unit("trend_threshold", metrics.trend_threshold)?;
        check_unit("effective_improvement", metrics.effective_improvement)?;

        if metrics.effectiveness_sample == 0 {
            return Err(ConfigError::InvalidEffectivenessSample(
                metrics.effectiveness_sample,
            ));
        }

        if !(1..=3650).contains(&metrics.default_window_days) {
            return Err(ConfigError::InvalidWindowDays(metrics.default_window_days));
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Path of the SQLite database holding corrections, patterns and metrics
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.get_base_dir().join("feedback.db")
    }

    /// Directory of the LanceDB vector tables
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.get_base_dir().join("vectors")
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if !(64..=4096).contains(&self.embedding_dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        if !(1..=600).contains(&self.request_timeout_secs) {
            return Err(ConfigError::InvalidRequestTimeout(self.request_timeout_secs));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let candidate = OllamaConfig {
            host: host.clone(),
            ..self.clone()
        };
        candidate.validate()?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    pub fn set_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.model = model;
        Ok(())
    }

    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), ConfigError> {
        if batch_size == 0 || batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(batch_size));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    pub fn set_embedding_dimension(&mut self, dimension: u32) -> Result<(), ConfigError> {
        if !(64..=4096).contains(&dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(dimension));
        }
        self.embedding_dimension = dimension;
        Ok(())
    }
}
