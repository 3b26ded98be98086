use aggregate::{CrossRecordConfig, TieBreak};
use anyhow::{Context, Result};
use ingest::{ChunkerConfig, SizeUnit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::Semaphore;

use crate::error::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: OperationMode,
    pub chunking: ChunkingConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub aggregation: AggregationConfig,
    pub model: ModelConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Fast,      // Whole speeches where they fit, few retries
    Accurate,  // Always chunked, several passes, model-written descriptions
    Balanced,  // Default
}

/// Which units a speech is split into before extraction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Chunk only speeches longer than the budget.
    Auto,
    Chunked,
    WholeSpeech,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub extraction_mode: ExtractionMode,
    pub max_size: usize,
    pub overlap: usize,
    pub unit: SizeUnit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_llm_calls: usize,
    pub request_timeout_secs: u64,
    /// Abandon whatever is still in flight after this long.
    pub batch_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub passes_per_speech: usize,
    /// Reconciles the passes over one speech.
    pub per_speech: CrossRecordConfig,
    /// Judges one pair across speeches.
    pub longitudinal: CrossRecordConfig,
    pub similarity_threshold: f64,
    /// Ask the model to word judgment descriptions.
    pub model_descriptions: bool,
    /// Extra country short forms, alias -> canonical name.
    pub country_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        let chunker = ChunkerConfig::default();
        Self {
            extraction_mode: ExtractionMode::Auto,
            max_size: chunker.max_size,
            overlap: chunker.overlap,
            unit: chunker.unit,
        }
    }
}

impl ChunkingConfig {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_size: self.max_size,
            overlap: self.overlap,
            unit: self.unit,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_llm_calls: 3,
            request_timeout_secs: 60,
            batch_timeout_secs: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            passes_per_speech: 1,
            per_speech: CrossRecordConfig::per_speech(),
            longitudinal: CrossRecordConfig::longitudinal(),
            similarity_threshold: 0.8,
            model_descriptions: false,
            country_aliases: BTreeMap::new(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            name: "llama3".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Balanced,
            chunking: ChunkingConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            aggregation: AggregationConfig::default(),
            model: ModelConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn fast_mode() -> Self {
        Self {
            mode: OperationMode::Fast,
            chunking: ChunkingConfig {
                max_size: 2048,
                overlap: 100,
                ..ChunkingConfig::default()
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_llm_calls: 10,
                request_timeout_secs: 30,
                batch_timeout_secs: None,
            },
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 500,
                max_backoff_ms: 5000,
            },
            ..Self::default()
        }
    }

    pub fn accurate_mode() -> Self {
        Self {
            mode: OperationMode::Accurate,
            chunking: ChunkingConfig {
                extraction_mode: ExtractionMode::Chunked,
                ..ChunkingConfig::default()
            },
            concurrency: ConcurrencyConfig {
                max_concurrent_llm_calls: 2,
                request_timeout_secs: 120,
                batch_timeout_secs: None,
            },
            retry: RetryConfig {
                max_retries: 5,
                initial_backoff_ms: 2000,
                max_backoff_ms: 20000,
            },
            aggregation: AggregationConfig {
                passes_per_speech: 3,
                per_speech: CrossRecordConfig {
                    min_usable_records: 2,
                    tie_break: vec![TieBreak::MostDetailed],
                },
                model_descriptions: true,
                ..AggregationConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn for_mode(mode: OperationMode) -> Self {
        match mode {
            OperationMode::Fast => Self::fast_mode(),
            OperationMode::Accurate => Self::accurate_mode(),
            OperationMode::Balanced => Self::default(),
        }
    }

    /// Load a JSON file. Missing sections and fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `STANCE_*` overrides from `lookup`, usually
    /// `|name| std::env::var(name).ok()`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("STANCE_MODEL_URL") {
            self.model.base_url = url;
        }
        if let Some(name) = lookup("STANCE_MODEL") {
            self.model.name = name;
        }
        if let Some(value) = lookup("STANCE_MAX_CONCURRENCY") {
            self.concurrency.max_concurrent_llm_calls = parse_var("STANCE_MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("STANCE_REQUEST_TIMEOUT_SECS") {
            self.concurrency.request_timeout_secs = parse_var("STANCE_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("STANCE_MAX_RETRIES") {
            self.retry.max_retries = parse_var("STANCE_MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("STANCE_MIN_USABLE_RECORDS") {
            self.aggregation.longitudinal.min_usable_records = parse_var("STANCE_MIN_USABLE_RECORDS", &value)?;
        }
        if let Some(value) = lookup("STANCE_LOG_FORMAT") {
            self.logging.format = match value.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => anyhow::bail!("STANCE_LOG_FORMAT must be json or pretty, got {}", other),
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.concurrency.max_concurrent_llm_calls == 0 {
            return Err(PipelineError::Config("max_concurrent_llm_calls must be at least 1".to_string()));
        }
        if self.concurrency.max_concurrent_llm_calls > Semaphore::MAX_PERMITS {
            return Err(PipelineError::Config(format!(
                "max_concurrent_llm_calls must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.concurrency.request_timeout_secs == 0 {
            return Err(PipelineError::Config("request_timeout_secs must be at least 1".to_string()));
        }
        if self.aggregation.passes_per_speech == 0 {
            return Err(PipelineError::Config("passes_per_speech must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.aggregation.similarity_threshold) {
            return Err(PipelineError::Config("similarity_threshold must be within 0..=1".to_string()));
        }
        self.chunking
            .chunker_config()
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{} has an invalid value: {}", name, value))
}
