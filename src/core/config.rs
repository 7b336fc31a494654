use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::core::metrics::METRIC_KINDS;
use crate::core::model::MODEL_KINDS;
use crate::core::selection::SELECTOR_KINDS;
use crate::core::stopping::STOP_CONDITION_KINDS;

pub const CONFIG_FILE: &str = "labelloop.toml";

/// Startup-time configuration problems. These are fatal and never retried.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("selector '{0}' is not recognized (known: {known})", known = SELECTOR_KINDS.join(", "))]
    UnknownSelector(String),
    #[error(
        "stopping condition '{0}' is not recognized (known: {known})",
        known = STOP_CONDITION_KINDS.join(", ")
    )]
    UnknownStoppingCondition(String),
    #[error("model '{0}' is not recognized (known: {known})", known = MODEL_KINDS.join(", "))]
    UnknownModel(String),
    #[error("metric '{0}' is not recognized (known: {known})", known = METRIC_KINDS.join(", "))]
    UnknownMetric(String),
    #[error("parameter '{param}' is required for {owner}")]
    MissingParameter { owner: String, param: String },
    #[error("invalid value for '{param}': {reason}")]
    InvalidValue { param: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Samples selected per iteration.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    #[serde(default = "default_selector")]
    pub selector: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default)]
    pub stopping_conditions: Vec<StoppingConditionConfig>,

    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Where the final metric report is written as JSON, relative to the data dir.
    #[serde(default)]
    pub report_path: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoppingConditionConfig {
    pub kind: String,
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_sample_size() -> usize {
    100
}
fn default_selector() -> String {
    "random".to_string()
}
fn default_model() -> String {
    "keyword_vote".to_string()
}
fn default_metrics() -> Vec<String> {
    vec!["accuracy".to_string(), "span_f1".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            sample_size: default_sample_size(),
            selector: default_selector(),
            model: default_model(),
            stopping_conditions: Vec::new(),
            metrics: default_metrics(),
            log_level: default_log_level(),
            report_path: None,
            retry: RetryConfig::default(),
        }
    }
}

impl LoopConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        let config = Self::from_toml(&content)?;
        info!(
            "Loaded config: model={}, selector={}, max_iterations={}, sample_size={}, stopping_conditions={}",
            config.model,
            config.selector,
            config.max_iterations,
            config.sample_size,
            config.stopping_conditions.len()
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: LoopConfig = toml::from_str(content).context("parsing labelloop.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Shape checks only; unknown component names are reported by the factories.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_size == 0 {
            return Err(ConfigError::InvalidValue {
                param: "sample_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                param: "retry.max_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidValue {
                param: "retry.base_delay_ms".into(),
                reason: "must not exceed retry.max_delay_ms".into(),
            });
        }
        Ok(())
    }
}
