use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ConfigError;

/// Environment variable holding a YAML `ServiceConfig` document.
pub const CONFIG_ENV_VAR: &str = "BATCH_CONSUMER_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    pub rabbit: RabbitConfig,
}

/// Batching behaviour of a `Consumer`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_flush_delay_ms")]
    pub max_flush_delay_ms: u64,
    #[serde(default = "default_true")]
    pub discard_on_adapter_failure: bool,
    /// Upper bound for a single output call. Unbounded when absent.
    #[serde(default)]
    pub output_timeout_ms: Option<u64>,
}

/// Connection and acknowledgment settings of the RabbitMQ driver.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RabbitConfig {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub queue: String,
    /// Should match the consumer's batch size; drives the prefetch limit.
    #[serde(default)]
    pub batch_size: usize,
    #[serde(default = "default_max_connection_retries")]
    pub max_connection_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_extra_prefetch_percentage")]
    pub extra_prefetch_percentage: f64,
    #[serde(default = "default_true")]
    pub requeue_on_failure: bool,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default)]
    pub consumer_tag: Option<String>,
}

fn default_batch_size() -> usize {
    10
}

fn default_max_flush_delay_ms() -> u64 {
    10_000
}

fn default_max_connection_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_extra_prefetch_percentage() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_flush_delay_ms: default_max_flush_delay_ms(),
            discard_on_adapter_failure: true,
            output_timeout_ms: None,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "batch_size must be at least 1".to_string(),
            });
        }
        if self.output_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationFailed {
                reason: "output_timeout_ms must be greater than zero when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn max_flush_delay(&self) -> Duration {
        Duration::from_millis(self.max_flush_delay_ms)
    }

    pub fn output_timeout(&self) -> Option<Duration> {
        self.output_timeout_ms.map(Duration::from_millis)
    }
}

impl RabbitConfig {
    /// Builds a config with the required fields set and every option at its default.
    pub fn new(uri: impl Into<String>, queue: impl Into<String>, batch_size: usize) -> Self {
        Self {
            uri: uri.into(),
            queue: queue.into(),
            batch_size,
            max_connection_retries: default_max_connection_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            extra_prefetch_percentage: default_extra_prefetch_percentage(),
            requeue_on_failure: true,
            keep_alive: true,
            consumer_tag: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.is_empty() {
            return Err(missing("uri"));
        }
        if self.queue.is_empty() {
            return Err(missing("queue"));
        }
        if self.batch_size == 0 {
            return Err(missing("batchSize"));
        }
        if self.max_connection_retries == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "max_connection_retries must be at least 1".to_string(),
            });
        }
        if !self.extra_prefetch_percentage.is_finite() || self.extra_prefetch_percentage < 0.0 {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "extra_prefetch_percentage must be a non-negative number, got {}",
                    self.extra_prefetch_percentage
                ),
            });
        }
        Ok(())
    }

    /// Number of unacknowledged deliveries the broker may push ahead of the consumer.
    pub fn prefetch_count(&self) -> u16 {
        let prefetch = (self.batch_size as f64 * (1.0 + self.extra_prefetch_percentage)).floor();
        prefetch.clamp(1.0, u16::MAX as f64) as u16
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn missing(field: &str) -> ConfigError {
    ConfigError::MissingField {
        field: field.to_string(),
    }
}

pub async fn load_config(config_path: Option<&str>) -> Result<ServiceConfig, ConfigError> {
    match config_path {
        Some(path) => ServiceConfig::from_file(path),
        None => ServiceConfig::from_env(),
    }
}

impl ServiceConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            location: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content, path)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::Invalid {
            message: format!("{CONFIG_ENV_VAR} environment variable not set"),
        })?;
        Self::from_yaml(&config_str, CONFIG_ENV_VAR)
    }

    fn from_yaml(content: &str, location: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::LoadFailed {
            location: location.to_string(),
            error: Box::new(e),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.consumer.validate()?;
        self.rabbit.validate()?;
        if self.consumer.batch_size != self.rabbit.batch_size {
            tracing::warn!(
                consumer_batch_size = self.consumer.batch_size,
                driver_batch_size = self.rabbit.batch_size,
                "consumer and driver batch sizes differ; prefetch may starve or overfill batches"
            );
        }
        Ok(())
    }
}
