use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Acknowledgment error: {0}")]
    Acknowledgment(#[from] AcknowledgmentError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Consumer is already running")]
    AlreadyRunning,

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("missing required configuration '{field}'")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {location}: {error}")]
    LoadFailed {
        location: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("could not connect to broker after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Driver is not connected")]
    NotConnected,
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Failed to decode message: {0}")]
    Decode(#[source] anyhow::Error),

    #[error("Message adapter failed: {0}")]
    Rejected(#[source] anyhow::Error),

    #[error("Message {stage} panicked: {reason}")]
    Panicked { stage: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Batch output failed: {0}")]
    Failed(#[source] anyhow::Error),

    #[error("Batch output timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Batch output panicked: {reason}")]
    Panicked { reason: String },
}

#[derive(Error, Debug)]
pub enum AcknowledgmentError {
    #[error("Failed to acknowledge delivery {delivery_tag}: {reason}")]
    Ack { delivery_tag: u64, reason: String },

    #[error("Failed to reject delivery {delivery_tag}: {reason}")]
    Reject { delivery_tag: u64, reason: String },

    #[error("No open channel to acknowledge on")]
    ChannelClosed,
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },

    #[error("Payload is not valid UTF-8: {reason}")]
    Utf8 { reason: String },
}

pub type Result<T> = std::result::Result<T, ConsumerError>;

impl From<serde_json::Error> for ConsumerError {
    fn from(err: serde_json::Error) -> Self {
        ConsumerError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for ConsumerError {
    fn from(err: serde_yaml::Error) -> Self {
        ConsumerError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl ConsumerError {
    /// Whether the broker is expected to redeliver work affected by this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::Connection(_) => true,
            ConsumerError::Output(_) => true,
            ConsumerError::Acknowledgment(_) => true,
            ConsumerError::Config(_) => false,
            ConsumerError::Adapter(_) => false,
            ConsumerError::Serialization(_) => false,
            ConsumerError::AlreadyRunning => false,
            ConsumerError::Generic(_) => true,
        }
    }

    /// Short, stable name used as the `kind` field in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsumerError::Config(_) => "ConfigurationError",
            ConsumerError::Connection(_) => "ConnectionError",
            ConsumerError::Adapter(_) => "AdapterError",
            ConsumerError::Output(_) => "OutputError",
            ConsumerError::Acknowledgment(_) => "AcknowledgmentError",
            ConsumerError::Serialization(_) => "SerializationError",
            ConsumerError::AlreadyRunning => "StateError",
            ConsumerError::Generic(_) => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::MissingField {
            field: "uri".to_string(),
        };
        assert_eq!(error.to_string(), "missing required configuration 'uri'");
    }

    #[test]
    fn test_connection_error_display() {
        let error = ConnectionError::RetriesExhausted {
            attempts: 3,
            source: "connection refused".into(),
        };
        assert_eq!(
            error.to_string(),
            "could not connect to broker after 3 attempts: connection refused"
        );
    }

    #[test]
    fn test_output_timeout_display() {
        let error = OutputError::Timeout { after_ms: 250 };
        assert_eq!(error.to_string(), "Batch output timed out after 250ms");
    }

    #[test]
    fn test_consumer_error_from_config_error() {
        let config_error = ConfigError::ValidationFailed {
            reason: "Test validation".to_string(),
        };
        let consumer_error = ConsumerError::from(config_error);

        match consumer_error {
            ConsumerError::Config(ConfigError::ValidationFailed { reason }) => {
                assert_eq!(reason, "Test validation");
            }
            _ => panic!("Expected Config error"),
        }
    }

    #[test]
    fn test_consumer_error_from_serde_json_error() {
        let json_str = r#"{"invalid": json}"#;
        let json_error = serde_json::from_str::<serde_json::Value>(json_str).unwrap_err();
        let consumer_error = ConsumerError::from(json_error);

        match consumer_error {
            ConsumerError::Serialization(SerializationError::Json { .. }) => {}
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_consumer_error_from_serde_yaml_error() {
        let yaml_str = r#"
invalid yaml content:
  - missing quotes
  - "improper: structure
"#;
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>(yaml_str).unwrap_err();
        let consumer_error = ConsumerError::from(yaml_error);

        match consumer_error {
            ConsumerError::Serialization(SerializationError::Yaml { .. }) => {}
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_is_retryable() {
        let retryable_errors = vec![
            ConsumerError::Connection(ConnectionError::NotConnected),
            ConsumerError::Output(OutputError::Timeout { after_ms: 1 }),
            ConsumerError::Acknowledgment(AcknowledgmentError::ChannelClosed),
        ];
        for error in retryable_errors {
            assert!(error.is_retryable(), "{error} should be retryable");
        }

        let fatal_errors = vec![
            ConsumerError::Config(ConfigError::MissingField {
                field: "queue".to_string(),
            }),
            ConsumerError::Adapter(AdapterError::Rejected(anyhow::anyhow!("bad"))),
            ConsumerError::AlreadyRunning,
        ];
        for error in fatal_errors {
            assert!(!error.is_retryable(), "{error} should not be retryable");
        }
    }

    #[test]
    fn test_kind() {
        let error = ConsumerError::Output(OutputError::Failed(anyhow::anyhow!("db down")));
        assert_eq!(error.kind(), "OutputError");
        assert_eq!(
            ConsumerError::Adapter(AdapterError::Decode(anyhow::anyhow!("x"))).kind(),
            "AdapterError"
        );
    }

    #[test]
    fn test_panicked_errors() {
        let adapter = ConsumerError::Adapter(AdapterError::Panicked {
            stage: "adapter",
            reason: "boom".to_string(),
        });
        assert_eq!(adapter.kind(), "AdapterError");
        assert!(adapter.to_string().contains("Message adapter panicked: boom"));

        let output = ConsumerError::Output(OutputError::Panicked {
            reason: "boom".to_string(),
        });
        assert_eq!(output.kind(), "OutputError");
        assert!(output.is_retryable());
    }
}
