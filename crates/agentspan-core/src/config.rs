//! Configuration management for AgentSpan

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable prefix, e.g. `AGENTSPAN__LOGGING__LEVEL=debug`
pub const ENV_PREFIX: &str = "AGENTSPAN";

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Span construction settings
    pub instrumentation: InstrumentationConfig,

    /// Streaming adapter settings
    pub streaming: StreamingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from defaults, an optional file, then the environment.
    ///
    /// A missing file is an error only when a path was given explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Span construction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// `service.name` of the exported resource
    pub service_name: String,
    /// OTLP/HTTP traces endpoint used when spans are exported
    pub otlp_endpoint: String,
    /// Model name used when neither the request nor the root span carries one
    pub default_model: String,
    /// Value of `gen_ai.system` on model-invocation spans
    pub llm_system: String,
    /// Maximum number of merged guardrail assessments detailed on the assessment span
    pub assessment_detail_limit: usize,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            service_name: "bedrock-agent".to_string(),
            otlp_endpoint: "http://localhost:4318/v1/traces".to_string(),
            default_model: "Not-Configured".to_string(),
            llm_system: "aws.bedrock".to_string(),
            assessment_detail_limit: 3,
        }
    }
}

/// Streaming adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Refresh `streaming.chunks_received` on the root span every N content chunks
    pub progress_interval: usize,
    /// Maximum wait for the next upstream item (async adapter only)
    #[serde(with = "humantime_serde")]
    pub read_deadline: Option<Duration>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            progress_interval: 10,
            read_deadline: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.instrumentation.default_model, "Not-Configured");
        assert_eq!(config.instrumentation.assessment_detail_limit, 3);
        assert_eq!(config.streaming.progress_interval, 10);
        assert!(config.streaming.read_deadline.is_none());
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn loads_partial_toml_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[streaming]\nread_deadline = \"250ms\"\n\n[instrumentation]\nservice_name = \"support-bot\""
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.instrumentation.service_name, "support-bot");
        assert_eq!(config.instrumentation.llm_system, "aws.bedrock");
        assert_eq!(
            config.streaming.read_deadline,
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.streaming.progress_interval, 10);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/agentspan.toml")));
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }
}
