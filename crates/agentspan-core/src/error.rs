//! Error types for AgentSpan

use thiserror::Error;

/// Result type alias using AgentSpan's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for AgentSpan operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A trace event did not have the shape its component requires
    #[error("Malformed {component} event: {reason}")]
    MalformedEvent {
        /// Component the event was classified as
        component: String,
        /// What was missing or wrong
        reason: String,
    },

    /// The wrapped agent call or its response stream failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// No upstream item arrived before the configured read deadline
    #[error("Stream read deadline of {0:?} exceeded")]
    ReadDeadline(std::time::Duration),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a malformed event error
    pub fn malformed(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an upstream error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short machine-readable name of the variant, used as `error.type`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::MalformedEvent { .. } => "MalformedEvent",
            Self::Upstream(_) => "UpstreamError",
            Self::ReadDeadline(_) => "ReadDeadlineExceeded",
            Self::Internal(_) => "InternalError",
            Self::Io(_) => "IoError",
            Self::Serialization(_) => "SerializationError",
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
