//! Span data model

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attributes::{AttrKey, AttrValue};

/// Status code of a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    /// Operation completed successfully
    Ok,
    /// Operation failed
    Error,
    /// Status not set
    #[default]
    Unset,
}

/// Status with an optional explanatory message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Status {
    /// Status code
    pub code: SpanStatus,
    /// Message, usually only for errors
    pub message: Option<String>,
}

impl Status {
    /// Successful status
    pub fn ok() -> Self {
        Self {
            code: SpanStatus::Ok,
            message: None,
        }
    }

    /// Error status with a message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: SpanStatus::Error,
            message: Some(message.into()),
        }
    }

    /// Error status without a message
    pub fn error_bare() -> Self {
        Self {
            code: SpanStatus::Error,
            message: None,
        }
    }

    /// Whether this is an error status
    pub fn is_error(&self) -> bool {
        self.code == SpanStatus::Error
    }
}

/// Kind of span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// Internal operation
    Internal,
    /// Client-side operation
    #[default]
    Client,
}

/// An event that occurred during a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    /// Event name
    pub name: String,

    /// When the event occurred
    pub timestamp: DateTime<Utc>,

    /// Event attributes
    pub attributes: BTreeMap<String, AttrValue>,
}

impl SpanEvent {
    /// Build an `exception` event the way tracing backends expect it
    pub fn exception(kind: &str, message: &str, timestamp: DateTime<Utc>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert("exception.type".to_string(), AttrValue::from(kind));
        attributes.insert("exception.message".to_string(), AttrValue::from(message));
        Self {
            name: "exception".to_string(),
            timestamp,
            attributes,
        }
    }
}

/// A finished (or still open) span as recorded by a tracer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Span ID (32-char hex)
    pub span_id: String,

    /// Trace ID this span belongs to
    pub trace_id: String,

    /// Parent span ID (if any)
    pub parent_span_id: Option<String>,

    /// Name of the operation
    pub name: String,

    /// Kind of span
    pub span_kind: SpanKind,

    /// When the operation started
    pub started_at: DateTime<Utc>,

    /// When the operation ended (if completed)
    pub ended_at: Option<DateTime<Utc>>,

    /// Duration in milliseconds
    pub duration_ms: Option<f64>,

    /// Status of the operation
    pub status: SpanStatus,

    /// Status message (usually for errors)
    pub status_message: Option<String>,

    /// Attributes keyed by their exported name
    pub attributes: BTreeMap<String, AttrValue>,

    /// Events that occurred during the span
    pub events: Vec<SpanEvent>,
}

impl Span {
    /// Calculate duration from start and end times
    pub fn calculate_duration(&mut self) {
        if let Some(ended_at) = self.ended_at {
            let duration = ended_at - self.started_at;
            self.duration_ms = Some(duration.num_milliseconds() as f64);
        }
    }

    /// Look up an attribute by schema key
    pub fn attribute(&self, key: AttrKey) -> Option<&AttrValue> {
        self.attributes.get(key.as_key().as_ref())
    }

    /// Look up a text attribute by schema key
    pub fn attribute_str(&self, key: AttrKey) -> Option<&str> {
        self.attribute(key).and_then(AttrValue::as_str)
    }

    /// Whether the span has been ended
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Check if this span represents an LLM call
    pub fn is_llm_call(&self) -> bool {
        self.name == "llm"
    }

    /// Get total tokens used
    pub fn total_tokens(&self) -> i64 {
        let tokens = |key| {
            self.attribute(key)
                .and_then(AttrValue::as_i64)
                .unwrap_or(0)
        };
        tokens(AttrKey::InputTokens) + tokens(AttrKey::OutputTokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_span() -> Span {
        let started_at = Utc::now();
        Span {
            span_id: "test-span".to_string(),
            trace_id: "test-trace".to_string(),
            parent_span_id: None,
            name: "llm".to_string(),
            span_kind: SpanKind::Client,
            started_at,
            ended_at: Some(started_at + Duration::milliseconds(250)),
            duration_ms: None,
            status: SpanStatus::Ok,
            status_message: None,
            attributes: BTreeMap::new(),
            events: vec![],
        }
    }

    #[test]
    fn test_calculate_duration() {
        let mut span = create_test_span();
        span.calculate_duration();
        assert_eq!(span.duration_ms, Some(250.0));
    }

    #[test]
    fn test_total_tokens_reads_usage_attributes() {
        let mut span = create_test_span();
        span.attributes.insert(
            AttrKey::InputTokens.as_key().into_owned(),
            AttrValue::Int(120),
        );
        span.attributes.insert(
            AttrKey::OutputTokens.as_key().into_owned(),
            AttrValue::Int(30),
        );
        assert!(span.is_llm_call());
        assert_eq!(span.total_tokens(), 150);
    }

    #[test]
    fn test_error_status_carries_message() {
        let status = Status::error("Content blocked by guardrail");
        assert!(status.is_error());
        assert_eq!(status.message.as_deref(), Some("Content blocked by guardrail"));
        assert!(!Status::ok().is_error());
    }
}
