//! Typed trace events and response items received from the agent runtime
//!
//! Field names follow the runtime's camelCase wire format. Everything is optional:
//! the runtime omits sub-objects freely and a missing field must never fail
//! deserialization of the whole event.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One item of the raw response stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseItem {
    /// Content delivered to the caller
    Chunk(Chunk),
    /// Execution trace routed to the span builders
    Trace(TraceEvent),
}

impl ResponseItem {
    /// Build a content chunk from text
    pub fn text(text: impl Into<String>) -> Self {
        Self::Chunk(Chunk {
            bytes: ChunkBytes::Text(text.into()),
        })
    }
}

/// A content chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Payload, either already-decoded text or raw UTF-8 bytes
    pub bytes: ChunkBytes,
}

/// Chunk payload as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkBytes {
    /// Text payload
    Text(String),
    /// Raw byte payload
    Raw(Vec<u8>),
}

impl Chunk {
    /// Decoded text; invalid UTF-8 is replaced rather than rejected
    pub fn text(&self) -> Cow<'_, str> {
        match &self.bytes {
            ChunkBytes::Text(s) => Cow::Borrowed(s),
            ChunkBytes::Raw(b) => String::from_utf8_lossy(b),
        }
    }
}

/// One raw envelope from the agent's execution stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    /// Component payload
    #[serde(default)]
    pub trace: TraceEnvelope,

    /// When the runtime says the step happened
    #[serde(default, with = "event_time", skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,

    /// When this process received the event; stamped by the stream adapters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,

    /// Files attached to the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<FilesEvent>,
}

impl TraceEvent {
    /// Wrap an envelope without any timestamps
    pub fn new(trace: TraceEnvelope) -> Self {
        Self {
            trace,
            ..Self::default()
        }
    }

    /// Attach an embedded event time
    #[must_use]
    pub fn at(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }
}

/// The component-specific part of a trace event; normally exactly one field is set
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestration_trace: Option<OrchestrationTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_processing_trace: Option<ModelTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_processing_trace: Option<ModelTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail_trace: Option<GuardrailTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_trace: Option<FailureTrace>,
}

/// Pre- and post-processing payload: a single model call
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_invocation_input: Option<ModelInvocationInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_invocation_output: Option<ModelInvocationOutput>,
}

/// One step of an orchestration round
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_invocation_input: Option<ModelInvocationInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_invocation_output: Option<ModelInvocationOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<Rationale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_input: Option<InvocationInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
}

/// Prompt sent to the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInvocationInput {
    /// Correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Prompt text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Prompt type, e.g. `ORCHESTRATION`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Sampling parameters, passed through as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_configuration: Option<Value>,
}

/// Model response
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInvocationOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<RawResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_response: Option<ParsedResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<OutputMetadata>,
}

impl ModelInvocationOutput {
    /// Raw model text, falling back to the parsed text
    pub fn content(&self) -> Option<&str> {
        match &self.raw_response {
            Some(raw) => raw.content.as_deref(),
            None => self.parsed_response.as_ref().and_then(|p| p.text.as_deref()),
        }
    }

    /// Token usage, if reported
    pub fn usage(&self) -> Option<Usage> {
        self.metadata.as_ref().and_then(|m| m.usage)
    }
}

/// Unparsed model output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    /// Model text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Structured model output; shape depends on the component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResponse {
    /// Preprocessing verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_valid: Option<bool>,
    /// Preprocessing reasoning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Post-processing answer text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Anything else the runtime sent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Output metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputMetadata {
    /// Token usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Anything else the runtime sent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Token usage of one model call
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

impl Usage {
    /// Sum of input and output tokens
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Model reasoning text
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rationale {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Tool request issued by the model
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_base_lookup_input: Option<KnowledgeBaseLookupInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_group_invocation_input: Option<ActionGroupInvocationInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_interpreter_invocation_input: Option<CodeInterpreterInvocationInput>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseLookupInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_base_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionGroupInvocationInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_schema: Option<Value>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeInterpreterInvocationInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

/// Result of a tool request, or the round's final answer
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// `FINISH`, `ASK_USER`, `KNOWLEDGE_BASE`, ...
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_base_lookup_output: Option<KnowledgeBaseLookupOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_group_invocation_output: Option<ActionGroupInvocationOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_interpreter_invocation_output: Option<CodeInterpreterInvocationOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<FinalResponse>,
    #[serde(
        rename = "ask_user_metadata",
        alias = "askUserMetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ask_user_metadata: Option<Value>,
}

impl Observation {
    /// Observation type that marks a clarification question
    pub const ASK_USER: &'static str = "ASK_USER";

    /// Whether the final response is a question back to the user
    pub fn is_ask_user(&self) -> bool {
        self.kind.as_deref() == Some(Self::ASK_USER)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBaseLookupOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieved_references: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionGroupInvocationOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeInterpreterInvocationOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_status: Option<String>,
    #[serde(
        alias = "executionError",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Guardrail evaluation, either on the input (pre) or on the answer (post)
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// `NONE`, `INTERVENED`, `GUARDRAIL_INTERVENED`, `BLOCKED`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_assessments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_assessments: Vec<Value>,
}

impl GuardrailTrace {
    /// Action, or `NONE` when absent
    pub fn action(&self) -> &str {
        self.action.as_deref().unwrap_or("NONE")
    }
}

/// Terminal failure reported by the runtime
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Files attached to a trace event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesEvent {
    /// Attached files
    #[serde(default)]
    pub files: Vec<FileInfo>,
}

/// One attached file
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<FileContent>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

/// `eventTime` accepts RFC 3339, a zone-less timestamp read as UTC, or epoch
/// seconds or milliseconds. Anything else is treated as absent.
mod event_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use tracing::debug;

    /// Epoch values above this are taken to be milliseconds
    const MILLIS_THRESHOLD: i64 = 100_000_000_000;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => serializer.serialize_str(&t.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<Value>::deserialize(deserializer)?;
        let parsed = match &raw {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(text)) => parse_text(text),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(epoch) => from_epoch(epoch),
                None => n.as_f64().and_then(from_epoch_secs_f64),
            },
            Some(_) => None,
        };
        if parsed.is_none() {
            debug!(event_time = ?raw, "Unusable eventTime ignored");
        }
        Ok(parsed)
    }

    fn parse_text(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
            return Some(t.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| naive.and_utc())
    }

    fn from_epoch(epoch: i64) -> Option<DateTime<Utc>> {
        if epoch.abs() > MILLIS_THRESHOLD {
            DateTime::from_timestamp_millis(epoch)
        } else {
            DateTime::from_timestamp(epoch, 0)
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_epoch_secs_f64(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
        DateTime::from_timestamp(whole as i64, nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_orchestration_trace_item() {
        let item: ResponseItem = serde_json::from_value(json!({
            "trace": {
                "agentId": "AGENT1",
                "eventTime": "2024-05-01T10:00:00.250Z",
                "trace": {
                    "orchestrationTrace": {
                        "modelInvocationOutput": {
                            "traceId": "t-1",
                            "rawResponse": {"content": "thinking"},
                            "metadata": {"usage": {"inputTokens": 12, "outputTokens": 3}}
                        }
                    }
                }
            }
        }))
        .unwrap();

        let ResponseItem::Trace(event) = item else {
            panic!("expected a trace item");
        };
        let output = event
            .trace
            .orchestration_trace
            .and_then(|o| o.model_invocation_output)
            .unwrap();
        assert_eq!(output.trace_id.as_deref(), Some("t-1"));
        assert_eq!(output.content(), Some("thinking"));
        assert_eq!(output.usage().map(|u| u.total()), Some(15));
        assert_eq!(
            event.event_time,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(250))
        );
    }

    #[test]
    fn naive_event_time_is_read_as_utc() {
        let event: TraceEvent = serde_json::from_value(json!({
            "trace": {},
            "eventTime": "2024-05-01T10:00:00"
        }))
        .unwrap();
        assert_eq!(
            event.event_time,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn epoch_event_time_is_converted() {
        let seconds: TraceEvent =
            serde_json::from_value(json!({"trace": {}, "eventTime": 1_714_557_600})).unwrap();
        let millis: TraceEvent =
            serde_json::from_value(json!({"trace": {}, "eventTime": 1_714_557_600_250_i64})).unwrap();

        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(seconds.event_time, Some(expected));
        assert_eq!(
            millis.event_time,
            Some(expected + chrono::Duration::milliseconds(250))
        );
    }

    #[test]
    fn unusable_event_time_leaves_event_intact() {
        let garbled: TraceEvent = serde_json::from_value(json!({
            "trace": {"orchestrationTrace": {"rationale": {"traceId": "t-1", "text": "why"}}},
            "eventTime": "yesterday-ish"
        }))
        .unwrap();
        let nested: TraceEvent =
            serde_json::from_value(json!({"trace": {}, "eventTime": {"seconds": 1}})).unwrap();

        assert_eq!(garbled.event_time, None);
        assert!(garbled.trace.orchestration_trace.is_some());
        assert_eq!(nested.event_time, None);
    }

    #[test]
    fn chunk_bytes_accept_text_and_raw() {
        let text: ResponseItem = serde_json::from_value(json!({"chunk": {"bytes": "Hello"}})).unwrap();
        let raw: ResponseItem =
            serde_json::from_value(json!({"chunk": {"bytes": [72, 105]}})).unwrap();

        let ResponseItem::Chunk(text) = text else { panic!("expected chunk") };
        let ResponseItem::Chunk(raw) = raw else { panic!("expected chunk") };
        assert_eq!(text.text(), "Hello");
        assert_eq!(raw.text(), "Hi");
    }

    #[test]
    fn parsed_response_keeps_unknown_fields() {
        let parsed: ParsedResponse =
            serde_json::from_value(json!({"isValid": false, "category": "E"})).unwrap();
        assert_eq!(parsed.is_valid, Some(false));
        assert_eq!(
            serde_json::to_value(&parsed).unwrap(),
            json!({"isValid": false, "category": "E"})
        );
    }

    #[test]
    fn ask_user_observation_is_recognised() {
        let obs: Observation = serde_json::from_value(json!({
            "type": "ASK_USER",
            "finalResponse": {"text": "Which account?"}
        }))
        .unwrap();
        assert!(obs.is_ask_user());
    }
}
