//! Closed attribute schema shared by every span builder
//!
//! Attribute keys are an enum rather than free strings so that two builders can
//! never drift apart on the spelling of the same key. Indexed keys (per-file and
//! per-assessment details) carry their index as data.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Value of a span attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Boolean flag
    Bool(bool),
    /// Signed integer (token counts, sizes)
    Int(i64),
    /// Floating point (durations)
    Float(f64),
    /// Text, including JSON-serialized sub-objects
    Str(String),
}

impl AttrValue {
    /// Borrow the value as a string slice if it is text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value, if this is an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Boolean value, if this is a flag
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric value as f64 (integers are widened)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    fn is_empty_str(&self) -> bool {
        matches!(self, Self::Str(s) if s.is_empty())
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for AttrValue {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&String> for AttrValue {
    fn from(v: &String) -> Self {
        Self::Str(v.clone())
    }
}

impl From<OperationKind> for AttrValue {
    fn from(v: OperationKind) -> Self {
        Self::Str(v.as_str().to_string())
    }
}

/// Value of `gen_ai.operation.name`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Invocation root
    Agent,
    /// A reasoning or processing step
    Task,
    /// Tool execution (action group, code interpreter, ask-user)
    Tool,
    /// Knowledge-base retrieval
    Database,
    /// Guardrail evaluation
    Guardrail,
    /// Attached file handling
    FileOperation,
}

impl OperationKind {
    /// Wire form of the operation kind
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Task => "task",
            Self::Tool => "tool",
            Self::Database => "database",
            Self::Guardrail => "guardrail",
            Self::FileOperation => "file_operation",
        }
    }
}

/// Guardrail policy families reported in assessments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Policy {
    /// `contentPolicy`
    Content,
    /// `topicPolicy`
    Topic,
    /// `wordPolicy`
    Word,
    /// `sensitiveInformationPolicy`
    SensitiveInformation,
}

impl Policy {
    /// All policies, in reporting order
    pub const ALL: [Policy; 4] = [
        Policy::Content,
        Policy::Topic,
        Policy::Word,
        Policy::SensitiveInformation,
    ];

    /// Field name inside an assessment object
    pub fn field(self) -> &'static str {
        match self {
            Self::Content => "contentPolicy",
            Self::Topic => "topicPolicy",
            Self::Word => "wordPolicy",
            Self::SensitiveInformation => "sensitiveInformationPolicy",
        }
    }

    fn attr_suffix(self) -> &'static str {
        match self {
            Self::Content => "content_policy",
            Self::Topic => "topic_policy",
            Self::Word => "word_policy",
            Self::SensitiveInformation => "sensitive_info_policy",
        }
    }
}

/// Per-file detail fields
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileField {
    Name,
    Type,
    Size,
    Metadata,
    ContentType,
    ContentSize,
}

impl FileField {
    fn attr_suffix(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Type => "type",
            Self::Size => "size",
            Self::Metadata => "metadata",
            Self::ContentType => "content_type",
            Self::ContentSize => "content_size",
        }
    }
}

/// Every attribute key a span may carry
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttrKey {
    // Generic span description
    OperationName,
    TraceType,
    TracePart,
    TraceSequence,
    CorrelationId,
    SpanName,
    SpanStartTime,
    SpanEndTime,
    SpanDuration,
    StreamMode,
    MetadataStreaming,

    // Model invocation
    LlmSystem,
    RequestModel,
    Prompt,
    Completion,
    InputTokens,
    OutputTokens,
    TotalTokens,
    ModelInputText,
    ModelInputType,
    InferenceConfiguration,
    ModelOutput,
    Output,
    Result,
    Metadata,
    UsageInputTokens,
    UsageOutputTokens,
    ParsedResponse,
    ParsedRationale,
    RawResponse,
    IsValid,
    FinalResponse,
    ResponseMetadata,

    // Rationale
    RationaleStandalone,
    HasLlmParent,
    IsOrphaned,

    // Knowledge base
    RetrievalType,
    Query,
    KnowledgeBaseId,
    KbQueryText,
    KbDataSource,
    KbFilters,
    KbResultCount,
    KbTotalTokens,
    ResultCount,

    // Tools
    ToolName,
    ToolDescription,
    ToolType,
    ToolActionGroup,
    ToolFunction,
    ToolParameters,
    ToolCallArguments,
    Code,
    ExecutionStatus,
    ExecutionError,
    AskUserMetadata,

    // Guardrails
    GuardrailType,
    GuardrailAction,
    GuardrailIntervention,
    GuardrailBaseTraceId,
    GuardrailStreaming,
    GuardrailChunkCount,
    GuardrailChunksReceived,
    GuardrailAssessments,
    GuardrailOutputAssessments,
    GuardrailAssessmentsCount,
    GuardrailBlockedItems,
    PolicyDetail(Policy),
    AssessmentPolicy { index: usize, policy: Policy },

    // Failures
    ErrorMessage,
    ErrorType,
    FailureReason,
    FailureStep,

    // Files
    FileCount,
    FileTypes,
    File { index: usize, field: FileField },

    // Invocation root
    AgentId,
    AgentAliasId,
    SessionId,
    UserId,
    CustomTraceId,
    CustomTags,
    InvokeStartedTime,
    InvokeCompleteTime,
    InvokeDuration,
    ProcessingStartTime,
    ProcessingEndTime,
    ProcessingDuration,
    TracesWindow,
    DurationMs,
    Streaming,
    StreamingStartTime,
    StreamingEndTime,
    StreamingComplete,
    StreamingTotalChunks,
    StreamingChunksReceived,
}

impl AttrKey {
    /// Exported attribute name
    pub fn as_key(&self) -> Cow<'static, str> {
        let key = match self {
            Self::OperationName => "gen_ai.operation.name",
            Self::TraceType => "trace.type",
            Self::TracePart => "trace.part",
            Self::TraceSequence => "trace.sequence",
            Self::CorrelationId => "trace.id",
            Self::SpanName => "span.name",
            Self::SpanStartTime => "span.start_time",
            Self::SpanEndTime => "span.end_time",
            Self::SpanDuration => "span.duration_ms",
            Self::StreamMode => "stream_mode",
            Self::MetadataStreaming => "metadata.streaming",

            Self::LlmSystem => "gen_ai.system",
            Self::RequestModel => "gen_ai.request.model",
            Self::Prompt => "gen_ai.prompt",
            Self::Completion => "gen_ai.completion",
            Self::InputTokens => "gen_ai.usage.input_tokens",
            Self::OutputTokens => "gen_ai.usage.output_tokens",
            Self::TotalTokens => "gen_ai.usage.total_tokens",
            Self::ModelInputText => "model.input.text",
            Self::ModelInputType => "model.input.type",
            Self::InferenceConfiguration => "model.input.inference_configuration",
            Self::ModelOutput => "model.output",
            Self::Output => "output",
            Self::Result => "result",
            Self::Metadata => "metadata",
            Self::UsageInputTokens => "usage.inputTokens",
            Self::UsageOutputTokens => "usage.outputTokens",
            Self::ParsedResponse => "parsedResponse",
            Self::ParsedRationale => "parsedResponse.rationale",
            Self::RawResponse => "rawResponse",
            Self::IsValid => "isValid",
            Self::FinalResponse => "final_response",
            Self::ResponseMetadata => "response.metadata",

            Self::RationaleStandalone => "rationale.standalone",
            Self::HasLlmParent => "has_llm_parent",
            Self::IsOrphaned => "is_orphaned",

            Self::RetrievalType => "retrieval.type",
            Self::Query => "query",
            Self::KnowledgeBaseId => "knowledge_base_id",
            Self::KbQueryText => "kb.query.text",
            Self::KbDataSource => "kb.data_source",
            Self::KbFilters => "kb.filters",
            Self::KbResultCount => "kb.result_count",
            Self::KbTotalTokens => "kb.total_tokens",
            Self::ResultCount => "result_count",

            Self::ToolName => "tool.name",
            Self::ToolDescription => "tool.description",
            Self::ToolType => "tool_type",
            Self::ToolActionGroup => "tool.action_group_name",
            Self::ToolFunction => "tool.function",
            Self::ToolParameters => "tool.parameters",
            Self::ToolCallArguments => "gen_ai.tool_calls.0.arguments",
            Self::Code => "code",
            Self::ExecutionStatus => "executionStatus",
            Self::ExecutionError => "errorMessage",
            Self::AskUserMetadata => "ask_user.metadata",

            Self::GuardrailType => "guardrail.type",
            Self::GuardrailAction => "guardrail.action",
            Self::GuardrailIntervention => "guardrail.intervention",
            Self::GuardrailBaseTraceId => "guardrail.base_trace_id",
            Self::GuardrailStreaming => "guardrail.streaming",
            Self::GuardrailChunkCount => "guardrail.chunk_count",
            Self::GuardrailChunksReceived => "guardrail.chunks_received",
            Self::GuardrailAssessments => "guardrail.assessments",
            Self::GuardrailOutputAssessments => "guardrail.output_assessments",
            Self::GuardrailAssessmentsCount => "guardrail.assessments_count",
            Self::GuardrailBlockedItems => "guardrail.blocked_items",
            Self::PolicyDetail(policy) => policy.attr_suffix(),
            Self::AssessmentPolicy { index, policy } => {
                return Cow::Owned(format!("assessment.{index}.{}", policy.attr_suffix()));
            }

            Self::ErrorMessage => "error.message",
            Self::ErrorType => "error.type",
            Self::FailureReason => "failure.reason",
            Self::FailureStep => "failure.step",

            Self::FileCount => "file.count",
            Self::FileTypes => "file.types",
            Self::File { index, field } => {
                return Cow::Owned(format!("file.{index}.{}", field.attr_suffix()));
            }

            Self::AgentId => "agent.id",
            Self::AgentAliasId => "agent.alias_id",
            Self::SessionId => "session.id",
            Self::UserId => "user.id",
            Self::CustomTraceId => "custom.trace_id",
            Self::CustomTags => "custom.tags",
            Self::InvokeStartedTime => "invoke_started_time_iso",
            Self::InvokeCompleteTime => "invoke_complete_time_iso",
            Self::InvokeDuration => "invoke_duration_ms",
            Self::ProcessingStartTime => "processing_start_time_iso",
            Self::ProcessingEndTime => "processing_end_time_iso",
            Self::ProcessingDuration => "processing_duration_ms",
            Self::TracesWindow => "traces_window_ms",
            Self::DurationMs => "duration_ms",
            Self::Streaming => "streaming",
            Self::StreamingStartTime => "streaming.start_time",
            Self::StreamingEndTime => "streaming.end_time",
            Self::StreamingComplete => "streaming.complete",
            Self::StreamingTotalChunks => "streaming.total_chunks",
            Self::StreamingChunksReceived => "streaming.chunks_received",
        };
        Cow::Borrowed(key)
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// Ordered list of attributes passed to span creation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(Vec<(AttrKey, AttrValue)>);

impl Attributes {
    /// Empty attribute list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute, replacing an earlier value for the same key
    pub fn with(mut self, key: AttrKey, value: impl Into<AttrValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add an attribute only when a value is present and not an empty string
    pub fn with_non_empty(mut self, key: AttrKey, value: Option<impl Into<AttrValue>>) -> Self {
        if let Some(value) = value {
            let value = value.into();
            if !value.is_empty_str() {
                self.insert(key, value);
            }
        }
        self
    }

    /// Insert or replace an attribute
    pub fn insert(&mut self, key: AttrKey, value: impl Into<AttrValue>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// Look up an attribute
    pub fn get(&self, key: AttrKey) -> Option<&AttrValue> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Look up a text attribute
    pub fn get_str(&self, key: AttrKey) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &(AttrKey, AttrValue)> {
        self.0.iter()
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for Attributes {
    type Item = (AttrKey, AttrValue);
    type IntoIter = std::vec::IntoIter<(AttrKey, AttrValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn indexed_keys_render_with_index() {
        let key = AttrKey::AssessmentPolicy {
            index: 2,
            policy: Policy::SensitiveInformation,
        };
        assert_eq!(key.as_key(), "assessment.2.sensitive_info_policy");

        let key = AttrKey::File {
            index: 0,
            field: FileField::ContentSize,
        };
        assert_eq!(key.as_key(), "file.0.content_size");
    }

    #[test]
    fn with_replaces_existing_key() {
        let attrs = Attributes::new()
            .with(AttrKey::Prompt, "first")
            .with(AttrKey::Prompt, "second");
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get_str(AttrKey::Prompt), Some("second"));
    }

    #[test]
    fn with_non_empty_skips_missing_and_blank_values() {
        let attrs = Attributes::new()
            .with_non_empty(AttrKey::ModelInputText, Some(""))
            .with_non_empty(AttrKey::ModelOutput, None::<String>)
            .with_non_empty(AttrKey::Code, Some("print(1)"));
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get_str(AttrKey::Code), Some("print(1)"));
    }
}
