//! Tool spans opened on an invocation input and closed on the matching observation
//!
//! Each tool kind owns one slot in the registry. An observation without a parked
//! input gets a fallback parent so its result is never dropped.

use serde_json::json;
use tracing::{debug, warn};

use super::BuildScope;
use crate::classifier::CorrelationId;
use crate::error::Result;
use crate::models::{
    ActionGroupInvocationInput, ActionGroupInvocationOutput, AttrKey, Attributes,
    CodeInterpreterInvocationInput, CodeInterpreterInvocationOutput, KnowledgeBaseLookupInput,
    KnowledgeBaseLookupOutput, OperationKind, SpanKind, Status, TraceEvent,
};
use crate::registry::ToolSlot;
use crate::timing::TimedOperation;
use crate::tracer::SpanHandle;

/// Placeholder used where a tool span has no meaningful prompt or completion
pub const NOT_APPLICABLE: &str = "NotApplicable";

const CODE_INTERPRETER: &str = "CodeInterpreter";
const CODE_INTERPRETER_DESCRIPTION: &str = "Executes Python code and returns results";

/// Parked span for `slot` and its prompt, or a freshly opened fallback under `parent`
fn parked_or_fallback(
    scope: &mut BuildScope<'_>,
    slot: ToolSlot,
    name: &str,
    parent: SpanHandle,
    fallback: Attributes,
) -> (SpanHandle, Option<String>) {
    if let Some(record) = scope.registry.take_slot(slot) {
        let prompt = record.attribute_str(AttrKey::Prompt).map(str::to_string);
        return (record.handle, prompt);
    }

    warn!(slot = slot.as_str(), "Tool output without a matching input, creating fallback span");
    metrics::counter!("agentspan_fallback_spans_total", "slot" => slot.as_str()).increment(1);
    let handle = scope
        .registry
        .start_span(name, Some(parent), SpanKind::Client, fallback, None);
    (handle, None)
}

/// Open and park a `knowledgeBaseLookupInput` span
pub(crate) fn knowledge_base_input(
    scope: &mut BuildScope<'_>,
    event: &TraceEvent,
    correlation: &CorrelationId,
    parent: SpanHandle,
    input: &KnowledgeBaseLookupInput,
) -> Result<()> {
    let timing = scope.timing.resolve(TimedOperation::KnowledgeBase, event, correlation);
    let query = input.text.as_deref().unwrap_or_default();
    let metadata = json!({
        "knowledge_base_id": input.knowledge_base_id,
        "data_source": input.data_source,
    });

    let mut attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Database)
        .with(AttrKey::RetrievalType, "semantic")
        .with(AttrKey::RequestModel, scope.request_model())
        .with(AttrKey::TraceType, "KNOWLEDGE_BASE_LOOKUP")
        .with(AttrKey::CorrelationId, correlation.as_str())
        .with(AttrKey::Prompt, query)
        .with(AttrKey::Query, query)
        .with(AttrKey::KbQueryText, query)
        .with_non_empty(AttrKey::KnowledgeBaseId, input.knowledge_base_id.as_deref())
        .with_non_empty(AttrKey::KbDataSource, input.data_source.as_deref())
        .with(AttrKey::Metadata, serde_json::to_string(&metadata)?);
    if let Some(filters) = &input.filters {
        attributes.insert(AttrKey::KbFilters, serde_json::to_string(filters)?);
    }
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }

    let handle = scope.registry.start_span(
        "knowledgeBaseLookupInput",
        Some(parent),
        SpanKind::Client,
        attributes.clone(),
        Some(timing.start),
    );
    scope
        .registry
        .open_slot(ToolSlot::KnowledgeBase, handle, attributes);
    debug!(correlation_id = %correlation, "Knowledge base lookup started");
    Ok(())
}

/// Close the parked lookup with a `knowledgeBaseLookupOutput` child
pub(crate) fn knowledge_base_output(
    scope: &mut BuildScope<'_>,
    correlation: &CorrelationId,
    parent: SpanHandle,
    output: &KnowledgeBaseLookupOutput,
) -> Result<()> {
    let fallback = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Database)
        .with(AttrKey::TraceType, "KNOWLEDGE_BASE_LOOKUP")
        .with(AttrKey::CorrelationId, correlation.as_str())
        .with(AttrKey::RequestModel, scope.request_model());
    let (lookup, prompt) = parked_or_fallback(
        scope,
        ToolSlot::KnowledgeBase,
        "knowledgeBaseLookupInput",
        parent,
        fallback,
    );

    let references = output.retrieved_references.as_deref().unwrap_or_default();
    let total_tokens = output.total_tokens.unwrap_or_default();
    let attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Database)
        .with(AttrKey::TraceType, "KNOWLEDGE_BASE_RESULT")
        .with(AttrKey::RequestModel, scope.request_model())
        .with(AttrKey::Prompt, prompt.unwrap_or_default())
        .with(AttrKey::Completion, serde_json::to_string(references)?)
        .with(AttrKey::ResultCount, references.len())
        .with(AttrKey::KbTotalTokens, total_tokens);

    let result = scope.registry.start_span(
        "knowledgeBaseLookupOutput",
        Some(lookup),
        SpanKind::Client,
        attributes,
        None,
    );
    scope.registry.end_span(result, Status::ok());

    scope.registry.annotate(lookup, AttrKey::KbResultCount, references.len());
    scope.registry.annotate(lookup, AttrKey::KbTotalTokens, total_tokens);
    scope.registry.end_span(lookup, Status::ok());
    debug!(correlation_id = %correlation, results = references.len(), "Knowledge base lookup finished");
    Ok(())
}

/// Open and park an `action_group` span
pub(crate) fn action_group_input(
    scope: &mut BuildScope<'_>,
    event: &TraceEvent,
    correlation: &CorrelationId,
    parent: SpanHandle,
    input: &ActionGroupInvocationInput,
) -> Result<()> {
    let timing = scope.timing.resolve(TimedOperation::ActionGroup, event, correlation);
    let parameters = input.parameters.clone().unwrap_or_else(|| json!({}));
    let parameters = serde_json::to_string(&parameters)?;
    let metadata = json!({
        "api_path": input.api_path,
        "verb": input.verb,
        "api_schema": input.api_schema,
        "execution_type": input.execution_type,
    });

    let mut attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Tool)
        .with(AttrKey::CorrelationId, correlation.as_str())
        .with(
            AttrKey::TraceType,
            input.execution_type.as_deref().unwrap_or("ACTION_GROUP"),
        )
        .with(AttrKey::RequestModel, scope.request_model())
        .with_non_empty(AttrKey::ToolActionGroup, input.action_group_name.as_deref())
        .with_non_empty(AttrKey::ToolFunction, input.function.as_deref())
        .with(AttrKey::ToolParameters, parameters.as_str())
        .with(AttrKey::Metadata, serde_json::to_string(&metadata)?)
        .with(AttrKey::Prompt, parameters.as_str())
        .with(AttrKey::Completion, NOT_APPLICABLE);
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }

    let handle = scope.registry.start_span(
        "action_group",
        Some(parent),
        SpanKind::Client,
        attributes.clone(),
        Some(timing.start),
    );
    scope
        .registry
        .open_slot(ToolSlot::ActionGroup, handle, attributes);
    debug!(
        correlation_id = %correlation,
        action_group = input.action_group_name.as_deref().unwrap_or_default(),
        "Action group call started"
    );
    Ok(())
}

/// Close the parked action span with an `action_result` child
pub(crate) fn action_group_output(
    scope: &mut BuildScope<'_>,
    correlation: &CorrelationId,
    parent: SpanHandle,
    output: &ActionGroupInvocationOutput,
) -> Result<()> {
    let fallback = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Tool)
        .with(AttrKey::TraceType, "ACTION_GROUP")
        .with(AttrKey::CorrelationId, correlation.as_str())
        .with(AttrKey::RequestModel, scope.request_model());
    let (action, _) =
        parked_or_fallback(scope, ToolSlot::ActionGroup, "action_group", parent, fallback);

    let attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Tool)
        .with(AttrKey::TraceType, "ACTION_RESULT")
        .with(AttrKey::Prompt, NOT_APPLICABLE)
        .with(AttrKey::Completion, output.text.as_deref().unwrap_or_default());
    let result =
        scope
            .registry
            .start_span("action_result", Some(action), SpanKind::Client, attributes, None);
    scope.registry.end_span(result, Status::ok());
    scope.registry.end_span(action, Status::ok());
    debug!(correlation_id = %correlation, "Action group call finished");
    Ok(())
}

/// Open and park a `CodeInterpreter` span
pub(crate) fn code_interpreter_input(
    scope: &mut BuildScope<'_>,
    event: &TraceEvent,
    correlation: &CorrelationId,
    parent: SpanHandle,
    input: &CodeInterpreterInvocationInput,
) -> Result<()> {
    let timing = scope
        .timing
        .resolve(TimedOperation::CodeInterpreter, event, correlation);
    let code = input.code.as_deref().unwrap_or_default();
    let arguments = json!({ "code": code, "language": "python" });

    let mut attributes = code_interpreter_attributes(scope, correlation)
        .with(AttrKey::ToolCallArguments, serde_json::to_string(&arguments)?)
        .with(AttrKey::Prompt, code)
        .with(AttrKey::Code, code);
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }

    let handle = scope.registry.start_span(
        CODE_INTERPRETER,
        Some(parent),
        SpanKind::Client,
        attributes.clone(),
        Some(timing.start),
    );
    scope
        .registry
        .open_slot(ToolSlot::CodeInterpreter, handle, attributes);
    debug!(correlation_id = %correlation, "Code interpreter run started");
    Ok(())
}

/// Close the parked code span with a `code_interpreter_result` child
pub(crate) fn code_interpreter_output(
    scope: &mut BuildScope<'_>,
    correlation: &CorrelationId,
    parent: SpanHandle,
    output: &CodeInterpreterInvocationOutput,
) -> Result<()> {
    let fallback = code_interpreter_attributes(scope, correlation);
    let (run, _) = parked_or_fallback(
        scope,
        ToolSlot::CodeInterpreter,
        CODE_INTERPRETER,
        parent,
        fallback,
    );

    let result_text = output.execution_output.as_deref().unwrap_or_default();
    let attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Tool)
        .with(AttrKey::TraceType, "CODE_INTERPRETER_RESULT")
        .with(AttrKey::Output, result_text)
        .with(AttrKey::Result, result_text)
        .with_non_empty(AttrKey::ExecutionStatus, output.execution_status.as_deref())
        .with_non_empty(AttrKey::ExecutionError, output.error_message.as_deref());

    scope.registry.annotate(run, AttrKey::Result, result_text);
    if let Some(status) = &output.execution_status {
        scope.registry.annotate(run, AttrKey::ExecutionStatus, status);
    }
    if let Some(error) = output.error_message.as_deref().filter(|e| !e.is_empty()) {
        scope.registry.annotate(run, AttrKey::ExecutionError, error);
    }

    let result = scope.registry.start_span(
        "code_interpreter_result",
        Some(run),
        SpanKind::Client,
        attributes,
        None,
    );
    scope.registry.end_span(result, Status::ok());
    scope.registry.end_span(run, Status::ok());
    debug!(
        correlation_id = %correlation,
        status = output.execution_status.as_deref().unwrap_or_default(),
        "Code interpreter run finished"
    );
    Ok(())
}

fn code_interpreter_attributes(scope: &BuildScope<'_>, correlation: &CorrelationId) -> Attributes {
    Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Tool)
        .with(AttrKey::ToolName, CODE_INTERPRETER)
        .with(AttrKey::ToolDescription, CODE_INTERPRETER_DESCRIPTION)
        .with(AttrKey::CorrelationId, correlation.as_str())
        .with(AttrKey::RequestModel, scope.request_model())
        .with(AttrKey::SpanName, CODE_INTERPRETER)
}
