//! Model invocation spans shared by the three model-driven components

use tracing::debug;

use super::BuildScope;
use crate::classifier::CorrelationId;
use crate::error::{Error, Result};
use crate::models::{
    AttrKey, Attributes, ModelInvocationInput, ModelInvocationOutput, OperationKind, SpanKind,
    Status, TraceEvent, Usage,
};
use crate::registry::SpanKey;
use crate::timing::{TimedOperation, Timing};
use crate::tracer::SpanHandle;

/// Phase-specific naming of a model output
pub(crate) struct ModelPhase {
    /// Value of `trace.part`
    pub part: &'static str,
    /// Timer of the llm span
    pub llm_timer: TimedOperation,
    /// Name of the output child under the llm span
    pub output_span: &'static str,
    /// Value of `gen_ai.system` on the output child
    pub output_system: &'static str,
    /// Value of `trace.type` on the output child
    pub output_type: &'static str,
    /// Default `model.input.type`
    pub input_type: &'static str,
}

pub(crate) const PREPROCESSING: ModelPhase = ModelPhase {
    part: "preprocessing",
    llm_timer: TimedOperation::PreprocessingLlm,
    output_span: "input_assessment",
    output_system: "bedrock-preprocessing",
    output_type: "PRE_PROCESSING_MODEL_OUTPUT",
    input_type: "PRE_PROCESSING",
};

pub(crate) const ORCHESTRATION: ModelPhase = ModelPhase {
    part: "orchestration",
    llm_timer: TimedOperation::OrchestrationLlm,
    output_span: "OrchestrationModelInvocationOutput",
    output_system: "bedrock-orchestration",
    output_type: "ORCHESTRATION_MODEL_OUTPUT",
    input_type: "ORCHESTRATION",
};

pub(crate) const POST_PROCESSING: ModelPhase = ModelPhase {
    part: "postprocessing",
    llm_timer: TimedOperation::PostProcessingLlm,
    output_span: "PostProcessingModelInvocationOutput",
    output_system: "bedrock-postprocessing",
    output_type: "POSTPROCESSING_MODEL_OUTPUT",
    input_type: "POST_PROCESSING",
};

/// Copy a model input onto its component span
pub(crate) fn record_input(
    scope: &mut BuildScope<'_>,
    key: &SpanKey,
    phase: &ModelPhase,
    input: &ModelInvocationInput,
) -> Result<()> {
    let text = input.text.as_deref().unwrap_or_default();
    if !text.is_empty() {
        scope.registry.set_attribute(key, AttrKey::ModelInputText, text);
    }
    scope.registry.set_attribute(
        key,
        AttrKey::ModelInputType,
        input.kind.as_deref().unwrap_or(phase.input_type),
    );
    scope.registry.set_attribute(key, AttrKey::Prompt, text);
    if let Some(config) = &input.inference_configuration {
        scope
            .registry
            .set_attribute(key, AttrKey::InferenceConfiguration, serde_json::to_string(config)?);
    }
    debug!(span_key = %key, "Model input recorded");
    Ok(())
}

/// Token usage attributes in `gen_ai.usage.*` form
pub(crate) fn usage_attributes(usage: Option<Usage>) -> Attributes {
    match usage {
        Some(usage) => Attributes::new()
            .with(AttrKey::InputTokens, usage.input_tokens)
            .with(AttrKey::OutputTokens, usage.output_tokens)
            .with(AttrKey::TotalTokens, usage.total()),
        None => Attributes::new(),
    }
}

/// Open the `llm` span for a model output under its component span.
///
/// The prompt is taken from the component span, which received it with the input.
pub(crate) fn open_llm_span(
    scope: &mut BuildScope<'_>,
    key: &SpanKey,
    phase: &ModelPhase,
    timing: &Timing,
    output: &ModelInvocationOutput,
) -> Result<SpanHandle> {
    let parent = scope
        .registry
        .get(key)
        .map(|r| r.handle)
        .ok_or_else(|| Error::internal(format!("no live span for {key}")))?;
    let prompt = scope
        .registry
        .get(key)
        .and_then(|r| r.attribute_str(AttrKey::Prompt))
        .unwrap_or_default()
        .to_string();

    let mut attributes = Attributes::new()
        .with(AttrKey::LlmSystem, scope.config.llm_system.as_str())
        .with(AttrKey::RequestModel, scope.request_model())
        .with(AttrKey::Prompt, prompt)
        .with(AttrKey::TracePart, phase.part)
        .with(AttrKey::SpanName, format!("{}_llm", phase.part))
        .with_non_empty(AttrKey::Completion, output.content());
    for (k, v) in usage_attributes(output.usage()) {
        attributes.insert(k, v);
    }
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }

    if let Some(content) = output.content() {
        scope.registry.set_attribute(key, AttrKey::ModelOutput, content);
    }

    Ok(scope
        .registry
        .start_span("llm", Some(parent), SpanKind::Client, attributes, Some(timing.start)))
}

/// Emit `llm` and its output child for orchestration or post-processing.
///
/// Returns the llm handle, already ended, so a rationale can still be parented to it.
pub(crate) fn emit_model_output(
    scope: &mut BuildScope<'_>,
    key: &SpanKey,
    phase: &ModelPhase,
    event: &TraceEvent,
    correlation: &CorrelationId,
    output: &ModelInvocationOutput,
) -> Result<SpanHandle> {
    let timing = scope.timing.resolve(phase.llm_timer, event, correlation);
    let llm = open_llm_span(scope, key, phase, &timing, output)?;

    let prompt = scope
        .registry
        .attribute(key, AttrKey::Prompt)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let raw = output.raw_response.as_ref().and_then(|r| r.content.as_deref());
    let usage = output.usage();

    let mut attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Task)
        .with(AttrKey::TraceType, phase.output_type)
        .with(AttrKey::TracePart, phase.part)
        .with(AttrKey::LlmSystem, phase.output_system)
        .with(AttrKey::RequestModel, scope.request_model())
        .with(AttrKey::SpanName, format!("{}_output", phase.part))
        .with(AttrKey::Prompt, prompt)
        .with_non_empty(AttrKey::Completion, output.content())
        .with_non_empty(AttrKey::Output, raw);
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }
    if let Some(metadata) = &output.metadata {
        attributes.insert(AttrKey::Metadata, serde_json::to_string(metadata)?);
    }
    if let Some(usage) = usage {
        attributes.insert(AttrKey::UsageInputTokens, usage.input_tokens);
        attributes.insert(AttrKey::UsageOutputTokens, usage.output_tokens);
    }
    if let Some(parsed) = &output.parsed_response {
        attributes.insert(AttrKey::ParsedResponse, serde_json::to_string(parsed)?);
    }

    let parsed_text = output
        .parsed_response
        .as_ref()
        .and_then(|p| p.text.as_deref())
        .filter(|t| !t.is_empty());
    if phase.part == POST_PROCESSING.part {
        if let Some(text) = parsed_text {
            attributes.insert(AttrKey::Result, text);
            scope.registry.annotate(llm, AttrKey::Result, text);
            scope.registry.set_attribute(key, AttrKey::Result, text);
        }
    }

    let child = scope.registry.start_span(
        phase.output_span,
        Some(llm),
        SpanKind::Client,
        attributes,
        Some(timing.start),
    );
    scope.registry.end_span(child, Status::ok());
    scope.registry.end_span(llm, Status::ok());
    scope.registry.record_llm(correlation.clone(), llm);

    debug!(
        component = %key.component,
        correlation_id = %correlation,
        input_tokens = usage.map(|u| u.input_tokens),
        output_tokens = usage.map(|u| u.output_tokens),
        "Model output recorded"
    );
    Ok(llm)
}

