//! `pre_processing` -> `llm` -> `input_assessment`

use tracing::{debug, warn};

use super::llm::{self, PREPROCESSING};
use super::{BuildScope, HierarchyBuilder};
use crate::classifier::{ComponentType, CorrelationId};
use crate::error::{Error, Result};
use crate::models::{
    AttrKey, Attributes, ModelInvocationOutput, OperationKind, SpanKind, Status, TraceEvent,
};
use crate::registry::SpanKey;
use crate::timing::TimedOperation;

/// Status message of an assessment that rejected the input
pub const INVALID_INPUT: &str = "Invalid input in preprocessing";

/// Builds the preprocessing hierarchy
#[derive(Debug, Default, Clone, Copy)]
pub struct PreprocessingBuilder;

impl HierarchyBuilder for PreprocessingBuilder {
    fn component(&self) -> ComponentType {
        ComponentType::Preprocessing
    }

    fn build(
        &self,
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
    ) -> Result<()> {
        let trace = event
            .trace
            .pre_processing_trace
            .as_ref()
            .ok_or_else(|| Error::malformed("preprocessing", "missing preProcessingTrace"))?;

        let key = SpanKey::new(ComponentType::Preprocessing, correlation.clone());
        let timing = scope.timing.resolve(TimedOperation::Preprocessing, event, correlation);
        let attributes = scope
            .component_attributes("PRE_PROCESSING", correlation)
            .with(AttrKey::LlmSystem, PREPROCESSING.part)
            .with(AttrKey::SpanName, ComponentType::Preprocessing.span_name());
        let root = scope.root_handle();
        scope
            .registry
            .get_or_create(&key, Some(root), attributes, Some(&timing));

        if let Some(input) = &trace.model_invocation_input {
            llm::record_input(scope, &key, &PREPROCESSING, input)?;
        }

        if let Some(output) = &trace.model_invocation_output {
            emit_assessment(scope, &key, event, correlation, output)?;
            scope.registry.set_timing_if_not_set(&key, &timing);
            scope.registry.close(&key, Status::ok());
        }
        Ok(())
    }
}

/// `llm` plus its `input_assessment` child. A rejected input only fails the assessment.
fn emit_assessment(
    scope: &mut BuildScope<'_>,
    key: &SpanKey,
    event: &TraceEvent,
    correlation: &CorrelationId,
    output: &ModelInvocationOutput,
) -> Result<()> {
    let timing = scope
        .timing
        .resolve(PREPROCESSING.llm_timer, event, correlation);
    let llm = llm::open_llm_span(scope, key, &PREPROCESSING, &timing, output)?;

    for (k, v) in llm::usage_attributes(output.usage()) {
        scope.registry.set_attribute(key, k, v);
    }

    let parsed = output.parsed_response.as_ref();
    let is_valid = parsed.and_then(|p| p.is_valid).unwrap_or(true);
    let raw = output.raw_response.as_ref().and_then(|r| r.content.as_deref());

    let mut attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Task)
        .with(AttrKey::TraceType, PREPROCESSING.output_type)
        .with(AttrKey::TracePart, PREPROCESSING.part)
        .with(AttrKey::LlmSystem, PREPROCESSING.output_system)
        .with(AttrKey::RequestModel, scope.request_model())
        .with(AttrKey::IsValid, is_valid)
        .with_non_empty(AttrKey::RawResponse, raw)
        .with_non_empty(AttrKey::Output, raw)
        .with_non_empty(AttrKey::ParsedRationale, parsed.and_then(|p| p.rationale.as_deref()));
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }
    if let Some(metadata) = &output.metadata {
        attributes.insert(AttrKey::Metadata, serde_json::to_string(metadata)?);
    }
    if let Some(usage) = output.usage() {
        attributes.insert(AttrKey::UsageInputTokens, usage.input_tokens);
        attributes.insert(AttrKey::UsageOutputTokens, usage.output_tokens);
    }
    if let Some(parsed) = parsed {
        attributes.insert(AttrKey::ParsedResponse, serde_json::to_string(parsed)?);
    }

    let status = if is_valid {
        Status::ok()
    } else {
        warn!(correlation_id = %correlation, "Preprocessing rejected the input");
        attributes.insert(AttrKey::ErrorMessage, INVALID_INPUT);
        Status::error(INVALID_INPUT)
    };

    let assessment = scope.registry.start_span(
        PREPROCESSING.output_span,
        Some(llm),
        SpanKind::Client,
        attributes,
        Some(timing.start),
    );
    scope.registry.end_span(assessment, status);
    scope.registry.end_span(llm, Status::ok());
    scope.registry.record_llm(correlation.clone(), llm);

    debug!(correlation_id = %correlation, is_valid, "Preprocessing assessed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Harness;
    use super::*;
    use crate::models::{AttrValue, SpanStatus};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn input_then_output_builds_three_levels() {
        let mut h = Harness::new();
        h.build(
            json!({"preProcessingTrace": {"modelInvocationInput": {"traceId": "p-1", "text": "classify this"}}}),
            "p-1",
        );
        h.build(
            json!({"preProcessingTrace": {"modelInvocationOutput": {
                "traceId": "p-1",
                "rawResponse": {"content": "<category>E</category>"},
                "parsedResponse": {"isValid": true, "rationale": "fine"},
                "metadata": {"usage": {"inputTokens": 10, "outputTokens": 4}}
            }}}),
            "p-1",
        );
        h.finish();

        let pre = h.tracer.find("pre_processing").unwrap();
        let llm = h.tracer.find("llm").unwrap();
        let assessment = h.tracer.find("input_assessment").unwrap();
        assert_eq!(llm.parent_span_id.as_deref(), Some(pre.span_id.as_str()));
        assert_eq!(assessment.parent_span_id.as_deref(), Some(llm.span_id.as_str()));
        assert_eq!(pre.status, SpanStatus::Ok);
        assert_eq!(llm.attribute_str(AttrKey::Prompt), Some("classify this"));
        assert_eq!(llm.attribute(AttrKey::TotalTokens), Some(&AttrValue::Int(14)));
        assert_eq!(pre.attribute(AttrKey::InputTokens), Some(&AttrValue::Int(10)));
        assert_eq!(assessment.attribute_str(AttrKey::ParsedRationale), Some("fine"));
    }

    #[test]
    fn invalid_input_fails_only_the_assessment() {
        let mut h = Harness::new();
        h.build(
            json!({"preProcessingTrace": {"modelInvocationOutput": {
                "traceId": "p-2",
                "parsedResponse": {"isValid": false}
            }}}),
            "p-2",
        );
        h.finish();

        let assessment = h.tracer.find("input_assessment").unwrap();
        assert_eq!(assessment.status, SpanStatus::Error);
        assert_eq!(assessment.status_message.as_deref(), Some(INVALID_INPUT));
        assert_eq!(assessment.attribute(AttrKey::IsValid), Some(&AttrValue::Bool(false)));
        let pre = h.tracer.find("pre_processing").unwrap();
        assert_eq!(pre.status, SpanStatus::Ok);
        assert_eq!(pre.status_message, None);
    }
}
