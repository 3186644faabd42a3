//! Orchestration rounds: model call, rationale, tools, final answer

use serde_json::json;
use tracing::{debug, info};

use super::llm::{self, ORCHESTRATION};
use super::tools::{self, NOT_APPLICABLE};
use super::{BuildScope, HierarchyBuilder};
use crate::classifier::{ComponentType, CorrelationId};
use crate::error::{Error, Result};
use crate::models::{
    AttrKey, Attributes, FinalResponse, Observation, OperationKind, Rationale, SpanKind, Status,
    TraceEvent,
};
use crate::registry::SpanKey;
use crate::timing::TimedOperation;
use crate::tracer::SpanHandle;

const ASK_USER_DESCRIPTION: &str = "Ask clarification question to the user";

/// Builds the orchestration hierarchy
#[derive(Debug, Default, Clone, Copy)]
pub struct OrchestrationBuilder;

impl HierarchyBuilder for OrchestrationBuilder {
    fn component(&self) -> ComponentType {
        ComponentType::Orchestration
    }

    fn build(
        &self,
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
    ) -> Result<()> {
        let trace = event
            .trace
            .orchestration_trace
            .as_ref()
            .ok_or_else(|| Error::malformed("orchestration", "missing orchestrationTrace"))?;

        let key = SpanKey::new(ComponentType::Orchestration, correlation.clone());
        let timing = scope.timing.resolve(TimedOperation::Orchestration, event, correlation);
        let attributes = scope.component_attributes("ORCHESTRATION", correlation);
        let root = scope.root_handle();
        let span = scope
            .registry
            .get_or_create(&key, Some(root), attributes, Some(&timing));

        if let Some(input) = &trace.model_invocation_input {
            llm::record_input(scope, &key, &ORCHESTRATION, input)?;
        }

        let llm_span = match &trace.model_invocation_output {
            Some(output) => Some(llm::emit_model_output(
                scope,
                &key,
                &ORCHESTRATION,
                event,
                correlation,
                output,
            )?),
            None => None,
        };

        if let Some(rationale) = &trace.rationale {
            emit_rationale(scope, &key, event, correlation, llm_span, rationale)?;
        }

        if let Some(input) = &trace.invocation_input {
            if let Some(kb) = &input.knowledge_base_lookup_input {
                tools::knowledge_base_input(scope, event, correlation, span, kb)?;
            }
            if let Some(action) = &input.action_group_invocation_input {
                tools::action_group_input(scope, event, correlation, span, action)?;
            }
            if let Some(code) = &input.code_interpreter_invocation_input {
                tools::code_interpreter_input(scope, event, correlation, span, code)?;
            }
        }

        if let Some(observation) = &trace.observation {
            if let Some(kb) = &observation.knowledge_base_lookup_output {
                tools::knowledge_base_output(scope, correlation, span, kb)?;
            }
            if let Some(action) = &observation.action_group_invocation_output {
                tools::action_group_output(scope, correlation, span, action)?;
            }
            if let Some(code) = &observation.code_interpreter_invocation_output {
                tools::code_interpreter_output(scope, correlation, span, code)?;
            }
            if let Some(answer) = &observation.final_response {
                if observation.is_ask_user() {
                    emit_ask_user(scope, &key, event, correlation, span, observation, answer)?;
                } else {
                    emit_final_response(scope, &key, event, correlation, span, answer)?;
                }
            }
        }
        Ok(())
    }
}

/// Emit `rationale` under this round's llm span, or standalone under the round
fn emit_rationale(
    scope: &mut BuildScope<'_>,
    key: &SpanKey,
    event: &TraceEvent,
    correlation: &CorrelationId,
    llm_span: Option<SpanHandle>,
    rationale: &Rationale,
) -> Result<()> {
    let llm_parent = llm_span.or_else(|| scope.registry.llm_span(correlation));
    let parent = match llm_parent {
        Some(handle) => handle,
        None => {
            debug!(correlation_id = %correlation, "Rationale without a model output, emitting standalone");
            scope
                .registry
                .set_attribute(key, AttrKey::RationaleStandalone, true);
            scope
                .registry
                .get(key)
                .map(|r| r.handle)
                .ok_or_else(|| Error::internal(format!("no live span for {key}")))?
        }
    };

    let timing = scope.timing.resolve(TimedOperation::Rationale, event, correlation);
    let id = rationale.trace_id.as_deref().unwrap_or(correlation.as_str());
    let mut attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Task)
        .with(AttrKey::TraceType, "REASONING")
        .with(AttrKey::CorrelationId, id)
        .with(AttrKey::HasLlmParent, llm_parent.is_some())
        .with(AttrKey::IsOrphaned, llm_parent.is_none())
        .with(AttrKey::TraceSequence, "post-llm")
        .with(AttrKey::Prompt, NOT_APPLICABLE)
        .with(AttrKey::Completion, rationale.text.as_deref().unwrap_or_default());
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }

    let span = scope.registry.start_span(
        "rationale",
        Some(parent),
        SpanKind::Client,
        attributes,
        Some(timing.start),
    );
    scope.registry.end_span(span, Status::ok());
    Ok(())
}

/// Emit `final_response`, copy the answer upward and close the round
fn emit_final_response(
    scope: &mut BuildScope<'_>,
    key: &SpanKey,
    event: &TraceEvent,
    correlation: &CorrelationId,
    parent: SpanHandle,
    answer: &FinalResponse,
) -> Result<()> {
    let timing = scope.timing.resolve(TimedOperation::FinalResponse, event, correlation);
    let text = answer.text.as_deref().unwrap_or_default();
    let mut attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Task)
        .with(AttrKey::TraceType, "FINAL_RESPONSE")
        .with(AttrKey::TracePart, ORCHESTRATION.part)
        .with(AttrKey::CorrelationId, correlation.as_str())
        .with(AttrKey::Prompt, "")
        .with(AttrKey::Completion, text);
    if let Some(metadata) = &answer.metadata {
        attributes.insert(AttrKey::ResponseMetadata, serde_json::to_string(metadata)?);
    }
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }

    let span = scope.registry.start_span(
        "final_response",
        Some(parent),
        SpanKind::Client,
        attributes,
        Some(timing.start),
    );
    scope.registry.end_span(span, Status::ok());

    scope.registry.set_attribute(key, AttrKey::FinalResponse, text);
    scope.root.set_attribute(AttrKey::FinalResponse, text);
    let round = scope.timing.resolve(TimedOperation::Orchestration, event, correlation);
    scope.registry.set_timing_if_not_set(key, &round);
    scope.registry.close(key, Status::ok());
    info!(correlation_id = %correlation, chars = text.len(), "Orchestration finished with a final response");
    Ok(())
}

/// Emit `askUser`; the round stays open for the user's answer
fn emit_ask_user(
    scope: &mut BuildScope<'_>,
    key: &SpanKey,
    event: &TraceEvent,
    correlation: &CorrelationId,
    parent: SpanHandle,
    observation: &Observation,
    answer: &FinalResponse,
) -> Result<()> {
    let timing = scope.timing.resolve(TimedOperation::AskUser, event, correlation);
    let question = answer.text.as_deref().unwrap_or_default();
    let kind = observation.kind.as_deref().unwrap_or(Observation::ASK_USER);
    let parameters = json!({
        "question": {
            "type": "string",
            "description": "Clarification question for the user",
            "required": true,
        }
    });
    let prompt = scope
        .registry
        .attribute(key, AttrKey::Prompt)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let mut attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Tool)
        .with(AttrKey::ToolName, kind)
        .with(AttrKey::ToolDescription, ASK_USER_DESCRIPTION)
        .with(AttrKey::ToolType, kind)
        .with(AttrKey::CorrelationId, correlation.as_str())
        .with(AttrKey::ToolParameters, serde_json::to_string(&parameters)?)
        .with(AttrKey::Prompt, prompt)
        .with(AttrKey::Completion, question);
    if let Some(metadata) = &answer.metadata {
        attributes.insert(AttrKey::ResponseMetadata, serde_json::to_string(metadata)?);
    }
    if let Some(metadata) = &observation.ask_user_metadata {
        attributes.insert(AttrKey::AskUserMetadata, serde_json::to_string(metadata)?);
    }
    for (k, v) in timing.attributes() {
        attributes.insert(k, v);
    }

    let span = scope.registry.start_span(
        "askUser",
        Some(parent),
        SpanKind::Client,
        attributes,
        Some(timing.start),
    );
    scope.registry.end_span(span, Status::ok());
    info!(correlation_id = %correlation, "Agent asked the user for clarification");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Harness;
    use super::*;
    use crate::models::{AttrValue, SpanStatus};
    use pretty_assertions::assert_eq;

    #[test]
    fn model_output_then_rationale_nests_under_llm() {
        let mut h = Harness::new();
        h.build(
            json!({"orchestrationTrace": {"modelInvocationInput": {"traceId": "o-1", "text": "plan"}}}),
            "o-1",
        );
        h.build(
            json!({"orchestrationTrace": {
                "modelInvocationOutput": {
                    "traceId": "o-1",
                    "rawResponse": {"content": "thinking"},
                    "metadata": {"usage": {"inputTokens": 3, "outputTokens": 2}}
                },
                "rationale": {"traceId": "o-1", "text": "because"}
            }}),
            "o-1",
        );
        h.finish();

        let llm = h.tracer.find("llm").unwrap();
        let output = h.tracer.find("OrchestrationModelInvocationOutput").unwrap();
        let rationale = h.tracer.find("rationale").unwrap();
        assert_eq!(output.parent_span_id.as_deref(), Some(llm.span_id.as_str()));
        assert_eq!(rationale.parent_span_id.as_deref(), Some(llm.span_id.as_str()));
        assert_eq!(rationale.attribute(AttrKey::HasLlmParent), Some(&AttrValue::Bool(true)));
        assert_eq!(llm.attribute_str(AttrKey::Prompt), Some("plan"));
        assert_eq!(output.attribute(AttrKey::UsageInputTokens), Some(&AttrValue::Int(3)));
    }

    #[test]
    fn rationale_without_llm_is_orphaned_but_emitted() {
        let mut h = Harness::new();
        h.build(
            json!({"orchestrationTrace": {"rationale": {"traceId": "o-2", "text": "hmm"}}}),
            "o-2",
        );
        h.finish();

        let round = h.tracer.find("orchestrationTrace").unwrap();
        let rationale = h.tracer.find("rationale").unwrap();
        assert_eq!(rationale.parent_span_id.as_deref(), Some(round.span_id.as_str()));
        assert_eq!(rationale.attribute(AttrKey::IsOrphaned), Some(&AttrValue::Bool(true)));
        assert_eq!(round.attribute(AttrKey::RationaleStandalone), Some(&AttrValue::Bool(true)));
    }

    #[test]
    fn final_response_closes_round_and_reaches_root() {
        let mut h = Harness::new();
        h.build(
            json!({"orchestrationTrace": {"observation": {
                "traceId": "o-3",
                "type": "FINISH",
                "finalResponse": {"text": "42"}
            }}}),
            "o-3",
        );
        assert_eq!(h.registry.open_count(), 0);
        assert_eq!(h.root.attribute_str(AttrKey::FinalResponse), Some("42"));
        h.finish();

        let round = h.tracer.find("orchestrationTrace").unwrap();
        assert_eq!(round.status, SpanStatus::Ok);
        assert_eq!(round.attribute_str(AttrKey::FinalResponse), Some("42"));
        assert_eq!(h.tracer.find("final_response").unwrap().attribute_str(AttrKey::Completion), Some("42"));
    }

    #[test]
    fn ask_user_keeps_round_open() {
        let mut h = Harness::new();
        h.build(
            json!({"orchestrationTrace": {"observation": {
                "traceId": "o-4",
                "type": "ASK_USER",
                "finalResponse": {"text": "Which account?"}
            }}}),
            "o-4",
        );
        assert_eq!(h.registry.open_count(), 1);
        assert!(h.tracer.find("final_response").is_none());
        let ask = h.tracer.find("askUser").unwrap();
        assert_eq!(ask.attribute_str(AttrKey::Completion), Some("Which account?"));
        assert_eq!(ask.attribute_str(AttrKey::ToolName), Some("ASK_USER"));
    }

    #[test]
    fn knowledge_base_pairs_input_and_output() {
        let mut h = Harness::new();
        h.build(
            json!({"orchestrationTrace": {"invocationInput": {
                "traceId": "o-5",
                "knowledgeBaseLookupInput": {"text": "refund policy", "knowledgeBaseId": "KB1"}
            }}}),
            "o-5",
        );
        h.build(
            json!({"orchestrationTrace": {"observation": {
                "traceId": "o-5",
                "knowledgeBaseLookupOutput": {"retrievedReferences": [{"content": {"text": "a"}}, {"content": {"text": "b"}}]}
            }}}),
            "o-5",
        );
        h.finish();

        let lookups = h.tracer.spans_named("knowledgeBaseLookupInput");
        let results = h.tracer.spans_named("knowledgeBaseLookupOutput");
        assert_eq!(lookups.len(), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].parent_span_id.as_deref(), Some(lookups[0].span_id.as_str()));
        assert_eq!(results[0].attribute_str(AttrKey::Prompt), Some("refund policy"));
        assert_eq!(lookups[0].attribute(AttrKey::KbResultCount), Some(&AttrValue::Int(2)));
    }

    #[test]
    fn code_output_without_input_gets_fallback_parent() {
        let mut h = Harness::new();
        h.build(
            json!({"orchestrationTrace": {"observation": {
                "traceId": "o-6",
                "codeInterpreterInvocationOutput": {"executionOutput": "4", "executionStatus": "SUCCESS"}
            }}}),
            "o-6",
        );
        h.finish();

        let run = h.tracer.find("CodeInterpreter").unwrap();
        let result = h.tracer.find("code_interpreter_result").unwrap();
        assert_eq!(result.parent_span_id.as_deref(), Some(run.span_id.as_str()));
        assert_eq!(run.attribute_str(AttrKey::Result), Some("4"));
        assert_eq!(run.attribute_str(AttrKey::ExecutionStatus), Some("SUCCESS"));
    }
}
