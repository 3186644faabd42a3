//! Guardrail spans: pre checks, interventions and post-answer assessments

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{BuildScope, HierarchyBuilder};
use crate::classifier::{ComponentType, CorrelationId};
use crate::error::{Error, Result};
use crate::guardrail::{base_correlation, is_intervention, GuardrailBufferEntry, MergedAssessment};
use crate::models::{
    AttrKey, Attributes, GuardrailTrace, OperationKind, Policy, SpanKind, Status, TraceEvent,
};
use crate::timing::TimedOperation;
use crate::tracer::SpanHandle;

/// Status message of a guardrail that blocked content
pub const CONTENT_BLOCKED: &str = "Content blocked by guardrail";

const GUARDRAIL_SYSTEM: &str = "guardrails";
const INTERVENED: &str = "GUARDRAIL_INTERVENED";

fn guardrail_trace<'a>(event: &'a TraceEvent, component: ComponentType) -> Result<&'a GuardrailTrace> {
    event
        .trace
        .guardrail_trace
        .as_ref()
        .ok_or_else(|| Error::malformed(component.as_str(), "missing guardrailTrace"))
}

/// `"Word 'x' blocked"` for every custom word an assessment blocked
fn blocked_items(assessments: &[Value]) -> Vec<String> {
    assessments
        .iter()
        .filter_map(|a| a.pointer("/wordPolicy/customWords")?.as_array())
        .flatten()
        .filter(|w| w.get("action").and_then(Value::as_str) == Some("BLOCKED"))
        .filter_map(|w| w.get("match").and_then(Value::as_str))
        .map(|word| format!("Word '{word}' blocked"))
        .collect()
}

/// One-shot span directly under the root
fn emit_leaf(
    scope: &mut BuildScope<'_>,
    name: &str,
    attributes: Attributes,
    start: Option<chrono::DateTime<chrono::Utc>>,
    status: Status,
) -> SpanHandle {
    let root = scope.root_handle();
    let span = scope
        .registry
        .start_span(name, Some(root), SpanKind::Client, attributes, start);
    scope.registry.end_span(span, status);
    span
}

/// Builds `guardrail_pre` or `guardrail_intervention`
#[derive(Debug, Default, Clone, Copy)]
pub struct GuardrailPreBuilder;

impl GuardrailPreBuilder {
    /// Plain pre check; `BLOCKED` is an error
    pub fn emit_check(
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
        guardrail: &GuardrailTrace,
    ) -> Result<()> {
        let timing = scope.timing.resolve(TimedOperation::GuardrailPre, event, correlation);
        let action = guardrail.action();
        let mut attributes = Attributes::new()
            .with(AttrKey::OperationName, OperationKind::Guardrail)
            .with(AttrKey::GuardrailType, "pre")
            .with(AttrKey::GuardrailAction, action)
            .with(AttrKey::CorrelationId, correlation.as_str())
            .with(AttrKey::LlmSystem, GUARDRAIL_SYSTEM)
            .with(AttrKey::RequestModel, scope.request_model())
            .with(AttrKey::SpanName, "guardrail_pre")
            .with(AttrKey::Prompt, "NA")
            .with(AttrKey::Completion, serde_json::to_string(&guardrail.input_assessments)?)
            .with(
                AttrKey::GuardrailAssessments,
                serde_json::to_string(&json!({ "input": guardrail.input_assessments }))?,
            );
        for (k, v) in timing.attributes() {
            attributes.insert(k, v);
        }

        let status = if action == "BLOCKED" {
            attributes.insert(AttrKey::ErrorMessage, CONTENT_BLOCKED);
            Status::error(CONTENT_BLOCKED)
        } else {
            Status::ok()
        };
        emit_leaf(scope, "guardrail_pre", attributes, Some(timing.start), status);
        debug!(correlation_id = %correlation, action, "Pre guardrail recorded");
        Ok(())
    }

    /// Intervention on the user input
    pub fn emit_intervention(
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
        guardrail: &GuardrailTrace,
    ) -> Result<()> {
        let timing = scope
            .timing
            .resolve(TimedOperation::GuardrailIntervention, event, correlation);
        let blocked = blocked_items(&guardrail.input_assessments);
        let prompt = scope
            .root
            .attribute_str(AttrKey::Prompt)
            .unwrap_or_default()
            .to_string();

        let mut attributes = Attributes::new()
            .with(AttrKey::OperationName, OperationKind::Guardrail)
            .with(AttrKey::GuardrailType, "pre")
            .with(AttrKey::GuardrailAction, guardrail.action())
            .with(AttrKey::GuardrailIntervention, true)
            .with(AttrKey::CorrelationId, correlation.as_str())
            .with(AttrKey::LlmSystem, GUARDRAIL_SYSTEM)
            .with(AttrKey::RequestModel, scope.request_model())
            .with(AttrKey::SpanName, "guardrail_intervention")
            .with(AttrKey::Prompt, prompt)
            .with(AttrKey::Completion, serde_json::to_string(&guardrail.input_assessments)?);
        if !blocked.is_empty() {
            attributes.insert(AttrKey::GuardrailBlockedItems, serde_json::to_string(&blocked)?);
        }
        for (k, v) in timing.attributes() {
            attributes.insert(k, v);
        }

        emit_leaf(
            scope,
            "guardrail_intervention",
            attributes,
            Some(timing.start),
            Status::ok(),
        );
        info!(
            correlation_id = %correlation,
            action = guardrail.action(),
            blocked = blocked.len(),
            "Guardrail intervened on the input"
        );
        Ok(())
    }
}

impl HierarchyBuilder for GuardrailPreBuilder {
    fn component(&self) -> ComponentType {
        ComponentType::GuardrailPre
    }

    fn build(
        &self,
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
    ) -> Result<()> {
        let guardrail = guardrail_trace(event, ComponentType::GuardrailPre)?;
        if is_intervention(guardrail.action()) {
            Self::emit_intervention(scope, event, correlation, guardrail)
        } else {
            Self::emit_check(scope, event, correlation, guardrail)
        }
    }
}

/// Buffers post guardrails while streaming, emits them at once otherwise
#[derive(Debug, Default, Clone, Copy)]
pub struct GuardrailPostBuilder;

impl GuardrailPostBuilder {
    /// One `guardrail_post` span for a single, non-streamed assessment
    pub fn emit_immediate(
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
        guardrail: &GuardrailTrace,
    ) -> Result<()> {
        let timing = scope.timing.resolve(TimedOperation::GuardrailPost, event, correlation);
        let action = guardrail.action();
        let mut attributes = Attributes::new()
            .with(AttrKey::OperationName, OperationKind::Guardrail)
            .with(AttrKey::GuardrailType, "post")
            .with(AttrKey::GuardrailAction, action)
            .with(AttrKey::CorrelationId, correlation.as_str())
            .with(AttrKey::LlmSystem, GUARDRAIL_SYSTEM)
            .with(AttrKey::RequestModel, scope.request_model())
            .with(AttrKey::SpanName, "guardrail_post")
            .with(AttrKey::StreamMode, scope.streaming)
            .with(AttrKey::Prompt, "NA")
            .with(AttrKey::Completion, "NA");
        if !guardrail.output_assessments.is_empty() {
            attributes.insert(
                AttrKey::GuardrailOutputAssessments,
                serde_json::to_string(&guardrail.output_assessments)?,
            );
        }
        for (k, v) in timing.attributes() {
            attributes.insert(k, v);
        }

        let root = scope.root_handle();
        let span = scope.registry.start_span(
            "guardrail_post",
            Some(root),
            SpanKind::Client,
            attributes,
            Some(timing.start),
        );

        if let Some(first) = guardrail.output_assessments.first() {
            let mut detail = Attributes::new()
                .with(AttrKey::OperationName, OperationKind::Guardrail)
                .with(AttrKey::TraceType, "OUTPUT_ASSESSMENT")
                .with(AttrKey::CorrelationId, correlation.as_str());
            for policy in Policy::ALL {
                if let Some(value) = first.get(policy.field()) {
                    detail.insert(AttrKey::PolicyDetail(policy), serde_json::to_string(value)?);
                }
            }
            let child = scope.registry.start_span(
                "output_assessment",
                Some(span),
                SpanKind::Client,
                detail,
                Some(timing.start),
            );
            scope.registry.end_span(child, Status::ok());
        }

        let status = if action == INTERVENED {
            scope.registry.annotate(span, AttrKey::ErrorMessage, CONTENT_BLOCKED);
            Status::error(CONTENT_BLOCKED)
        } else {
            Status::ok()
        };
        scope.registry.end_span(span, status);
        debug!(correlation_id = %correlation, action, "Post guardrail recorded");
        Ok(())
    }
}

impl HierarchyBuilder for GuardrailPostBuilder {
    fn component(&self) -> ComponentType {
        ComponentType::GuardrailPost
    }

    fn build(
        &self,
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
    ) -> Result<()> {
        let guardrail = guardrail_trace(event, ComponentType::GuardrailPost)?;
        if !scope.streaming {
            return Self::emit_immediate(scope, event, correlation, guardrail);
        }

        let received_at = event
            .received_at
            .or(event.event_time)
            .unwrap_or_else(|| scope.timing.now());
        scope.guardrails.push(GuardrailBufferEntry {
            base: base_correlation(correlation),
            received_at,
            trace: guardrail.clone(),
            content: scope.last_chunk.clone(),
        });
        Ok(())
    }
}

/// Emit the consolidated `guardrail_post` span of one merged base id
pub fn emit_consolidated(scope: &mut BuildScope<'_>, merged: &MergedAssessment) -> Result<()> {
    let start = merged.window.map(|(first, _)| first);
    let mut attributes = Attributes::new()
        .with(AttrKey::OperationName, OperationKind::Guardrail)
        .with(AttrKey::GuardrailType, "post")
        .with(AttrKey::GuardrailAction, merged.action.as_str())
        .with(AttrKey::GuardrailBaseTraceId, merged.base.as_str())
        .with(AttrKey::GuardrailStreaming, true)
        .with(AttrKey::GuardrailChunkCount, merged.chunk_count)
        .with(AttrKey::GuardrailChunksReceived, merged.chunk_count)
        .with(AttrKey::LlmSystem, GUARDRAIL_SYSTEM)
        .with(AttrKey::RequestModel, scope.request_model())
        .with(AttrKey::SpanName, "guardrail_post");
    if !merged.assessments.is_empty() {
        attributes.insert(
            AttrKey::GuardrailOutputAssessments,
            serde_json::to_string(&merged.assessments)?,
        );
    }

    let root = scope.root_handle();
    let span = scope
        .registry
        .start_span("guardrail_post", Some(root), SpanKind::Client, attributes, start);

    if !merged.assessments.is_empty() {
        let mut detail = Attributes::new()
            .with(AttrKey::OperationName, OperationKind::Guardrail)
            .with(AttrKey::TraceType, "OUTPUT_ASSESSMENT")
            .with(AttrKey::GuardrailBaseTraceId, merged.base.as_str())
            .with(AttrKey::GuardrailStreaming, true)
            .with(AttrKey::GuardrailAssessmentsCount, merged.assessments.len())
            .with(AttrKey::LlmSystem, "guardrails-assessment")
            .with(AttrKey::RequestModel, scope.request_model());
        let limit = scope.config.assessment_detail_limit;
        for (index, assessment) in merged.assessments.iter().take(limit).enumerate() {
            for policy in Policy::ALL {
                if let Some(value) = assessment.get(policy.field()) {
                    detail.insert(
                        AttrKey::AssessmentPolicy { index, policy },
                        serde_json::to_string(value)?,
                    );
                }
            }
        }
        let child = scope
            .registry
            .start_span("output_assessment", Some(span), SpanKind::Client, detail, start);
        scope.registry.end_span(child, Status::ok());
    }

    let status = if merged.intervened {
        warn!(base_correlation_id = %merged.base, chunks = merged.chunk_count, "Guardrail intervened on the streamed answer");
        scope.registry.annotate(span, AttrKey::ErrorMessage, CONTENT_BLOCKED);
        Status::error(CONTENT_BLOCKED)
    } else {
        Status::ok()
    };
    scope.registry.end_span(span, status);
    debug!(
        base_correlation_id = %merged.base,
        chunk_count = merged.chunk_count,
        assessments = merged.assessments.len(),
        "Consolidated guardrail emitted"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Harness;
    use super::*;
    use crate::models::{AttrValue, SpanStatus};
    use pretty_assertions::assert_eq;

    #[test]
    fn blocked_input_emits_intervention_with_words() {
        let mut h = Harness::new();
        h.build(
            json!({"guardrailTrace": {
                "traceId": "abc-guardrail-pre-0",
                "action": "INTERVENED",
                "inputAssessments": [{"wordPolicy": {"customWords": [
                    {"match": "secret", "action": "BLOCKED"},
                    {"match": "fine", "action": "NONE"}
                ]}}]
            }}),
            "abc-guardrail-pre-0",
        );

        let span = h.tracer.find("guardrail_intervention").unwrap();
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.attribute(AttrKey::GuardrailIntervention), Some(&AttrValue::Bool(true)));
        assert_eq!(
            span.attribute_str(AttrKey::GuardrailBlockedItems),
            Some(r#"["Word 'secret' blocked"]"#)
        );
        assert_eq!(span.attribute_str(AttrKey::Prompt), Some("hello"));
        assert!(h.tracer.find("guardrail_pre").is_none());
    }

    #[test]
    fn plain_pre_check_is_ok() {
        let mut h = Harness::new();
        h.build(
            json!({"guardrailTrace": {"traceId": "abc-guardrail-pre-0", "action": "NONE"}}),
            "abc-guardrail-pre-0",
        );
        let span = h.tracer.find("guardrail_pre").unwrap();
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.attribute_str(AttrKey::GuardrailAssessments), Some(r#"{"input":[]}"#));
    }

    #[test]
    fn direct_blocked_check_is_error() {
        let mut h = Harness::new();
        let guardrail = GuardrailTrace {
            action: Some("BLOCKED".into()),
            ..GuardrailTrace::default()
        };
        GuardrailPreBuilder::emit_check(
            &mut h.scope(),
            &TraceEvent::default(),
            &CorrelationId::from("x-pre"),
            &guardrail,
        )
        .unwrap();
        let span = h.tracer.find("guardrail_pre").unwrap();
        assert_eq!(span.status_message.as_deref(), Some(CONTENT_BLOCKED));
    }

    #[test]
    fn non_streaming_post_is_emitted_immediately() {
        let mut h = Harness::new();
        h.build(
            json!({"guardrailTrace": {
                "traceId": "abc-guardrail-post-0",
                "action": "GUARDRAIL_INTERVENED",
                "outputAssessments": [{"topicPolicy": {"topics": [{"name": "x"}]}}]
            }}),
            "abc-guardrail-post-0",
        );
        assert!(h.guardrails.is_empty());

        let span = h.tracer.find("guardrail_post").unwrap();
        let child = h.tracer.find("output_assessment").unwrap();
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(child.parent_span_id.as_deref(), Some(span.span_id.as_str()));
        assert!(child.attribute_str(AttrKey::PolicyDetail(Policy::Topic)).is_some());
    }

    #[test]
    fn streaming_post_is_buffered() {
        let mut h = Harness::new();
        h.streaming = true;
        h.build(
            json!({"guardrailTrace": {"traceId": "abc-guardrail-post-0", "action": "NONE"}}),
            "abc-guardrail-post-0",
        );
        assert_eq!(h.guardrails.fragment_count(), 1);
        assert!(h.tracer.find("guardrail_post").is_none());
    }

    #[test]
    fn consolidated_span_caps_policy_details() {
        let mut h = Harness::new();
        let assessments: Vec<Value> = (0..5)
            .map(|i| json!({"contentPolicy": {"filters": [{"type": format!("T{i}")}]}}))
            .collect();
        let merged = MergedAssessment {
            base: CorrelationId::from("abc"),
            action: "NONE".into(),
            chunk_count: 5,
            assessments,
            intervened: false,
            window: None,
        };
        emit_consolidated(&mut h.scope(), &merged).unwrap();

        let child = h.tracer.find("output_assessment").unwrap();
        let policy = |index| AttrKey::AssessmentPolicy {
            index,
            policy: Policy::Content,
        };
        assert!(child.attribute(policy(2)).is_some());
        assert!(child.attribute(policy(3)).is_none());
        assert_eq!(child.attribute(AttrKey::GuardrailAssessmentsCount), Some(&AttrValue::Int(5)));
    }
}
