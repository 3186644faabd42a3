//! Terminal runtime failures

use tracing::error;

use super::{BuildScope, HierarchyBuilder};
use crate::classifier::{ComponentType, CorrelationId};
use crate::error::{Error, Result};
use crate::invocation::InvocationFailure;
use crate::models::{AttrKey, Attributes, OperationKind, SpanEvent, SpanKind, Status, TraceEvent};
use crate::timing::TimedOperation;

/// `error.type` of failures reported by the runtime
pub const AGENT_FAILURE: &str = "AgentProcessingFailure";

/// Phase a failure reason points at, judged by keywords
pub fn failure_step(reason: &str) -> Option<&'static str> {
    let reason = reason.to_lowercase();
    if reason.contains("preprocessing") {
        Some("preprocessing")
    } else if reason.contains("orchestration") {
        Some("orchestration")
    } else if reason.contains("postprocessing") {
        Some("postprocessing")
    } else if reason.contains("action") || reason.contains("tool") {
        Some("action_group")
    } else if reason.contains("knowledge") {
        Some("knowledge_base")
    } else {
        None
    }
}

/// Builds the `failure` span and fails the root
#[derive(Debug, Default, Clone, Copy)]
pub struct FailureBuilder;

impl HierarchyBuilder for FailureBuilder {
    fn component(&self) -> ComponentType {
        ComponentType::Failure
    }

    fn build(
        &self,
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
    ) -> Result<()> {
        let failure = event
            .trace
            .failure_trace
            .as_ref()
            .ok_or_else(|| Error::malformed("failure", "missing failureTrace"))?;
        let reason = failure.failure_reason.as_deref().unwrap_or("Unknown failure");
        let step = failure_step(reason);

        let timing = scope.timing.resolve(TimedOperation::Failure, event, correlation);
        let mut attributes = Attributes::new()
            .with(AttrKey::OperationName, OperationKind::Task)
            .with(AttrKey::CorrelationId, correlation.as_str())
            .with(AttrKey::ErrorType, AGENT_FAILURE)
            .with(AttrKey::ErrorMessage, reason)
            .with(AttrKey::FailureReason, reason)
            .with_non_empty(AttrKey::FailureStep, step);
        for (k, v) in timing.attributes() {
            attributes.insert(k, v);
        }

        let root = scope.root_handle();
        let span = scope.registry.start_span(
            "failure",
            Some(root),
            SpanKind::Client,
            attributes,
            Some(timing.start),
        );
        scope
            .registry
            .tracer()
            .add_event(span, SpanEvent::exception(AGENT_FAILURE, reason, timing.end));
        scope.registry.end_span(span, Status::error(reason));

        scope.root.record_failure(
            InvocationFailure::new(AGENT_FAILURE, reason),
            timing.end,
        );
        error!(correlation_id = %correlation, step = step.unwrap_or("unknown"), reason, "Agent reported a failure");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Harness;
    use super::*;
    use crate::models::SpanStatus;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("Orchestration timeout", Some("orchestration"))]
    #[case("preprocessing rejected", Some("preprocessing"))]
    #[case("Tool call failed", Some("action_group"))]
    #[case("knowledge base unavailable", Some("knowledge_base"))]
    #[case("throttled", None)]
    fn derives_step_from_reason(#[case] reason: &str, #[case] step: Option<&str>) {
        assert_eq!(failure_step(reason), step);
    }

    #[test]
    fn failure_marks_span_and_root() {
        let mut h = Harness::new();
        h.build(
            json!({"failureTrace": {"traceId": "f-1", "failureReason": "orchestration timeout"}}),
            "f-1",
        );
        assert!(h.root.failure().is_some());
        h.finish();

        let span = h.tracer.find("failure").unwrap();
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.attribute_str(AttrKey::FailureStep), Some("orchestration"));
        assert_eq!(span.events[0].name, "exception");

        let root = h.tracer.find("Bedrock Agent: TEST").unwrap();
        assert_eq!(root.status, SpanStatus::Error);
        assert_eq!(root.attribute_str(AttrKey::ErrorMessage), Some("orchestration timeout"));
    }
}
