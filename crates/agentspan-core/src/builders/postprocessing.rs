//! Post-processing rounds
//!
//! Only one post-processing span is live at a time: an event for a new
//! correlation id closes the previous round first.

use tracing::debug;

use super::llm::{self, POST_PROCESSING};
use super::{BuildScope, HierarchyBuilder};
use crate::classifier::{ComponentType, CorrelationId};
use crate::error::{Error, Result};
use crate::models::{AttrKey, Status, TraceEvent};
use crate::registry::SpanKey;
use crate::timing::TimedOperation;

/// Builds the post-processing hierarchy
#[derive(Debug, Default, Clone, Copy)]
pub struct PostProcessingBuilder;

impl HierarchyBuilder for PostProcessingBuilder {
    fn component(&self) -> ComponentType {
        ComponentType::PostProcessing
    }

    fn build(
        &self,
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
    ) -> Result<()> {
        let trace = event
            .trace
            .post_processing_trace
            .as_ref()
            .ok_or_else(|| Error::malformed("postprocessing", "missing postProcessingTrace"))?;

        let key = SpanKey::new(ComponentType::PostProcessing, correlation.clone());
        if let Some(previous) = scope.registry.active_key(ComponentType::PostProcessing) {
            if previous != key {
                debug!(previous = %previous.correlation, next = %correlation, "Switching post-processing round");
                scope.registry.close(&previous, Status::ok());
            }
        }

        let timing = scope
            .timing
            .resolve(TimedOperation::PostProcessing, event, correlation);
        let attributes = scope.component_attributes("POST_PROCESSING", correlation);
        let root = scope.root_handle();
        scope
            .registry
            .get_or_create(&key, Some(root), attributes, Some(&timing));

        if let Some(input) = &trace.model_invocation_input {
            llm::record_input(scope, &key, &POST_PROCESSING, input)?;
        }

        if let Some(output) = &trace.model_invocation_output {
            llm::emit_model_output(scope, &key, &POST_PROCESSING, event, correlation, output)?;
            let answer = output
                .parsed_response
                .as_ref()
                .and_then(|p| p.text.as_deref())
                .filter(|t| !t.is_empty());
            if let Some(text) = answer {
                scope.registry.set_attribute(&key, AttrKey::FinalResponse, text);
                scope.registry.close(&key, Status::ok());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Harness;
    use super::*;
    use crate::models::SpanStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parsed_text_closes_round_with_result() {
        let mut h = Harness::new();
        h.build(
            json!({"postProcessingTrace": {"modelInvocationInput": {"traceId": "q-1", "text": "polish"}}}),
            "q-1",
        );
        h.build(
            json!({"postProcessingTrace": {"modelInvocationOutput": {
                "traceId": "q-1",
                "parsedResponse": {"text": "Polished answer"}
            }}}),
            "q-1",
        );
        assert_eq!(h.registry.open_count(), 0);
        h.finish();

        let round = h.tracer.find("postProcessingTrace").unwrap();
        assert_eq!(round.status, SpanStatus::Ok);
        assert_eq!(round.attribute_str(AttrKey::FinalResponse), Some("Polished answer"));
        assert_eq!(round.attribute_str(AttrKey::ModelInputType), Some("POST_PROCESSING"));
        let output = h.tracer.find("PostProcessingModelInvocationOutput").unwrap();
        assert_eq!(output.attribute_str(AttrKey::Result), Some("Polished answer"));
        assert_eq!(h.tracer.find("llm").unwrap().attribute_str(AttrKey::Result), Some("Polished answer"));
    }

    #[test]
    fn new_correlation_closes_previous_round() {
        let mut h = Harness::new();
        h.build(
            json!({"postProcessingTrace": {"modelInvocationInput": {"traceId": "q-1"}}}),
            "q-1",
        );
        h.build(
            json!({"postProcessingTrace": {"modelInvocationInput": {"traceId": "q-2"}}}),
            "q-2",
        );

        assert_eq!(h.tracer.spans_named("postProcessingTrace").len(), 1);
        assert_eq!(
            h.registry.active(ComponentType::PostProcessing),
            Some(&CorrelationId::from("q-2"))
        );
        h.finish();
        assert_eq!(h.tracer.spans_named("postProcessingTrace").len(), 2);
    }
}
