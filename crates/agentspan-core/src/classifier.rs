//! Event classification and correlation-id extraction

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ModelInvocationInput, ModelInvocationOutput, OrchestrationTrace, TraceEvent};
use crate::timing::Clock;

/// Prefix of ids synthesized for events that carry none
pub const GENERATED_PREFIX: &str = "generated-";

/// Component an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    /// Input validation before orchestration
    Preprocessing,
    /// Reasoning loop
    Orchestration,
    /// Answer shaping after orchestration
    PostProcessing,
    /// Guardrail on the user input
    GuardrailPre,
    /// Guardrail on the model answer
    GuardrailPost,
    /// Terminal runtime failure
    Failure,
}

impl ComponentType {
    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocessing => "preprocessing",
            Self::Orchestration => "orchestration",
            Self::PostProcessing => "postprocessing",
            Self::GuardrailPre => "guardrail_pre",
            Self::GuardrailPost => "guardrail_post",
            Self::Failure => "failure",
        }
    }

    /// Name of the component-level span
    pub fn span_name(self) -> &'static str {
        match self {
            Self::Preprocessing => "pre_processing",
            Self::Orchestration => "orchestrationTrace",
            Self::PostProcessing => "postProcessingTrace",
            Self::GuardrailPre => "guardrail_pre",
            Self::GuardrailPost => "guardrail_post",
            Self::Failure => "failure",
        }
    }

    /// Whether input and output halves of this component share one long-lived span
    pub fn is_paired(self) -> bool {
        matches!(
            self,
            Self::Preprocessing | Self::Orchestration | Self::PostProcessing
        )
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity joining an input sub-event to its later output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was made up because the event had none
    pub fn is_synthesized(&self) -> bool {
        self.0.starts_with(GENERATED_PREFIX)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Result of classifying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Component the event belongs to
    pub component: ComponentType,
    /// Extracted or synthesized correlation id
    pub correlation: CorrelationId,
    /// Whether `correlation` was synthesized
    pub synthesized: bool,
}

/// Decides which component an event belongs to and which id correlates it
#[derive(Debug)]
pub struct EventClassifier {
    clock: Arc<dyn Clock>,
    last_stamp: i64,
}

impl EventClassifier {
    /// Classifier using `clock` for synthesized ids
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last_stamp: 0,
        }
    }

    /// Classify an event. Returns `None` when the envelope carries no known component.
    ///
    /// Envelope keys are checked in a fixed order: orchestration, preprocessing,
    /// post-processing, guardrail, failure.
    pub fn classify(&mut self, event: &TraceEvent) -> Option<Classification> {
        let trace = &event.trace;

        let (component, explicit) = if let Some(orch) = &trace.orchestration_trace {
            (ComponentType::Orchestration, orchestration_id(orch))
        } else if let Some(pre) = &trace.pre_processing_trace {
            (
                ComponentType::Preprocessing,
                model_id(pre.model_invocation_input.as_ref(), pre.model_invocation_output.as_ref()),
            )
        } else if let Some(post) = &trace.post_processing_trace {
            (
                ComponentType::PostProcessing,
                model_id(post.model_invocation_input.as_ref(), post.model_invocation_output.as_ref()),
            )
        } else if let Some(guardrail) = &trace.guardrail_trace {
            let id = match &guardrail.trace_id {
                Some(id) => CorrelationId::from(id.as_str()),
                None => self.synthesize("guardrail-"),
            };
            let component = if id.as_str().contains("pre") {
                ComponentType::GuardrailPre
            } else {
                ComponentType::GuardrailPost
            };
            return Some(Classification {
                component,
                correlation: id,
                synthesized: guardrail.trace_id.is_none(),
            });
        } else if let Some(failure) = &trace.failure_trace {
            let synthesized = failure.trace_id.is_none();
            let correlation = match &failure.trace_id {
                Some(id) => CorrelationId::from(id.as_str()),
                None => self.synthesize("failure-"),
            };
            return Some(Classification {
                component: ComponentType::Failure,
                correlation,
                synthesized,
            });
        } else {
            return None;
        };

        let synthesized = explicit.is_none();
        let correlation = match explicit {
            Some(id) => CorrelationId::from(id),
            None => {
                let id = self.synthesize(GENERATED_PREFIX);
                debug!(component = %component, correlation_id = %id, "Synthesized correlation id");
                id
            }
        };

        Some(Classification {
            component,
            correlation,
            synthesized,
        })
    }

    /// `<prefix><micros>`, strictly increasing even when the clock stands still
    fn synthesize(&mut self, prefix: &str) -> CorrelationId {
        let stamp = self.clock.now().timestamp_micros().max(self.last_stamp + 1);
        self.last_stamp = stamp;
        CorrelationId::new(format!("{prefix}{stamp}"))
    }
}

fn model_id<'a>(
    input: Option<&'a ModelInvocationInput>,
    output: Option<&'a ModelInvocationOutput>,
) -> Option<&'a str> {
    input
        .and_then(|i| i.trace_id.as_deref())
        .or_else(|| output.and_then(|o| o.trace_id.as_deref()))
}

fn orchestration_id(orch: &OrchestrationTrace) -> Option<&str> {
    model_id(orch.model_invocation_input.as_ref(), orch.model_invocation_output.as_ref())
        .or_else(|| orch.rationale.as_ref().and_then(|r| r.trace_id.as_deref()))
        .or_else(|| orch.invocation_input.as_ref().and_then(|i| i.trace_id.as_deref()))
        .or_else(|| orch.observation.as_ref().and_then(|o| o.trace_id.as_deref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::ManualClock;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn classifier() -> EventClassifier {
        EventClassifier::new(Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        )))
    }

    fn event(trace: serde_json::Value) -> TraceEvent {
        serde_json::from_value(json!({ "trace": trace })).unwrap()
    }

    #[rstest]
    #[case(json!({"orchestrationTrace": {"rationale": {"traceId": "r-1"}}}), ComponentType::Orchestration, "r-1")]
    #[case(json!({"preProcessingTrace": {"modelInvocationOutput": {"traceId": "p-1"}}}), ComponentType::Preprocessing, "p-1")]
    #[case(json!({"postProcessingTrace": {"modelInvocationInput": {"traceId": "q-1"}}}), ComponentType::PostProcessing, "q-1")]
    #[case(json!({"guardrailTrace": {"traceId": "abc-guardrail-pre-0"}}), ComponentType::GuardrailPre, "abc-guardrail-pre-0")]
    #[case(json!({"guardrailTrace": {"traceId": "abc-guardrail-post-3"}}), ComponentType::GuardrailPost, "abc-guardrail-post-3")]
    #[case(json!({"failureTrace": {"traceId": "f-1", "failureReason": "x"}}), ComponentType::Failure, "f-1")]
    fn classifies_each_component(
        #[case] trace: serde_json::Value,
        #[case] component: ComponentType,
        #[case] id: &str,
    ) {
        let c = classifier().classify(&event(trace)).unwrap();
        assert_eq!(c.component, component);
        assert_eq!(c.correlation.as_str(), id);
        assert!(!c.synthesized);
    }

    #[test]
    fn orchestration_wins_over_other_keys() {
        let c = classifier()
            .classify(&event(json!({
                "failureTrace": {"traceId": "f"},
                "orchestrationTrace": {"observation": {"traceId": "o"}}
            })))
            .unwrap();
        assert_eq!(c.component, ComponentType::Orchestration);
    }

    #[test]
    fn input_id_takes_precedence_over_later_fields() {
        let c = classifier()
            .classify(&event(json!({"orchestrationTrace": {
                "observation": {"traceId": "obs"},
                "rationale": {"traceId": "rat"},
                "modelInvocationOutput": {"traceId": "out"},
                "modelInvocationInput": {"traceId": "in"}
            }})))
            .unwrap();
        assert_eq!(c.correlation.as_str(), "in");
    }

    #[test]
    fn synthesized_ids_are_unique_under_a_frozen_clock() {
        let mut classifier = classifier();
        let e = event(json!({"preProcessingTrace": {"modelInvocationInput": {"text": "hi"}}}));
        let a = classifier.classify(&e).unwrap();
        let b = classifier.classify(&e).unwrap();
        assert!(a.synthesized && a.correlation.is_synthesized());
        assert_ne!(a.correlation, b.correlation);
    }

    #[test]
    fn guardrail_without_id_is_post() {
        let c = classifier()
            .classify(&event(json!({"guardrailTrace": {"action": "NONE"}})))
            .unwrap();
        assert_eq!(c.component, ComponentType::GuardrailPost);
        assert!(c.correlation.as_str().starts_with("guardrail-"));
    }

    #[test]
    fn unknown_envelope_is_unclassified() {
        assert!(classifier().classify(&event(json!({"routingClassifierTrace": {}}))).is_none());
    }
}
