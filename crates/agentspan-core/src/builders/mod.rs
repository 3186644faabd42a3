//! Span hierarchy builders, one per component
//!
//! ```text
//! Bedrock Agent: <agent>
//!   guardrail_pre | guardrail_intervention
//!   pre_processing
//!     llm
//!       input_assessment
//!   orchestrationTrace
//!     llm
//!       OrchestrationModelInvocationOutput
//!     rationale
//!     knowledgeBaseLookupInput
//!       knowledgeBaseLookupOutput
//!     action_group
//!       action_result
//!     CodeInterpreter
//!       code_interpreter_result
//!     final_response | askUser
//!   postProcessingTrace
//!     llm
//!       PostProcessingModelInvocationOutput
//!   guardrail_post
//!     output_assessment
//!   failure
//! ```

mod failure;
mod files;
mod guardrail;
mod llm;
mod orchestration;
mod postprocessing;
mod preprocessing;
mod tools;

pub use failure::{failure_step, FailureBuilder};
pub use files::emit_files;
pub use guardrail::{emit_consolidated, GuardrailPostBuilder, GuardrailPreBuilder};
pub use orchestration::OrchestrationBuilder;
pub use postprocessing::PostProcessingBuilder;
pub use preprocessing::PreprocessingBuilder;

use crate::classifier::{ComponentType, CorrelationId};
use crate::config::InstrumentationConfig;
use crate::error::Result;
use crate::guardrail::GuardrailBuffer;
use crate::invocation::RootSpan;
use crate::models::{AttrKey, AttrValue, Attributes, OperationKind, TraceEvent};
use crate::registry::SpanRegistry;
use crate::timing::TimingResolver;
use crate::tracer::SpanHandle;

/// Per-invocation state a builder may read and mutate
pub struct BuildScope<'a> {
    /// Open spans
    pub registry: &'a mut SpanRegistry,
    /// Timing resolver
    pub timing: &'a mut TimingResolver,
    /// Invocation root span
    pub root: &'a mut RootSpan,
    /// Post-guardrail buffer
    pub guardrails: &'a mut GuardrailBuffer,
    /// Span construction settings
    pub config: &'a InstrumentationConfig,
    /// Whether the response is being streamed
    pub streaming: bool,
    /// Most recent content chunk, attached to buffered guardrail fragments
    pub last_chunk: Option<String>,
}

impl BuildScope<'_> {
    /// Handle of the invocation root
    pub fn root_handle(&self) -> SpanHandle {
        self.root.handle()
    }

    /// Model id carried by the root, or the configured default
    pub fn request_model(&self) -> String {
        self.root
            .attribute_str(AttrKey::RequestModel)
            .unwrap_or(&self.config.default_model)
            .to_string()
    }

    /// Boolean flag copied from the root
    fn root_flag(&self, key: AttrKey) -> bool {
        self.root
            .attribute(key)
            .and_then(AttrValue::as_bool)
            .unwrap_or(false)
    }

    /// Attributes every component-level span starts with
    fn component_attributes(&self, trace_type: &str, correlation: &CorrelationId) -> Attributes {
        Attributes::new()
            .with(AttrKey::OperationName, OperationKind::Task)
            .with(AttrKey::TraceType, trace_type)
            .with(AttrKey::CorrelationId, correlation.as_str())
            .with(AttrKey::RequestModel, self.request_model())
            .with(AttrKey::StreamMode, self.root_flag(AttrKey::StreamMode))
            .with(AttrKey::MetadataStreaming, self.root_flag(AttrKey::MetadataStreaming))
    }
}

/// Turns one classified event into spans
pub trait HierarchyBuilder: Send + Sync {
    /// Component this builder handles
    fn component(&self) -> ComponentType;

    /// Emit or update the spans for one event
    fn build(
        &self,
        scope: &mut BuildScope<'_>,
        event: &TraceEvent,
        correlation: &CorrelationId,
    ) -> Result<()>;
}

/// Builder responsible for a component
pub fn builder_for(component: ComponentType) -> &'static dyn HierarchyBuilder {
    match component {
        ComponentType::Preprocessing => &PreprocessingBuilder,
        ComponentType::Orchestration => &OrchestrationBuilder,
        ComponentType::PostProcessing => &PostProcessingBuilder,
        ComponentType::GuardrailPre => &GuardrailPreBuilder,
        ComponentType::GuardrailPost => &GuardrailPostBuilder,
        ComponentType::Failure => &FailureBuilder,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    use super::BuildScope;
    use crate::classifier::CorrelationId;
    use crate::config::InstrumentationConfig;
    use crate::guardrail::GuardrailBuffer;
    use crate::invocation::RootSpan;
    use crate::models::{AttrKey, Attributes, TraceEvent};
    use crate::registry::SpanRegistry;
    use crate::timing::{ManualClock, TimingResolver};
    use crate::tracer::InMemoryTracer;

    /// Everything a builder needs, wired to an in-memory tracer
    pub(crate) struct Harness {
        pub clock: Arc<ManualClock>,
        pub tracer: Arc<InMemoryTracer>,
        pub registry: SpanRegistry,
        pub timing: TimingResolver,
        pub root: RootSpan,
        pub guardrails: GuardrailBuffer,
        pub config: InstrumentationConfig,
        pub streaming: bool,
    }

    impl Harness {
        pub fn new() -> Self {
            let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
            let tracer = Arc::new(InMemoryTracer::with_clock(clock.clone()));
            let root = RootSpan::start(
                tracer.clone(),
                "Bedrock Agent: TEST",
                Attributes::new()
                    .with(AttrKey::RequestModel, "test-model")
                    .with(AttrKey::Prompt, "hello"),
                None,
            );
            Self {
                registry: SpanRegistry::new(tracer.clone()),
                timing: TimingResolver::new(clock.clone()),
                root,
                guardrails: GuardrailBuffer::new(),
                config: InstrumentationConfig::default(),
                streaming: false,
                clock,
                tracer,
            }
        }

        pub fn scope(&mut self) -> BuildScope<'_> {
            BuildScope {
                registry: &mut self.registry,
                timing: &mut self.timing,
                root: &mut self.root,
                guardrails: &mut self.guardrails,
                config: &self.config,
                streaming: self.streaming,
                last_chunk: None,
            }
        }

        pub fn build(&mut self, trace: Value, correlation: &str) {
            let event: TraceEvent = serde_json::from_value(serde_json::json!({ "trace": trace })).unwrap();
            let classification = crate::classifier::EventClassifier::new(self.clock.clone())
                .classify(&event)
                .unwrap();
            let builder = super::builder_for(classification.component);
            builder
                .build(&mut self.scope(), &event, &CorrelationId::from(correlation))
                .unwrap();
        }

        pub fn finish(&mut self) {
            self.registry.reset();
            self.root.end(crate::models::Status::ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_component_has_its_own_builder() {
        for component in [
            ComponentType::Preprocessing,
            ComponentType::Orchestration,
            ComponentType::PostProcessing,
            ComponentType::GuardrailPre,
            ComponentType::GuardrailPost,
            ComponentType::Failure,
        ] {
            assert_eq!(builder_for(component).component(), component);
        }
    }
}
