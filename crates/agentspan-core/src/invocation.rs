//! Per-invocation state
//!
//! Every agent call owns one [`InvocationContext`]: its registry, timers, guardrail
//! buffer and root span. Nothing is shared between invocations, so a process serving
//! many calls at once only needs [`SharedInvocations`] to find the right context.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::builders::{builder_for, emit_consolidated, emit_files, BuildScope};
use crate::classifier::{Classification, ComponentType, CorrelationId, EventClassifier};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::guardrail::GuardrailBuffer;
use crate::models::{
    AttrKey, AttrValue, Attributes, OperationKind, SpanEvent, SpanKind, SpanStatus, Status,
    TraceEvent,
};
use crate::registry::SpanRegistry;
use crate::timing::{elapsed_ms, format_timestamp, Clock, TimingResolver};
use crate::tracer::{SpanHandle, Tracer};

/// Model id recorded on the root when the request names none
pub const DEFAULT_AGENT_MODEL: &str = "bedrock-agent-default";

/// User id recorded on the root when the request names none
pub const ANONYMOUS_USER: &str = "anonymous";

/// What the caller asked the agent to do
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// User input
    pub input_text: String,
    /// Agent id
    pub agent_id: String,
    /// Agent alias id
    pub agent_alias_id: String,
    /// Conversation session id
    pub session_id: String,
    /// End user, if known
    #[serde(default)]
    pub user_id: Option<String>,
    /// Free-form tags copied to the root span
    #[serde(default)]
    pub tags: Vec<String>,
    /// Caller-supplied trace id; a random one is generated otherwise
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Foundation model behind the agent, if known
    #[serde(default)]
    pub model_id: Option<String>,
    /// Whether the answer is streamed
    #[serde(default)]
    pub streaming: bool,
}

impl InvocationRequest {
    /// Request with the mandatory fields
    pub fn new(
        agent_id: impl Into<String>,
        agent_alias_id: impl Into<String>,
        session_id: impl Into<String>,
        input_text: impl Into<String>,
    ) -> Self {
        Self {
            input_text: input_text.into(),
            agent_id: agent_id.into(),
            agent_alias_id: agent_alias_id.into(),
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Mark the request as streamed
    #[must_use]
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Record the foundation model
    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Attach tags
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// An invocation-level failure, surfaced to the caller as data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationFailure {
    /// Machine-readable kind, copied to `error.type`
    pub kind: String,
    /// Human-readable message, copied to `error.message`
    pub message: String,
}

impl InvocationFailure {
    /// Build a failure
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&Error> for InvocationFailure {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Summary handed back once an invocation is finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    /// Concatenated answer text
    pub completion: String,
    /// Final root status
    pub status: SpanStatus,
    /// Failure recorded during the invocation, if any
    pub failure: Option<InvocationFailure>,
    /// Content chunks seen
    pub chunk_count: usize,
    /// Trace events that failed to build
    pub event_errors: usize,
}

impl InvocationResult {
    /// Whether the invocation ended without a failure
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

/// The invocation root span, ended exactly once
pub struct RootSpan {
    tracer: Arc<dyn Tracer>,
    handle: SpanHandle,
    attributes: Attributes,
    failure: Option<InvocationFailure>,
    ended: bool,
}

impl fmt::Debug for RootSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootSpan")
            .field("handle", &self.handle)
            .field("failure", &self.failure)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl RootSpan {
    /// Open the root span
    pub fn start(
        tracer: Arc<dyn Tracer>,
        name: &str,
        attributes: Attributes,
        start_time: Option<DateTime<Utc>>,
    ) -> Self {
        let handle = tracer.start_span(name, None, SpanKind::Client, attributes.clone(), start_time);
        Self {
            tracer,
            handle,
            attributes,
            failure: None,
            ended: false,
        }
    }

    /// Tracer handle
    pub fn handle(&self) -> SpanHandle {
        self.handle
    }

    /// Set an attribute and remember it
    pub fn set_attribute(&mut self, key: AttrKey, value: impl Into<AttrValue>) {
        let value = value.into();
        self.tracer.set_attribute(self.handle, key, value.clone());
        self.attributes.insert(key, value);
    }

    /// Last value written for `key`
    pub fn attribute(&self, key: AttrKey) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// Last text value written for `key`
    pub fn attribute_str(&self, key: AttrKey) -> Option<&str> {
        self.attributes.get_str(key)
    }

    /// Record a failure: error attributes, an exception event and ERROR status.
    ///
    /// The first failure wins; later ones only add their exception event.
    pub fn record_failure(&mut self, failure: InvocationFailure, at: DateTime<Utc>) {
        self.tracer.add_event(
            self.handle,
            SpanEvent::exception(&failure.kind, &failure.message, at),
        );
        if self.failure.is_some() {
            return;
        }
        self.set_attribute(AttrKey::ErrorMessage, failure.message.as_str());
        self.set_attribute(AttrKey::ErrorType, failure.kind.as_str());
        self.tracer
            .set_status(self.handle, Status::error(failure.message.as_str()));
        self.failure = Some(failure);
    }

    /// Failure recorded so far
    pub fn failure(&self) -> Option<&InvocationFailure> {
        self.failure.as_ref()
    }

    /// Whether the span has been ended
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// End the span. A recorded failure overrides `status`. Returns `false` if already ended.
    pub fn end(&mut self, status: Status) -> bool {
        if self.ended {
            return false;
        }
        let status = match &self.failure {
            Some(failure) => Status::error(failure.message.as_str()),
            None => status,
        };
        self.tracer.set_status(self.handle, status);
        self.tracer.end(self.handle);
        self.ended = true;
        true
    }
}

/// All mutable state of one invocation
pub struct InvocationContext {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    registry: SpanRegistry,
    timing: TimingResolver,
    classifier: EventClassifier,
    guardrails: GuardrailBuffer,
    root: RootSpan,
    streaming: bool,
    started_at: DateTime<Utc>,
    processing_started: Option<DateTime<Utc>>,
    trace_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    completion: String,
    chunk_count: usize,
    last_chunk: Option<String>,
    event_errors: usize,
    result: Option<InvocationResult>,
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("root", &self.root)
            .field("registry", &self.registry)
            .field("streaming", &self.streaming)
            .field("chunk_count", &self.chunk_count)
            .finish_non_exhaustive()
    }
}

impl InvocationContext {
    /// Open the root span for `request`
    pub fn begin(
        tracer: Arc<dyn Tracer>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
        request: &InvocationRequest,
    ) -> Self {
        let mut registry = SpanRegistry::new(Arc::clone(&tracer));
        registry.reset();

        let started_at = clock.now();
        let tags = serde_json::to_string(&request.tags).unwrap_or_else(|_| "[]".to_string());
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut attributes = Attributes::new()
            .with(AttrKey::OperationName, OperationKind::Agent)
            .with(AttrKey::AgentId, request.agent_id.as_str())
            .with(AttrKey::AgentAliasId, request.agent_alias_id.as_str())
            .with(AttrKey::SessionId, request.session_id.as_str())
            .with(
                AttrKey::UserId,
                request.user_id.as_deref().unwrap_or(ANONYMOUS_USER),
            )
            .with(AttrKey::CustomTraceId, trace_id.as_str())
            .with(AttrKey::CustomTags, tags)
            .with(AttrKey::StreamMode, request.streaming)
            .with(AttrKey::MetadataStreaming, request.streaming)
            .with(AttrKey::LlmSystem, config.instrumentation.llm_system.as_str())
            .with(
                AttrKey::RequestModel,
                request.model_id.as_deref().unwrap_or(DEFAULT_AGENT_MODEL),
            )
            .with(AttrKey::Prompt, request.input_text.as_str())
            .with(AttrKey::InvokeStartedTime, format_timestamp(started_at))
            .with(AttrKey::SpanStartTime, format_timestamp(started_at));
        if request.streaming {
            attributes.insert(AttrKey::Streaming, true);
            attributes.insert(AttrKey::StreamingStartTime, format_timestamp(started_at));
        }

        let name = format!("Bedrock Agent: {}", request.agent_id);
        let root = RootSpan::start(tracer, &name, attributes, Some(started_at));
        info!(
            agent_id = %request.agent_id,
            session_id = %request.session_id,
            trace_id = %trace_id,
            streaming = request.streaming,
            "Invocation started"
        );

        Self {
            registry,
            timing: TimingResolver::new(Arc::clone(&clock)),
            classifier: EventClassifier::new(Arc::clone(&clock)),
            guardrails: GuardrailBuffer::new(),
            root,
            streaming: request.streaming,
            started_at,
            processing_started: None,
            trace_window: None,
            completion: String::new(),
            chunk_count: 0,
            last_chunk: None,
            event_errors: 0,
            result: None,
            config,
            clock,
        }
    }

    /// Root span
    pub fn root(&self) -> &RootSpan {
        &self.root
    }

    /// Open span registry
    pub fn registry(&self) -> &SpanRegistry {
        &self.registry
    }

    /// Buffered post guardrails
    pub fn guardrails(&self) -> &GuardrailBuffer {
        &self.guardrails
    }

    /// Whether the answer is streamed
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Answer text accumulated so far
    pub fn completion(&self) -> &str {
        &self.completion
    }

    /// Whether [`finish`](Self::finish) already ran
    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }

    fn scope(&mut self) -> BuildScope<'_> {
        BuildScope {
            registry: &mut self.registry,
            timing: &mut self.timing,
            root: &mut self.root,
            guardrails: &mut self.guardrails,
            config: &self.config.instrumentation,
            streaming: self.streaming,
            last_chunk: self.last_chunk.clone(),
        }
    }

    /// Route one trace event to its builder.
    ///
    /// Errors are logged and counted here; the next event is processed normally.
    pub fn process(&mut self, mut event: TraceEvent) {
        let received = self.clock.now();
        event.received_at.get_or_insert(received);
        self.trace_window = Some(match self.trace_window {
            Some((first, _)) => (first, received),
            None => (received, received),
        });

        let Some(classification) = self.classifier.classify(&event) else {
            warn!("Trace event with no known component skipped");
            return;
        };
        metrics::counter!(
            "agentspan_trace_events_total",
            "component" => classification.component.as_str()
        )
        .increment(1);

        let component = classification.component;
        let correlation = self.correlation_for(classification);
        if let Err(err) = self.dispatch(&event, component, &correlation) {
            self.event_errors += 1;
            metrics::counter!("agentspan_event_errors_total").increment(1);
            error!(
                component = %component,
                correlation_id = %correlation,
                error = %err,
                "Trace event processing failed"
            );
        }
    }

    /// Synthesized ids of paired components fall back to the component's live span
    fn correlation_for(&self, classification: Classification) -> CorrelationId {
        if classification.synthesized && classification.component.is_paired() {
            if let Some(active) = self.registry.active(classification.component) {
                debug!(
                    component = %classification.component,
                    correlation_id = %active,
                    "Reusing active span for event without id"
                );
                return active.clone();
            }
        }
        classification.correlation
    }

    fn dispatch(
        &mut self,
        event: &TraceEvent,
        component: ComponentType,
        correlation: &CorrelationId,
    ) -> Result<()> {
        let mut scope = self.scope();
        builder_for(component).build(&mut scope, event, correlation)?;

        if let Some(files) = &event.files {
            let parent = scope
                .registry
                .active_key(component)
                .and_then(|key| scope.registry.get(&key).map(|r| r.handle))
                .unwrap_or_else(|| scope.root_handle());
            emit_files(&mut scope, event, correlation, parent, files)?;
        }
        Ok(())
    }

    /// Account for one content chunk delivered to the caller
    pub fn record_chunk(&mut self, text: &str) {
        self.completion.push_str(text);
        self.chunk_count += 1;
        self.last_chunk = Some(text.to_string());

        let interval = self.config.streaming.progress_interval;
        if self.streaming && interval > 0 && self.chunk_count % interval == 0 {
            self.root
                .set_attribute(AttrKey::StreamingChunksReceived, self.chunk_count);
            debug!(chunks = self.chunk_count, "Streaming progress");
        }
    }

    /// The upstream call returned
    pub fn record_invoke_complete(&mut self) {
        let now = self.clock.now();
        self.root
            .set_attribute(AttrKey::InvokeCompleteTime, format_timestamp(now));
        self.root
            .set_attribute(AttrKey::InvokeDuration, elapsed_ms(self.started_at, now));
    }

    /// Batch processing of a non-streamed response begins
    pub fn begin_processing(&mut self) {
        let now = self.clock.now();
        self.processing_started = Some(now);
        self.root
            .set_attribute(AttrKey::ProcessingStartTime, format_timestamp(now));
    }

    /// Batch processing of a non-streamed response ended
    pub fn end_processing(&mut self) {
        let now = self.clock.now();
        let started = self.processing_started.unwrap_or(now);
        self.root
            .set_attribute(AttrKey::ProcessingEndTime, format_timestamp(now));
        self.root
            .set_attribute(AttrKey::ProcessingDuration, elapsed_ms(started, now));
        if let Some((first, last)) = self.trace_window {
            self.root
                .set_attribute(AttrKey::TracesWindow, elapsed_ms(first, last));
        }
    }

    /// Record an invocation-level failure on the root
    pub fn fail(&mut self, err: &Error) {
        warn!(error = %err, "Invocation failed");
        self.record_failure(InvocationFailure::from(err));
    }

    /// Record a failure that did not come from an [`Error`]
    pub fn record_failure(&mut self, failure: InvocationFailure) {
        let now = self.clock.now();
        self.root.record_failure(failure, now);
    }

    /// Failure recorded so far
    pub fn failure(&self) -> Option<&InvocationFailure> {
        self.root.failure()
    }

    /// Result of [`finish`](Self::finish), once it ran
    pub fn result(&self) -> Option<&InvocationResult> {
        self.result.as_ref()
    }

    /// Merge and emit every buffered post guardrail. Returns the spans emitted.
    pub fn flush_guardrails(&mut self) -> usize {
        let merged = self.guardrails.drain_merged();
        let mut scope = self.scope();
        let mut emitted = 0;
        for assessment in &merged {
            match emit_consolidated(&mut scope, assessment) {
                Ok(()) => emitted += 1,
                Err(err) => error!(
                    base_correlation_id = %assessment.base,
                    error = %err,
                    "Consolidated guardrail could not be emitted"
                ),
            }
        }
        emitted
    }

    /// End-of-stream bookkeeping on the root
    pub fn finish_stream(&mut self) {
        self.flush_guardrails();
        let now = self.clock.now();
        self.root.set_attribute(AttrKey::StreamingComplete, true);
        self.root
            .set_attribute(AttrKey::StreamingEndTime, format_timestamp(now));
        self.root
            .set_attribute(AttrKey::StreamingTotalChunks, self.chunk_count);
        self.root
            .set_attribute(AttrKey::Completion, self.completion.as_str());
        info!(chunks = self.chunk_count, "Stream complete");
    }

    /// Tear down every open span and end the root. Calling it again returns the same result.
    pub fn finish(&mut self) -> InvocationResult {
        if let Some(result) = &self.result {
            return result.clone();
        }

        self.flush_guardrails();
        if !self.completion.is_empty() {
            self.root
                .set_attribute(AttrKey::Completion, self.completion.as_str());
        }
        self.registry.reset();
        self.timing.reset();

        let now = self.clock.now();
        let duration = elapsed_ms(self.started_at, now);
        self.root.set_attribute(AttrKey::DurationMs, duration);
        self.root
            .set_attribute(AttrKey::SpanEndTime, format_timestamp(now));
        self.root.set_attribute(AttrKey::SpanDuration, duration);
        self.root.end(Status::ok());

        let failure = self.root.failure().cloned();
        let result = InvocationResult {
            completion: self.completion.clone(),
            status: if failure.is_some() {
                SpanStatus::Error
            } else {
                SpanStatus::Ok
            },
            failure,
            chunk_count: self.chunk_count,
            event_errors: self.event_errors,
        };
        info!(
            duration_ms = duration,
            chunks = self.chunk_count,
            event_errors = self.event_errors,
            ok = result.is_ok(),
            "Invocation finished"
        );
        self.result = Some(result.clone());
        result
    }
}

/// Contexts of many concurrent invocations, keyed by invocation id
pub struct SharedInvocations {
    tracer: Arc<dyn Tracer>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    contexts: DashMap<String, Arc<Mutex<InvocationContext>>>,
}

impl fmt::Debug for SharedInvocations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedInvocations")
            .field("live", &self.contexts.len())
            .finish_non_exhaustive()
    }
}

impl SharedInvocations {
    /// Empty map
    pub fn new(tracer: Arc<dyn Tracer>, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        Self {
            tracer,
            clock,
            config,
            contexts: DashMap::new(),
        }
    }

    /// Start tracking an invocation
    pub fn begin(&self, id: impl Into<String>, request: &InvocationRequest) -> Result<()> {
        let id = id.into();
        match self.contexts.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(Error::internal(format!(
                "invocation {} already started",
                entry.key()
            ))),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let context = InvocationContext::begin(
                    Arc::clone(&self.tracer),
                    Arc::clone(&self.clock),
                    Arc::clone(&self.config),
                    request,
                );
                entry.insert(Arc::new(Mutex::new(context)));
                Ok(())
            }
        }
    }

    fn context(&self, id: &str) -> Result<Arc<Mutex<InvocationContext>>> {
        self.contexts
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::internal(format!("unknown invocation {id}")))
    }

    /// Process one event of an invocation
    pub fn process(&self, id: &str, event: TraceEvent) -> Result<()> {
        let context = self.context(id)?;
        context.lock().process(event);
        Ok(())
    }

    /// Account for a content chunk of an invocation
    pub fn record_chunk(&self, id: &str, text: &str) -> Result<()> {
        let context = self.context(id)?;
        context.lock().record_chunk(text);
        Ok(())
    }

    /// Finish an invocation and forget it
    pub fn finish(&self, id: &str) -> Result<InvocationResult> {
        let (_, context) = self
            .contexts
            .remove(id)
            .ok_or_else(|| Error::internal(format!("unknown invocation {id}")))?;
        let result = context.lock().finish();
        Ok(result)
    }

    /// Live invocations
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether no invocation is live
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::ManualClock;
    use crate::tracer::InMemoryTracer;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup(streaming: bool) -> (Arc<ManualClock>, Arc<InMemoryTracer>, InvocationContext) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
        let tracer = Arc::new(InMemoryTracer::with_clock(clock.clone()));
        let request = InvocationRequest::new("AGENT1", "ALIAS1", "sess-1", "hello").streaming(streaming);
        let context =
            InvocationContext::begin(tracer.clone(), clock.clone(), Arc::new(Config::default()), &request);
        (clock, tracer, context)
    }

    fn event(trace: serde_json::Value) -> TraceEvent {
        serde_json::from_value(json!({ "trace": trace })).unwrap()
    }

    #[test]
    fn root_carries_request_attributes() {
        let (_clock, tracer, mut context) = setup(false);
        context.finish();

        let root = tracer.find("Bedrock Agent: AGENT1").unwrap();
        assert_eq!(root.attribute_str(AttrKey::UserId), Some(ANONYMOUS_USER));
        assert_eq!(root.attribute_str(AttrKey::RequestModel), Some(DEFAULT_AGENT_MODEL));
        assert_eq!(root.attribute_str(AttrKey::Prompt), Some("hello"));
        assert_eq!(root.status, SpanStatus::Ok);
        assert!(root.attribute_str(AttrKey::CustomTraceId).is_some());
    }

    #[test]
    fn finish_is_idempotent_and_ends_root_once() {
        let (clock, tracer, mut context) = setup(false);
        clock.advance(Duration::milliseconds(30));
        let first = context.finish();
        let second = context.finish();

        assert_eq!(first, second);
        assert_eq!(tracer.spans_named("Bedrock Agent: AGENT1").len(), 1);
        let root = tracer.find("Bedrock Agent: AGENT1").unwrap();
        assert_eq!(root.attribute(AttrKey::DurationMs), Some(&AttrValue::Float(30.0)));
    }

    #[test]
    fn events_without_ids_share_the_active_span() {
        let (_clock, tracer, mut context) = setup(false);
        context.process(event(json!({"preProcessingTrace": {"modelInvocationInput": {"text": "classify this"}}})));
        context.process(event(json!({"preProcessingTrace": {"modelInvocationOutput": {"parsedResponse": {"isValid": true}}}})));
        context.finish();

        assert_eq!(tracer.spans_named("pre_processing").len(), 1);
        assert_eq!(tracer.spans_named("input_assessment").len(), 1);
    }

    #[test]
    fn malformed_event_is_counted_and_skipped() {
        let (_clock, tracer, mut context) = setup(false);
        context.process(event(json!({"routingClassifierTrace": {}})));
        context.process(event(json!({"failureTrace": {"failureReason": "tool crashed"}})));
        let result = context.finish();

        assert_eq!(result.status, SpanStatus::Error);
        assert_eq!(result.failure.unwrap().kind, "AgentProcessingFailure");
        assert!(tracer.find("failure").is_some());
    }

    #[test]
    fn upstream_failure_is_returned_as_data() {
        let (_clock, tracer, mut context) = setup(false);
        context.fail(&Error::upstream("throttled"));
        let result = context.finish();

        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, "UpstreamError");
        let root = tracer.find("Bedrock Agent: AGENT1").unwrap();
        assert_eq!(root.status, SpanStatus::Error);
        assert_eq!(root.events.len(), 1);
    }

    #[test]
    fn streaming_progress_is_sampled() {
        let (_clock, tracer, mut context) = setup(true);
        for _ in 0..25 {
            context.record_chunk("x");
        }
        context.finish_stream();
        context.finish();

        let root = tracer.find("Bedrock Agent: AGENT1").unwrap();
        assert_eq!(root.attribute(AttrKey::StreamingChunksReceived), Some(&AttrValue::Int(20)));
        assert_eq!(root.attribute(AttrKey::StreamingTotalChunks), Some(&AttrValue::Int(25)));
        assert_eq!(root.attribute_str(AttrKey::Completion).map(str::len), Some(25));
    }

    #[test]
    fn shared_invocations_are_isolated() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
        let tracer = Arc::new(InMemoryTracer::with_clock(clock.clone()));
        let shared = SharedInvocations::new(tracer.clone(), clock, Arc::new(Config::default()));

        shared.begin("a", &InvocationRequest::new("A", "x", "s1", "hi")).unwrap();
        shared.begin("b", &InvocationRequest::new("B", "x", "s2", "hi")).unwrap();
        assert!(shared.begin("a", &InvocationRequest::default()).is_err());

        shared
            .process("a", event(json!({"orchestrationTrace": {"modelInvocationInput": {"traceId": "t-1"}}})))
            .unwrap();
        shared
            .process("b", event(json!({"orchestrationTrace": {"modelInvocationInput": {"traceId": "t-1"}}})))
            .unwrap();
        assert!(shared.process("nope", TraceEvent::default()).is_err());

        shared.finish("a").unwrap();
        shared.finish("b").unwrap();
        assert!(shared.is_empty());
        assert_eq!(tracer.spans_named("orchestrationTrace").len(), 2);
        let a = tracer.find("Bedrock Agent: A").unwrap();
        let b = tracer.find("Bedrock Agent: B").unwrap();
        assert_ne!(a.trace_id, b.trace_id);
    }
}
