//! OpenTelemetry span sink
//!
//! Bridges the [`Tracer`](crate::tracer::Tracer) seam onto an OpenTelemetry SDK
//! tracer. Feature-gated behind `otel`.

use std::collections::HashMap;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use opentelemetry::trace::{
    Span as _, SpanKind as OtelSpanKind, Status as OtelStatus, TraceContextExt, Tracer as _,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::InstrumentationConfig;
use crate::error::{Error, Result};
use crate::models::{AttrKey, AttrValue, Attributes, SpanEvent, SpanKind, SpanStatus, Status};
use crate::tracer::{SpanHandle, Tracer};

/// Instrumentation scope name of every span this crate emits
pub const SCOPE_NAME: &str = "agentspan";

/// Resource carrying the configured `service.name`
pub fn service_resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_string())
        .build()
}

/// Tracer that emits through an OpenTelemetry SDK provider
pub struct OtelTracer {
    tracer: SdkTracer,
    /// Open spans, each held by the context that owns it
    active: Mutex<HashMap<SpanHandle, Context>>,
    provider: SdkTracerProvider,
}

impl std::fmt::Debug for OtelTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelTracer")
            .field("active", &self.active.lock().len())
            .finish_non_exhaustive()
    }
}

impl OtelTracer {
    /// Batch-export over OTLP/HTTP to `config.otlp_endpoint`
    pub fn otlp(config: &InstrumentationConfig) -> Result<Self> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(config.otlp_endpoint.clone())
            .build()
            .map_err(|e| Error::config(format!("OTLP exporter: {e}")))?;

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(service_resource(&config.service_name))
            .build();
        debug!(endpoint = %config.otlp_endpoint, service = %config.service_name, "OTLP export configured");
        Ok(Self::from_provider(provider))
    }

    /// Emit through an existing provider
    pub fn from_provider(provider: SdkTracerProvider) -> Self {
        Self {
            tracer: provider.tracer(SCOPE_NAME),
            active: Mutex::new(HashMap::new()),
            provider,
        }
    }

    /// Flush pending spans and stop the provider
    pub fn shutdown(&self) -> Result<()> {
        let orphaned = self.active.lock().len();
        if orphaned > 0 {
            warn!(orphaned, "Shutting down with spans still open");
        }
        self.provider
            .shutdown()
            .map_err(|e| Error::internal(format!("OpenTelemetry shutdown: {e}")))
    }
}

fn to_value(value: AttrValue) -> Value {
    match value {
        AttrValue::Bool(b) => Value::Bool(b),
        AttrValue::Int(i) => Value::I64(i),
        AttrValue::Float(f) => Value::F64(f),
        AttrValue::Str(s) => Value::String(s.into()),
    }
}

fn key_value(key: AttrKey, value: AttrValue) -> KeyValue {
    KeyValue::new(key.as_key().into_owned(), to_value(value))
}

fn to_kind(kind: SpanKind) -> OtelSpanKind {
    match kind {
        SpanKind::Internal => OtelSpanKind::Internal,
        SpanKind::Client => OtelSpanKind::Client,
    }
}

impl Tracer for OtelTracer {
    fn start_span(
        &self,
        name: &str,
        parent: Option<SpanHandle>,
        kind: SpanKind,
        attributes: Attributes,
        start_time: Option<DateTime<Utc>>,
    ) -> SpanHandle {
        let handle = SpanHandle::new();
        let mut active = self.active.lock();

        let parent_cx = match parent {
            Some(p) => active.get(&p).cloned().unwrap_or_else(|| {
                warn!(span = name, parent_id = %p, "Parent span not open, starting a new trace");
                Context::new()
            }),
            None => Context::new(),
        };

        let mut builder = self
            .tracer
            .span_builder(name.to_string())
            .with_kind(to_kind(kind))
            .with_attributes(
                attributes
                    .into_iter()
                    .map(|(k, v)| key_value(k, v))
                    .collect::<Vec<_>>(),
            );
        if let Some(start) = start_time {
            builder = builder.with_start_time(SystemTime::from(start));
        }
        let span = builder.start_with_context(&self.tracer, &parent_cx);
        active.insert(handle, parent_cx.with_span(span));
        handle
    }

    fn set_attribute(&self, span: SpanHandle, key: AttrKey, value: AttrValue) {
        match self.active.lock().get(&span) {
            Some(cx) => cx.span().set_attribute(key_value(key, value)),
            None => debug!(span_id = %span, %key, "Attribute on ended span ignored"),
        }
    }

    fn set_status(&self, span: SpanHandle, status: Status) {
        let Some(cx) = self.active.lock().get(&span).cloned() else {
            return;
        };
        let status = match status.code {
            SpanStatus::Ok => OtelStatus::Ok,
            SpanStatus::Error => OtelStatus::error(status.message.unwrap_or_default()),
            SpanStatus::Unset => OtelStatus::Unset,
        };
        cx.span().set_status(status);
    }

    fn add_event(&self, span: SpanHandle, event: SpanEvent) {
        if let Some(cx) = self.active.lock().get(&span) {
            let attributes = event
                .attributes
                .into_iter()
                .map(|(k, v)| KeyValue::new(k, to_value(v)))
                .collect();
            cx.span().add_event_with_timestamp(
                event.name,
                SystemTime::from(event.timestamp),
                attributes,
            );
        }
    }

    fn end(&self, span: SpanHandle) {
        match self.active.lock().remove(&span) {
            Some(cx) => cx.span().end(),
            None => warn!(span_id = %span, "End called on unknown or already ended span"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use opentelemetry::Key;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::Config;
    use crate::instrument::Instrumentation;
    use crate::invocation::InvocationRequest;
    use crate::models::TraceEvent;

    fn otel_tracer() -> (Arc<OtelTracer>, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (Arc::new(OtelTracer::from_provider(provider)), exporter)
    }

    fn named<'a>(spans: &'a [SpanData], name: &str) -> &'a SpanData {
        spans
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no span named {name}"))
    }

    #[test]
    fn invocation_is_exported_as_one_trace() {
        let (tracer, exporter) = otel_tracer();
        let instrumentation = Instrumentation::new(tracer.clone(), Config::default());
        let request = InvocationRequest::new("AGENT1", "ALIAS", "s-1", "hello");

        let mut context = instrumentation.begin(&request);
        for trace in [
            json!({"orchestrationTrace": {"modelInvocationInput": {"traceId": "o-1", "text": "plan"}}}),
            json!({"orchestrationTrace": {"observation": {
                "traceId": "o-1", "type": "FINISH", "finalResponse": {"text": "done"}
            }}}),
        ] {
            let event: TraceEvent = serde_json::from_value(json!({ "trace": trace })).unwrap();
            context.process(event);
        }
        assert!(context.finish().is_ok());

        let spans = exporter.get_finished_spans().unwrap();
        let root = named(&spans, "Bedrock Agent: AGENT1");
        let round = named(&spans, "orchestrationTrace");

        assert_eq!(round.parent_span_id, root.span_context.span_id());
        assert_eq!(round.span_context.trace_id(), root.span_context.trace_id());
        assert_eq!(root.status, OtelStatus::Ok);
        assert!(round
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == AttrKey::FinalResponse.as_key()
                && kv.value == Value::from("done")));
        assert!(tracer.active.lock().is_empty());
    }

    #[test]
    fn error_status_keeps_its_message() {
        let (tracer, exporter) = otel_tracer();
        let span = tracer.start_span("failure", None, SpanKind::Internal, Attributes::new(), None);
        tracer.set_status(span, Status::error("tool crashed"));
        tracer.end(span);
        tracer.end(span);

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, OtelStatus::error("tool crashed"));
        assert_eq!(spans[0].span_kind, OtelSpanKind::Internal);
    }

    #[test]
    fn resource_carries_service_name() {
        let config = Config::default();
        let resource = service_resource(&config.instrumentation.service_name);
        assert_eq!(
            resource.get(&Key::from_static_str("service.name")),
            Some(Value::from("bedrock-agent"))
        );
    }
}
