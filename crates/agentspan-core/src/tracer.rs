//! The span sink that builders write to
//!
//! Builders only see the [`Tracer`] trait. [`InMemoryTracer`] records spans for
//! tests and for the replay command; with the `otel` feature, `otel::OtelTracer`
//! exports them.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{AttrKey, AttrValue, Attributes, Span, SpanEvent, SpanKind, SpanStatus, Status};
use crate::timing::{elapsed_ms, Clock, SystemClock};

/// Opaque reference to a span created by a [`Tracer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanHandle(Uuid);

impl SpanHandle {
    /// Fresh random handle
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Span id in 32-char hex form
    pub fn span_id(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for SpanHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Injected span sink
pub trait Tracer: Send + Sync {
    /// Open a span under `parent` (or as a new trace when `None`)
    fn start_span(
        &self,
        name: &str,
        parent: Option<SpanHandle>,
        kind: SpanKind,
        attributes: Attributes,
        start_time: Option<DateTime<Utc>>,
    ) -> SpanHandle;

    /// Set or overwrite one attribute
    fn set_attribute(&self, span: SpanHandle, key: AttrKey, value: AttrValue);

    /// Set the span status
    fn set_status(&self, span: SpanHandle, status: Status);

    /// Attach a point-in-time event
    fn add_event(&self, _span: SpanHandle, _event: SpanEvent) {}

    /// End the span; ending twice has no effect
    fn end(&self, span: SpanHandle);
}

#[derive(Default)]
struct Recorded {
    open: HashMap<SpanHandle, Span>,
    finished: Vec<Span>,
}

impl Recorded {
    fn trace_id_of(&self, handle: SpanHandle) -> Option<String> {
        let span_id = handle.span_id();
        self.open
            .get(&handle)
            .or_else(|| self.finished.iter().find(|s| s.span_id == span_id))
            .map(|s| s.trace_id.clone())
    }
}

/// Tracer that keeps every span in memory
pub struct InMemoryTracer {
    clock: Arc<dyn Clock>,
    recorded: Mutex<Recorded>,
}

impl fmt::Debug for InMemoryTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recorded = self.recorded.lock();
        f.debug_struct("InMemoryTracer")
            .field("open", &recorded.open.len())
            .field("finished", &recorded.finished.len())
            .finish()
    }
}

impl Default for InMemoryTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTracer {
    /// Tracer stamping spans with the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Tracer stamping spans with the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Finished spans, in the order they ended
    pub fn finished_spans(&self) -> Vec<Span> {
        self.recorded.lock().finished.clone()
    }

    /// Spans that were started but never ended
    pub fn open_spans(&self) -> Vec<Span> {
        let mut open: Vec<Span> = self.recorded.lock().open.values().cloned().collect();
        open.sort_by_key(|s| s.started_at);
        open
    }

    /// Finished spans with the given name
    pub fn spans_named(&self, name: &str) -> Vec<Span> {
        self.recorded
            .lock()
            .finished
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// First finished span with the given name
    pub fn find(&self, name: &str) -> Option<Span> {
        self.recorded
            .lock()
            .finished
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    /// Finished children of a span
    pub fn children_of(&self, parent: &Span) -> Vec<Span> {
        self.recorded
            .lock()
            .finished
            .iter()
            .filter(|s| s.parent_span_id.as_deref() == Some(parent.span_id.as_str()))
            .cloned()
            .collect()
    }

    /// Drop everything recorded so far
    pub fn clear(&self) {
        let mut recorded = self.recorded.lock();
        recorded.open.clear();
        recorded.finished.clear();
    }

    /// Indented text rendering of all finished spans, roots first
    pub fn render_tree(&self) -> String {
        let mut spans = self.finished_spans();
        spans.sort_by_key(|s| s.started_at);
        let mut out = String::new();
        for root in spans.iter().filter(|s| s.parent_span_id.is_none()) {
            render_node(&spans, root, 0, &mut out);
        }
        out
    }
}

fn render_node(spans: &[Span], node: &Span, depth: usize, out: &mut String) {
    let status = match node.status {
        SpanStatus::Ok => "OK",
        SpanStatus::Error => "ERROR",
        SpanStatus::Unset => "UNSET",
    };
    let _ = write!(out, "{:indent$}{} [{}]", "", node.name, status, indent = depth * 2);
    if let Some(message) = &node.status_message {
        let _ = write!(out, " {message}");
    }
    if let Some(duration) = node.duration_ms {
        let _ = write!(out, " {duration:.1}ms");
    }
    out.push('\n');
    for child in spans
        .iter()
        .filter(|s| s.parent_span_id.as_deref() == Some(node.span_id.as_str()))
    {
        render_node(spans, child, depth + 1, out);
    }
}

impl Tracer for InMemoryTracer {
    fn start_span(
        &self,
        name: &str,
        parent: Option<SpanHandle>,
        kind: SpanKind,
        attributes: Attributes,
        start_time: Option<DateTime<Utc>>,
    ) -> SpanHandle {
        let handle = SpanHandle::new();
        let mut recorded = self.recorded.lock();

        let trace_id = parent
            .and_then(|p| recorded.trace_id_of(p))
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let span = Span {
            span_id: handle.span_id(),
            trace_id,
            parent_span_id: parent.map(|p| p.span_id()),
            name: name.to_string(),
            span_kind: kind,
            started_at: start_time.unwrap_or_else(|| self.clock.now()),
            ended_at: None,
            duration_ms: None,
            status: SpanStatus::Unset,
            status_message: None,
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.as_key().into_owned(), v))
                .collect(),
            events: Vec::new(),
        };
        debug!(span = name, span_id = %handle, "Span started");
        recorded.open.insert(handle, span);
        handle
    }

    fn set_attribute(&self, span: SpanHandle, key: AttrKey, value: AttrValue) {
        match self.recorded.lock().open.get_mut(&span) {
            Some(open) => {
                open.attributes.insert(key.as_key().into_owned(), value);
            }
            None => debug!(span_id = %span, %key, "Attribute on ended span ignored"),
        }
    }

    fn set_status(&self, span: SpanHandle, status: Status) {
        if let Some(open) = self.recorded.lock().open.get_mut(&span) {
            open.status = status.code;
            open.status_message = status.message;
        }
    }

    fn add_event(&self, span: SpanHandle, event: SpanEvent) {
        if let Some(open) = self.recorded.lock().open.get_mut(&span) {
            open.events.push(event);
        }
    }

    fn end(&self, span: SpanHandle) {
        let mut recorded = self.recorded.lock();
        let Some(mut finished) = recorded.open.remove(&span) else {
            warn!(span_id = %span, "End called on unknown or already ended span");
            return;
        };
        let ended_at = self.clock.now();
        finished.duration_ms = Some(elapsed_ms(finished.started_at, ended_at));
        finished.ended_at = Some(ended_at);
        recorded.finished.push(finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::ManualClock;
    use chrono::{Duration, TimeZone};

    #[test]
    fn children_inherit_trace_id_and_parent() {
        let tracer = InMemoryTracer::new();
        let root = tracer.start_span("root", None, SpanKind::Client, Attributes::new(), None);
        let child = tracer.start_span("child", Some(root), SpanKind::Client, Attributes::new(), None);
        tracer.end(child);
        tracer.end(root);

        let root = tracer.find("root").unwrap();
        let child = tracer.find("child").unwrap();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_eq!(tracer.children_of(&root).len(), 1);
    }

    #[test]
    fn ending_twice_records_one_span() {
        let tracer = InMemoryTracer::new();
        let span = tracer.start_span("once", None, SpanKind::Client, Attributes::new(), None);
        tracer.end(span);
        tracer.end(span);
        assert_eq!(tracer.finished_spans().len(), 1);
        assert!(tracer.open_spans().is_empty());
    }

    #[test]
    fn duration_comes_from_clock() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let tracer = InMemoryTracer::with_clock(clock.clone());
        let span = tracer.start_span("timed", None, SpanKind::Internal, Attributes::new(), None);
        clock.advance(Duration::milliseconds(120));
        tracer.set_status(span, Status::ok());
        tracer.end(span);

        let span = tracer.find("timed").unwrap();
        assert_eq!(span.duration_ms, Some(120.0));
        assert_eq!(span.status, SpanStatus::Ok);
    }

    #[test]
    fn render_tree_indents_children() {
        let tracer = InMemoryTracer::new();
        let root = tracer.start_span("root", None, SpanKind::Client, Attributes::new(), None);
        let child = tracer.start_span("leaf", Some(root), SpanKind::Client, Attributes::new(), None);
        tracer.set_status(child, Status::error("boom"));
        tracer.end(child);
        tracer.end(root);

        let tree = tracer.render_tree();
        assert!(tree.starts_with("root [UNSET]"));
        assert!(tree.contains("\n  leaf [ERROR] boom"));
    }
}
