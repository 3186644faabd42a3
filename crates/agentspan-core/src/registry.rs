//! Lifecycle of the open spans of one invocation
//!
//! Component spans are keyed by `(component, correlation id)`. Tool spans live in
//! fixed slots, one per tool kind, because only one such call is in flight per
//! orchestration round. Nothing here fails on a missing key: lookups return
//! `None` and writes to unknown keys are logged and dropped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::classifier::{ComponentType, CorrelationId};
use crate::models::{AttrKey, AttrValue, Attributes, SpanKind, Status};
use crate::timing::Timing;
use crate::tracer::{SpanHandle, Tracer};

/// Unique handle of a component span
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanKey {
    /// Owning component
    pub component: ComponentType,
    /// Correlation id of the input/output pair
    pub correlation: CorrelationId,
}

impl SpanKey {
    /// Build a key
    pub fn new(component: ComponentType, correlation: CorrelationId) -> Self {
        Self {
            component,
            correlation,
        }
    }
}

impl fmt::Display for SpanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component, self.correlation)
    }
}

/// Tool spans that stay open between an input and its output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolSlot {
    /// Knowledge-base lookup
    KnowledgeBase,
    /// Action-group call
    ActionGroup,
    /// Code-interpreter run
    CodeInterpreter,
}

impl ToolSlot {
    /// Label used in logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KnowledgeBase => "knowledge_base",
            Self::ActionGroup => "action_group",
            Self::CodeInterpreter => "code_interpreter",
        }
    }
}

/// An open span plus bookkeeping
#[derive(Debug, Clone)]
pub struct SpanRecord {
    /// Tracer handle
    pub handle: SpanHandle,
    timing_protected: bool,
    attributes: Attributes,
}

impl SpanRecord {
    fn new(handle: SpanHandle, attributes: Attributes) -> Self {
        Self {
            handle,
            timing_protected: false,
            attributes,
        }
    }

    /// Whether start/end/duration are frozen
    pub fn is_timing_protected(&self) -> bool {
        self.timing_protected
    }

    /// Last value written for `key`
    pub fn attribute(&self, key: AttrKey) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// Last text value written for `key`
    pub fn attribute_str(&self, key: AttrKey) -> Option<&str> {
        self.attributes.get_str(key)
    }
}

/// Registry of the open spans of one invocation
pub struct SpanRegistry {
    tracer: Arc<dyn Tracer>,
    records: BTreeMap<SpanKey, SpanRecord>,
    active: HashMap<ComponentType, CorrelationId>,
    slots: BTreeMap<ToolSlot, SpanRecord>,
    llm_spans: HashMap<CorrelationId, SpanHandle>,
}

impl fmt::Debug for SpanRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanRegistry")
            .field("records", &self.records.keys().map(ToString::to_string).collect::<Vec<_>>())
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SpanRegistry {
    /// Empty registry writing to `tracer`
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            tracer,
            records: BTreeMap::new(),
            active: HashMap::new(),
            slots: BTreeMap::new(),
            llm_spans: HashMap::new(),
        }
    }

    /// The underlying tracer
    pub fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.tracer
    }

    /// Reuse the live span for `key`, or open a new one under `parent`.
    ///
    /// On reuse, `timing` is applied only if the span's timing is not yet protected.
    /// A new span takes `timing.start` as its start time and is protected at once.
    pub fn get_or_create(
        &mut self,
        key: &SpanKey,
        parent: Option<SpanHandle>,
        attributes: Attributes,
        timing: Option<&Timing>,
    ) -> SpanHandle {
        if let Some(handle) = self.records.get(key).map(|r| r.handle) {
            if let Some(timing) = timing {
                self.set_timing_if_not_set(key, timing);
            }
            return handle;
        }

        let mut attributes = attributes;
        if let Some(timing) = timing {
            for (k, v) in timing.attributes() {
                attributes.insert(k, v);
            }
        }

        let handle = self.tracer.start_span(
            key.component.span_name(),
            parent,
            SpanKind::Client,
            attributes.clone(),
            timing.map(|t| t.start),
        );
        let mut record = SpanRecord::new(handle, attributes);
        record.timing_protected = timing.is_some();

        if key.correlation.is_synthesized() {
            warn!(span_key = %key, "No open span for an event without an id, opened a new one");
        } else {
            debug!(span_key = %key, "Component span opened");
        }
        self.records.insert(key.clone(), record);
        self.active.insert(key.component, key.correlation.clone());
        handle
    }

    /// Live record for `key`
    pub fn get(&self, key: &SpanKey) -> Option<&SpanRecord> {
        self.records.get(key)
    }

    /// Correlation id of the component's most recently opened live span
    pub fn active(&self, component: ComponentType) -> Option<&CorrelationId> {
        self.active.get(&component)
    }

    /// Key of the component's active span, if it is still live
    pub fn active_key(&self, component: ComponentType) -> Option<SpanKey> {
        let key = SpanKey::new(component, self.active.get(&component)?.clone());
        self.records.contains_key(&key).then_some(key)
    }

    /// Freeze the timing attributes of `key`
    pub fn protect_timing(&mut self, key: &SpanKey) {
        if let Some(record) = self.records.get_mut(key) {
            record.timing_protected = true;
        }
    }

    /// Whether timing may still be written for `key`
    pub fn can_set_timing(&self, key: &SpanKey) -> bool {
        self.records.get(key).map_or(true, |r| !r.timing_protected)
    }

    /// Write timing once; later calls are silently ignored
    pub fn set_timing_if_not_set(&mut self, key: &SpanKey, timing: &Timing) -> bool {
        let tracer = Arc::clone(&self.tracer);
        let Some(record) = self.records.get_mut(key) else {
            warn!(span_key = %key, "Timing for unknown span dropped");
            return false;
        };
        if record.timing_protected {
            return false;
        }
        for (k, v) in timing.attributes() {
            tracer.set_attribute(record.handle, k, v.clone());
            record.attributes.insert(k, v);
        }
        record.timing_protected = true;
        debug!(span_key = %key, "Timing set");
        true
    }

    /// Write an attribute to a live component span
    pub fn set_attribute(&mut self, key: &SpanKey, attr: AttrKey, value: impl Into<AttrValue>) {
        let Some(record) = self.records.get_mut(key) else {
            warn!(span_key = %key, attribute = %attr, "Attribute for unknown span dropped");
            return;
        };
        let value = value.into();
        if is_timing_key(attr) && record.timing_protected {
            return;
        }
        self.tracer.set_attribute(record.handle, attr, value.clone());
        record.attributes.insert(attr, value);
    }

    /// Read back an attribute of a live component span
    pub fn attribute(&self, key: &SpanKey, attr: AttrKey) -> Option<&AttrValue> {
        self.records.get(key).and_then(|r| r.attribute(attr))
    }

    /// End a component span. Returns `false` if it was not live.
    pub fn close(&mut self, key: &SpanKey, status: Status) -> bool {
        let Some(record) = self.records.remove(key) else {
            warn!(span_key = %key, "Close requested for unknown span");
            return false;
        };
        self.tracer.set_status(record.handle, status);
        self.tracer.end(record.handle);
        if self.active.get(&key.component) == Some(&key.correlation) {
            self.active.remove(&key.component);
        }
        debug!(span_key = %key, "Component span closed");
        true
    }

    /// Park an open tool span in its slot. A span already parked there is closed OK.
    pub fn open_slot(&mut self, slot: ToolSlot, handle: SpanHandle, attributes: Attributes) {
        if let Some(previous) = self.slots.insert(slot, SpanRecord::new(handle, attributes)) {
            warn!(slot = slot.as_str(), "Tool span replaced before its output arrived");
            self.end_span(previous.handle, Status::ok());
        }
    }

    /// Remove the span parked in a slot
    pub fn take_slot(&mut self, slot: ToolSlot) -> Option<SpanRecord> {
        self.slots.remove(&slot)
    }

    /// Remember the llm span emitted for a correlation id
    pub fn record_llm(&mut self, correlation: CorrelationId, handle: SpanHandle) {
        self.llm_spans.insert(correlation, handle);
    }

    /// Llm span emitted earlier for a correlation id
    pub fn llm_span(&self, correlation: &CorrelationId) -> Option<SpanHandle> {
        self.llm_spans.get(correlation).copied()
    }

    /// Open a span that is not tracked by key
    pub fn start_span(
        &self,
        name: &str,
        parent: Option<SpanHandle>,
        kind: SpanKind,
        attributes: Attributes,
        start_time: Option<DateTime<Utc>>,
    ) -> SpanHandle {
        self.tracer.start_span(name, parent, kind, attributes, start_time)
    }

    /// Set an attribute on any span
    pub fn annotate(&self, handle: SpanHandle, key: AttrKey, value: impl Into<AttrValue>) {
        self.tracer.set_attribute(handle, key, value.into());
    }

    /// Set status and end any span
    pub fn end_span(&self, handle: SpanHandle, status: Status) {
        self.tracer.set_status(handle, status);
        self.tracer.end(handle);
    }

    /// Number of live component and tool spans
    pub fn open_count(&self) -> usize {
        self.records.len() + self.slots.len()
    }

    /// End every live span with status OK and clear all state
    pub fn reset(&mut self) {
        let slots = std::mem::take(&mut self.slots);
        let records = std::mem::take(&mut self.records);
        if !slots.is_empty() || !records.is_empty() {
            debug!(
                tool_spans = slots.len(),
                component_spans = records.len(),
                "Force-closing open spans"
            );
        }
        for (_, record) in slots {
            self.end_span(record.handle, Status::ok());
        }
        for (_, record) in records {
            self.end_span(record.handle, Status::ok());
        }
        self.active.clear();
        self.llm_spans.clear();
    }
}

fn is_timing_key(key: AttrKey) -> bool {
    matches!(
        key,
        AttrKey::SpanStartTime | AttrKey::SpanEndTime | AttrKey::SpanDuration
    )
}
