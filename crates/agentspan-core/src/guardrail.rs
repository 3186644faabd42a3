//! Buffering and merging of post-response guardrail fragments
//!
//! While an answer streams, the runtime emits one post-guardrail trace per
//! evaluated slice of text. They are collected here per base correlation id and
//! merged into one consolidated assessment when the stream ends.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::classifier::CorrelationId;
use crate::models::{GuardrailTrace, Policy};

/// Separator between the base id and the fragment suffix of a post-guardrail id
pub const POST_SUFFIX_MARKER: &str = "-guardrail-post-";

/// Guardrail actions that mean the guardrail changed or blocked content
pub const INTERVENTION_ACTIONS: [&str; 3] = ["GUARDRAIL_INTERVENED", "INTERVENED", "BLOCKED"];

/// Whether an action string denotes an intervention
pub fn is_intervention(action: &str) -> bool {
    INTERVENTION_ACTIONS.contains(&action)
}

/// Strip the post-guardrail fragment suffix from a correlation id
pub fn base_correlation(id: &CorrelationId) -> CorrelationId {
    match id.as_str().split_once(POST_SUFFIX_MARKER) {
        Some((base, _)) => CorrelationId::from(base),
        None => id.clone(),
    }
}

/// Whether an assessment object carries at least one non-empty policy
pub fn is_substantive(assessment: &Value) -> bool {
    Policy::ALL.iter().any(|p| match assessment.get(p.field()) {
        None | Some(Value::Null) => false,
        Some(Value::Object(m)) => !m.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(_) => true,
    })
}

/// One buffered post-guardrail fragment
#[derive(Debug, Clone)]
pub struct GuardrailBufferEntry {
    /// Base correlation id shared by all fragments of one answer
    pub base: CorrelationId,
    /// When the fragment was buffered
    pub received_at: DateTime<Utc>,
    /// Raw guardrail payload
    pub trace: GuardrailTrace,
    /// Content chunk the fragment followed, if any
    pub content: Option<String>,
}

/// Result of merging all fragments of one base id
#[derive(Debug, Clone, PartialEq)]
pub struct MergedAssessment {
    /// Base correlation id
    pub base: CorrelationId,
    /// Action of the first fragment
    pub action: String,
    /// Number of fragments merged
    pub chunk_count: usize,
    /// De-duplicated substantive assessments, in arrival order
    pub assessments: Vec<Value>,
    /// Whether any fragment reported an intervention
    pub intervened: bool,
    /// First and last buffering time
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl MergedAssessment {
    /// Merge the fragments of one base id
    pub fn merge(base: CorrelationId, entries: &[GuardrailBufferEntry]) -> Self {
        let mut assessments: Vec<Value> = Vec::new();
        for entry in entries {
            for assessment in &entry.trace.output_assessments {
                if is_substantive(assessment) && !assessments.contains(assessment) {
                    assessments.push(assessment.clone());
                }
            }
        }

        Self {
            base,
            action: entries
                .first()
                .map_or("NONE", |e| e.trace.action())
                .to_string(),
            chunk_count: entries.len(),
            assessments,
            intervened: entries.iter().any(|e| is_intervention(e.trace.action())),
            window: entries
                .first()
                .zip(entries.last())
                .map(|(first, last)| (first.received_at, last.received_at)),
        }
    }
}

/// Post-guardrail fragments of one invocation, grouped by base id in arrival order
#[derive(Debug, Default)]
pub struct GuardrailBuffer {
    groups: Vec<(CorrelationId, Vec<GuardrailBufferEntry>)>,
}

impl GuardrailBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a fragment under its base id
    pub fn push(&mut self, entry: GuardrailBufferEntry) {
        metrics::counter!("agentspan_guardrail_fragments_total").increment(1);
        debug!(base_correlation_id = %entry.base, "Guardrail fragment buffered");
        match self.groups.iter_mut().find(|(base, _)| *base == entry.base) {
            Some((_, entries)) => entries.push(entry),
            None => self.groups.push((entry.base.clone(), vec![entry])),
        }
    }

    /// Number of distinct base ids
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total fragments across all base ids
    pub fn fragment_count(&self) -> usize {
        self.groups.iter().map(|(_, e)| e.len()).sum()
    }

    /// Merge every group and empty the buffer.
    ///
    /// The buffer is emptied before merging, so a later flush never sees these
    /// fragments again.
    pub fn drain_merged(&mut self) -> Vec<MergedAssessment> {
        std::mem::take(&mut self.groups)
            .into_iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(base, entries)| MergedAssessment::merge(base, &entries))
            .collect()
    }

    /// Drop everything without merging
    pub fn clear(&mut self) {
        self.groups.clear();
    }
}
