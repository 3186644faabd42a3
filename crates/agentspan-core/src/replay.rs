//! Offline replay of recorded agent responses
//!
//! Two on-disk formats are understood:
//!
//! - **Response items**: newline-delimited JSON, one `{"chunk": ...}` or
//!   `{"trace": ...}` object per line, exactly as the runtime streamed them.
//! - **Trace log**: bare trace events, each possibly spanning several lines,
//!   separated by lines containing only `---`.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use metrics::counter;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::instrument::{Instrumentation, InvocationOutcome};
use crate::invocation::{InvocationRequest, InvocationResult};
use crate::models::{ResponseItem, TraceEvent};

/// Separator line between events of a trace log
pub const TRACE_LOG_SEPARATOR: &str = "---";

/// Layout of a replay file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayFormat {
    /// Newline-delimited response items
    #[default]
    ResponseItems,
    /// `---`-separated trace events
    TraceLog,
}

impl FromStr for ReplayFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "response_items" | "ndjson" => Ok(Self::ResponseItems),
            "trace_log" => Ok(Self::TraceLog),
            other => Err(Error::config(format!("unknown replay format: {other}"))),
        }
    }
}

/// Items read from a replay file
#[derive(Debug, Clone, Default)]
pub struct ReplayInput {
    /// Items in file order
    pub items: Vec<ResponseItem>,
    /// Records that could not be parsed and were left out
    pub skipped: usize,
}

impl ReplayInput {
    fn skip(&mut self, what: &str, line: usize, error: &serde_json::Error) {
        warn!(line, %error, "Skipping malformed {what}");
        counter!("agentspan_replay_records_skipped_total").increment(1);
        self.skipped += 1;
    }
}

/// Parse newline-delimited response items. Blank lines are ignored and
/// malformed lines are skipped.
pub fn parse_response_items(input: &str) -> ReplayInput {
    let mut parsed = ReplayInput::default();
    for (index, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(item) => parsed.items.push(item),
            Err(e) => parsed.skip("response item", index + 1, &e),
        }
    }
    parsed
}

/// Parse a trace log into trace items. Empty sections are ignored and
/// malformed sections are skipped.
pub fn parse_trace_log(input: &str) -> ReplayInput {
    let mut parsed = ReplayInput::default();
    let mut section = String::new();
    let mut section_start = 1;

    let mut flush = |section: &mut String, start: usize| {
        if !section.trim().is_empty() {
            match serde_json::from_str::<TraceEvent>(section) {
                Ok(event) => parsed.items.push(ResponseItem::Trace(event)),
                Err(e) => parsed.skip("trace log event", start, &e),
            }
        }
        section.clear();
    };

    for (index, line) in input.lines().enumerate() {
        if line.trim() == TRACE_LOG_SEPARATOR {
            flush(&mut section, section_start);
            section_start = index + 2;
        } else {
            section.push_str(line);
            section.push('\n');
        }
    }
    flush(&mut section, section_start);
    parsed
}

/// Read and parse a replay file
pub fn load(path: &Path, format: ReplayFormat) -> Result<ReplayInput> {
    let input = std::fs::read_to_string(path)?;
    let parsed = match format {
        ReplayFormat::ResponseItems => parse_response_items(&input),
        ReplayFormat::TraceLog => parse_trace_log(&input),
    };
    debug!(
        path = %path.display(),
        items = parsed.items.len(),
        skipped = parsed.skipped,
        ?format,
        "Replay file loaded"
    );
    Ok(parsed)
}

/// Run recorded items through an instrumented invocation, as if the agent had
/// returned them for `request`
pub fn replay(
    instrumentation: &Instrumentation,
    request: &InvocationRequest,
    items: Vec<ResponseItem>,
) -> Result<InvocationResult> {
    let agent = instrumentation.instrument(move |_: &InvocationRequest| {
        Ok(items.clone().into_iter().map(Ok::<ResponseItem, Error>))
    });

    match agent.invoke(request) {
        InvocationOutcome::Completed(result) => Ok(result),
        InvocationOutcome::Streaming(mut adapter) => {
            adapter.by_ref().for_each(drop);
            adapter
                .result()
                .cloned()
                .ok_or_else(|| Error::internal("stream ended without a result"))
        }
        InvocationOutcome::Failed(failure) => Err(Error::upstream(failure.to_string())),
    }
}
