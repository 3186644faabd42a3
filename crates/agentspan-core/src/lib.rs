//! # AgentSpan
//!
//! Turns the execution traces of an AI agent runtime into nested, timed spans.
//!
//! The runtime reports its reasoning as a flat stream of trace events: preprocessing,
//! orchestration rounds with model calls and tool invocations, post-processing,
//! guardrail checks and failures. AgentSpan classifies each event, pairs inputs with
//! their later outputs, and emits a span tree through an injected [`Tracer`].
//!
//! ## Architecture
//!
//! - **Classifier**: decides which component an event belongs to and derives its correlation id
//! - **Registry**: open spans keyed by component and correlation id
//! - **Builders**: one per component, turning paired events into nested spans
//! - **Guardrail buffer**: merges post-response guardrail fragments of a streamed answer
//! - **Streaming adapters**: pass content through to the caller while routing traces
//! - **OpenTelemetry sink** (feature `otel`): exports the spans over OTLP
//!
//! ## Quick Start
//!
//! ```bash
//! # Replay a recorded response and print the span tree
//! agentspan replay response.ndjson
//!
//! # Same, for a saved trace log
//! agentspan replay --trace-log traces.log --format json
//! ```
//!
//! [`Tracer`]: tracer::Tracer

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod builders;
pub mod classifier;
pub mod config;
pub mod error;
pub mod guardrail;
pub mod instrument;
pub mod invocation;
pub mod models;
#[cfg(feature = "otel")]
pub mod otel;
pub mod registry;
pub mod replay;
pub mod streaming;
pub mod timing;
pub mod tracer;

pub use config::Config;
pub use error::{Error, Result};
pub use instrument::{Instrumentation, InvocationOutcome};
pub use invocation::{InvocationContext, InvocationRequest, InvocationResult};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::instrument::{Instrumentation, InvocationOutcome};
    pub use crate::invocation::{
        InvocationContext, InvocationFailure, InvocationRequest, InvocationResult,
        SharedInvocations,
    };
    pub use crate::models::*;
    pub use crate::streaming::{AsyncStreamingAdapter, StreamingAdapter};
    pub use crate::timing::{Clock, ManualClock, SystemClock};
    pub use crate::tracer::{InMemoryTracer, SpanHandle, Tracer};
}
