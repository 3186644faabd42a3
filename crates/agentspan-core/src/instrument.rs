//! Instrumented agent calls
//!
//! [`Instrumentation::instrument`] takes the function that actually invokes the agent
//! and returns a wrapper with the same input. Each call through the wrapper gets its
//! own [`InvocationContext`]; nothing is patched or registered globally.
//!
//! ```
//! use std::sync::Arc;
//! use agentspan::prelude::*;
//!
//! let tracer = Arc::new(InMemoryTracer::new());
//! let instrumentation = Instrumentation::new(tracer.clone(), Config::default());
//! let agent = instrumentation.instrument(|_request: &InvocationRequest| {
//!     Ok(vec![Ok::<_, Error>(ResponseItem::text("Hi there"))])
//! });
//!
//! let request = InvocationRequest::new("AGENT", "ALIAS", "session-1", "Hello");
//! let result = agent.invoke(&request).completed().unwrap();
//! assert_eq!(result.completion, "Hi there");
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::warn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::invocation::{InvocationContext, InvocationFailure, InvocationRequest, InvocationResult};
use crate::models::ResponseItem;
use crate::streaming::{AsyncStreamingAdapter, StreamingAdapter, READ_DEADLINE_MESSAGE};
use crate::timing::{Clock, SystemClock};
use crate::tracer::Tracer;

/// What an instrumented call hands back
#[derive(Debug)]
pub enum InvocationOutcome<A> {
    /// Non-streamed response, fully processed
    Completed(InvocationResult),
    /// Streamed response; drain the adapter to receive content
    Streaming(A),
    /// The upstream call or its response failed; the root span is already ended
    Failed(InvocationFailure),
}

impl<A> InvocationOutcome<A> {
    /// Result of a completed, non-streamed call
    pub fn completed(self) -> Option<InvocationResult> {
        match self {
            Self::Completed(result) => Some(result),
            _ => None,
        }
    }

    /// Adapter of a streamed call
    pub fn into_stream(self) -> Option<A> {
        match self {
            Self::Streaming(adapter) => Some(adapter),
            _ => None,
        }
    }

    /// Failure of a call that could not complete
    pub fn failure(&self) -> Option<&InvocationFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Shared tracer, clock and configuration for instrumented calls
#[derive(Clone)]
pub struct Instrumentation {
    tracer: Arc<dyn Tracer>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Instrumentation {
    /// Instrumentation using the system clock
    pub fn new(tracer: Arc<dyn Tracer>, config: Config) -> Self {
        Self {
            tracer,
            clock: Arc::new(SystemClock),
            config: Arc::new(config),
        }
    }

    /// Replace the clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open the root span of a new invocation
    pub fn begin(&self, request: &InvocationRequest) -> InvocationContext {
        InvocationContext::begin(
            Arc::clone(&self.tracer),
            Arc::clone(&self.clock),
            Arc::clone(&self.config),
            request,
        )
    }

    /// Wrap a blocking agent call
    pub fn instrument<F, I>(&self, call: F) -> Instrumented<F>
    where
        F: Fn(&InvocationRequest) -> Result<I>,
        I: IntoIterator<Item = Result<ResponseItem>>,
    {
        Instrumented {
            instrumentation: self.clone(),
            call,
        }
    }

    /// Wrap an async agent call
    pub fn instrument_async<F, Fut, S>(&self, call: F) -> InstrumentedAsync<F>
    where
        F: Fn(InvocationRequest) -> Fut,
        Fut: Future<Output = Result<S>>,
        S: Stream<Item = Result<ResponseItem>> + Unpin,
    {
        InstrumentedAsync {
            instrumentation: self.clone(),
            call,
        }
    }
}

/// Feed one non-streamed item into the context. Returns the upstream error, if any.
fn consume(context: &mut InvocationContext, item: Result<ResponseItem>) -> Option<Error> {
    match item {
        Ok(ResponseItem::Chunk(chunk)) => context.record_chunk(&chunk.text()),
        Ok(ResponseItem::Trace(event)) => context.process(event),
        Err(err) => return Some(err),
    }
    None
}

/// End a context whose upstream failed
fn failed<A>(mut context: InvocationContext, err: &Error) -> InvocationOutcome<A> {
    context.fail(err);
    let result = context.finish();
    InvocationOutcome::Failed(
        result
            .failure
            .unwrap_or_else(|| InvocationFailure::from(err)),
    )
}

/// A blocking agent call wrapped with span construction
pub struct Instrumented<F> {
    instrumentation: Instrumentation,
    call: F,
}

impl<F> std::fmt::Debug for Instrumented<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumented")
            .field("instrumentation", &self.instrumentation)
            .finish_non_exhaustive()
    }
}

impl<F, I> Instrumented<F>
where
    F: Fn(&InvocationRequest) -> Result<I>,
    I: IntoIterator<Item = Result<ResponseItem>>,
{
    /// Invoke the agent.
    ///
    /// A non-streamed response is consumed here; a streamed one is returned wrapped
    /// in a [`StreamingAdapter`] that finalises the invocation when drained.
    pub fn invoke(&self, request: &InvocationRequest) -> InvocationOutcome<StreamingAdapter<I::IntoIter>> {
        let mut context = self.instrumentation.begin(request);
        let upstream = match (self.call)(request) {
            Ok(upstream) => upstream,
            Err(err) => return failed(context, &err),
        };
        context.record_invoke_complete();

        if request.streaming {
            return InvocationOutcome::Streaming(StreamingAdapter::new(upstream.into_iter(), context));
        }

        context.begin_processing();
        for item in upstream {
            if let Some(err) = consume(&mut context, item) {
                context.end_processing();
                return failed(context, &err);
            }
        }
        context.end_processing();
        InvocationOutcome::Completed(context.finish())
    }
}

/// An async agent call wrapped with span construction
pub struct InstrumentedAsync<F> {
    instrumentation: Instrumentation,
    call: F,
}

impl<F> std::fmt::Debug for InstrumentedAsync<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentedAsync")
            .field("instrumentation", &self.instrumentation)
            .finish_non_exhaustive()
    }
}

impl<F, Fut, S> InstrumentedAsync<F>
where
    F: Fn(InvocationRequest) -> Fut,
    Fut: Future<Output = Result<S>>,
    S: Stream<Item = Result<ResponseItem>> + Unpin,
{
    /// Invoke the agent.
    ///
    /// `streaming.read_deadline` bounds the wait for each upstream item, both here
    /// for non-streamed responses and in the returned [`AsyncStreamingAdapter`].
    pub async fn invoke(
        &self,
        request: &InvocationRequest,
    ) -> InvocationOutcome<AsyncStreamingAdapter<S>> {
        let mut context = self.instrumentation.begin(request);
        let mut upstream = match (self.call)(request.clone()).await {
            Ok(upstream) => upstream,
            Err(err) => return failed(context, &err),
        };
        context.record_invoke_complete();

        let deadline = self.instrumentation.config.streaming.read_deadline;
        if request.streaming {
            return InvocationOutcome::Streaming(
                AsyncStreamingAdapter::new(upstream, context).with_deadline(deadline),
            );
        }

        context.begin_processing();
        loop {
            let next = match deadline {
                Some(limit) => match tokio::time::timeout(limit, upstream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(deadline = ?limit, "No upstream item before the read deadline");
                        let err = Error::ReadDeadline(limit);
                        context.record_failure(InvocationFailure::new(err.kind(), READ_DEADLINE_MESSAGE));
                        context.end_processing();
                        let result = context.finish();
                        return InvocationOutcome::Failed(
                            result.failure.unwrap_or_else(|| InvocationFailure::from(&err)),
                        );
                    }
                },
                None => upstream.next().await,
            };
            let Some(item) = next else { break };
            if let Some(err) = consume(&mut context, item) {
                context.end_processing();
                return failed(context, &err);
            }
        }
        context.end_processing();
        InvocationOutcome::Completed(context.finish())
    }
}
