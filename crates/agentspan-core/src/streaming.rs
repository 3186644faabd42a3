//! Streaming adapters
//!
//! Both adapters sit between the upstream response and the caller. Content chunks
//! are handed through untouched while their text is accumulated; trace items are
//! routed into the invocation's builders. When the upstream ends, fails, or the
//! adapter is dropped, the invocation is finalised exactly once.
//!
//! [`StreamingAdapter`] wraps a blocking [`Iterator`]; [`AsyncStreamingAdapter`]
//! wraps a [`futures::Stream`] and can enforce a read deadline between items.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::time::Sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::invocation::{InvocationContext, InvocationFailure, InvocationResult};
use crate::models::ResponseItem;

/// Called once with the final result when a stream is finalised
pub type CompletionCallback = Box<dyn FnOnce(&InvocationResult) + Send>;

/// Message recorded on the root when the read deadline fires
pub const READ_DEADLINE_MESSAGE: &str = "stream read deadline exceeded";

/// State shared by both adapters
struct StreamCore {
    context: InvocationContext,
    callback: Option<CompletionCallback>,
    done: bool,
}

impl StreamCore {
    fn new(context: InvocationContext) -> Self {
        Self {
            context,
            callback: None,
            done: false,
        }
    }

    fn observe(&mut self, item: &ResponseItem) {
        match item {
            ResponseItem::Chunk(chunk) => self.context.record_chunk(&chunk.text()),
            ResponseItem::Trace(event) => self.context.process(event.clone()),
        }
    }

    fn fail(&mut self, err: &Error) {
        self.context.fail(err);
    }

    fn finalise(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.context.finish_stream();
        let result = self.context.finish();
        if let Some(callback) = self.callback.take() {
            callback(&result);
        }
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        if !self.done {
            debug!("Stream dropped before the upstream ended");
            self.finalise();
        }
    }
}

/// Pass-through adapter over a blocking upstream
pub struct StreamingAdapter<I> {
    upstream: I,
    core: StreamCore,
}

impl<I> fmt::Debug for StreamingAdapter<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingAdapter")
            .field("context", &self.core.context)
            .field("done", &self.core.done)
            .finish_non_exhaustive()
    }
}

impl<I> StreamingAdapter<I>
where
    I: Iterator<Item = Result<ResponseItem>>,
{
    /// Wrap `upstream`; `context` must already have its root span open
    pub fn new(upstream: I, context: InvocationContext) -> Self {
        Self {
            upstream,
            core: StreamCore::new(context),
        }
    }

    /// Run `callback` with the final result once the stream is finalised
    #[must_use]
    pub fn on_complete(mut self, callback: impl FnOnce(&InvocationResult) + Send + 'static) -> Self {
        self.core.callback = Some(Box::new(callback));
        self
    }

    /// Invocation state behind the adapter
    pub fn context(&self) -> &InvocationContext {
        &self.core.context
    }

    /// Final result, once the stream has been finalised
    pub fn result(&self) -> Option<&InvocationResult> {
        self.core.context.result()
    }
}

impl<I> Iterator for StreamingAdapter<I>
where
    I: Iterator<Item = Result<ResponseItem>>,
{
    type Item = Result<ResponseItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.core.done {
            return None;
        }
        match self.upstream.next() {
            Some(Ok(item)) => {
                self.core.observe(&item);
                Some(Ok(item))
            }
            Some(Err(err)) => {
                self.core.fail(&err);
                self.core.finalise();
                Some(Err(err))
            }
            None => {
                self.core.finalise();
                None
            }
        }
    }
}

/// Pass-through adapter over an async upstream, with an optional read deadline.
///
/// The deadline timer is a tokio timer, so the adapter must be polled inside a
/// tokio runtime when a deadline is set.
pub struct AsyncStreamingAdapter<S> {
    upstream: S,
    core: StreamCore,
    deadline: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<S> fmt::Debug for AsyncStreamingAdapter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncStreamingAdapter")
            .field("context", &self.core.context)
            .field("deadline", &self.deadline)
            .field("done", &self.core.done)
            .finish_non_exhaustive()
    }
}

impl<S> AsyncStreamingAdapter<S>
where
    S: Stream<Item = Result<ResponseItem>> + Unpin,
{
    /// Wrap `upstream` with no read deadline
    pub fn new(upstream: S, context: InvocationContext) -> Self {
        Self {
            upstream,
            core: StreamCore::new(context),
            deadline: None,
            sleep: None,
        }
    }

    /// Give up when no upstream item arrives within `deadline`
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run `callback` with the final result once the stream is finalised
    #[must_use]
    pub fn on_complete(mut self, callback: impl FnOnce(&InvocationResult) + Send + 'static) -> Self {
        self.core.callback = Some(Box::new(callback));
        self
    }

    /// Invocation state behind the adapter
    pub fn context(&self) -> &InvocationContext {
        &self.core.context
    }

    /// Final result, once the stream has been finalised
    pub fn result(&self) -> Option<&InvocationResult> {
        self.core.context.result()
    }
}

impl<S> Stream for AsyncStreamingAdapter<S>
where
    S: Stream<Item = Result<ResponseItem>> + Unpin,
{
    type Item = Result<ResponseItem>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.core.done {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => {
                this.sleep = None;
                this.core.observe(&item);
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.sleep = None;
                this.core.fail(&err);
                this.core.finalise();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.sleep = None;
                this.core.finalise();
                Poll::Ready(None)
            }
            Poll::Pending => {
                let Some(deadline) = this.deadline else {
                    return Poll::Pending;
                };
                let sleep = this
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(deadline)));
                if sleep.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }

                this.sleep = None;
                warn!(deadline = ?deadline, "No upstream item before the read deadline");
                metrics::counter!("agentspan_read_deadline_exceeded_total").increment(1);
                let err = Error::ReadDeadline(deadline);
                this.core
                    .context
                    .record_failure(InvocationFailure::new(err.kind(), READ_DEADLINE_MESSAGE));
                this.core.finalise();
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::invocation::InvocationRequest;
    use crate::models::{AttrKey, AttrValue, SpanStatus, TraceEvent};
    use crate::timing::ManualClock;
    use crate::tracer::InMemoryTracer;
    use chrono::{TimeZone, Utc};
    use futures::{stream, StreamExt};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn context(tracer: &Arc<InMemoryTracer>) -> InvocationContext {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
        let request = InvocationRequest::new("AGENT1", "ALIAS1", "sess-1", "hi").streaming(true);
        InvocationContext::begin(tracer.clone(), clock, Arc::new(Config::default()), &request)
    }

    fn trace(value: serde_json::Value) -> ResponseItem {
        let event: TraceEvent = serde_json::from_value(json!({ "trace": value })).unwrap();
        ResponseItem::Trace(event)
    }

    fn items() -> Vec<Result<ResponseItem>> {
        vec![
            Ok(ResponseItem::text("Hello, ")),
            Ok(trace(json!({"orchestrationTrace": {"modelInvocationInput": {"traceId": "t-1"}}}))),
            Ok(ResponseItem::text("world")),
        ]
    }

    #[test]
    fn content_passes_through_unchanged() {
        let tracer = Arc::new(InMemoryTracer::new());
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let adapter = StreamingAdapter::new(items().into_iter(), context(&tracer))
            .on_complete(move |result| *sink.lock() = Some(result.completion.clone()));

        let delivered: Vec<ResponseItem> = adapter.map(|item| item.unwrap()).collect();
        let expected: Vec<ResponseItem> = items().into_iter().map(|i| i.unwrap()).collect();
        assert_eq!(delivered, expected);
        assert_eq!(seen.lock().as_deref(), Some("Hello, world"));

        let root = tracer.find("Bedrock Agent: AGENT1").unwrap();
        assert_eq!(root.attribute_str(AttrKey::Completion), Some("Hello, world"));
        assert_eq!(root.attribute(AttrKey::StreamingComplete), Some(&AttrValue::Bool(true)));
        assert!(tracer.find("orchestrationTrace").is_some());
    }

    #[test]
    fn upstream_error_fails_root_and_ends_iteration() {
        let tracer = Arc::new(InMemoryTracer::new());
        let upstream = vec![
            Ok(ResponseItem::text("partial")),
            Err(Error::upstream("connection reset")),
            Ok(ResponseItem::text("never")),
        ];
        let mut adapter = StreamingAdapter::new(upstream.into_iter(), context(&tracer));

        assert!(adapter.next().unwrap().is_ok());
        assert!(adapter.next().unwrap().is_err());
        assert!(adapter.next().is_none());

        let result = adapter.result().unwrap();
        assert_eq!(result.status, SpanStatus::Error);
        assert_eq!(result.completion, "partial");
        assert_eq!(tracer.spans_named("Bedrock Agent: AGENT1").len(), 1);
    }

    #[test]
    fn dropping_early_still_ends_root() {
        let tracer = Arc::new(InMemoryTracer::new());
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        {
            let mut adapter = StreamingAdapter::new(items().into_iter(), context(&tracer))
                .on_complete(move |_| *counter.lock() += 1);
            let _ = adapter.next();
        }
        assert_eq!(*calls.lock(), 1);
        assert!(tracer.open_spans().is_empty());
        assert!(tracer.find("Bedrock Agent: AGENT1").is_some());
    }

    #[tokio::test]
    async fn async_adapter_passes_items_through() {
        let tracer = Arc::new(InMemoryTracer::new());
        let adapter = AsyncStreamingAdapter::new(stream::iter(items()), context(&tracer))
            .with_deadline(Some(Duration::from_secs(5)));

        let delivered: Vec<_> = adapter.collect().await;
        assert_eq!(delivered.len(), 3);
        let root = tracer.find("Bedrock Agent: AGENT1").unwrap();
        assert_eq!(root.status, SpanStatus::Ok);
        assert_eq!(root.attribute_str(AttrKey::Completion), Some("Hello, world"));
    }

    #[tokio::test]
    async fn read_deadline_fails_the_invocation() {
        let tracer = Arc::new(InMemoryTracer::new());
        let upstream = stream::iter(items()).chain(stream::pending());
        let mut adapter = AsyncStreamingAdapter::new(upstream, context(&tracer))
            .with_deadline(Some(Duration::from_millis(20)));

        for _ in 0..3 {
            assert!(adapter.next().await.unwrap().is_ok());
        }
        let err = adapter.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ReadDeadline(_)));
        assert!(adapter.next().await.is_none());

        let failure = adapter.result().unwrap().failure.clone().unwrap();
        assert_eq!(failure.kind, "ReadDeadlineExceeded");
        assert_eq!(failure.message, READ_DEADLINE_MESSAGE);
        let root = tracer.find("Bedrock Agent: AGENT1").unwrap();
        assert_eq!(root.status, SpanStatus::Error);
    }
}
