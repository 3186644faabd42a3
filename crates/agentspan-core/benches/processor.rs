//! Event processing throughput

use std::sync::Arc;

use agentspan::classifier::EventClassifier;
use agentspan::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

fn round(n: usize) -> Vec<TraceEvent> {
    let id = format!("o-{n}");
    [
        json!({"orchestrationTrace": {"modelInvocationInput": {"traceId": id, "text": "plan"}}}),
        json!({"orchestrationTrace": {"modelInvocationOutput": {
            "traceId": id,
            "rawResponse": {"content": "thinking"},
            "metadata": {"usage": {"inputTokens": 512, "outputTokens": 64}}
        }}}),
        json!({"orchestrationTrace": {"rationale": {"traceId": id, "text": "use the tool"}}}),
        json!({"orchestrationTrace": {"invocationInput": {
            "traceId": id,
            "knowledgeBaseLookupInput": {"text": "query", "knowledgeBaseId": "KB1"}
        }}}),
        json!({"orchestrationTrace": {"observation": {
            "traceId": id,
            "knowledgeBaseLookupOutput": {"retrievedReferences": [{"content": {"text": "doc"}}]}
        }}}),
        json!({"orchestrationTrace": {"observation": {
            "traceId": id, "type": "FINISH", "finalResponse": {"text": "answer"}
        }}}),
    ]
    .into_iter()
    .map(|trace| serde_json::from_value(json!({ "trace": trace })).unwrap())
    .collect()
}

fn bench_classify(c: &mut Criterion) {
    let events = round(0);
    let mut classifier = EventClassifier::new(Arc::new(SystemClock));

    c.bench_function("classify", |b| {
        b.iter(|| {
            for event in &events {
                black_box(classifier.classify(black_box(event)));
            }
        });
    });
}

fn bench_invocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("invocation");
    let tracer = Arc::new(InMemoryTracer::new());
    let instrumentation = Instrumentation::new(tracer.clone(), Config::default());
    let request = InvocationRequest::new("AGENT", "ALIAS", "bench", "hello");

    for rounds in [1usize, 10, 50] {
        let events: Vec<TraceEvent> = (0..rounds).flat_map(round).collect();
        group.throughput(Throughput::Elements(events.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rounds), &events, |b, events| {
            b.iter(|| {
                let mut context = instrumentation.begin(&request);
                for event in events {
                    context.process(event.clone());
                }
                black_box(context.finish());
                tracer.clear();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_classify, bench_invocation);
criterion_main!(benches);
