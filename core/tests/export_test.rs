use chrono::Duration;
use futures::future::BoxFuture;
use opentelemetry_sdk::export::trace::{ExportResult as OtelExportResult, SpanData, SpanExporter};
use serde_json::json;
use std::sync::{Arc, Mutex};
use twinraven_core::event::{Event, Outcome};
use twinraven_core::export::spans::trace_id_for_session;
use twinraven_core::export::{
    export_jsonl, export_parquet, export_spans, import_jsonl, import_parquet, EventStream,
    ExportError, SpanExportConfig,
};
use twinraven_core::store::{EventStore, MemoryEventStore};

fn fixture_events(n: usize) -> Vec<Event> {
    let mut previous: Option<Event> = None;
    (0..n)
        .map(|i| {
            let mut event = Event::new(
                format!("session-{}", i % 3),
                format!("tool-{}", i % 4),
                json!({"index": i, "nested": {"deep": {"x": 1}}}),
                match i % 3 {
                    0 => Outcome::Success,
                    1 => Outcome::Failure,
                    _ => Outcome::Partial,
                },
            )
            .with_latency((i * 7) as u32)
            .with_tags(vec![format!("tag{}", i % 2)]);
            event.timestamp = event.timestamp + Duration::milliseconds(i as i64);
            if i % 3 != 0 {
                event.predecessor = previous.as_ref().map(|p| p.id);
            }
            if i > 5 {
                event.output_summary = Some(format!("output {i}"));
            }
            previous = Some(event.clone());
            event
        })
        .collect()
}

fn stream_of(events: Vec<Event>) -> EventStream {
    Box::pin(futures::stream::iter(events.into_iter().map(Ok)))
}

fn assert_events_equal(a: &Event, b: &Event) {
    assert_eq!(a.id, b.id);
    assert_eq!(a.session_id, b.session_id);
    assert_eq!(a.tool_id, b.tool_id);
    assert_eq!(a.input_hash, b.input_hash);
    assert_eq!(a.input_params, b.input_params);
    assert_eq!(a.output_summary, b.output_summary);
    assert_eq!(a.predecessor, b.predecessor);
    assert_eq!(a.successor, b.successor);
    assert_eq!(a.timestamp, b.timestamp);
    assert_eq!(a.latency_ms, b.latency_ms);
    assert_eq!(a.outcome, b.outcome);
    assert_eq!(a.tags, b.tags);
}

#[tokio::test]
async fn jsonl_round_trip_preserves_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let events = fixture_events(20);

    let written = export_jsonl(stream_of(events.clone()), &path).await.unwrap();
    assert_eq!(written, 20);

    let store = MemoryEventStore::new();
    let ingested = import_jsonl(&path, store.as_ref()).await.unwrap();
    assert_eq!(ingested, 20);

    for original in &events {
        let loaded = store.get_by_id(original.id).await.unwrap().unwrap();
        assert_events_equal(original, &loaded);
    }
}

#[tokio::test]
async fn parquet_round_trip_preserves_fields_and_types() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.parquet");
    let events = fixture_events(20);

    let written = export_parquet(stream_of(events.clone()), &path).await.unwrap();
    assert_eq!(written, 20);

    let store = MemoryEventStore::new();
    let ingested = import_parquet(&path, store.as_ref()).await.unwrap();
    assert_eq!(ingested, 20);

    for original in &events {
        let loaded = store.get_by_id(original.id).await.unwrap().unwrap();
        assert_events_equal(original, &loaded);
    }
}

#[tokio::test]
async fn existing_destination_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    tokio::fs::write(&path, b"occupied").await.unwrap();

    let err = export_jsonl(stream_of(fixture_events(1)), &path)
        .await
        .unwrap_err();
    assert!(matches!(err, ExportError::DestinationExists(_)));

    let err = export_parquet(stream_of(fixture_events(1)), &path)
        .await
        .unwrap_err();
    assert!(matches!(err, ExportError::DestinationExists(_)));
}

#[tokio::test]
async fn failed_export_leaves_no_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");

    let events: Vec<Result<Event, twinraven_core::store::StorageError>> = vec![
        Ok(fixture_events(1).remove(0)),
        Err(twinraven_core::store::StorageError::Io("source died".into())),
    ];
    let stream: EventStream = Box::pin(futures::stream::iter(events));
    let err = export_jsonl(stream, &path).await.unwrap_err();
    assert!(matches!(err, ExportError::Storage(_)));
    assert!(!path.exists());
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[derive(Debug, Clone)]
struct CollectingExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
    fail: bool,
}

impl SpanExporter for CollectingExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, OtelExportResult> {
        let spans = Arc::clone(&self.spans);
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                return Err(opentelemetry::trace::TraceError::Other(
                    "injected exporter failure".into(),
                ));
            }
            spans.lock().unwrap().extend(batch);
            Ok(())
        })
    }
}

#[tokio::test]
async fn span_export_maps_sessions_to_traces() {
    let events = fixture_events(12);
    let mut exporter = CollectingExporter {
        spans: Arc::new(Mutex::new(Vec::new())),
        fail: false,
    };

    let stats = export_spans(
        stream_of(events.clone()),
        &mut exporter,
        &SpanExportConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(stats.exported, 12);
    assert_eq!(stats.dropped, 0);

    let spans = exporter.spans.lock().unwrap();
    assert_eq!(spans.len(), 12);
    for event in &events {
        // Span id is the truncated event id; trace id is stable per session.
        let span = spans
            .iter()
            .find(|s| s.span_context.span_id().to_bytes()[..] == event.id.as_bytes()[..8])
            .expect("span for event");
        assert_eq!(span.name.as_ref(), event.tool_id);
        assert_eq!(
            span.span_context.trace_id(),
            trace_id_for_session(&event.session_id)
        );
        if let Some(predecessor) = event.predecessor {
            assert_eq!(
                span.links.links[0].span_context.span_id().to_bytes()[..],
                predecessor.as_bytes()[..8]
            );
        }
    }
}

#[tokio::test]
async fn failing_span_exporter_drops_after_retries() {
    let events = fixture_events(6);
    let mut exporter = CollectingExporter {
        spans: Arc::new(Mutex::new(Vec::new())),
        fail: true,
    };
    let config = SpanExportConfig {
        max_retries: 1,
        retry_delay: std::time::Duration::from_millis(1),
        ..Default::default()
    };
    let stats = export_spans(stream_of(events), &mut exporter, &config)
        .await
        .unwrap();
    assert_eq!(stats.exported, 0);
    assert_eq!(stats.dropped, 6);
}
