//! Trace-span export.
//!
//! Each event becomes one span: the session id hashes to a stable 16-byte
//! trace id, the event id truncates to an 8-byte span id, the outcome maps
//! to span status, input parameters flatten to attributes at depth 2, and
//! the predecessor link becomes a span link. Spans pass through a bounded
//! queue with retry; on overflow the oldest spans are dropped with an
//! error log.

use super::{EventStream, ExportError, ExportResult};
use crate::event::{Event, Outcome};
use futures::StreamExt;
use opentelemetry::trace::{
    Link, SpanContext, SpanId, SpanKind, Status, TraceFlags, TraceId, TraceState,
};
use opentelemetry::KeyValue;
use opentelemetry_sdk::export::trace::{SpanData, SpanExporter};
use opentelemetry_sdk::trace::{SpanEvents, SpanLinks};
use opentelemetry_sdk::Resource;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct SpanExportConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for SpanExportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2048,
            batch_size: 256,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SpanExportStats {
    pub exported: u64,
    pub dropped: u64,
}

/// Stream events through the bounded queue into `exporter`.
///
/// Cancellation-safe in the sense of the pipeline contract: whatever was
/// exported before a failure stays exported, and the error surfaces.
pub async fn export_spans(
    mut events: EventStream,
    exporter: &mut dyn SpanExporter,
    config: &SpanExportConfig,
) -> ExportResult<SpanExportStats> {
    let mut queue: VecDeque<SpanData> = VecDeque::with_capacity(config.queue_capacity);
    let mut stats = SpanExportStats::default();
    let mut source_done = false;

    while !source_done || !queue.is_empty() {
        // Fill the queue; overflow evicts from the front.
        while !source_done && queue.len() < config.queue_capacity {
            match events.next().await {
                Some(event) => queue.push_back(event_to_span(&event?)),
                None => source_done = true,
            }
        }

        let batch: Vec<SpanData> = {
            let take = config.batch_size.min(queue.len());
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            continue;
        }
        let batch_len = batch.len() as u64;

        let mut attempt = 0;
        let mut sent = false;
        let mut last_error = String::new();
        while attempt <= config.max_retries {
            match exporter.export(batch.clone()).await {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(e) => {
                    last_error = e.to_string();
                    attempt += 1;
                    tokio::time::sleep(config.retry_delay * attempt).await;
                }
            }
        }
        if sent {
            stats.exported += batch_len;
        } else {
            // The queue would only grow from here; shed the oldest spans.
            stats.dropped += batch_len;
            error!(
                target: "export",
                dropped = batch_len,
                error = %last_error,
                "span batch dropped after retries"
            );
        }
    }

    info!(
        target: "export",
        exported = stats.exported,
        dropped = stats.dropped,
        "span export complete"
    );
    Ok(stats)
}

/// Stable 16-byte trace id from the session grouping key.
pub fn trace_id_for_session(session_id: &str) -> TraceId {
    let digest = Sha256::digest(session_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    TraceId::from_bytes(bytes)
}

/// 8-byte span id: the event identifier truncated.
pub fn span_id_for_event(event_id: &crate::event::EventId) -> SpanId {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&event_id.as_bytes()[..8]);
    SpanId::from_bytes(bytes)
}

pub fn event_to_span(event: &Event) -> SpanData {
    let trace_id = trace_id_for_session(&event.session_id);
    let span_context = SpanContext::new(
        trace_id,
        span_id_for_event(&event.id),
        TraceFlags::SAMPLED,
        false,
        TraceState::default(),
    );

    let mut attributes = vec![
        KeyValue::new("session.id", event.session_id.clone()),
        KeyValue::new("tool.id", event.tool_id.clone()),
        KeyValue::new("input.hash", event.input_hash.clone()),
        KeyValue::new("outcome", event.outcome.as_str()),
    ];
    if !event.tags.is_empty() {
        attributes.push(KeyValue::new("tags", event.tags.join(",")));
    }
    flatten_attributes("input", &event.input_params, 0, &mut attributes);

    let mut links = SpanLinks::default();
    if let Some(predecessor) = &event.predecessor {
        let link_context = SpanContext::new(
            trace_id,
            span_id_for_event(predecessor),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        );
        links.links.push(Link::new(link_context, Vec::new()));
    }

    let status = match event.outcome {
        Outcome::Success => Status::Ok,
        Outcome::Failure => Status::error(
            event
                .output_summary
                .clone()
                .unwrap_or_else(|| "tool call failed".to_string()),
        ),
        Outcome::Partial => Status::Unset,
    };

    let start_time = SystemTime::UNIX_EPOCH
        + Duration::from_micros(event.timestamp.timestamp_micros().max(0) as u64);
    let end_time = start_time + Duration::from_millis(event.latency_ms as u64);

    SpanData {
        span_context,
        parent_span_id: SpanId::INVALID,
        span_kind: SpanKind::Internal,
        name: Cow::Owned(event.tool_id.clone()),
        start_time,
        end_time,
        attributes,
        dropped_attributes_count: 0,
        events: SpanEvents::default(),
        links,
        status,
        resource: Cow::Owned(Resource::new(vec![KeyValue::new(
            "service.name",
            "twinraven",
        )])),
        instrumentation_lib: Default::default(),
    }
}

/// Flatten a parameter tree into dotted attribute keys, two levels deep;
/// anything deeper serializes in place.
fn flatten_attributes(prefix: &str, value: &Value, depth: usize, out: &mut Vec<KeyValue>) {
    match value {
        Value::Object(map) if depth < 2 => {
            for (key, inner) in map {
                flatten_attributes(&format!("{prefix}.{key}"), inner, depth + 1, out);
            }
        }
        Value::String(s) => out.push(KeyValue::new(prefix.to_string(), s.clone())),
        Value::Bool(b) => out.push(KeyValue::new(prefix.to_string(), *b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push(KeyValue::new(prefix.to_string(), i));
            } else if let Some(f) = n.as_f64() {
                out.push(KeyValue::new(prefix.to_string(), f));
            }
        }
        Value::Null => {}
        other => out.push(KeyValue::new(prefix.to_string(), other.to_string())),
    }
}
