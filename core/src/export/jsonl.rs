//! Line-delimited JSON export and re-ingest.
//!
//! One canonical record per line: alphabetical field order, ISO-8601 UTC
//! timestamps at microsecond precision, lowercase UUIDs.

use super::{commit_or_cleanup, temp_sibling, EventStream, ExportError, ExportResult};
use crate::event::{canonical_json, Event};
use crate::store::EventStore;
use futures::StreamExt;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::info;

const INGEST_BATCH: usize = 1000;

/// Render one event as its canonical JSONL line (no trailing newline).
pub fn event_to_line(event: &Event) -> ExportResult<String> {
    // serde emits rfc3339 timestamps and lowercase hyphenated uuids;
    // canonical_json then fixes the key order.
    let value = serde_json::to_value(event)
        .map_err(|e| ExportError::Export(format!("serialize failed: {e}")))?;
    Ok(canonical_json(&value))
}

/// Stream events to `path`. Fails if the destination exists; the partial
/// temp file is deleted on any error.
pub async fn export_jsonl(mut events: EventStream, path: &Path) -> ExportResult<u64> {
    if tokio::fs::try_exists(path)
        .await
        .map_err(|e| ExportError::Export(e.to_string()))?
    {
        return Err(ExportError::DestinationExists(path.to_path_buf()));
    }
    let tmp = temp_sibling(path);
    let file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| ExportError::Export(format!("create failed: {e}")))?;
    let mut writer = BufWriter::new(file);

    let result = async {
        let mut written = 0u64;
        while let Some(event) = events.next().await {
            let event = event?;
            let line = event_to_line(&event)?;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ExportError::Export(format!("write failed: {e}")))?;
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| ExportError::Export(format!("write failed: {e}")))?;
            written += 1;
        }
        writer
            .flush()
            .await
            .map_err(|e| ExportError::Export(format!("flush failed: {e}")))?;
        Ok(written)
    }
    .await;

    let written = commit_or_cleanup(&tmp, path, result).await?;
    info!(target: "export", path = %path.display(), events = written, "jsonl export complete");
    Ok(written)
}

/// Re-ingest a JSONL export, appending in batches. The round-trip inverse
/// of [`export_jsonl`].
pub async fn import_jsonl(path: &Path, store: &dyn EventStore) -> ExportResult<u64> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ExportError::Export(format!("open failed: {e}")))?;
    let mut lines = BufReader::new(file).lines();

    let mut batch: Vec<Event> = Vec::with_capacity(INGEST_BATCH);
    let mut ingested = 0u64;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ExportError::Export(format!("read failed: {e}")))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)
            .map_err(|e| ExportError::Export(format!("bad record: {e}")))?;
        batch.push(event);
        if batch.len() >= INGEST_BATCH {
            ingested += batch.len() as u64;
            store.append_batch(std::mem::take(&mut batch)).await?;
        }
    }
    if !batch.is_empty() {
        ingested += batch.len() as u64;
        store.append_batch(batch).await?;
    }
    info!(target: "export", path = %path.display(), events = ingested, "jsonl import complete");
    Ok(ingested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Outcome;
    use serde_json::json;

    #[test]
    fn lines_have_alphabetical_fields_and_lowercase_ids() {
        let event = Event::new("s1", "search", json!({"q": "x"}), Outcome::Success)
            .with_latency(12)
            .with_tags(vec!["web".into()]);
        let line = event_to_line(&event).unwrap();
        let positions: Vec<usize> = [
            "\"event_id\"",
            "\"id\"",
            "\"input_hash\"",
            "\"input_params\"",
            "\"latency_ms\"",
            "\"outcome\"",
            "\"session_id\"",
            "\"tags\"",
            "\"timestamp\"",
            "\"tool_id\"",
        ]
        .iter()
        .filter_map(|field| line.find(field))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "line: {line}");
        assert!(line.contains(&event.id.to_string()));
        assert_eq!(event.id.to_string(), event.id.to_string().to_lowercase());
    }

    #[test]
    fn line_round_trips_to_equal_event() {
        let event = Event::new("s1", "read", json!({"url": "http://x"}), Outcome::Partial)
            .with_summary("body text")
            .with_latency(30);
        let line = event_to_line(&event).unwrap();
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.input_hash, event.input_hash);
        assert_eq!(back.timestamp, event.timestamp);
        assert_eq!(back.outcome, event.outcome);
        assert_eq!(back.output_summary, event.output_summary);
    }
}
