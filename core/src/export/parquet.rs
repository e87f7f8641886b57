//! Columnar export in 10 000-row record batches.
//!
//! Timestamps are microsecond UTC, nested parameter trees are serialized
//! as JSON strings, tags use a native list column.

use super::{commit_or_cleanup, temp_sibling, EventStream, ExportError, ExportResult};
use crate::event::{Event, EventId, Outcome};
use crate::store::EventStore;
use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{
    Array, ArrayRef, Int32Array, ListArray, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::DateTime;
use futures::StreamExt;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::AsyncArrowWriter;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const BATCH_ROWS: usize = 10_000;

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("event_id", DataType::Utf8, false),
        Field::new("session_id", DataType::Utf8, false),
        Field::new("tool_id", DataType::Utf8, false),
        Field::new("input_hash", DataType::Utf8, false),
        Field::new("input_params", DataType::Utf8, false),
        Field::new("output_summary", DataType::Utf8, true),
        Field::new("predecessor", DataType::Utf8, true),
        Field::new("successor", DataType::Utf8, true),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("latency_ms", DataType::Int32, false),
        Field::new("outcome", DataType::Utf8, false),
        Field::new(
            "tags",
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
            false,
        ),
    ]))
}

#[derive(Default)]
struct ColumnBuffer {
    event_id: Vec<String>,
    session_id: Vec<String>,
    tool_id: Vec<String>,
    input_hash: Vec<String>,
    input_params: Vec<String>,
    output_summary: Vec<Option<String>>,
    predecessor: Vec<Option<String>>,
    successor: Vec<Option<String>>,
    timestamp_us: Vec<i64>,
    latency_ms: Vec<i32>,
    outcome: Vec<String>,
    tags: Vec<Vec<String>>,
}

impl ColumnBuffer {
    fn push(&mut self, event: &Event) {
        self.event_id.push(event.id.to_string());
        self.session_id.push(event.session_id.clone());
        self.tool_id.push(event.tool_id.clone());
        self.input_hash.push(event.input_hash.clone());
        self.input_params.push(event.input_params.to_string());
        self.output_summary.push(event.output_summary.clone());
        self.predecessor
            .push(event.predecessor.map(|id| id.to_string()));
        self.successor.push(event.successor.map(|id| id.to_string()));
        self.timestamp_us.push(event.timestamp.timestamp_micros());
        self.latency_ms.push(event.latency_ms as i32);
        self.outcome.push(event.outcome.as_str().to_string());
        self.tags.push(event.tags.clone());
    }

    fn len(&self) -> usize {
        self.event_id.len()
    }

    fn into_batch(self) -> ExportResult<RecordBatch> {
        let mut tags = ListBuilder::new(StringBuilder::new());
        for row in &self.tags {
            for tag in row {
                tags.values().append_value(tag);
            }
            tags.append(true);
        }
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(self.event_id)),
            Arc::new(StringArray::from(self.session_id)),
            Arc::new(StringArray::from(self.tool_id)),
            Arc::new(StringArray::from(self.input_hash)),
            Arc::new(StringArray::from(self.input_params)),
            Arc::new(StringArray::from(self.output_summary)),
            Arc::new(StringArray::from(self.predecessor)),
            Arc::new(StringArray::from(self.successor)),
            Arc::new(TimestampMicrosecondArray::from(self.timestamp_us).with_timezone("UTC")),
            Arc::new(Int32Array::from(self.latency_ms)),
            Arc::new(StringArray::from(self.outcome)),
            Arc::new(tags.finish()),
        ];
        RecordBatch::try_new(schema(), columns)
            .map_err(|e| ExportError::Export(format!("batch build failed: {e}")))
    }
}

/// Stream events to a Parquet file at `path` (temp sibling + rename).
pub async fn export_parquet(mut events: EventStream, path: &Path) -> ExportResult<u64> {
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
    let mut writer = AsyncArrowWriter::try_new(file, schema(), None)
        .map_err(|e| ExportError::Export(format!("writer init failed: {e}")))?;

    let result = async {
        let mut written = 0u64;
        let mut buffer = ColumnBuffer::default();
        while let Some(event) = events.next().await {
            buffer.push(&event?);
            written += 1;
            if buffer.len() >= BATCH_ROWS {
                let batch = std::mem::take(&mut buffer).into_batch()?;
                writer
                    .write(&batch)
                    .await
                    .map_err(|e| ExportError::Export(format!("batch write failed: {e}")))?;
            }
        }
        if buffer.len() > 0 {
            let batch = buffer.into_batch()?;
            writer
                .write(&batch)
                .await
                .map_err(|e| ExportError::Export(format!("batch write failed: {e}")))?;
        }
        writer
            .close()
            .await
            .map_err(|e| ExportError::Export(format!("close failed: {e}")))?;
        Ok(written)
    }
    .await;

    let written = commit_or_cleanup(&tmp, path, result).await?;
    info!(target: "export", path = %path.display(), events = written, "parquet export complete");
    Ok(written)
}

/// Read a Parquet export back into the store, preserving all fields.
pub async fn import_parquet(path: &Path, store: &dyn EventStore) -> ExportResult<u64> {
    let file = std::fs::File::open(path)
        .map_err(|e| ExportError::Export(format!("open failed: {e}")))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| ExportError::Export(format!("reader init failed: {e}")))?
        .build()
        .map_err(|e| ExportError::Export(format!("reader build failed: {e}")))?;

    let mut ingested = 0u64;
    for batch in reader {
        let batch = batch.map_err(|e| ExportError::Export(format!("batch read failed: {e}")))?;
        let events = batch_to_events(&batch)?;
        ingested += events.len() as u64;
        store.append_batch(events).await?;
    }
    info!(target: "export", path = %path.display(), events = ingested, "parquet import complete");
    Ok(ingested)
}

fn batch_to_events(batch: &RecordBatch) -> ExportResult<Vec<Event>> {
    fn strings<'a>(batch: &'a RecordBatch, idx: usize) -> ExportResult<&'a StringArray> {
        batch
            .column(idx)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| ExportError::Export(format!("column {idx} is not utf8")))
    }
    let event_id = strings(batch, 0)?;
    let session_id = strings(batch, 1)?;
    let tool_id = strings(batch, 2)?;
    let input_hash = strings(batch, 3)?;
    let input_params = strings(batch, 4)?;
    let output_summary = strings(batch, 5)?;
    let predecessor = strings(batch, 6)?;
    let successor = strings(batch, 7)?;
    let timestamp = batch
        .column(8)
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| ExportError::Export("timestamp column has wrong type".into()))?;
    let latency = batch
        .column(9)
        .as_any()
        .downcast_ref::<Int32Array>()
        .ok_or_else(|| ExportError::Export("latency column has wrong type".into()))?;
    let outcome = strings(batch, 10)?;
    let tags = batch
        .column(11)
        .as_any()
        .downcast_ref::<ListArray>()
        .ok_or_else(|| ExportError::Export("tags column has wrong type".into()))?;

    let parse_id = |raw: &str| -> ExportResult<EventId> {
        raw.parse()
            .map_err(|e| ExportError::Export(format!("bad event id {raw:?}: {e}")))
    };
    let opt_id = |arr: &StringArray, i: usize| -> ExportResult<Option<EventId>> {
        if arr.is_null(i) {
            Ok(None)
        } else {
            parse_id(arr.value(i)).map(Some)
        }
    };

    let mut events = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let row_tags: Vec<String> = {
            let values = tags.value(i);
            let strings = values
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| ExportError::Export("tags items are not utf8".into()))?;
            (0..strings.len()).map(|j| strings.value(j).to_string()).collect()
        };
        events.push(Event {
            id: parse_id(event_id.value(i))?,
            session_id: session_id.value(i).to_string(),
            tool_id: tool_id.value(i).to_string(),
            input_hash: input_hash.value(i).to_string(),
            input_params: serde_json::from_str(input_params.value(i))
                .map_err(|e| ExportError::Export(format!("bad input_params: {e}")))?,
            output_summary: (!output_summary.is_null(i))
                .then(|| output_summary.value(i).to_string()),
            predecessor: opt_id(predecessor, i)?,
            successor: opt_id(successor, i)?,
            timestamp: DateTime::from_timestamp_micros(timestamp.value(i))
                .ok_or_else(|| ExportError::Export("timestamp out of range".into()))?,
            latency_ms: latency.value(i) as u32,
            outcome: Outcome::parse(outcome.value(i))
                .ok_or_else(|| ExportError::Export(format!("bad outcome {:?}", outcome.value(i))))?,
            tags: row_tags,
        });
    }
    Ok(events)
}
