//! Streaming exporters.
//!
//! Exporters consume an asynchronous event stream and never hold the full
//! set in memory; the stream is the backpressure mechanism. File exporters
//! write to a temporary sibling and rename on success.

pub mod jsonl;
pub mod parquet;
pub mod spans;

pub use jsonl::{export_jsonl, import_jsonl};
pub use parquet::{export_parquet, import_parquet};
pub use spans::{export_spans, SpanExportConfig, SpanExportStats};

use crate::event::Event;
use crate::store::StorageError;
use futures::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("export failed: {0}")]
    Export(String),

    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type ExportResult<T> = std::result::Result<T, ExportError>;

/// The source contract for all exporters.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, StorageError>> + Send>>;

/// Temporary sibling path for atomic writes.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Commit a finished temp file, or clean it up after a failure.
pub(crate) async fn commit_or_cleanup(
    tmp: &Path,
    path: &Path,
    result: ExportResult<u64>,
) -> ExportResult<u64> {
    match result {
        Ok(n) => {
            tokio::fs::rename(tmp, path)
                .await
                .map_err(|e| ExportError::Export(format!("rename failed: {e}")))?;
            Ok(n)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(tmp).await;
            Err(e)
        }
    }
}

/// Atomically replace `path` with `bytes` (temp sibling + rename).
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> ExportResult<()> {
    let tmp = temp_sibling(path);
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ExportError::Export(format!("write failed: {e}")));
    }
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ExportError::Export(format!("rename failed: {e}")))
}
