//! Per-session write facade over the event store.
//!
//! A [`Collector`] opens one [`ObservationContext`] per logical agent
//! session. The context is the private sequential owner of the session's
//! predecessor pointer; different sessions run concurrently without
//! coordination, the store arbitrates via its append path.
//!
//! Once a context is open, telemetry failures never propagate to the agent:
//! a failed append drops that event, a failed backfill leaves a chain gap,
//! a failed summarization falls back to truncation.

use crate::event::{canonical_json, Event, Outcome};
use crate::llm::{GenerateRequest, LlmProvider};
use crate::store::EventStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid collector state: {0}")]
    InvalidState(String),
}

/// How records reach the store.
#[derive(Debug, Clone)]
pub enum BufferMode {
    /// Each `record` issues one `append`.
    Immediate,
    /// Accumulate and flush via `append_batch` on size, age, or exit.
    Buffered {
        max_events: usize,
        max_age: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Summarize outputs longer than `max_output_length` through the LLM.
    pub compress_outputs: bool,
    pub max_output_length: usize,
    pub buffer_mode: BufferMode,
    /// Budget for the store reachability probe at `observe` entry.
    pub health_check_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            compress_outputs: true,
            max_output_length: 2048,
            buffer_mode: BufferMode::Immediate,
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Collector {
    store: Arc<dyn EventStore>,
    summarizer: Option<Arc<dyn LlmProvider>>,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(
        store: Arc<dyn EventStore>,
        summarizer: Option<Arc<dyn LlmProvider>>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            store,
            summarizer,
            config,
        }
    }

    /// Open a scoped observation for one session.
    ///
    /// Store unreachability is the only fatal precondition surfaced to the
    /// caller; the probe is bounded by `health_check_timeout`.
    pub async fn observe(
        &self,
        session_id: impl Into<String>,
    ) -> Result<ObservationContext, CollectorError> {
        let session_id = session_id.into();
        let probe = tokio::time::timeout(
            self.config.health_check_timeout,
            self.store.health_check(),
        )
        .await;
        match probe {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(CollectorError::Unavailable(e.to_string())),
            Err(_) => {
                return Err(CollectorError::Unavailable(format!(
                    "health check exceeded {:?}",
                    self.config.health_check_timeout
                )))
            }
        }
        debug!(target: "collector", session = %session_id, "observation opened");
        Ok(ObservationContext {
            session_id,
            store: Arc::clone(&self.store),
            summarizer: self.summarizer.clone(),
            config: self.config.clone(),
            previous: None,
            event_count: 0,
            dropped_count: 0,
            buffer: Vec::new(),
            pending_backfills: Vec::new(),
            last_flush: Instant::now(),
            closed: false,
        })
    }
}

/// One session's write chain. Not shareable across tasks.
pub struct ObservationContext {
    session_id: String,
    store: Arc<dyn EventStore>,
    summarizer: Option<Arc<dyn LlmProvider>>,
    config: CollectorConfig,
    /// Id of the most recent durable-or-buffered event of this session.
    previous: Option<crate::event::EventId>,
    event_count: usize,
    dropped_count: usize,
    buffer: Vec<Event>,
    /// Backfills targeting already-flushed predecessors, applied at flush.
    pending_backfills: Vec<(crate::event::EventId, crate::event::EventId)>,
    last_flush: Instant,
    closed: bool,
}

impl std::fmt::Debug for ObservationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationContext")
            .field("session_id", &self.session_id)
            .field("event_count", &self.event_count)
            .field("dropped_count", &self.dropped_count)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ObservationContext {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// Record one successful (or partial) tool call.
    pub async fn record(
        &mut self,
        tool_id: &str,
        inputs: Value,
        output: &Value,
        outcome: Outcome,
        tags: Vec<String>,
        latency_ms: Option<u32>,
    ) -> Result<(), CollectorError> {
        let summary = self.summarize_output(output).await;
        self.record_event(tool_id, inputs, summary, outcome, tags, latency_ms)
            .await
    }

    /// Record a failed tool call; the error rendering becomes the summary.
    /// Failures are telemetry, never fatal to the context.
    pub async fn record_failure(
        &mut self,
        tool_id: &str,
        inputs: Value,
        error: &str,
        tags: Vec<String>,
        latency_ms: Option<u32>,
    ) -> Result<(), CollectorError> {
        self.record_event(
            tool_id,
            inputs,
            Some(error.to_string()),
            Outcome::Failure,
            tags,
            latency_ms,
        )
        .await
    }

    async fn record_event(
        &mut self,
        tool_id: &str,
        inputs: Value,
        summary: Option<String>,
        outcome: Outcome,
        tags: Vec<String>,
        latency_ms: Option<u32>,
    ) -> Result<(), CollectorError> {
        if self.closed {
            return Err(CollectorError::InvalidState(
                "context already closed".into(),
            ));
        }

        let mut event = Event::new(self.session_id.clone(), tool_id, inputs, outcome)
            .with_latency(latency_ms.unwrap_or(0))
            .with_tags(tags);
        event.predecessor = self.previous;
        if let Some(summary) = summary {
            event.output_summary = Some(summary);
        }

        match self.config.buffer_mode.clone() {
            BufferMode::Immediate => {
                // Backfill before append: a dangling forward link is
                // tolerated by chain reconstruction.
                if let Some(prev) = self.previous {
                    if let Err(e) = self.store.update_successor(prev, event.id).await {
                        warn!(
                            target: "collector",
                            session = %self.session_id,
                            error = %e,
                            "successor backfill failed, chain gap accepted"
                        );
                    }
                }
                let id = event.id;
                match self.store.append(event).await {
                    Ok(()) => {
                        self.previous = Some(id);
                        self.event_count += 1;
                    }
                    Err(e) => {
                        self.dropped_count += 1;
                        error!(
                            target: "collector",
                            session = %self.session_id,
                            error = %e,
                            "append failed, event dropped"
                        );
                    }
                }
            }
            BufferMode::Buffered {
                max_events,
                max_age,
            } => {
                // Link in memory; flushed predecessors batch their backfill.
                if let Some(prev) = self.previous {
                    match self.buffer.iter_mut().find(|e| e.id == prev) {
                        Some(buffered_prev) => buffered_prev.successor = Some(event.id),
                        None => self.pending_backfills.push((prev, event.id)),
                    }
                }
                self.previous = Some(event.id);
                self.event_count += 1;
                self.buffer.push(event);
                if self.buffer.len() >= max_events || self.last_flush.elapsed() >= max_age {
                    self.flush().await;
                }
            }
        }
        Ok(())
    }

    /// Flush buffered events. A failed flush drops the batch and continues.
    pub async fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.buffer.is_empty() && self.pending_backfills.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.buffer);
        let backfills = std::mem::take(&mut self.pending_backfills);
        let batch_len = batch.len();
        if !batch.is_empty() {
            if let Err(e) = self.store.append_batch(batch).await {
                self.dropped_count += batch_len;
                self.event_count -= batch_len.min(self.event_count);
                error!(
                    target: "collector",
                    session = %self.session_id,
                    batch = batch_len,
                    error = %e,
                    "batch flush failed, batch dropped"
                );
                return;
            }
        }
        for (pred, succ) in backfills {
            if let Err(e) = self.store.update_successor(pred, succ).await {
                warn!(
                    target: "collector",
                    session = %self.session_id,
                    error = %e,
                    "successor backfill failed, chain gap accepted"
                );
            }
        }
    }

    /// Flush and log the session summary. Further records are rejected.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.flush().await;
        self.closed = true;
        info!(
            target: "collector",
            session = %self.session_id,
            events = self.event_count,
            dropped = self.dropped_count,
            "observation closed"
        );
    }

    /// Canonical output rendering, compressed through the LLM when too
    /// long, truncated when the LLM is unavailable.
    async fn summarize_output(&self, output: &Value) -> Option<String> {
        if output.is_null() {
            return None;
        }
        let rendered = canonical_json(output);
        if !self.config.compress_outputs || rendered.len() <= self.config.max_output_length {
            return Some(rendered);
        }

        if let Some(llm) = &self.summarizer {
            let prompt = format!(
                "Summarize this tool output in at most {} characters. Preserve \
                 identifiers, counts, and any error details verbatim.\n\n{}",
                self.config.max_output_length, rendered
            );
            let request = GenerateRequest::new(prompt)
                .with_max_tokens((self.config.max_output_length / 3).max(64) as u32)
                .with_temperature(0.0);
            match llm.generate(request).await {
                Ok(resp) => return Some(resp.content),
                Err(e) => {
                    warn!(
                        target: "collector",
                        session = %self.session_id,
                        error = %e,
                        "summarization failed, truncating"
                    );
                }
            }
        }
        let truncated: String = rendered
            .chars()
            .take(self.config.max_output_length)
            .collect();
        Some(format!("{truncated} …[truncated]"))
    }
}

impl Drop for ObservationContext {
    fn drop(&mut self) {
        if !self.closed && !self.buffer.is_empty() {
            warn!(
                target: "collector",
                session = %self.session_id,
                buffered = self.buffer.len(),
                "context dropped with unflushed events"
            );
        }
    }
}
