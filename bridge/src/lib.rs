//! Wrapper contract between agent frameworks and the telemetry pipeline.
//!
//! The bridge never interprets a tool's semantics: it intercepts the call,
//! captures timing, forwards the result or error untouched, and emits one
//! telemetry event per invocation. Outcomes are mechanical: `Ok` records
//! success, `Err` records failure; richer outcome signals stay with the
//! caller.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use twinraven_core::collector::ObservationContext;
use twinraven_core::event::Outcome;

#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("unsupported tool: {0}")]
    UnsupportedTool(String),
}

/// Errors a hosted tool may surface; forwarded verbatim to the agent.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout")]
    Timeout,
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// The minimal surface a hosted tool must expose to be observable.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool identifier, e.g. `web.search`.
    fn name(&self) -> String;

    fn description(&self) -> String {
        String::new()
    }

    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value;

    async fn call(&self, arguments: Value) -> ToolResult<Value>;
}

/// A tool wrapped for observation. Shares the session's observation
/// context; the mutex preserves the context's single-writer discipline
/// while tools of the same session run sequentially.
pub struct Instrumented {
    inner: Arc<dyn Tool>,
    context: Arc<Mutex<ObservationContext>>,
}

impl std::fmt::Debug for Instrumented {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumented").finish()
    }
}

/// Wrap a hosted tool for observation.
///
/// A tool without a stable name or without an object parameter schema
/// cannot be attributed in the event log and is rejected.
pub fn instrument(
    tool: Arc<dyn Tool>,
    context: Arc<Mutex<ObservationContext>>,
) -> Result<Instrumented, IntegrationError> {
    let name = tool.name();
    if name.trim().is_empty() {
        return Err(IntegrationError::UnsupportedTool(
            "tool has no name".into(),
        ));
    }
    if !tool.parameters().is_object() {
        return Err(IntegrationError::UnsupportedTool(format!(
            "{name}: parameter schema is not an object"
        )));
    }
    Ok(Instrumented {
        inner: tool,
        context,
    })
}

/// Wrap a whole toolset against one session context.
pub fn instrument_toolset(
    tools: Vec<Arc<dyn Tool>>,
    context: Arc<Mutex<ObservationContext>>,
) -> Result<Vec<Arc<dyn Tool>>, IntegrationError> {
    tools
        .into_iter()
        .map(|tool| {
            instrument(tool, Arc::clone(&context))
                .map(|wrapped| Arc::new(wrapped) as Arc<dyn Tool>)
        })
        .collect()
}

#[async_trait]
impl Tool for Instrumented {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn description(&self) -> String {
        self.inner.description()
    }

    fn parameters(&self) -> Value {
        self.inner.parameters()
    }

    async fn call(&self, arguments: Value) -> ToolResult<Value> {
        let name = self.inner.name();
        let started = Instant::now();
        let result = self.inner.call(arguments.clone()).await;
        let latency_ms = started.elapsed().as_millis().min(u32::MAX as u128) as u32;
        debug!(target: "bridge", tool = %name, latency_ms, ok = result.is_ok(), "tool call observed");

        // Telemetry must never alter what the agent sees; record errors
        // are swallowed by the context itself.
        let mut context = self.context.lock().await;
        match &result {
            Ok(output) => {
                let _ = context
                    .record(
                        &name,
                        arguments,
                        output,
                        Outcome::Success,
                        Vec::new(),
                        Some(latency_ms),
                    )
                    .await;
            }
            Err(error) => {
                let _ = context
                    .record_failure(
                        &name,
                        arguments,
                        &error.to_string(),
                        Vec::new(),
                        Some(latency_ms),
                    )
                    .await;
            }
        }
        result
    }
}
