//! Tracing and OpenTelemetry wiring.

use crate::config::TelemetrySection;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Error, Debug)]
#[error("telemetry init failed: {0}")]
pub struct TelemetryError(String);

/// Install the tracing subscriber: EnvFilter + fmt, plus an OTLP layer
/// when an endpoint is configured. Call once, before building components.
pub fn init_telemetry(section: &TelemetrySection) -> Result<(), TelemetryError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(section.log_filter.clone()));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer());

    match &section.otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint.clone()),
                )
                .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
                    Resource::new(vec![
                        KeyValue::new("service.name", section.service_name.clone()),
                        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ]),
                ))
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .map_err(|e| TelemetryError(e.to_string()))?;
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|e| TelemetryError(e.to_string()))?;
            info!(target: "telemetry", endpoint = %endpoint, "telemetry initialized with OTLP");
        }
        None => {
            registry
                .try_init()
                .map_err(|e| TelemetryError(e.to_string()))?;
            info!(target: "telemetry", "telemetry initialized");
        }
    }
    Ok(())
}

/// Flush and tear down the global tracer provider.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// A tonic OTLP span exporter for the streaming span export path.
pub fn otlp_span_exporter(endpoint: &str) -> Result<impl SpanExporter, TelemetryError> {
    opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint.to_string())
        .build_span_exporter()
        .map_err(|e| TelemetryError(e.to_string()))
}
