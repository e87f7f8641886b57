//! Hierarchical configuration.
//!
//! Merge order: built-in defaults, then the user file, then the project
//! file, then `TWINRAVEN__SECTION__KEY` environment overrides. Validation
//! runs before any component initializes; an invalid configuration is
//! fatal.

use crate::collector::{BufferMode, CollectorConfig};
use crate::llm::LlmProviderConfig;
use crate::mining::{MiningAlgorithm, MiningConfig};
use crate::registry::RegistryConfig;
use crate::store::SqliteStoreOptions;
use crate::synthesis::SynthesizerConfig;
use crate::validation::{SimilarityMethod, ValidationConfig};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

pub const ENV_PREFIX: &str = "TWINRAVEN__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub retention_days: i64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: "twinraven.db".into(),
            max_connections: 5,
            acquire_timeout_secs: 5,
            max_lifetime_secs: 1800,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSection {
    pub compress_outputs: bool,
    pub max_output_length: usize,
    /// "immediate" or "buffered".
    pub buffer_mode: String,
    pub buffer_max_events: usize,
    pub buffer_max_age_secs: u64,
    pub health_check_timeout_secs: u64,
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            compress_outputs: true,
            max_output_length: 2048,
            buffer_mode: "immediate".into(),
            buffer_max_events: 64,
            buffer_max_age_secs: 5,
            health_check_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningSection {
    /// "prefixspan" or "gsp".
    pub algorithm: String,
    pub min_support: f64,
    pub min_confidence: f64,
    pub max_chain_length: usize,
    pub time_window_seconds: u64,
    pub collapse_repeats: bool,
    pub max_sample_events: usize,
    pub subsumption_threshold: f64,
    pub sample_rate: f64,
    /// Mining window, counted back from now.
    pub window_days: i64,
    /// Candidates above this failure rate are not synthesized.
    pub max_failure_rate: f64,
}

impl Default for MiningSection {
    fn default() -> Self {
        Self {
            algorithm: "prefixspan".into(),
            min_support: 0.3,
            min_confidence: 0.5,
            max_chain_length: 5,
            time_window_seconds: 300,
            collapse_repeats: true,
            max_sample_events: 10,
            subsumption_threshold: 0.1,
            sample_rate: 1.0,
            window_days: 7,
            max_failure_rate: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisSection {
    pub max_parallel_steps: usize,
    pub max_prompt_samples: usize,
    pub max_tokens: u32,
}

impl Default for SynthesisSection {
    fn default() -> Self {
        let d = SynthesizerConfig::default();
        Self {
            max_parallel_steps: d.max_parallel_steps,
            max_prompt_samples: d.max_prompt_samples,
            max_tokens: d.max_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub min_replay_sessions: usize,
    pub equivalence_threshold: f64,
    pub max_latency_regression: f64,
    /// "exact_match" or "cosine_tfidf".
    pub similarity_method: String,
    pub approval_required: bool,
    pub window_days: i64,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            min_replay_sessions: 5,
            equivalence_threshold: 0.9,
            max_latency_regression: 1.2,
            similarity_method: "cosine_tfidf".into(),
            approval_required: false,
            window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub root_dir: String,
    pub drift_threshold: f64,
    pub auto_retire_on_drift: bool,
    pub auto_retire_after_days: i64,
    pub failure_spike_threshold: f64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        let d = RegistryConfig::default();
        Self {
            root_dir: d.root_dir.to_string_lossy().to_string(),
            drift_threshold: d.drift_threshold,
            auto_retire_on_drift: d.auto_retire_on_drift,
            auto_retire_after_days: d.auto_retire_after_days,
            failure_spike_threshold: d.failure_spike_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSection {
    pub span_queue_capacity: usize,
    pub span_batch_size: usize,
    pub span_max_retries: u32,
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            span_queue_capacity: 2048,
            span_batch_size: 256,
            span_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".into(),
            model: String::new(),
            api_key: None,
            request_timeout_ms: 120_000,
            max_attempts: 3,
            backoff_base_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub log_filter: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            service_name: "twinraven".into(),
            log_filter: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinRavenConfig {
    pub store: StoreSection,
    pub collector: CollectorSection,
    pub mining: MiningSection,
    pub synthesis: SynthesisSection,
    pub validation: ValidationSection,
    pub registry: RegistrySection,
    pub export: ExportSection,
    pub llm: LlmSection,
    pub telemetry: TelemetrySection,
}

impl TwinRavenConfig {
    /// Defaults -> user file -> project file -> environment, validated.
    pub fn load(
        user_file: Option<&Path>,
        project_file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::try_from(TwinRavenConfig::default())
            .map_err(|e| ConfigError(format!("defaults: {e}")))?;

        for path in [user_file, project_file].into_iter().flatten() {
            if !path.exists() {
                debug!(target: "config", path = %path.display(), "config file absent, skipping");
                continue;
            }
            let raw = std::fs::read_to_string(path)
                .map_err(|e| ConfigError(format!("{}: {e}", path.display())))?;
            let value: toml::Value = raw
                .parse()
                .map_err(|e| ConfigError(format!("{}: {e}", path.display())))?;
            merge(&mut merged, value);
        }

        merge(&mut merged, env_overrides(std::env::vars())?);

        let config: TwinRavenConfig = merged
            .try_into()
            .map_err(|e| ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_unit = |name: &str, v: f64| {
            if !(0.0..=1.0).contains(&v) {
                Err(ConfigError(format!("{name} {v} not in [0, 1]")))
            } else {
                Ok(())
            }
        };
        if !(self.mining.min_support > 0.0 && self.mining.min_support <= 1.0) {
            return Err(ConfigError(format!(
                "mining.min_support {} not in (0, 1]",
                self.mining.min_support
            )));
        }
        in_unit("mining.min_confidence", self.mining.min_confidence)?;
        in_unit("mining.subsumption_threshold", self.mining.subsumption_threshold)?;
        in_unit("mining.max_failure_rate", self.mining.max_failure_rate)?;
        in_unit("validation.equivalence_threshold", self.validation.equivalence_threshold)?;
        in_unit("registry.drift_threshold", self.registry.drift_threshold)?;
        in_unit(
            "registry.failure_spike_threshold",
            self.registry.failure_spike_threshold,
        )?;
        if !(self.mining.sample_rate > 0.0 && self.mining.sample_rate <= 1.0) {
            return Err(ConfigError(format!(
                "mining.sample_rate {} not in (0, 1]",
                self.mining.sample_rate
            )));
        }
        if self.mining.max_chain_length < 2 {
            return Err(ConfigError("mining.max_chain_length must be >= 2".into()));
        }
        if self.validation.max_latency_regression <= 0.0 {
            return Err(ConfigError(
                "validation.max_latency_regression must be positive".into(),
            ));
        }
        match self.mining.algorithm.as_str() {
            "prefixspan" | "gsp" => {}
            other => {
                return Err(ConfigError(format!(
                    "mining.algorithm {other:?} is not one of prefixspan, gsp"
                )))
            }
        }
        match self.validation.similarity_method.as_str() {
            "exact_match" | "cosine_tfidf" => {}
            other => {
                return Err(ConfigError(format!(
                    "validation.similarity_method {other:?} is not one of \
                     exact_match, cosine_tfidf"
                )))
            }
        }
        match self.collector.buffer_mode.as_str() {
            "immediate" | "buffered" => {}
            other => {
                return Err(ConfigError(format!(
                    "collector.buffer_mode {other:?} is not one of immediate, buffered"
                )))
            }
        }
        if self.llm.base_url.is_empty() {
            return Err(ConfigError("llm.base_url must not be empty".into()));
        }
        Ok(())
    }

    pub fn store_options(&self) -> SqliteStoreOptions {
        SqliteStoreOptions {
            max_connections: self.store.max_connections,
            acquire_timeout: Duration::from_secs(self.store.acquire_timeout_secs),
            max_lifetime: Duration::from_secs(self.store.max_lifetime_secs),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.store.path)
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            compress_outputs: self.collector.compress_outputs,
            max_output_length: self.collector.max_output_length,
            buffer_mode: match self.collector.buffer_mode.as_str() {
                "buffered" => BufferMode::Buffered {
                    max_events: self.collector.buffer_max_events,
                    max_age: Duration::from_secs(self.collector.buffer_max_age_secs),
                },
                _ => BufferMode::Immediate,
            },
            health_check_timeout: Duration::from_secs(self.collector.health_check_timeout_secs),
        }
    }

    /// Mining config over the configured trailing window ending now.
    pub fn mining_config(&self) -> MiningConfig {
        let until = Utc::now();
        let since = until - ChronoDuration::days(self.mining.window_days);
        self.mining_config_over(since, until)
    }

    pub fn mining_config_over(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> MiningConfig {
        MiningConfig {
            algorithm: match self.mining.algorithm.as_str() {
                "gsp" => MiningAlgorithm::Gsp,
                _ => MiningAlgorithm::PrefixSpan,
            },
            min_support: self.mining.min_support,
            min_confidence: self.mining.min_confidence,
            max_chain_length: self.mining.max_chain_length,
            time_window_seconds: self.mining.time_window_seconds,
            since,
            until,
            session_ids: None,
            collapse_repeats: self.mining.collapse_repeats,
            max_sample_events: self.mining.max_sample_events,
            subsumption_threshold: self.mining.subsumption_threshold,
            sample_rate: self.mining.sample_rate,
        }
    }

    pub fn synthesizer_config(&self) -> SynthesizerConfig {
        SynthesizerConfig {
            max_parallel_steps: self.synthesis.max_parallel_steps,
            max_prompt_samples: self.synthesis.max_prompt_samples,
            max_tokens: self.synthesis.max_tokens,
        }
    }

    pub fn validation_config(&self) -> ValidationConfig {
        let until = Utc::now();
        let since = until - ChronoDuration::days(self.validation.window_days);
        ValidationConfig {
            min_replay_sessions: self.validation.min_replay_sessions,
            equivalence_threshold: self.validation.equivalence_threshold,
            max_latency_regression: self.validation.max_latency_regression,
            similarity_method: match self.validation.similarity_method.as_str() {
                "exact_match" => SimilarityMethod::ExactMatch,
                _ => SimilarityMethod::CosineTfidf,
            },
            since,
            until,
            approval_required: self.validation.approval_required,
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            root_dir: PathBuf::from(&self.registry.root_dir),
            drift_threshold: self.registry.drift_threshold,
            auto_retire_on_drift: self.registry.auto_retire_on_drift,
            auto_retire_after_days: self.registry.auto_retire_after_days,
            failure_spike_threshold: self.registry.failure_spike_threshold,
        }
    }

    pub fn span_export_config(&self) -> crate::export::SpanExportConfig {
        crate::export::SpanExportConfig {
            queue_capacity: self.export.span_queue_capacity,
            batch_size: self.export.span_batch_size,
            max_retries: self.export.span_max_retries,
            ..Default::default()
        }
    }

    pub fn llm_config(&self) -> LlmProviderConfig {
        LlmProviderConfig {
            base_url: self.llm.base_url.clone(),
            model: self.llm.model.clone(),
            api_key: self.llm.api_key.clone(),
            request_timeout_ms: self.llm.request_timeout_ms,
            max_attempts: self.llm.max_attempts,
            backoff_base_ms: self.llm.backoff_base_ms,
        }
    }
}

/// `TWINRAVEN__SECTION__KEY=value` pairs as a toml overlay. Values parse
/// as toml scalars, falling back to strings.
fn env_overrides(
    vars: impl Iterator<Item = (String, String)>,
) -> Result<toml::Value, ConfigError> {
    let mut root = toml::value::Table::new();
    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let mut parts = rest.splitn(2, "__");
        let (Some(section), Some(field)) = (parts.next(), parts.next()) else {
            return Err(ConfigError(format!(
                "malformed override {key}: expected {ENV_PREFIX}SECTION__KEY"
            )));
        };
        let value = parse_scalar(&raw);
        root.entry(section.to_lowercase())
            .or_insert_with(|| toml::Value::Table(toml::value::Table::new()))
            .as_table_mut()
            .ok_or_else(|| ConfigError(format!("override {key} clashes with a scalar")))?
            .insert(field.to_lowercase(), value);
    }
    Ok(toml::Value::Table(root))
}

fn parse_scalar(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(raw.to_string())
}

/// Recursive table merge; overlay scalars win.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay,
    }
}
