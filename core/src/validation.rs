//! Offline replay validation.
//!
//! The validator never invokes a tool: it reconstructs what the composite
//! would have done over recorded sessions and scores the reconstruction
//! against what actually happened.

use crate::event::{canonical_json, Event, Outcome};
use crate::mining::leftmost_embedding;
use crate::predicate::Predicate;
use crate::store::{EventStore, SessionOrder, StorageError};
use crate::synthesis::parsed_output;
use crate::tool::{InputSource, SynthesizedTool, ToolStatus, TransitionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient data: {found} replayable sessions, need {needed}")]
    InsufficientData { found: usize, needed: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMethod {
    ExactMatch,
    CosineTfidf,
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub min_replay_sessions: usize,
    /// Mean similarity must reach this to pass equivalence.
    pub equivalence_threshold: f64,
    /// Composite/original latency ratio ceiling.
    pub max_latency_regression: f64,
    pub similarity_method: SimilarityMethod,
    /// Session selection window.
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    /// When set, a passing tool lands in `testing` instead of `promoted`.
    pub approval_required: bool,
}

impl ValidationConfig {
    pub fn over_window(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            min_replay_sessions: 5,
            equivalence_threshold: 0.9,
            max_latency_regression: 1.2,
            similarity_method: SimilarityMethod::CosineTfidf,
            since,
            until,
            approval_required: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub id: Uuid,
    pub tool_slug: String,
    pub tool_version: u32,
    pub sessions_replayed: usize,
    pub mean_similarity: f64,
    pub min_similarity: f64,
    pub similarity_method: SimilarityMethod,
    pub equivalence_threshold: f64,
    pub error_parity: bool,
    pub latency_ratio: f64,
    pub passed: bool,
    pub failure_reasons: Vec<String>,
    pub validated_at: DateTime<Utc>,
}

/// One session's replay outcome.
struct Replay {
    similarity: f64,
    original_latency_ms: u64,
    composite_latency_ms: u64,
    parity_violations: Vec<usize>,
    all_success: bool,
}

pub struct Validator {
    store: Arc<dyn EventStore>,
}

impl Validator {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Replay the tool offline and transition it according to the result:
    /// pass without approval promotes, pass with approval parks in
    /// testing, fail returns to draft with the reasons attached.
    #[tracing::instrument(skip(self, tool, config), fields(slug = %tool.slug))]
    pub async fn validate(
        &self,
        tool: &mut SynthesizedTool,
        config: &ValidationConfig,
    ) -> Result<ValidationResult, ValidationError> {
        if !matches!(tool.status, ToolStatus::Draft | ToolStatus::Testing) {
            return Err(ValidationError::Validation(format!(
                "tool {} is {:?}, expected draft or testing",
                tool.slug, tool.status
            )));
        }

        let sessions = self.select_sessions(tool, config).await?;
        if sessions.len() < config.min_replay_sessions {
            return Err(ValidationError::InsufficientData {
                found: sessions.len(),
                needed: config.min_replay_sessions,
            });
        }

        let replays: Vec<Replay> = sessions
            .iter()
            .map(|events| replay_session(tool, events, config.similarity_method))
            .collect();

        let n = replays.len() as f64;
        let mean_similarity = replays.iter().map(|r| r.similarity).sum::<f64>() / n;
        let min_similarity = replays
            .iter()
            .map(|r| r.similarity)
            .fold(f64::INFINITY, f64::min);
        let original_total: u64 = replays.iter().map(|r| r.original_latency_ms).sum();
        let composite_total: u64 = replays.iter().map(|r| r.composite_latency_ms).sum();
        let latency_ratio = if original_total == 0 {
            1.0
        } else {
            composite_total as f64 / original_total as f64
        };
        let error_parity = replays.iter().all(|r| r.parity_violations.is_empty());

        if replays.iter().all(|r| r.all_success) {
            // Callers that never supply outcomes look exactly like this;
            // failure-rate statistics degrade silently in that case.
            warn!(
                target: "validator",
                slug = %tool.slug,
                sessions = replays.len(),
                "every replayed session is uniformly successful; outcome coverage may be low"
            );
        }

        let mut failure_reasons = Vec::new();
        if mean_similarity < config.equivalence_threshold {
            failure_reasons.push(format!(
                "mean similarity {mean_similarity:.3} below threshold {:.3}",
                config.equivalence_threshold
            ));
        }
        if latency_ratio > config.max_latency_regression {
            failure_reasons.push(format!(
                "latency ratio {latency_ratio:.3} exceeds {:.3}",
                config.max_latency_regression
            ));
        }
        if !error_parity {
            let steps: Vec<String> = replays
                .iter()
                .flat_map(|r| r.parity_violations.iter().map(|s| s.to_string()))
                .collect();
            failure_reasons.push(format!(
                "error strategy does not cover observed failures at steps [{}]",
                steps.join(", ")
            ));
        }
        let passed = failure_reasons.is_empty();

        // Lifecycle: draft passes through testing on its way to promoted.
        if passed {
            if tool.status == ToolStatus::Draft {
                tool.transition(ToolStatus::Testing)?;
            }
            if !config.approval_required {
                tool.transition(ToolStatus::Promoted)?;
            }
        } else if tool.status == ToolStatus::Testing {
            tool.transition(ToolStatus::Draft)?;
        }

        let result = ValidationResult {
            id: Uuid::new_v4(),
            tool_slug: tool.slug.clone(),
            tool_version: tool.version,
            sessions_replayed: replays.len(),
            mean_similarity,
            min_similarity,
            similarity_method: config.similarity_method,
            equivalence_threshold: config.equivalence_threshold,
            error_parity,
            latency_ratio,
            passed,
            failure_reasons,
            validated_at: Utc::now(),
        };
        info!(
            target: "validator",
            slug = %tool.slug,
            passed,
            mean = mean_similarity,
            ratio = latency_ratio,
            "validation complete"
        );
        Ok(result)
    }

    /// Sessions containing the chain as a subsequence, most recent first,
    /// capped at the replay budget.
    async fn select_sessions(
        &self,
        tool: &SynthesizedTool,
        config: &ValidationConfig,
    ) -> Result<Vec<Vec<Event>>, StorageError> {
        let chain: Vec<String> = tool.steps.iter().map(|s| s.tool_id.clone()).collect();
        let session_ids = self
            .store
            .get_sessions(config.since, config.until, 2)
            .await?;

        let mut matched: Vec<(DateTime<Utc>, Vec<Event>)> = Vec::new();
        for session_id in session_ids {
            let events = self
                .store
                .get_by_session(&session_id, SessionOrder::Timestamp)
                .await?;
            let tools: Vec<String> = events.iter().map(|e| e.tool_id.clone()).collect();
            if let Some(embedding) = leftmost_embedding(&chain, &tools) {
                let last_ts = events
                    .last()
                    .map(|e| e.timestamp)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let chain_events: Vec<Event> =
                    embedding.into_iter().map(|i| events[i].clone()).collect();
                matched.push((last_ts, chain_events));
            }
        }
        matched.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(matched
            .into_iter()
            .map(|(_, events)| events)
            .take(config.min_replay_sessions)
            .collect())
    }
}

/// Simulate the composite purely over recorded data for one session.
fn replay_session(
    tool: &SynthesizedTool,
    chain_events: &[Event],
    method: SimilarityMethod,
) -> Replay {
    let parameters = extract_external_inputs(tool, chain_events);

    // Recorded outputs per step, parsed where possible, for wiring lookups.
    let mut outputs: BTreeMap<usize, Value> = BTreeMap::new();
    let mut diverged: Option<String> = None;

    for step in &tool.steps {
        let Some(event) = chain_events.get(step.index) else {
            diverged = Some(format!("step {} has no recorded event", step.index));
            break;
        };

        if let Some(condition) = &step.condition {
            if let Ok(predicate) = Predicate::parse(condition) {
                if !predicate.eval(&parameters, &outputs) {
                    continue;
                }
            }
        }

        let mut resolved = Map::new();
        let mut resolution_failed = false;
        for (key, source) in &step.input_mapping {
            let value = match source {
                InputSource::Parameter(name) => parameters.get(name).cloned(),
                InputSource::Wiring { step: upstream, field } => outputs
                    .get(upstream)
                    .and_then(|out| out.get(field))
                    .cloned(),
                InputSource::Literal(v) => Some(v.clone()),
            };
            match value {
                Some(v) => {
                    resolved.insert(key.clone(), v);
                }
                None => {
                    resolution_failed = true;
                    break;
                }
            }
        }

        let resolved = Value::Object(resolved);
        if resolution_failed || canonical_json(&resolved) != canonical_json(&event.input_params)
        {
            // The projection no longer tracks the recorded execution; the
            // best reconstruction of "what the composite would have done"
            // is the inputs it would have fed this step.
            diverged = Some(canonical_json(&resolved));
            break;
        }

        outputs.insert(
            step.index,
            parsed_output(event).unwrap_or_else(|| {
                Value::String(event.output_summary.clone().unwrap_or_default())
            }),
        );
    }

    let recorded_final = chain_events
        .last()
        .and_then(|e| e.output_summary.clone())
        .unwrap_or_default();
    let projected_final = match diverged {
        None => recorded_final.clone(),
        Some(rendering) => rendering,
    };

    let similarity = match method {
        SimilarityMethod::ExactMatch => {
            if projected_final == recorded_final {
                1.0
            } else {
                0.0
            }
        }
        SimilarityMethod::CosineTfidf => cosine_tfidf(&projected_final, &recorded_final),
    };

    let original_latency_ms: u64 = chain_events.iter().map(|e| e.latency_ms as u64).sum();
    let savings: u64 = tool
        .parallel_groups()
        .iter()
        .map(|group| {
            let latencies: Vec<u64> = group
                .iter()
                .filter_map(|&i| chain_events.get(i))
                .map(|e| e.latency_ms as u64)
                .collect();
            let sum: u64 = latencies.iter().sum();
            let max = latencies.iter().copied().max().unwrap_or(0);
            sum - max
        })
        .sum();
    let composite_latency_ms = original_latency_ms.saturating_sub(savings);

    let parity_violations: Vec<usize> = chain_events
        .iter()
        .enumerate()
        .filter(|(i, e)| e.outcome == Outcome::Failure && !tool.error_strategy.covers_step(*i))
        .map(|(i, _)| i)
        .collect();
    let all_success = chain_events.iter().all(|e| e.outcome == Outcome::Success);

    Replay {
        similarity,
        original_latency_ms,
        composite_latency_ms,
        parity_violations,
        all_success,
    }
}

/// The composite's external inputs for this session: recorded parameters
/// at each step that map from `$.parameters.*`, first binding wins; keys
/// covered by internal wiring never surface.
fn extract_external_inputs(tool: &SynthesizedTool, chain_events: &[Event]) -> Value {
    let mut parameters = Map::new();
    for step in &tool.steps {
        let Some(event) = chain_events.get(step.index) else {
            continue;
        };
        for (key, source) in &step.input_mapping {
            if let InputSource::Parameter(name) = source {
                if !parameters.contains_key(name) {
                    if let Some(value) = event.input_params.get(key) {
                        parameters.insert(name.clone(), value.clone());
                    }
                }
            }
        }
    }
    Value::Object(parameters)
}

/// TF-IDF cosine similarity over whitespace/punctuation tokens.
pub fn cosine_tfidf(a: &str, b: &str) -> f64 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let tf = |tokens: &[String]| -> BTreeMap<String, f64> {
        let mut counts: BTreeMap<String, f64> = BTreeMap::new();
        for t in tokens {
            *counts.entry(t.clone()).or_insert(0.0) += 1.0;
        }
        let len = tokens.len() as f64;
        counts.values_mut().for_each(|v| *v /= len);
        counts
    };
    let tf_a = tf(&tokens_a);
    let tf_b = tf(&tokens_b);

    // Smoothed idf over the two-document corpus.
    let idf = |term: &str| -> f64 {
        let df = tf_a.contains_key(term) as u32 + tf_b.contains_key(term) as u32;
        ((1.0 + 2.0) / (1.0 + df as f64)).ln() + 1.0
    };

    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (term, &wa) in &tf_a {
        let w = wa * idf(term);
        norm_a += w * w;
        if let Some(&wb) = tf_b.get(term) {
            dot += w * (wb * idf(term));
        }
    }
    for (term, &wb) in &tf_b {
        let w = wb * idf(term);
        norm_b += w * w;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn tokenize(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}
