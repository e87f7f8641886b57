//! LLM-driven synthesis of composite tools from candidate chains.

mod flow;
mod prompt;

pub use flow::{analyze, parsed_output, ParamClass, ParamFlow};
pub use prompt::{build_prompt, build_retry_prompt, response_schema};

use crate::candidate::CandidateChain;
use crate::event::{Event, Outcome};
use crate::llm::{GenerateRequest, LlmError, LlmProvider};
use crate::mining::leftmost_embedding;
use crate::predicate::Predicate;
use crate::store::{EventStore, SessionOrder, StorageError};
use crate::tool::{
    derive_slug, AbortCondition, Backoff, DefaultBehavior, ErrorStrategy, InputSource,
    RetryPolicy, SynthesizedTool, ToolStatus, ToolStep,
};
use chrono::Utc;
use jsonschema::Draft;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("synthesis response failed schema validation: {0}")]
    SchemaInvalid(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    /// Cap on `parallelizable_with` siblings per step.
    pub max_parallel_steps: usize,
    /// Sample executions shown in the prompt.
    pub max_prompt_samples: usize,
    pub max_tokens: u32,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 2,
            max_prompt_samples: 3,
            max_tokens: 4096,
        }
    }
}

pub struct Synthesizer {
    store: Arc<dyn EventStore>,
    llm: Arc<dyn LlmProvider>,
    config: SynthesizerConfig,
}

impl Synthesizer {
    pub fn new(
        store: Arc<dyn EventStore>,
        llm: Arc<dyn LlmProvider>,
        config: SynthesizerConfig,
    ) -> Self {
        Self { store, llm, config }
    }

    /// Produce a draft composite tool (version 1) for the chain.
    ///
    /// One retry is permitted when the response fails validation, with the
    /// validator's complaints fed back; a second failure is operation-fatal.
    #[tracing::instrument(skip(self, chain), fields(chain = %chain.tools.join("->")))]
    pub async fn synthesize(
        &self,
        chain: &CandidateChain,
    ) -> Result<SynthesizedTool, SynthesisError> {
        let samples = self.retrieve_samples(chain).await?;
        if samples.is_empty() {
            return Err(SynthesisError::Synthesis(format!(
                "no replayable samples for chain {}",
                chain.id
            )));
        }

        let flows = analyze(&samples);
        let base_prompt = build_prompt(chain, &flows, &samples, self.config.max_prompt_samples);
        let schema = response_schema(chain.tools.len());

        let mut last_errors = String::new();
        for attempt in 0..2 {
            let prompt = if attempt == 0 {
                base_prompt.clone()
            } else {
                debug!(target: "synthesizer", errors = %last_errors, "retrying with feedback");
                build_retry_prompt(&base_prompt, &last_errors)
            };
            let request = GenerateRequest::new(prompt)
                .with_schema(schema.clone())
                .with_max_tokens(self.config.max_tokens)
                .with_temperature(0.0);

            let parsed = match self.llm.generate(request).await {
                Ok(resp) => resp
                    .parsed
                    .ok_or_else(|| SynthesisError::Synthesis("provider returned no parsed response".into()))?,
                Err(LlmError::Response(e)) => {
                    last_errors = e;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self.build_tool(chain, &samples, parsed) {
                Ok(tool) => {
                    info!(target: "synthesizer", slug = %tool.slug, "synthesized draft tool");
                    return Ok(tool);
                }
                Err(errors) => last_errors = errors,
            }
        }
        Err(SynthesisError::SchemaInvalid(last_errors))
    }

    /// For each provenance anchor: the event, its session, and the
    /// sub-sequence of session events matching the chain's tool order.
    async fn retrieve_samples(
        &self,
        chain: &CandidateChain,
    ) -> Result<Vec<Vec<Event>>, StorageError> {
        let mut samples = Vec::new();
        for &sample_id in &chain.sample_event_ids {
            let Some(anchor) = self.store.get_by_id(sample_id).await? else {
                warn!(target: "synthesizer", event = %sample_id, "sample anchor missing, skipping");
                continue;
            };
            let events = self
                .store
                .get_by_session(&anchor.session_id, SessionOrder::Timestamp)
                .await?;
            let tools: Vec<String> = events.iter().map(|e| e.tool_id.clone()).collect();
            if let Some(embedding) = leftmost_embedding(&chain.tools, &tools) {
                samples.push(embedding.into_iter().map(|i| events[i].clone()).collect());
            }
        }
        Ok(samples)
    }

    /// Semantic validation of the LLM response plus tool construction.
    /// Returns the collected complaints on failure for the retry prompt.
    fn build_tool(
        &self,
        chain: &CandidateChain,
        samples: &[Vec<Event>],
        response: Value,
    ) -> Result<SynthesizedTool, String> {
        let mut errors: Vec<String> = Vec::new();

        let description = response
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let parameters = response.get("parameters").cloned().unwrap_or(Value::Null);
        if jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&parameters)
            .is_err()
        {
            errors.push("`parameters` is not a valid JSON Schema (draft 2020-12)".into());
        }

        let raw_steps = response
            .get("steps")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let chain_len = chain.tools.len();
        let mut steps: Vec<ToolStep> = Vec::with_capacity(raw_steps.len());

        for (i, raw) in raw_steps.iter().enumerate() {
            let index = raw.get("index").and_then(|v| v.as_u64()).unwrap_or(u64::MAX) as usize;
            if index != i {
                errors.push(format!("step {i}: index must be dense from 0, got {index}"));
            }
            let tool_id = raw
                .get("tool_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if chain.tools.get(i) != Some(&tool_id) {
                errors.push(format!(
                    "step {i}: unknown tool `{tool_id}`, expected `{}`",
                    chain.tools.get(i).map(String::as_str).unwrap_or("?")
                ));
            }

            let mut input_mapping = BTreeMap::new();
            if let Some(Value::Object(mapping)) = raw.get("input_mapping") {
                for (key, value) in mapping {
                    let source = InputSource::from_value(value.clone());
                    if let InputSource::Wiring { step, .. } = &source {
                        if *step >= i {
                            errors.push(format!(
                                "step {i}: wiring for `{key}` references step {step}, \
                                 which is not upstream"
                            ));
                        }
                        if *step >= chain_len {
                            errors.push(format!(
                                "step {i}: wiring for `{key}` references out-of-bounds \
                                 step {step}"
                            ));
                        }
                    }
                    input_mapping.insert(key.clone(), source);
                }
            }

            let condition = match raw.get("condition").and_then(|v| v.as_str()) {
                Some(src) if !src.is_empty() => match Predicate::parse(src) {
                    Ok(p) => Some(p.source().to_string()),
                    Err(e) => {
                        errors.push(format!("step {i}: condition rejected: {e}"));
                        None
                    }
                },
                _ => None,
            };

            let parallelizable_with: Vec<usize> = raw
                .get("parallelizable_with")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_u64().map(|n| n as usize))
                        .collect()
                })
                .unwrap_or_default();
            for &other in &parallelizable_with {
                if other >= chain_len {
                    errors.push(format!(
                        "step {i}: parallelizable_with references out-of-bounds step {other}"
                    ));
                }
            }

            steps.push(ToolStep {
                index: i,
                tool_id,
                input_mapping,
                condition,
                parallelizable_with,
                timeout_ms: raw.get("timeout_ms").and_then(|v| v.as_u64()),
            });
        }

        if steps.len() != chain_len {
            errors.push(format!(
                "expected {chain_len} steps, got {}",
                steps.len()
            ));
        }
        if !errors.is_empty() {
            return Err(errors.join("\n"));
        }

        let mut tool = SynthesizedTool {
            slug: derive_slug(&chain.tools),
            description,
            parameters,
            internal_wiring: BTreeMap::new(),
            steps,
            error_strategy: derive_error_strategy(samples),
            source_chain_id: chain.id,
            source_support: chain.support,
            version: 1,
            status: ToolStatus::Draft,
            created_at: Utc::now(),
            promoted_at: None,
            retired_at: None,
        };
        tool.rebuild_wiring();
        reconcile_parallelism(&mut tool, self.config.max_parallel_steps);
        Ok(tool)
    }
}

/// Two steps stay marked parallel only when neither is a transitive wiring
/// ancestor of the other; each step keeps at most `max_parallel` siblings.
fn reconcile_parallelism(tool: &mut SynthesizedTool, max_parallel: usize) {
    let ancestors: BTreeMap<usize, std::collections::BTreeSet<usize>> = tool
        .steps
        .iter()
        .map(|s| (s.index, tool.ancestors_of(s.index)))
        .collect();
    for step in &mut tool.steps {
        let own = step.index;
        let mut kept: Vec<usize> = Vec::new();
        for &other in &step.parallelizable_with {
            if other == own || kept.contains(&other) {
                continue;
            }
            let conflicting = ancestors
                .get(&own)
                .map_or(false, |a| a.contains(&other))
                || ancestors.get(&other).map_or(false, |a| a.contains(&own));
            if !conflicting {
                kept.push(other);
            }
        }
        kept.truncate(max_parallel);
        step.parallelizable_with = kept;
    }
}

/// Per-step failure handling from observed outcomes:
/// recovery after a step failure earns a skip fallback, rare failures earn
/// a bounded retry, consistent chain-killing failures earn an abort clause.
/// Steps with no observed failures rely on the abort default.
fn derive_error_strategy(samples: &[Vec<Event>]) -> ErrorStrategy {
    let mut strategy = ErrorStrategy::abort_only();
    let Some(first) = samples.first() else {
        return strategy;
    };

    for step in 0..first.len() {
        let appearing: Vec<&Vec<Event>> =
            samples.iter().filter(|s| s.len() > step).collect();
        if appearing.is_empty() {
            continue;
        }
        let failed: Vec<&&Vec<Event>> = appearing
            .iter()
            .filter(|s| s[step].outcome == Outcome::Failure)
            .collect();
        if failed.is_empty() {
            continue;
        }

        let chain_recovered = failed
            .iter()
            .any(|s| s.last().map(|e| e.outcome) == Some(Outcome::Success));
        let failure_share = failed.len() as f64 / appearing.len() as f64;

        if chain_recovered {
            // The chain survived this step failing: skip and continue.
            strategy.fallbacks.insert(step, Vec::new());
        } else if failure_share < 0.5 {
            strategy.retries.insert(
                step,
                RetryPolicy {
                    max_attempts: 3,
                    backoff: Backoff::Exponential,
                    base_delay_ms: 1000,
                },
            );
        } else {
            strategy.abort_conditions.push(AbortCondition {
                step,
                condition: None,
            });
        }
    }
    strategy.default_behavior = DefaultBehavior::Abort;
    strategy
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_with_outcomes(outcomes: &[Outcome]) -> Vec<Event> {
        outcomes
            .iter()
            .enumerate()
            .map(|(i, &o)| Event::new("s", format!("t{i}"), json!({}), o))
            .collect()
    }

    #[test]
    fn recovered_step_failure_earns_skip_fallback() {
        let samples = vec![sample_with_outcomes(&[
            Outcome::Success,
            Outcome::Failure,
            Outcome::Success,
        ])];
        let strategy = derive_error_strategy(&samples);
        assert!(strategy.fallbacks.contains_key(&1));
        assert!(strategy.covers_step(1));
        assert!(!strategy.covers_step(0));
    }

    #[test]
    fn rare_failure_earns_retry() {
        let mut samples = vec![
            sample_with_outcomes(&[Outcome::Success, Outcome::Success, Outcome::Success]),
            sample_with_outcomes(&[Outcome::Success, Outcome::Success, Outcome::Success]),
        ];
        samples.push(sample_with_outcomes(&[
            Outcome::Success,
            Outcome::Success,
            Outcome::Failure,
        ]));
        let strategy = derive_error_strategy(&samples);
        let retry = strategy.retries.get(&2).expect("retry policy for step 2");
        assert_eq!(retry.backoff, Backoff::Exponential);
        assert!(retry.max_attempts <= 3);
    }

    #[test]
    fn consistent_chain_killing_failure_earns_abort_clause() {
        let samples = vec![
            sample_with_outcomes(&[Outcome::Success, Outcome::Failure]),
            sample_with_outcomes(&[Outcome::Success, Outcome::Failure]),
        ];
        let strategy = derive_error_strategy(&samples);
        assert!(strategy.abort_conditions.iter().any(|a| a.step == 1));
    }

    #[test]
    fn clean_samples_keep_abort_default_only() {
        let samples = vec![sample_with_outcomes(&[Outcome::Success, Outcome::Success])];
        let strategy = derive_error_strategy(&samples);
        assert!(strategy.retries.is_empty());
        assert!(strategy.fallbacks.is_empty());
        assert!(strategy.abort_conditions.is_empty());
        assert_eq!(strategy.default_behavior, DefaultBehavior::Abort);
    }
}
