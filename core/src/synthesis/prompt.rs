//! Prompt assembly and the strict response schema for synthesis.

use super::flow::{ParamClass, ParamFlow};
use crate::candidate::CandidateChain;
use crate::event::Event;
use serde_json::{json, Value};

/// JSON Schema the LLM response must conform to. The error strategy is
/// derived deterministically from observed failures, so it is absent here.
pub fn response_schema(chain_len: usize) -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "properties": {
            "description": {"type": "string", "minLength": 1},
            "parameters": {
                "type": "object",
                "description": "JSON Schema (draft 2020-12) for the composite's external parameters",
            },
            "steps": {
                "type": "array",
                "minItems": chain_len,
                "maxItems": chain_len,
                "items": {
                    "type": "object",
                    "properties": {
                        "index": {"type": "integer", "minimum": 0},
                        "tool_id": {"type": "string"},
                        "input_mapping": {"type": "object"},
                        "condition": {"type": ["string", "null"]},
                        "parallelizable_with": {
                            "type": "array",
                            "items": {"type": "integer", "minimum": 0},
                        },
                        "timeout_ms": {"type": ["integer", "null"], "minimum": 0},
                    },
                    "required": ["index", "tool_id", "input_mapping"],
                    "additionalProperties": false,
                },
            },
        },
        "required": ["description", "parameters", "steps"],
        "additionalProperties": false,
    })
}

/// The synthesis prompt: tool sequence, chain statistics, the classified
/// parameter inventory, and the first `max_samples` observed executions.
pub fn build_prompt(
    chain: &CandidateChain,
    flows: &[ParamFlow],
    samples: &[Vec<Event>],
    max_samples: usize,
) -> String {
    let mut p = String::new();
    p.push_str(
        "You are designing a composite tool that collapses an observed \
         sequence of agent tool calls into a single callable.\n\n",
    );
    p.push_str(&format!(
        "Tool sequence: {}\nObserved support: {:.3}, confidence: {:.3}, \
         average total latency: {:.0} ms, failure rate: {:.3}\n\n",
        chain.tools.join(" -> "),
        chain.support,
        chain.confidence,
        chain.avg_latency_ms,
        chain.failure_rate,
    ));

    p.push_str("Parameter-flow analysis (trust these classifications):\n");
    for flow in flows {
        let line = match &flow.class {
            ParamClass::External => format!(
                "- step {} input `{}`: EXTERNAL (caller-supplied)\n",
                flow.step, flow.key
            ),
            ParamClass::Wiring { from_step, field } => format!(
                "- step {} input `{}`: WIRED from step {} output field `{}`\n",
                flow.step, flow.key, from_step, field
            ),
            ParamClass::Constant(v) => format!(
                "- step {} input `{}`: CONSTANT {}\n",
                flow.step, flow.key, v
            ),
            ParamClass::Ambiguous => format!(
                "- step {} input `{}`: AMBIGUOUS, resolve from the samples\n",
                flow.step, flow.key
            ),
        };
        p.push_str(&line);
    }

    p.push_str("\nSample executions:\n");
    for (i, sample) in samples.iter().take(max_samples).enumerate() {
        p.push_str(&format!("--- sample {} ---\n", i + 1));
        for event in sample {
            p.push_str(&format!(
                "{}: inputs={} output={} outcome={}\n",
                event.tool_id,
                event.input_params,
                event.output_summary.as_deref().unwrap_or("(none)"),
                event.outcome.as_str(),
            ));
        }
    }

    p.push_str(
        "\nRespond with JSON only, conforming to the response schema. Rules:\n\
         - `steps[i].tool_id` must be the i-th tool of the sequence.\n\
         - `input_mapping` values are `$.parameters.<name>` for external \
         inputs, `$.steps[<i>].output.<field>` for wired inputs, or a \
         literal JSON constant.\n\
         - `parameters` is a JSON Schema (draft 2020-12) object describing \
         exactly the external inputs.\n\
         - Optional `condition` guards use only comparisons over \
         `parameters.<name>` and `wiring.<step>.<field>` combined with \
         `&&`, `||`, `!`. No function calls.\n\
         - Mark steps `parallelizable_with` only when neither consumes the \
         other's output.\n",
    );
    p
}

/// Retry prompt: the original plus the validator's complaints.
pub fn build_retry_prompt(original: &str, errors: &str) -> String {
    format!(
        "{original}\n\nYour previous response was rejected for these \
         reasons:\n{errors}\n\nProduce a corrected JSON response that fixes \
         every issue. Respond with JSON only.",
    )
}
