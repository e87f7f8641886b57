//! Deterministic parameter-flow analysis over sample executions.
//!
//! Runs before the LLM is consulted; the classification is injected into
//! the prompt as structured hints so the model resolves only what the data
//! cannot.

use crate::event::{canonical_json, Event};
use serde_json::Value;
use std::collections::BTreeSet;

/// Classification of one input key at one step.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamClass {
    /// Supplied by the caller of the composite.
    External,
    /// Flows from the previous step's output.
    Wiring { from_step: usize, field: String },
    /// Identical value across all samples.
    Constant(Value),
    /// Inconsistent evidence; left to the LLM.
    Ambiguous,
}

#[derive(Debug, Clone)]
pub struct ParamFlow {
    pub step: usize,
    pub key: String,
    pub class: ParamClass,
}

/// Analyze aligned sample executions (each a matched event per chain step).
///
/// Step 0 keys are external by definition. For later steps a key is wiring
/// when the predecessor's output carries its value consistently (same
/// field name preferred, consistent rename accepted), constant when the
/// value never varies, external when prior outputs never produce it, and
/// ambiguous otherwise.
pub fn analyze(samples: &[Vec<Event>]) -> Vec<ParamFlow> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };
    let chain_len = first.len();
    let mut flows = Vec::new();

    for step in 0..chain_len {
        let keys = step_input_keys(samples, step);
        for key in keys {
            let class = if step == 0 {
                ParamClass::External
            } else {
                classify(samples, step, &key)
            };
            flows.push(ParamFlow {
                step,
                key,
                class,
            });
        }
    }
    flows
}

fn step_input_keys(samples: &[Vec<Event>], step: usize) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for sample in samples {
        if let Some(event) = sample.get(step) {
            if let Value::Object(map) = &event.input_params {
                keys.extend(map.keys().cloned());
            }
        }
    }
    keys
}

fn classify(samples: &[Vec<Event>], step: usize, key: &str) -> ParamClass {
    // Values of this key per sample, where present.
    let values: Vec<&Value> = samples
        .iter()
        .filter_map(|s| s.get(step))
        .filter_map(|e| e.input_params.get(key))
        .collect();
    if values.is_empty() {
        return ParamClass::Ambiguous;
    }

    if let Some(field) = wiring_field(samples, step, key) {
        return ParamClass::Wiring {
            from_step: step - 1,
            field,
        };
    }

    let first = canonical_json(values[0]);
    if values.iter().all(|v| canonical_json(v) == first) {
        return ParamClass::Constant(values[0].clone());
    }

    // Value seen in some predecessor outputs but not consistently: the
    // evidence conflicts, defer to the LLM.
    if any_output_match(samples, step, key) {
        return ParamClass::Ambiguous;
    }
    ParamClass::External
}

/// A predecessor output field whose value equals this input in every
/// sample where both sides are observable. Same-named fields win.
fn wiring_field(samples: &[Vec<Event>], step: usize, key: &str) -> Option<String> {
    let mut candidates: Option<BTreeSet<String>> = None;
    for sample in samples {
        let (Some(current), Some(prev)) = (sample.get(step), sample.get(step - 1)) else {
            continue;
        };
        let Some(input_value) = current.input_params.get(key) else {
            continue;
        };
        // Truncated or free-text summaries carry no field evidence; skip
        // the sample rather than discard what the others show.
        let Some(Value::Object(output)) = parsed_output(prev) else {
            continue;
        };
        let matching: BTreeSet<String> = output
            .iter()
            .filter(|(_, v)| canonical_json(v) == canonical_json(input_value))
            .map(|(k, _)| k.clone())
            .collect();
        candidates = Some(match candidates {
            None => matching,
            Some(existing) => existing.intersection(&matching).cloned().collect(),
        });
        if candidates.as_ref().map_or(false, |c| c.is_empty()) {
            return None;
        }
    }
    let candidates = candidates?;
    if candidates.contains(key) {
        return Some(key.to_string());
    }
    candidates.into_iter().next()
}

fn any_output_match(samples: &[Vec<Event>], step: usize, key: &str) -> bool {
    samples.iter().any(|sample| {
        let (Some(current), Some(prev)) = (sample.get(step), sample.get(step - 1)) else {
            return false;
        };
        let Some(input_value) = current.input_params.get(key) else {
            return false;
        };
        match parsed_output(prev) {
            Some(Value::Object(output)) => output
                .values()
                .any(|v| canonical_json(v) == canonical_json(input_value)),
            _ => false,
        }
    })
}

/// Structured view of a recorded output summary, when it parses as JSON.
pub fn parsed_output(event: &Event) -> Option<Value> {
    event
        .output_summary
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Outcome;
    use serde_json::json;

    fn sample(steps: &[(&str, Value, Value)]) -> Vec<Event> {
        steps
            .iter()
            .map(|(tool, inputs, output)| {
                Event::new("s", *tool, inputs.clone(), Outcome::Success)
                    .with_summary(canonical_json(output))
            })
            .collect()
    }

    #[test]
    fn step_zero_keys_are_external() {
        let samples = vec![sample(&[
            ("search", json!({"q": "rust"}), json!({"url": "a"})),
            ("read", json!({"url": "a"}), json!({"text": "t"})),
        ])];
        let flows = analyze(&samples);
        let q = flows.iter().find(|f| f.step == 0 && f.key == "q").unwrap();
        assert_eq!(q.class, ParamClass::External);
    }

    #[test]
    fn matching_output_field_classifies_as_wiring() {
        let samples = vec![
            sample(&[
                ("search", json!({"q": "a"}), json!({"url": "u1"})),
                ("read", json!({"url": "u1"}), json!({"text": "t1"})),
            ]),
            sample(&[
                ("search", json!({"q": "b"}), json!({"url": "u2"})),
                ("read", json!({"url": "u2"}), json!({"text": "t2"})),
            ]),
        ];
        let flows = analyze(&samples);
        let url = flows.iter().find(|f| f.step == 1 && f.key == "url").unwrap();
        assert_eq!(
            url.class,
            ParamClass::Wiring {
                from_step: 0,
                field: "url".into()
            }
        );
    }

    #[test]
    fn unvarying_value_classifies_as_constant() {
        let samples = vec![
            sample(&[
                ("search", json!({"q": "a"}), json!({"url": "u1"})),
                ("read", json!({"url": "u1", "format": "html"}), json!({})),
            ]),
            sample(&[
                ("search", json!({"q": "b"}), json!({"url": "u2"})),
                ("read", json!({"url": "u2", "format": "html"}), json!({})),
            ]),
        ];
        let flows = analyze(&samples);
        let format = flows
            .iter()
            .find(|f| f.step == 1 && f.key == "format")
            .unwrap();
        assert_eq!(format.class, ParamClass::Constant(json!("html")));
    }

    #[test]
    fn unsourced_varying_value_classifies_as_external() {
        let samples = vec![
            sample(&[
                ("search", json!({"q": "a"}), json!({"url": "u1"})),
                ("read", json!({"url": "u1", "lang": "en"}), json!({})),
            ]),
            sample(&[
                ("search", json!({"q": "b"}), json!({"url": "u2"})),
                ("read", json!({"url": "u2", "lang": "de"}), json!({})),
            ]),
        ];
        let flows = analyze(&samples);
        let lang = flows.iter().find(|f| f.step == 1 && f.key == "lang").unwrap();
        assert_eq!(lang.class, ParamClass::External);
    }
}
