//! Composite tool documents: steps, wiring, error strategy, lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of a synthesized tool. Retired is terminal; a reappearing
/// chain produces a new tool document, never a resurrection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Draft,
    Testing,
    Promoted,
    Retired,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Draft => "draft",
            ToolStatus::Testing => "testing",
            ToolStatus::Promoted => "promoted",
            ToolStatus::Retired => "retired",
        }
    }

    pub fn can_transition(self, to: ToolStatus) -> bool {
        use ToolStatus::*;
        matches!(
            (self, to),
            (Draft, Testing) | (Testing, Draft) | (Testing, Promoted) | (Promoted, Retired)
        )
    }
}

#[derive(Error, Debug)]
#[error("illegal lifecycle transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ToolStatus,
    pub to: ToolStatus,
}

/// Where a step input comes from. Serialized as a JSONPath-like string for
/// references (`$.parameters.<name>`, `$.steps[i].output.<field>`); any
/// other JSON value is a literal constant.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    Parameter(String),
    Wiring { step: usize, field: String },
    Literal(Value),
}

impl InputSource {
    pub fn to_value(&self) -> Value {
        match self {
            InputSource::Parameter(name) => Value::String(format!("$.parameters.{name}")),
            InputSource::Wiring { step, field } => {
                Value::String(format!("$.steps[{step}].output.{field}"))
            }
            InputSource::Literal(v) => v.clone(),
        }
    }

    pub fn from_value(value: Value) -> Self {
        if let Value::String(s) = &value {
            if let Some(name) = s.strip_prefix("$.parameters.") {
                return InputSource::Parameter(name.to_string());
            }
            if let Some(rest) = s.strip_prefix("$.steps[") {
                if let Some((idx, field)) = rest
                    .split_once("].output.")
                    .and_then(|(i, f)| i.parse::<usize>().ok().map(|i| (i, f)))
                {
                    return InputSource::Wiring {
                        step: idx,
                        field: field.to_string(),
                    };
                }
            }
        }
        InputSource::Literal(value)
    }
}

impl Serialize for InputSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InputSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(InputSource::from_value(value))
    }
}

/// One constituent step of a composite tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStep {
    /// Zero-based, dense.
    pub index: usize,
    pub tool_id: String,
    /// Target input key -> source.
    pub input_mapping: BTreeMap<String, InputSource>,
    /// Restricted predicate; the step is skipped when it evaluates false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Sibling steps this one may run concurrently with.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallelizable_with: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortCondition {
    pub step: usize,
    /// Restricted predicate; absent means "on any failure of this step".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultBehavior {
    Retry,
    Skip,
    Abort,
}

/// Per-step failure handling for a composite tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStrategy {
    /// Step index -> retry policy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retries: BTreeMap<usize, RetryPolicy>,
    /// Step index -> alternative tool sequences.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fallbacks: BTreeMap<usize, Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub abort_conditions: Vec<AbortCondition>,
    pub default_behavior: DefaultBehavior,
}

impl ErrorStrategy {
    pub fn abort_only() -> Self {
        Self {
            retries: BTreeMap::new(),
            fallbacks: BTreeMap::new(),
            abort_conditions: Vec::new(),
            default_behavior: DefaultBehavior::Abort,
        }
    }

    /// Whether a failure at `step` is explicitly handled: a retry policy,
    /// a fallback sequence, or an abort clause naming the step. The
    /// default behavior alone is silent and does not count.
    pub fn covers_step(&self, step: usize) -> bool {
        self.retries.contains_key(&step)
            || self.fallbacks.contains_key(&step)
            || self.abort_conditions.iter().any(|a| a.step == step)
    }
}

/// A proposed composite tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizedTool {
    /// Derived from the constituent tool names.
    pub slug: String,
    pub description: String,
    /// Merged external parameter schema, JSON Schema Draft 2020-12.
    pub parameters: Value,
    /// Step index -> target key -> source, the wiring subset of the step
    /// input mappings.
    pub internal_wiring: BTreeMap<usize, BTreeMap<String, InputSource>>,
    pub steps: Vec<ToolStep>,
    pub error_strategy: ErrorStrategy,
    pub source_chain_id: Uuid,
    /// Chain support observed at synthesis time, the drift baseline.
    pub source_support: f64,
    /// Monotone, starts at 1.
    pub version: u32,
    pub status: ToolStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
}

impl SynthesizedTool {
    /// Enforced lifecycle step; stamps promotion/retirement times.
    pub fn transition(&mut self, to: ToolStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        match to {
            ToolStatus::Promoted => self.promoted_at = Some(Utc::now()),
            ToolStatus::Retired => self.retired_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Recompute `internal_wiring` from the steps' input mappings.
    pub fn rebuild_wiring(&mut self) {
        self.internal_wiring = self
            .steps
            .iter()
            .filter_map(|step| {
                let wiring: BTreeMap<String, InputSource> = step
                    .input_mapping
                    .iter()
                    .filter(|(_, src)| matches!(src, InputSource::Wiring { .. }))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (!wiring.is_empty()).then_some((step.index, wiring))
            })
            .collect();
    }

    /// Upstream step indices each step depends on through wiring.
    pub fn dependency_edges(&self) -> BTreeMap<usize, BTreeSet<usize>> {
        let mut edges: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for step in &self.steps {
            let deps = edges.entry(step.index).or_default();
            for source in step.input_mapping.values() {
                if let InputSource::Wiring { step: upstream, .. } = source {
                    deps.insert(*upstream);
                }
            }
        }
        edges
    }

    /// Transitive wiring ancestors of `step`.
    pub fn ancestors_of(&self, step: usize) -> BTreeSet<usize> {
        let edges = self.dependency_edges();
        let mut out = BTreeSet::new();
        let mut stack: Vec<usize> = edges.get(&step).into_iter().flatten().copied().collect();
        while let Some(node) = stack.pop() {
            if out.insert(node) {
                stack.extend(edges.get(&node).into_iter().flatten().copied());
            }
        }
        out
    }

    /// True when the wiring graph contains a cycle.
    pub fn has_wiring_cycle(&self) -> bool {
        self.steps
            .iter()
            .any(|s| self.ancestors_of(s.index).contains(&s.index))
    }

    /// Groups of mutually parallelizable steps (connected components over
    /// the declared pairs), used for latency estimation.
    pub fn parallel_groups(&self) -> Vec<BTreeSet<usize>> {
        let mut assigned: BTreeMap<usize, usize> = BTreeMap::new();
        let mut groups: Vec<BTreeSet<usize>> = Vec::new();
        for step in &self.steps {
            for &other in &step.parallelizable_with {
                let a = step.index;
                match (assigned.get(&a).copied(), assigned.get(&other).copied()) {
                    (Some(ga), Some(gb)) if ga != gb => {
                        let merged: BTreeSet<usize> = groups[gb].clone();
                        for idx in &merged {
                            assigned.insert(*idx, ga);
                        }
                        let merged_into = groups[ga].clone();
                        groups[ga] = merged_into.union(&merged).copied().collect();
                        groups[gb].clear();
                    }
                    (Some(ga), None) => {
                        groups[ga].insert(other);
                        assigned.insert(other, ga);
                    }
                    (None, Some(gb)) => {
                        groups[gb].insert(a);
                        assigned.insert(a, gb);
                    }
                    (None, None) => {
                        let mut g = BTreeSet::new();
                        g.insert(a);
                        g.insert(other);
                        groups.push(g);
                        assigned.insert(a, groups.len() - 1);
                        assigned.insert(other, groups.len() - 1);
                    }
                    (Some(_), Some(_)) => {}
                }
            }
        }
        groups.retain(|g| g.len() >= 2);
        groups
    }
}

/// Slug from the constituent tool names: lowercased, non-alphanumeric runs
/// collapsed to single dashes.
pub fn derive_slug(tools: &[String]) -> String {
    let joined = tools.join("-").to_lowercase();
    let mut slug = String::with_capacity(joined.len());
    let mut last_dash = true;
    for c in joined.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_source_string_round_trip() {
        for src in [
            InputSource::Parameter("query".into()),
            InputSource::Wiring {
                step: 2,
                field: "url".into(),
            },
            InputSource::Literal(json!(42)),
            InputSource::Literal(json!("plain string")),
        ] {
            let encoded = src.to_value();
            assert_eq!(InputSource::from_value(encoded), src);
        }
    }

    #[test]
    fn lifecycle_transitions() {
        use ToolStatus::*;
        assert!(Draft.can_transition(Testing));
        assert!(Testing.can_transition(Draft));
        assert!(Testing.can_transition(Promoted));
        assert!(Promoted.can_transition(Retired));
        // Retired is terminal.
        assert!(!Retired.can_transition(Promoted));
        assert!(!Retired.can_transition(Draft));
        assert!(!Draft.can_transition(Promoted));
    }

    #[test]
    fn slug_derivation() {
        let tools: Vec<String> = vec!["web.search".into(), "Read_Page".into(), "summarize".into()];
        assert_eq!(derive_slug(&tools), "web-search-read-page-summarize");
    }

    #[test]
    fn wiring_cycle_detection() {
        let mk_step = |index: usize, from: usize| ToolStep {
            index,
            tool_id: format!("t{index}"),
            input_mapping: BTreeMap::from([(
                "x".to_string(),
                InputSource::Wiring {
                    step: from,
                    field: "y".into(),
                },
            )]),
            condition: None,
            parallelizable_with: vec![],
            timeout_ms: None,
        };
        let mut tool = SynthesizedTool {
            slug: "t".into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
            internal_wiring: BTreeMap::new(),
            steps: vec![mk_step(0, 1), mk_step(1, 0)],
            error_strategy: ErrorStrategy::abort_only(),
            source_chain_id: Uuid::new_v4(),
            source_support: 1.0,
            version: 1,
            status: ToolStatus::Draft,
            created_at: Utc::now(),
            promoted_at: None,
            retired_at: None,
        };
        assert!(tool.has_wiring_cycle());
        tool.steps = vec![mk_step(1, 0)];
        tool.steps.insert(
            0,
            ToolStep {
                index: 0,
                tool_id: "t0".into(),
                input_mapping: BTreeMap::new(),
                condition: None,
                parallelizable_with: vec![],
                timeout_ms: None,
            },
        );
        assert!(!tool.has_wiring_cycle());
    }
}
