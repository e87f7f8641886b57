// Telemetry event model and canonical input hashing
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// 128-bit opaque event identifier.
pub type EventId = Uuid;

/// Outcome of one observed tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Outcome::Success),
            "failure" => Some(Outcome::Failure),
            "partial" => Some(Outcome::Partial),
            _ => None,
        }
    }
}

/// A record of one tool call within a session.
///
/// Events are written once and never mutated afterwards; the only permitted
/// post-write change is the `successor` backfill performed by the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    /// Caller-assigned session grouping key.
    pub session_id: String,

    pub tool_id: String,

    /// Stable 64-bit hash of the canonicalized input tree, 16 hex chars.
    pub input_hash: String,

    /// Original input parameter tree.
    pub input_params: Value,

    /// Compressed textual output summary, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,

    /// Back link to the previous event of the same session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<EventId>,

    /// Forward link, backfilled by the collector once the next event exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successor: Option<EventId>,

    /// UTC, microsecond precision.
    pub timestamp: DateTime<Utc>,

    /// Execution duration in milliseconds, never negative.
    pub latency_ms: u32,

    pub outcome: Outcome,

    pub tags: Vec<String>,
}

impl Event {
    /// Build a fresh event for `tool_id` with a new identifier and the
    /// input hash computed over the canonicalized parameter tree.
    pub fn new(
        session_id: impl Into<String>,
        tool_id: impl Into<String>,
        input_params: Value,
        outcome: Outcome,
    ) -> Self {
        let input_hash = input_hash(&input_params);
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            tool_id: tool_id.into(),
            input_hash,
            input_params,
            output_summary: None,
            predecessor: None,
            successor: None,
            timestamp: now_micros(),
            latency_ms: 0,
            outcome,
            tags: Vec::new(),
        }
    }

    pub fn with_latency(mut self, latency_ms: u32) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.output_summary = Some(summary.into());
        self
    }
}

/// Current UTC time truncated to the event model's microsecond precision.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Canonical serialization of a JSON tree: object keys sorted, no
/// whitespace, numbers in normalized form (whole floats collapse to
/// integers so `1.0` and `1` hash identically).
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if n.as_i64().is_none() && n.as_u64().is_none() {
                if let Some(f) = n.as_f64() {
                    // Whole-valued floats normalize to their integer form.
                    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
                        out.push_str(&format!("{}", f as i64));
                        return;
                    }
                }
            }
            out.push_str(&n.to_string());
        }
        Value::String(s) => {
            // serde_json string escaping is deterministic
            out.push_str(&serde_json::to_string(s).expect("string serialization"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("key serialization"));
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// 64-bit input hash: first 8 bytes of SHA-256 over the canonical form,
/// rendered as 16 lowercase hex chars. Stable across runs and processes.
pub fn input_hash(params: &Value) -> String {
    let canonical = canonical_json(params);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_sorts_keys_and_strips_whitespace() {
        let v = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        assert_eq!(canonical_json(&v), r#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
    }

    #[test]
    fn identical_inputs_hash_identically() {
        let a = json!({"q": "rust", "limit": 10});
        let b = json!({"limit": 10, "q": "rust"});
        assert_eq!(input_hash(&a), input_hash(&b));
        assert_eq!(input_hash(&a).len(), 16);
    }

    #[test]
    fn whole_floats_normalize_to_integers() {
        let a = json!({"n": 10.0});
        let b = json!({"n": 10});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(input_hash(&a), input_hash(&b));
    }

    #[test]
    fn different_inputs_hash_differently() {
        assert_ne!(input_hash(&json!({"a": 1})), input_hash(&json!({"a": 2})));
    }

    #[test]
    fn outcome_round_trips_through_str() {
        for o in [Outcome::Success, Outcome::Failure, Outcome::Partial] {
            assert_eq!(Outcome::parse(o.as_str()), Some(o));
        }
        assert_eq!(Outcome::parse("unknown"), None);
    }
}
