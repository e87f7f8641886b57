use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use twinraven_core::event::{canonical_json, Event, Outcome};
use twinraven_core::store::{EventStore, MemoryEventStore};
use twinraven_core::tool::{
    Backoff, ErrorStrategy, InputSource, RetryPolicy, SynthesizedTool, ToolStatus, ToolStep,
};
use twinraven_core::validation::{
    SimilarityMethod, ValidationConfig, ValidationError, Validator,
};
use uuid::Uuid;

fn step(index: usize, tool_id: &str, mapping: &[(&str, InputSource)]) -> ToolStep {
    ToolStep {
        index,
        tool_id: tool_id.into(),
        input_mapping: mapping
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        condition: None,
        parallelizable_with: vec![],
        timeout_ms: None,
    }
}

/// The composite matching the canonical search -> read -> summarize flow.
fn fixture_tool() -> SynthesizedTool {
    let mut tool = SynthesizedTool {
        slug: "search-read-summarize".into(),
        description: "test composite".into(),
        parameters: json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
        }),
        internal_wiring: BTreeMap::new(),
        steps: vec![
            step(0, "search", &[("query", InputSource::Parameter("query".into()))]),
            step(
                1,
                "read",
                &[(
                    "url",
                    InputSource::Wiring {
                        step: 0,
                        field: "url".into(),
                    },
                )],
            ),
            step(
                2,
                "summarize",
                &[(
                    "text",
                    InputSource::Wiring {
                        step: 1,
                        field: "text".into(),
                    },
                )],
            ),
        ],
        error_strategy: ErrorStrategy::abort_only(),
        source_chain_id: Uuid::new_v4(),
        source_support: 1.0,
        version: 1,
        status: ToolStatus::Draft,
        created_at: Utc::now(),
        promoted_at: None,
        retired_at: None,
    };
    tool.rebuild_wiring();
    tool
}

async fn seed_session(
    store: &Arc<MemoryEventStore>,
    session: &str,
    read_outcome: Outcome,
    latencies: [u32; 3],
) {
    let base = Utc::now() - Duration::minutes(5);
    let steps: [(&str, Value, Value, Outcome); 3] = [
        (
            "search",
            json!({"query": format!("q-{session}")}),
            json!({"url": format!("https://a/{session}")}),
            Outcome::Success,
        ),
        (
            "read",
            json!({"url": format!("https://a/{session}")}),
            json!({"text": format!("body {session}")}),
            read_outcome,
        ),
        (
            "summarize",
            json!({"text": format!("body {session}")}),
            json!({"summary": format!("sum {session}")}),
            Outcome::Success,
        ),
    ];
    for (i, (tool, inputs, output, outcome)) in steps.iter().enumerate() {
        let mut event = Event::new(session, *tool, inputs.clone(), *outcome)
            .with_summary(canonical_json(output))
            .with_latency(latencies[i]);
        event.timestamp = base + Duration::seconds(i as i64);
        store.append(event).await.unwrap();
    }
}

fn config(min_sessions: usize) -> ValidationConfig {
    let mut c = ValidationConfig::over_window(
        Utc::now() - Duration::days(1),
        Utc::now() + Duration::minutes(5),
    );
    c.min_replay_sessions = min_sessions;
    c.equivalence_threshold = 0.95;
    c
}

#[tokio::test]
async fn faithful_composite_passes_and_promotes() {
    let store = MemoryEventStore::new();
    for (i, total) in [1000u32, 1100, 950].iter().enumerate() {
        let per = total / 3;
        seed_session(
            &store,
            &format!("s{i}"),
            Outcome::Success,
            [per, per, total - 2 * per],
        )
        .await;
    }

    let mut tool = fixture_tool();
    let validator = Validator::new(store);
    let result = validator.validate(&mut tool, &config(3)).await.unwrap();

    assert!(result.passed, "reasons: {:?}", result.failure_reasons);
    assert!(result.mean_similarity >= 0.95);
    assert_eq!(result.min_similarity, 1.0);
    assert!((result.latency_ratio - 1.0).abs() < 1e-9);
    assert!(result.error_parity);
    assert_eq!(result.sessions_replayed, 3);
    assert_eq!(tool.status, ToolStatus::Promoted);
    assert!(tool.promoted_at.is_some());
}

#[tokio::test]
async fn approval_required_parks_in_testing() {
    let store = MemoryEventStore::new();
    for i in 0..3 {
        seed_session(&store, &format!("s{i}"), Outcome::Success, [10, 10, 10]).await;
    }
    let mut tool = fixture_tool();
    let mut cfg = config(3);
    cfg.approval_required = true;

    let validator = Validator::new(store);
    let result = validator.validate(&mut tool, &cfg).await.unwrap();
    assert!(result.passed);
    assert_eq!(tool.status, ToolStatus::Testing);
    assert!(tool.promoted_at.is_none());
}

#[tokio::test]
async fn insufficient_sessions_fail_without_transition() {
    let store = MemoryEventStore::new();
    for i in 0..3 {
        seed_session(&store, &format!("s{i}"), Outcome::Success, [10, 10, 10]).await;
    }
    let mut tool = fixture_tool();

    let validator = Validator::new(store);
    let err = validator.validate(&mut tool, &config(10)).await.unwrap_err();
    assert!(matches!(
        err,
        ValidationError::InsufficientData {
            found: 3,
            needed: 10
        }
    ));
    assert_eq!(tool.status, ToolStatus::Draft);
}

#[tokio::test]
async fn wrong_wiring_fails_equivalence() {
    let store = MemoryEventStore::new();
    for i in 0..3 {
        seed_session(&store, &format!("s{i}"), Outcome::Success, [10, 10, 10]).await;
    }
    let mut tool = fixture_tool();
    // Mis-wire step 1 to a field the search output does not carry.
    tool.steps[1].input_mapping.insert(
        "url".into(),
        InputSource::Wiring {
            step: 0,
            field: "href".into(),
        },
    );
    tool.rebuild_wiring();

    let validator = Validator::new(store);
    let result = validator.validate(&mut tool, &config(3)).await.unwrap();
    assert!(!result.passed);
    assert!(result.mean_similarity < 0.95);
    assert!(result
        .failure_reasons
        .iter()
        .any(|r| r.contains("similarity")));
    assert_eq!(tool.status, ToolStatus::Draft);
}

#[tokio::test]
async fn uncovered_failures_break_error_parity() {
    let store = MemoryEventStore::new();
    seed_session(&store, "ok", Outcome::Success, [10, 10, 10]).await;
    seed_session(&store, "bad", Outcome::Failure, [10, 10, 10]).await;

    let mut tool = fixture_tool();
    let validator = Validator::new(store.clone());
    let result = validator.validate(&mut tool, &config(2)).await.unwrap();
    assert!(!result.error_parity);
    assert!(!result.passed);
    assert!(result
        .failure_reasons
        .iter()
        .any(|r| r.contains("error strategy")));

    // An explicit retry policy for the failing step restores parity.
    let mut covered = fixture_tool();
    covered.error_strategy.retries.insert(
        1,
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay_ms: 500,
        },
    );
    let result = validator.validate(&mut covered, &config(2)).await.unwrap();
    assert!(result.error_parity);
}

#[tokio::test]
async fn exact_match_scores_binary() {
    let store = MemoryEventStore::new();
    for i in 0..2 {
        seed_session(&store, &format!("s{i}"), Outcome::Success, [10, 10, 10]).await;
    }
    let mut tool = fixture_tool();
    let mut cfg = config(2);
    cfg.similarity_method = SimilarityMethod::ExactMatch;

    let validator = Validator::new(store);
    let result = validator.validate(&mut tool, &cfg).await.unwrap();
    assert_eq!(result.mean_similarity, 1.0);
    assert_eq!(result.min_similarity, 1.0);
}

#[tokio::test]
async fn parallel_groups_reduce_composite_latency() {
    let store = MemoryEventStore::new();
    for i in 0..2 {
        seed_session(&store, &format!("s{i}"), Outcome::Success, [100, 100, 100]).await;
    }
    let mut tool = fixture_tool();
    // Pretend read and summarize can overlap (no wiring between them).
    tool.steps[2].input_mapping.insert(
        "text".into(),
        InputSource::Parameter("text".into()),
    );
    tool.steps[1].parallelizable_with = vec![2];
    tool.steps[2].parallelizable_with = vec![1];
    tool.rebuild_wiring();

    let validator = Validator::new(store);
    let result = validator.validate(&mut tool, &config(2)).await.unwrap();
    // Savings per session: (100 + 100) - 100 over a 300 ms chain.
    assert!((result.latency_ratio - 200.0 / 300.0).abs() < 1e-9);
}
