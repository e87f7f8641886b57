use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use twinraven_core::candidate::CandidateChain;
use twinraven_core::event::{canonical_json, Event, Outcome};
use twinraven_core::llm::{GenerateRequest, LlmError, LlmProvider, LlmResponse, LlmResult};
use twinraven_core::mining::{Miner, MiningConfig};
use twinraven_core::store::{EventStore, MemoryEventStore};
use twinraven_core::synthesis::{SynthesisError, Synthesizer, SynthesizerConfig};
use twinraven_core::tool::{InputSource, ToolStatus};

/// Scripted provider: pops one canned reply per call and records prompts.
struct ScriptedProvider {
    replies: Mutex<VecDeque<LlmResult<Value>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<LlmResult<Value>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<LlmResponse> {
        self.prompts.lock().await.push(request.prompt.clone());
        let reply = self
            .replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Provider("script exhausted".into())));
        reply.map(|value| LlmResponse {
            content: value.to_string(),
            parsed: Some(value),
            model: "scripted".into(),
            ..Default::default()
        })
    }
}

/// Seed the canonical search -> read -> summarize session.
async fn seed_sessions(store: &Arc<MemoryEventStore>, n: usize) {
    for i in 0..n {
        let base = Utc::now() - Duration::minutes(10);
        let steps = [
            ("search", json!({"query": format!("topic-{i}")}), json!({"url": format!("https://a/{i}")})),
            ("read", json!({"url": format!("https://a/{i}")}), json!({"text": format!("body {i}")})),
            ("summarize", json!({"text": format!("body {i}")}), json!({"summary": "sum"})),
        ];
        for (j, (tool, inputs, output)) in steps.iter().enumerate() {
            let mut event = Event::new(format!("s{i}"), *tool, inputs.clone(), Outcome::Success)
                .with_summary(canonical_json(output))
                .with_latency(100);
            event.timestamp = base + Duration::seconds(j as i64);
            store.append(event).await.unwrap();
        }
    }
}

async fn mine_chain(store: Arc<MemoryEventStore>) -> CandidateChain {
    let mut config = MiningConfig::over_window(
        Utc::now() - Duration::days(1),
        Utc::now() + Duration::minutes(5),
    );
    config.min_support = 0.5;
    config.min_confidence = 0.8;
    let candidates = Miner::new(store).mine(&config).await.unwrap();
    candidates
        .into_iter()
        .find(|c| c.tools == vec!["search", "read", "summarize"])
        .expect("chain mined")
}

fn good_response() -> Value {
    json!({
        "description": "Search, read, and summarize in one call",
        "parameters": {
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"],
        },
        "steps": [
            {"index": 0, "tool_id": "search", "input_mapping": {"query": "$.parameters.query"}},
            {"index": 1, "tool_id": "read", "input_mapping": {"url": "$.steps[0].output.url"}},
            {"index": 2, "tool_id": "summarize", "input_mapping": {"text": "$.steps[1].output.text"}},
        ],
    })
}

#[tokio::test]
async fn good_response_builds_draft_tool() {
    let store = MemoryEventStore::new();
    seed_sessions(&store, 3).await;
    let chain = mine_chain(store.clone()).await;

    let llm = ScriptedProvider::new(vec![Ok(good_response())]);
    let synthesizer = Synthesizer::new(store, llm, SynthesizerConfig::default());
    let tool = synthesizer.synthesize(&chain).await.unwrap();

    assert_eq!(tool.slug, "search-read-summarize");
    assert_eq!(tool.version, 1);
    assert_eq!(tool.status, ToolStatus::Draft);
    assert_eq!(tool.steps.len(), 3);
    assert_eq!(tool.source_chain_id, chain.id);
    assert_eq!(tool.source_support, chain.support);

    // Wiring derived from the step mappings.
    let step1_wiring = tool.internal_wiring.get(&1).expect("step 1 wired");
    assert_eq!(
        step1_wiring.get("url"),
        Some(&InputSource::Wiring {
            step: 0,
            field: "url".into()
        })
    );
    assert!(!tool.internal_wiring.contains_key(&0));
    // Dense indices and chain-aligned tool ids.
    for (i, step) in tool.steps.iter().enumerate() {
        assert_eq!(step.index, i);
        assert_eq!(step.tool_id, chain.tools[i]);
    }
}

#[tokio::test]
async fn invalid_wiring_is_retried_with_feedback() {
    let store = MemoryEventStore::new();
    seed_sessions(&store, 3).await;
    let chain = mine_chain(store.clone()).await;

    let mut bad = good_response();
    // Downstream wiring reference: step 1 cannot consume step 2's output.
    bad["steps"][1]["input_mapping"]["url"] = json!("$.steps[2].output.url");

    let llm = ScriptedProvider::new(vec![Ok(bad), Ok(good_response())]);
    let synthesizer = Synthesizer::new(store, llm.clone(), SynthesizerConfig::default());
    let tool = synthesizer.synthesize(&chain).await.unwrap();
    assert_eq!(tool.steps.len(), 3);

    let prompts = llm.prompts.lock().await;
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("rejected"), "retry carries feedback");
    assert!(prompts[1].contains("not upstream"));
}

#[tokio::test]
async fn two_invalid_responses_fail_schema_invalid() {
    let store = MemoryEventStore::new();
    seed_sessions(&store, 3).await;
    let chain = mine_chain(store.clone()).await;

    let mut bad = good_response();
    bad["steps"][0]["tool_id"] = json!("unknown_tool");

    let llm = ScriptedProvider::new(vec![Ok(bad.clone()), Ok(bad)]);
    let synthesizer = Synthesizer::new(store, llm, SynthesizerConfig::default());
    let err = synthesizer.synthesize(&chain).await.unwrap_err();
    assert!(matches!(err, SynthesisError::SchemaInvalid(_)));
}

#[tokio::test]
async fn schema_violating_response_consumes_the_retry() {
    let store = MemoryEventStore::new();
    seed_sessions(&store, 3).await;
    let chain = mine_chain(store.clone()).await;

    let llm = ScriptedProvider::new(vec![
        Err(LlmError::Response("missing steps".into())),
        Ok(good_response()),
    ]);
    let synthesizer = Synthesizer::new(store, llm, SynthesizerConfig::default());
    let tool = synthesizer.synthesize(&chain).await.unwrap();
    assert_eq!(tool.slug, "search-read-summarize");
}

#[tokio::test]
async fn unrestricted_condition_is_rejected() {
    let store = MemoryEventStore::new();
    seed_sessions(&store, 3).await;
    let chain = mine_chain(store.clone()).await;

    let mut bad = good_response();
    bad["steps"][2]["condition"] = json!("exec(parameters.query) == 1");
    let mut good = good_response();
    good["steps"][2]["condition"] = json!("wiring.1.text != \"\"");

    let llm = ScriptedProvider::new(vec![Ok(bad), Ok(good)]);
    let synthesizer = Synthesizer::new(store, llm, SynthesizerConfig::default());
    let tool = synthesizer.synthesize(&chain).await.unwrap();
    assert_eq!(
        tool.steps[2].condition.as_deref(),
        Some("wiring.1.text != \"\"")
    );
}

#[tokio::test]
async fn parallel_marks_conflicting_with_wiring_are_trimmed() {
    let store = MemoryEventStore::new();
    seed_sessions(&store, 3).await;
    let chain = mine_chain(store.clone()).await;

    let mut response = good_response();
    // Step 1 consumes step 0's output; the claimed parallelism is bogus.
    response["steps"][1]["parallelizable_with"] = json!([0]);

    let llm = ScriptedProvider::new(vec![Ok(response)]);
    let synthesizer = Synthesizer::new(store, llm, SynthesizerConfig::default());
    let tool = synthesizer.synthesize(&chain).await.unwrap();
    assert!(tool.steps[1].parallelizable_with.is_empty());
    assert!(!tool.has_wiring_cycle());
}

#[tokio::test]
async fn provider_errors_propagate() {
    let store = MemoryEventStore::new();
    seed_sessions(&store, 3).await;
    let chain = mine_chain(store.clone()).await;

    let llm = ScriptedProvider::new(vec![Err(LlmError::Timeout)]);
    let synthesizer = Synthesizer::new(store, llm, SynthesizerConfig::default());
    let err = synthesizer.synthesize(&chain).await.unwrap_err();
    assert!(matches!(err, SynthesisError::Llm(LlmError::Timeout)));
}
