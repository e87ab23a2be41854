// Zikaron integration tests — end-to-end flows against in-memory stores and
// scripted model/tool seams. External services (embedding, Qdrant, reranker)
// point at dead endpoints, so every scenario also exercises the degradation
// paths that production relies on.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use zikaron::atoms::error::EngineResult;
use zikaron::atoms::types::{AbortSignal, RetrievalConfidence, SortBy, Tier};
use zikaron::config::EngineConfig;
use zikaron::flow::interceptor::{InterceptEvent, ToolCallStreamInterceptor};
use zikaron::flow::orchestrator::{McpFlowOrchestrator, ToolExecutor, TurnRequest};
use zikaron::flow::provider::{ChatMessage, ChatStreamProvider, ChatStreamRequest, StreamDelta};
use zikaron::mcp::types::{McpServerConfig, McpTransportKind};
use zikaron::memory::backup::{export_backup, import_backup};
use zikaron::memory::facade::{MemoryFacade, PrefetchRequest, StoreRequest};
use zikaron::memory::store::MemoryStore;

// ── Shared fixtures ────────────────────────────────────────────────────────

fn offline_config() -> EngineConfig {
    EngineConfig {
        embedding_url: "http://127.0.0.1:1".into(),
        qdrant_host: "127.0.0.1".into(),
        qdrant_port: 1,
        embedding_timeout_ms: 100,
        vector_timeout_ms: 100,
        embedding_dimension: 32,
        qdrant_vector_size: 32,
        ..Default::default()
    }
}

fn facade() -> Arc<MemoryFacade> {
    Arc::new(MemoryFacade::new(
        Arc::new(MemoryStore::open_in_memory().unwrap()),
        Arc::new(offline_config()),
    ))
}

fn store_req(user: &str, tier: Tier, text: &str) -> StoreRequest {
    StoreRequest {
        user_id: user.into(),
        tier: Some(tier),
        text: text.into(),
        ..Default::default()
    }
}

/// Scripted model: pops one canned output per stream request, emitted in
/// small chunks so the interceptor's hold-back is exercised for real.
struct ScriptedProvider {
    outputs: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(outputs: Vec<&str>) -> Self {
        ScriptedProvider {
            outputs: Mutex::new(outputs.into_iter().rev().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl ChatStreamProvider for ScriptedProvider {
    async fn chat_stream(
        &self,
        _request: ChatStreamRequest,
    ) -> EngineResult<mpsc::Receiver<StreamDelta>> {
        let output = self
            .outputs
            .lock()
            .pop()
            .unwrap_or_else(|| "Final answer.".to_string());
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut rest = output.as_str();
            while !rest.is_empty() {
                let mut cut = rest.len().min(5);
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                let (chunk, tail) = rest.split_at(cut);
                if tx
                    .send(StreamDelta { text: Some(chunk.to_string()), finish_reason: None })
                    .await
                    .is_err()
                {
                    return;
                }
                rest = tail;
            }
        });
        Ok(rx)
    }
}

/// Scripted tool server: one `fetch` tool returning a fixed body.
struct ScriptedExecutor {
    body: String,
    executed: Mutex<u32>,
}

#[async_trait]
impl ToolExecutor for ScriptedExecutor {
    async fn list_tools(&self, _server: &McpServerConfig) -> EngineResult<Vec<String>> {
        Ok(vec!["fetch".into()])
    }

    async fn call(
        &self,
        _server: &McpServerConfig,
        _tool: &str,
        _arguments: Value,
        _signal: Option<&AbortSignal>,
    ) -> EngineResult<String> {
        *self.executed.lock() += 1;
        Ok(self.body.clone())
    }
}

fn tool_server() -> McpServerConfig {
    McpServerConfig {
        name: "tools".into(),
        transport: McpTransportKind::StreamableHttp,
        url: "https://tools.example.com/mcp".into(),
        command: None,
        args: vec![],
        env: HashMap::new(),
        headers: BTreeMap::new(),
        timeout: None,
        retries: None,
        retry_delay: None,
        capabilities: vec![],
        enabled: true,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario: basic recall
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn basic_recall_injects_stored_memory() {
    let facade = facade();
    let stored = facade
        .store(store_req("u1", Tier::MemoryBank, "My name is Avi."))
        .await
        .unwrap();

    let result = facade
        .prefetch_context(PrefetchRequest {
            user_id: "u1".into(),
            conversation_id: Some("c1".into()),
            query: "what is my name".into(),
            recent_messages: vec![],
            limit: 5,
            signal: None,
        })
        .await
        .unwrap();

    assert!(!result.citations.is_empty(), "stored memory must be cited");
    assert_eq!(result.citations[0].memory_id, stored.memory_id);
    let expected = format!("[memory_bank:{}] My name is Avi.", stored.memory_id);
    assert!(
        result.memory_context_injection.contains(&expected),
        "injection line mismatch: {}",
        result.memory_context_injection
    );
}

#[tokio::test]
async fn hebrew_recall_round_trip() {
    let facade = facade();
    facade
        .store(store_req("u1", Tier::MemoryBank, "קוראים לי אבי ואני גר בחיפה"))
        .await
        .unwrap();

    let resp = facade
        .search("u1", "אבי חיפה", vec![], 5, SortBy::Relevance, None)
        .await
        .unwrap();
    assert_eq!(resp.hits.len(), 1);
    assert!(resp.hits[0].text.contains("אבי"));
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario: tool loop guard
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tool_loop_guard_suppresses_repeated_blocked_fetch() {
    let tool_call =
        r#"<tool_call>{"name":"fetch","arguments":{"url":"https://example.com"}}</tool_call>"#;
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_call,
        tool_call,
        tool_call,
        "Based on the evidence gathered, the site is not accessible.",
    ]));
    let executor = Arc::new(ScriptedExecutor {
        body: "Our systems have detected unusual traffic from your computer network".into(),
        executed: Mutex::new(0),
    });
    let config = Arc::new(offline_config());
    let facade = Arc::new(MemoryFacade::new(
        Arc::new(MemoryStore::open_in_memory().unwrap()),
        config.clone(),
    ));
    let orchestrator =
        McpFlowOrchestrator::new(facade, executor.clone(), provider, config);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = orchestrator
        .run_turn(
            TurnRequest {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                model: "test".into(),
                messages: vec![ChatMessage::user("fetch example.com for me")],
                servers: vec![tool_server()],
                force_tools: false,
                temperature: None,
                signal: None,
            },
            Some(tx),
        )
        .await
        .unwrap();

    assert!(result.loop_guard_tripped, "third identical call must be suppressed");
    // The blocked page weighted the counter, so only the first call ran.
    assert_eq!(*executor.executed.lock(), 1);
    assert!(result.answer.contains("evidence"));

    // The user-visible stream never contains a tool marker.
    let mut streamed = String::new();
    while let Ok(token) = rx.try_recv() {
        streamed.push_str(&token);
    }
    assert!(!streamed.contains("<tool"), "marker leaked: {streamed}");
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario: circuit degradation
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn embedding_outage_degrades_to_lexical() {
    let facade = facade();

    // Stores succeed while the embedding service is down; items defer.
    let first = facade
        .store(store_req("u1", Tier::Working, "degradation test alpha"))
        .await
        .unwrap();
    let second = facade
        .store(store_req("u1", Tier::Working, "degradation test beta"))
        .await
        .unwrap();
    assert!(first.needs_reindex);
    assert!(second.needs_reindex);

    // A third failure opens the circuit; the search that follows reports it.
    let _ = facade
        .store(store_req("u1", Tier::Working, "degradation test gamma"))
        .await
        .unwrap();

    let resp = facade
        .search("u1", "degradation test", vec![], 5, SortBy::Relevance, None)
        .await
        .unwrap();

    assert!(resp.hits.len() >= 3, "lexical path still serves results");
    assert!(matches!(
        resp.debug.confidence,
        RetrievalConfidence::Low | RetrievalConfidence::Medium
    ));
    assert!(
        resp.debug
            .fallbacks_used
            .contains(&"embedding_circuit_open".to_string()),
        "fallbacks: {:?}",
        resp.debug.fallbacks_used
    );
    assert_eq!(
        resp.debug.vector_stage_status.as_deref(),
        Some("disabled_breaker_open")
    );

    // The reindexer reports rather than clearing flags it cannot fix.
    let report = facade.run_reindex(false).await;
    match report {
        Ok(r) => assert_eq!(r.processed, 0),
        Err(e) => assert!(e.to_string().contains("refused")),
    }
    assert_eq!(facade.get_stats("u1").unwrap().total_needs_reindex, 3);
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario: feedback scoring
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn feedback_sequence_computes_wilson_below_rate() {
    let facade = facade();
    let stored = facade
        .store(store_req("u1", Tier::History, "a fact to score"))
        .await
        .unwrap();

    for score in [1, 1, 1, -1] {
        facade
            .record_feedback("u1", &stored.memory_id, score, Some("c1"), None)
            .unwrap();
    }

    let item = facade.get_by_id("u1", &stored.memory_id).unwrap().unwrap();
    assert_eq!(item.stats.worked_count, 3);
    assert_eq!(item.stats.failed_count, 1);
    assert!((item.stats.success_rate - 0.75).abs() < 1e-9);
    assert!(item.stats.wilson_score < 0.75, "lower bound sits under the raw rate");
    assert!(item.stats.wilson_score > 0.0);
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario: knowledge-graph co-occurrence
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn kg_co_occurrence_from_two_memories() {
    let facade = facade();
    let store = facade.store_handle();

    facade
        .store(StoreRequest {
            user_id: "u1".into(),
            tier: Some(Tier::Working),
            text: "first memory".into(),
            entities: vec!["aleph".into(), "bet".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    facade
        .store(StoreRequest {
            user_id: "u1".into(),
            tier: Some(Tier::Working),
            text: "second memory".into(),
            entities: vec!["bet".into(), "gimel".into()],
            ..Default::default()
        })
        .await
        .unwrap();

    use zikaron::memory::knowledge_graph as kg;
    let a = kg::find_node_by_label(&store, "u1", "aleph").unwrap().unwrap();
    let b = kg::find_node_by_label(&store, "u1", "bet").unwrap().unwrap();
    let c = kg::find_node_by_label(&store, "u1", "gimel").unwrap().unwrap();
    assert_eq!(a.mentions, 1);
    assert_eq!(b.mentions, 2);
    assert_eq!(c.mentions, 1);

    let b_ctx = kg::get_concept_context(&store, "u1", &b.node_id, 10).unwrap();
    assert_eq!(b_ctx.edges.len(), 2, "bet links to both neighbors");
    assert!(b_ctx.edges.iter().all(|e| e.weight == 1));

    let a_ctx = kg::get_concept_context(&store, "u1", &a.node_id, 10).unwrap();
    assert_eq!(a_ctx.edges.len(), 1, "no aleph-gimel edge");
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario: prefetch deadline
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn prefetch_deadline_bounds_latency() {
    let config = EngineConfig {
        embedding_url: "http://10.255.255.1:9".into(), // unroutable: hangs
        qdrant_host: "10.255.255.1".into(),
        qdrant_port: 9,
        prefetch_timeout_ms: 50,
        embedding_timeout_ms: 10_000,
        vector_timeout_ms: 10_000,
        embedding_dimension: 32,
        qdrant_vector_size: 32,
        ..Default::default()
    };
    let facade = Arc::new(MemoryFacade::new(
        Arc::new(MemoryStore::open_in_memory().unwrap()),
        Arc::new(config),
    ));

    let started = std::time::Instant::now();
    let result = facade
        .prefetch_context(PrefetchRequest {
            user_id: "u1".into(),
            conversation_id: None,
            query: "anything".into(),
            recent_messages: vec![],
            limit: 5,
            signal: Some(AbortSignal::new()),
        })
        .await
        .unwrap();

    assert!(
        started.elapsed().as_millis() <= 500,
        "prefetch must return promptly, took {:?}",
        started.elapsed()
    );
    assert!(result.memory_context_injection.is_empty());
    assert_eq!(result.retrieval_confidence, RetrievalConfidence::Low);
    assert!(result
        .retrieval_debug
        .fallbacks_used
        .contains(&"prefetch_timeout".to_string()));
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario: backup round trip
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn backup_round_trip_reproduces_state() {
    let facade = facade();
    let stored = facade
        .store(StoreRequest {
            user_id: "u1".into(),
            tier: Some(Tier::MemoryBank),
            text: "bundle me up".into(),
            entities: vec!["qdrant".into(), "docker".into()],
            ..Default::default()
        })
        .await
        .unwrap();
    facade.record_feedback("u1", &stored.memory_id, 1, Some("c1"), None).unwrap();

    let source = facade.store_handle();
    let bundle = export_backup(&source, Some("u1")).unwrap();
    let json = serde_json::to_string(&bundle).unwrap();

    // Restore from the serialized document into a fresh store.
    let restored_bundle = serde_json::from_str(&json).unwrap();
    let target = MemoryStore::open_in_memory().unwrap();
    let report = import_backup(&target, &restored_bundle).unwrap();
    assert_eq!(report.items, 1);
    assert_eq!(report.outcomes, 1);
    assert_eq!(report.nodes, 2);
    assert_eq!(report.edges, 1);

    let restored = target.get_item("u1", &stored.memory_id).unwrap().unwrap();
    assert_eq!(restored.text, "bundle me up");
    assert_eq!(restored.stats.worked_count, 1);

    // Original timestamps survive verbatim.
    let original = source.get_item("u1", &stored.memory_id).unwrap().unwrap();
    assert_eq!(restored.created_at, original.created_at);
}

// ═══════════════════════════════════════════════════════════════════════════
// Property: no tool-call marker ever reaches the user
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn interceptor_never_leaks_markers_at_any_chunking() {
    let output = "Sure, let me look that up for you. \
        <tool_call>{\"name\":\"fetch\",\"arguments\":{\"url\":\"https://example.com\"}}</tool_call>";

    // Split the stream at every possible boundary pair.
    for split in 1..output.len() {
        if !output.is_char_boundary(split) {
            continue;
        }
        let mut interceptor = ToolCallStreamInterceptor::new();
        let mut forwarded = String::new();
        let mut calls = 0;

        for event in interceptor
            .push(&output[..split])
            .into_iter()
            .chain(interceptor.push(&output[split..]))
            .chain(interceptor.finish())
        {
            match event {
                InterceptEvent::Forward(text) => forwarded.push_str(&text),
                InterceptEvent::ToolCalls(c) => calls += c.len(),
            }
        }

        assert!(
            !forwarded.contains("<tool"),
            "marker leaked at split {split}: {forwarded}"
        );
        assert_eq!(calls, 1, "tool call lost at split {split}");
        assert_eq!(forwarded, "Sure, let me look that up for you. ");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Disk persistence
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zikaron.db");

    let memory_id = {
        let store = MemoryStore::open(&path).unwrap();
        let item =
            zikaron::atoms::types::MemoryItem::new("u1", Tier::MemoryBank, "persisted fact");
        store.insert_item(&item).unwrap();
        item.memory_id
    };

    // Fresh handle over the same file: migrations re-run idempotently and
    // the row is still there, FTS index included.
    let reopened = MemoryStore::open(&path).unwrap();
    let item = reopened.get_item("u1", &memory_id).unwrap().unwrap();
    assert_eq!(item.text, "persisted fact");
    assert_eq!(reopened.text_search("u1", &[], "persisted", 10).unwrap().len(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Reindexer steady state
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reindex_steady_state_processes_zero() {
    // An empty store is the steady state an offline stack can reach.
    let facade = facade();
    let first = facade.run_reindex(false).await.unwrap();
    assert_eq!(first.processed, 0);
    let second = facade.run_reindex(false).await.unwrap();
    assert_eq!(second.processed, 0);
}
