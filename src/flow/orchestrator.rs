// ── Flow: MCP Turn Orchestrator ────────────────────────────────────────────
//
// The chat-turn state machine:
//
//   INIT → PREFETCH → GENERATE → (TOOL_EXEC → GENERATE)* → FINALIZE → LEARN
//                          ↘ FALLBACK (no tools) ↙
//
// INIT selects servers by policy (enabled ∧ URL-safe). PREFETCH pulls
// ranked memories with a hard deadline. GENERATE streams model output
// through the interceptor; detected tool calls execute through the pool
// (bounded parallelism, loop guard, blocked-page weighting) and their
// results feed the next round. The iteration cap forces FINALIZE with
// whatever evidence exists. LEARN is non-blocking and never surfaces
// errors to the user.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    now_iso, AbortSignal, ContextInsights, DebugMeta, FeedbackMeta, KnownContext, MemoryMetaV1,
    RetrievalSummary, Tier,
};
use crate::config::EngineConfig;
use crate::flow::interceptor::{
    ensure_stop_sequences, is_blocked_response, InterceptEvent, LoopGuard, LoopVerdict,
    ParsedToolCall, ToolCallStreamInterceptor, LOOP_GUARD_INSTRUCTION,
};
use crate::flow::provider::{ChatMessage, ChatStreamProvider, ChatStreamRequest, Role};
use crate::mcp::types::McpServerConfig;
use crate::memory::facade::{MemoryFacade, PrefetchRequest, PrefetchResult};
use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default loop-guard limit for identical calls within one turn.
const LOOP_LIMIT: u32 = 3;

// ═══════════════════════════════════════════════════════════════════════════
// Seams
// ═══════════════════════════════════════════════════════════════════════════

/// Tool execution seam: the pool in production, a script in tests.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn list_tools(&self, server: &McpServerConfig) -> EngineResult<Vec<String>>;
    async fn call(
        &self,
        server: &McpServerConfig,
        tool: &str,
        arguments: Value,
        signal: Option<&AbortSignal>,
    ) -> EngineResult<String>;
}

#[async_trait]
impl ToolExecutor for crate::mcp::pool::McpClientPool {
    async fn list_tools(&self, server: &McpServerConfig) -> EngineResult<Vec<String>> {
        let pooled = self.get_client(server, None).await?;
        let names = pooled.client.tools.iter().map(|t| t.name.clone()).collect();
        self.release_client(pooled).await;
        Ok(names)
    }

    async fn call(
        &self,
        server: &McpServerConfig,
        tool: &str,
        arguments: Value,
        signal: Option<&AbortSignal>,
    ) -> EngineResult<String> {
        self.call_tool(server, tool, arguments, None, signal).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Request / result
// ═══════════════════════════════════════════════════════════════════════════

pub struct TurnRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub model: String,
    /// Conversation history; the last user message drives prefetch.
    pub messages: Vec<ChatMessage>,
    pub servers: Vec<McpServerConfig>,
    /// Run the tool loop even with no eligible servers (fails fast instead
    /// of silently degrading).
    pub force_tools: bool,
    pub temperature: Option<f64>,
    pub signal: Option<AbortSignal>,
}

#[derive(Debug)]
pub struct TurnResult {
    pub answer: String,
    pub memory_meta: MemoryMetaV1,
    pub used_fallback: bool,
    pub iteration_cap_reached: bool,
    pub tool_calls_executed: u32,
    pub loop_guard_tripped: bool,
}

pub struct McpFlowOrchestrator {
    facade: Arc<MemoryFacade>,
    executor: Arc<dyn ToolExecutor>,
    provider: Arc<dyn ChatStreamProvider>,
    config: Arc<EngineConfig>,
}

impl McpFlowOrchestrator {
    pub fn new(
        facade: Arc<MemoryFacade>,
        executor: Arc<dyn ToolExecutor>,
        provider: Arc<dyn ChatStreamProvider>,
        config: Arc<EngineConfig>,
    ) -> Self {
        McpFlowOrchestrator { facade, executor, provider, config }
    }

    /// Run one chat turn. User-visible tokens stream through `token_tx` as
    /// they clear the interceptor; the final answer repeats them joined.
    pub async fn run_turn(
        &self,
        req: TurnRequest,
        token_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> EngineResult<TurnResult> {
        // ── INIT: server selection by policy ─────────────────────────
        let eligible: Vec<&McpServerConfig> = req
            .servers
            .iter()
            .filter(|s| s.enabled && s.is_poolable() && s.validate_url().is_ok())
            .collect();
        if eligible.is_empty() && req.force_tools {
            return Err(EngineError::Config(
                "tools forced but no eligible MCP server passed validation".into(),
            ));
        }
        let tools_enabled = !eligible.is_empty();

        // ── PREFETCH (deadline handled inside the facade) ────────────
        let query = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let prefetch = self
            .facade
            .prefetch_context(PrefetchRequest {
                user_id: req.user_id.clone(),
                conversation_id: Some(req.conversation_id.clone()),
                query: query.clone(),
                recent_messages: vec![],
                limit: self.config.top_k,
                signal: req.signal.clone(),
            })
            .await
            .unwrap_or_else(|e| {
                warn!("[flow] Prefetch failed, continuing without context: {e}");
                PrefetchResult {
                    memory_context_injection: String::new(),
                    retrieval_confidence: crate::atoms::types::RetrievalConfidence::Low,
                    retrieval_debug: Default::default(),
                    citations: vec![],
                }
            });

        // ── Tool discovery: route tool names to servers ──────────────
        let mut tool_routes: HashMap<String, McpServerConfig> = HashMap::new();
        if tools_enabled {
            for server in &eligible {
                match self.executor.list_tools(server).await {
                    Ok(names) => {
                        for name in names {
                            tool_routes.entry(name).or_insert_with(|| (*server).clone());
                        }
                    }
                    Err(e) => warn!("[flow] Skipping server '{}': {e}", server.name),
                }
            }
        }

        // ── Conversation assembly ────────────────────────────────────
        let mut messages = build_turn_messages(&req.messages, &prefetch, &tool_routes);
        let stop = ensure_stop_sequences(vec![]);

        let mut guard = LoopGuard::new(LOOP_LIMIT);
        let mut answer = String::new();
        let mut tool_calls_executed: u32 = 0;
        let mut loop_guard_tripped = false;
        let mut iteration_cap_reached = false;
        let mut used_fallback = !tools_enabled;

        // ── GENERATE ↔ TOOL_EXEC loop ────────────────────────────────
        let max_iterations = self.config.max_tool_iterations.max(1);
        let mut round: u32 = 0;
        loop {
            round += 1;
            if round > max_iterations {
                warn!("[flow] Iteration cap ({max_iterations}) reached, forcing finalize");
                iteration_cap_reached = true;
                break;
            }

            let stream = self
                .provider
                .chat_stream(ChatStreamRequest {
                    model: req.model.clone(),
                    messages: messages.clone(),
                    temperature: req.temperature,
                    stop: stop.clone(),
                })
                .await;

            let mut rx = match stream {
                Ok(rx) => rx,
                Err(e) => {
                    // No whole-turn retries: surface exactly one reason.
                    warn!("[flow] Model stream failed: {e}");
                    if answer.is_empty() {
                        answer = format!(
                            "I could not reach the language model ({}). Please try again.",
                            e.category()
                        );
                        used_fallback = true;
                    }
                    break;
                }
            };

            // Stream through the interceptor.
            let mut interceptor = ToolCallStreamInterceptor::new();
            let mut round_calls: Vec<ParsedToolCall> = Vec::new();
            while let Some(delta) = rx.recv().await {
                if let Some(text) = &delta.text {
                    for event in interceptor.push(text) {
                        match event {
                            InterceptEvent::Forward(safe) => {
                                if let Some(tx) = &token_tx {
                                    let _ = tx.send(safe.clone());
                                }
                                answer.push_str(&safe);
                            }
                            InterceptEvent::ToolCalls(calls) => round_calls.extend(calls),
                        }
                    }
                }
            }
            for event in interceptor.finish() {
                match event {
                    InterceptEvent::Forward(safe) => {
                        if let Some(tx) = &token_tx {
                            let _ = tx.send(safe.clone());
                        }
                        answer.push_str(&safe);
                    }
                    InterceptEvent::ToolCalls(calls) => round_calls.extend(calls),
                }
            }

            if round_calls.is_empty() {
                break; // FINALIZE
            }
            if !tools_enabled {
                // The model asked for tools we cannot provide; tell it once
                // and let it answer from context.
                messages.push(ChatMessage::system(
                    "No tools are available in this session. Answer directly from the \
                     conversation and memory context.",
                ));
                used_fallback = true;
                continue;
            }

            // Echo the calls into the transcript so the model sees what it
            // asked for alongside the results.
            messages.push(ChatMessage::assistant(render_tool_calls(&round_calls)));

            // ── TOOL_EXEC: bounded parallel execution ────────────────
            let mut guard_hit_this_round = false;
            for batch in round_calls.chunks(self.config.max_parallel_tools.max(1)) {
                let mut executions = Vec::new();
                for call in batch {
                    match guard.register(&call.name, &call.arguments) {
                        LoopVerdict::Allow => executions.push(call.clone()),
                        LoopVerdict::Suppress => {
                            loop_guard_tripped = true;
                            guard_hit_this_round = true;
                            messages.push(ChatMessage::tool(
                                &call.name,
                                "Suppressed: this exact call has repeated too many times.",
                            ));
                        }
                    }
                }

                let results = futures::future::join_all(executions.iter().map(|call| {
                    let route = tool_routes.get(&call.name).cloned();
                    let executor = self.executor.clone();
                    let signal = req.signal.clone();
                    async move {
                        match route {
                            Some(server) => {
                                executor
                                    .call(&server, &call.name, call.arguments.clone(), signal.as_ref())
                                    .await
                            }
                            None => Err(EngineError::tool(
                                &call.name,
                                "no connected server exposes this tool",
                            )),
                        }
                    }
                }))
                .await;

                for (call, result) in executions.iter().zip(results) {
                    match result {
                        Ok(body) => {
                            tool_calls_executed += 1;
                            if is_blocked_response(&body) {
                                guard.note_blocked(&call.name, &call.arguments);
                                info!(
                                    "[flow] Tool '{}' returned a blocked page, weighting loop guard",
                                    call.name
                                );
                            }
                            messages.push(ChatMessage::tool(&call.name, body));
                        }
                        Err(e) => {
                            messages.push(ChatMessage::tool(&call.name, format!("Error: {e}")));
                        }
                    }
                }
            }

            if guard_hit_this_round {
                messages.push(ChatMessage::system(LOOP_GUARD_INSTRUCTION));
            }
            // Back to GENERATE with the tool results appended.
        }

        if answer.is_empty() {
            answer = if iteration_cap_reached {
                "I ran out of tool steps before producing a final answer. \
                 Here is what I gathered so far; please narrow the request."
                    .to_string()
            } else {
                "I could not produce an answer for this turn.".to_string()
            };
        }

        // ── FINALIZE: attach MemoryMetaV1 ────────────────────────────
        let memory_meta = build_memory_meta(
            &req,
            &query,
            &prefetch,
            iteration_cap_reached,
            self.config.top_k,
        );

        // ── LEARN: non-blocking, errors never surface ────────────────
        let facade = self.facade.clone();
        let user_id = req.user_id.clone();
        let cited: Vec<String> =
            prefetch.citations.iter().map(|c| c.memory_id.clone()).collect();
        tokio::spawn(async move {
            facade.record_turn_learning(&user_id, &cited);
        });

        Ok(TurnResult {
            answer,
            memory_meta,
            used_fallback,
            iteration_cap_reached,
            tool_calls_executed,
            loop_guard_tripped,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Assembly helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Build the outgoing message list: system message enriched with memory
/// context and available tool names, then the conversation history.
fn build_turn_messages(
    history: &[ChatMessage],
    prefetch: &PrefetchResult,
    tool_routes: &HashMap<String, McpServerConfig>,
) -> Vec<ChatMessage> {
    let mut base_system = String::new();
    let mut rest: Vec<ChatMessage> = Vec::new();
    for (i, msg) in history.iter().enumerate() {
        if i == 0 && msg.role == Role::System {
            base_system = msg.content.clone();
        } else {
            rest.push(msg.clone());
        }
    }
    if base_system.is_empty() {
        base_system = "You are a helpful assistant with long-term memory.".into();
    }

    if !prefetch.memory_context_injection.is_empty() {
        base_system.push_str("\n\n<memory_context>\n");
        base_system.push_str(&prefetch.memory_context_injection);
        base_system.push_str("\n</memory_context>");
    }

    if !tool_routes.is_empty() {
        let mut names: Vec<&String> = tool_routes.keys().collect();
        names.sort();
        base_system.push_str(
            "\n\nYou may call the following tools by emitting \
             <tool_call>{\"name\": ..., \"arguments\": {...}}</tool_call> blocks: ",
        );
        base_system.push_str(
            &names.iter().map(|n| n.as_str()).collect::<Vec<_>>().join(", "),
        );
    }

    let mut messages = vec![ChatMessage::system(base_system)];
    messages.extend(rest);
    messages
}

/// Render executed calls back into the transcript in the XML form.
fn render_tool_calls(calls: &[ParsedToolCall]) -> String {
    calls
        .iter()
        .map(|c| {
            format!(
                "<tool_call>{}</tool_call>",
                serde_json::json!({ "name": c.name, "arguments": c.arguments })
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_memory_meta(
    req: &TurnRequest,
    query: &str,
    prefetch: &PrefetchResult,
    interrupted: bool,
    limit: usize,
) -> MemoryMetaV1 {
    let tiers_considered: Vec<String> =
        Tier::default_search_set().iter().map(|t| t.as_str()).collect();
    let tiers_used: Vec<String> = {
        let mut seen = Vec::new();
        for citation in &prefetch.citations {
            let tier = citation.tier.as_str();
            if !seen.contains(&tier) {
                seen.push(tier);
            }
        }
        seen
    };

    let known_context_items: Vec<String> = prefetch
        .memory_context_injection
        .lines()
        .map(|l| l.to_string())
        .filter(|l| !l.is_empty())
        .collect();

    MemoryMetaV1 {
        schema_version: MemoryMetaV1::SCHEMA_VERSION.into(),
        conversation_id: req.conversation_id.clone(),
        assistant_message_id: Uuid::new_v4().to_string(),
        user_id: Some(req.user_id.clone()),
        created_at: now_iso(),
        context_type: None,
        retrieval: RetrievalSummary {
            query: query.to_string(),
            normalized_query: None,
            limit,
            sort_by: Some("relevance".into()),
            tiers_considered,
            tiers_used,
            search_position_map: None,
        },
        known_context: KnownContext {
            known_context_text: prefetch.memory_context_injection.clone(),
            known_context_items,
        },
        citations: prefetch.citations.clone(),
        context_insights: ContextInsights::default(),
        debug: DebugMeta {
            retrieval_confidence: prefetch.retrieval_confidence.as_str().into(),
            fallbacks_used: prefetch.retrieval_debug.fallbacks_used.clone(),
            stage_timings_ms: prefetch.retrieval_debug.stage_timings_ms.clone(),
            errors: prefetch.retrieval_debug.errors.clone(),
            vector_stage_status: prefetch.retrieval_debug.vector_stage_status.clone(),
        },
        feedback: FeedbackMeta {
            eligible: !prefetch.citations.is_empty(),
            interrupted,
            default_related_positions: (0..prefetch.citations.len().min(3)).collect(),
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::MemoryStore;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Scripted model: each call pops the next canned output, streamed in
    /// small chunks to exercise the interceptor's hold-back.
    struct ScriptedProvider {
        outputs: Mutex<Vec<String>>,
        calls: Mutex<u32>,
    }

    impl ScriptedProvider {
        fn new(outputs: Vec<&str>) -> Self {
            ScriptedProvider {
                outputs: Mutex::new(outputs.into_iter().rev().map(|s| s.to_string()).collect()),
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl ChatStreamProvider for ScriptedProvider {
        async fn chat_stream(
            &self,
            _request: ChatStreamRequest,
        ) -> EngineResult<mpsc::Receiver<crate::flow::provider::StreamDelta>> {
            *self.calls.lock() += 1;
            let output = self
                .outputs
                .lock()
                .pop()
                .unwrap_or_else(|| "Final answer from evidence.".to_string());
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                // Chunk at 7 bytes, snapped to char boundaries.
                let mut rest = output.as_str();
                while !rest.is_empty() {
                    let mut cut = rest.len().min(7);
                    while !rest.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    let (chunk, tail) = rest.split_at(cut);
                    if tx
                        .send(crate::flow::provider::StreamDelta {
                            text: Some(chunk.to_string()),
                            finish_reason: None,
                        })
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

    /// Scripted tool side: one server exposing `fetch`, every call returns
    /// the configured body.
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

    fn offline_config() -> EngineConfig {
        EngineConfig {
            embedding_url: "http://127.0.0.1:1".into(),
            qdrant_host: "127.0.0.1".into(),
            qdrant_port: 1,
            embedding_timeout_ms: 100,
            vector_timeout_ms: 100,
            embedding_dimension: 16,
            qdrant_vector_size: 16,
            ..Default::default()
        }
    }

    fn test_server() -> McpServerConfig {
        McpServerConfig {
            name: "tools".into(),
            transport: crate::mcp::types::McpTransportKind::StreamableHttp,
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

    fn orchestrator(
        provider: Arc<ScriptedProvider>,
        executor: Arc<ScriptedExecutor>,
    ) -> McpFlowOrchestrator {
        let config = Arc::new(offline_config());
        let facade = Arc::new(MemoryFacade::new(
            Arc::new(MemoryStore::open_in_memory().unwrap()),
            config.clone(),
        ));
        McpFlowOrchestrator::new(facade, executor, provider, config)
    }

    fn turn(servers: Vec<McpServerConfig>) -> TurnRequest {
        TurnRequest {
            user_id: "u1".into(),
            conversation_id: "c1".into(),
            model: "test-model".into(),
            messages: vec![ChatMessage::user("please fetch example.com")],
            servers,
            force_tools: false,
            temperature: None,
            signal: None,
        }
    }

    #[tokio::test]
    async fn test_plain_answer_without_tools() {
        let provider = Arc::new(ScriptedProvider::new(vec!["Just a direct answer."]));
        let executor = Arc::new(ScriptedExecutor { body: "".into(), executed: Mutex::new(0) });
        let orch = orchestrator(provider.clone(), executor);

        let result = orch.run_turn(turn(vec![]), None).await.unwrap();
        assert_eq!(result.answer, "Just a direct answer.");
        assert!(result.used_fallback, "no servers means fallback mode");
        assert_eq!(result.tool_calls_executed, 0);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(result.memory_meta.schema_version, "v1");
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let tool_call =
            r#"<tool_call>{"name":"fetch","arguments":{"url":"https://example.com"}}</tool_call>"#;
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call,
            "The page says: welcome.",
        ]));
        let executor = Arc::new(ScriptedExecutor {
            body: "<html>welcome</html>".into(),
            executed: Mutex::new(0),
        });
        let orch = orchestrator(provider.clone(), executor.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = orch.run_turn(turn(vec![test_server()]), Some(tx)).await.unwrap();

        assert_eq!(result.answer, "The page says: welcome.");
        assert_eq!(result.tool_calls_executed, 1);
        assert_eq!(*executor.executed.lock(), 1);
        assert!(!result.loop_guard_tripped);
        assert_eq!(provider.call_count(), 2);

        // The user-visible stream never contains a tool-call marker.
        let mut streamed = String::new();
        while let Ok(tok) = rx.try_recv() {
            streamed.push_str(&tok);
        }
        assert!(!streamed.contains("<tool"), "leaked marker in: {streamed}");
    }

    #[tokio::test]
    async fn test_loop_guard_suppresses_third_identical_call() {
        let tool_call =
            r#"<tool_call>{"name":"fetch","arguments":{"url":"https://example.com"}}</tool_call>"#;
        // The model insists three times; the executor returns a blocked page.
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call,
            tool_call,
            tool_call,
            "Answering from what I have.",
        ]));
        let executor = Arc::new(ScriptedExecutor {
            body: "Our systems have detected unusual traffic from your network".into(),
            executed: Mutex::new(0),
        });
        let orch = orchestrator(provider.clone(), executor.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = orch.run_turn(turn(vec![test_server()]), Some(tx)).await.unwrap();

        assert!(result.loop_guard_tripped);
        // First call executes and comes back blocked (counts double), so the
        // second attempt is already suppressed.
        assert_eq!(*executor.executed.lock(), 1);
        assert_eq!(result.answer, "Answering from what I have.");

        let mut streamed = String::new();
        while let Ok(tok) = rx.try_recv() {
            streamed.push_str(&tok);
        }
        assert!(!streamed.contains("<tool"));
    }

    #[tokio::test]
    async fn test_iteration_cap_forces_finalize() {
        // Endless tool requests with fresh URLs (so the loop guard never
        // trips) would run forever without the iteration cap.
        let mut outputs = Vec::new();
        for i in 0..20 {
            outputs.push(format!(
                r#"<tool_call>{{"name":"fetch","arguments":{{"url":"https://site{i}.example"}}}}</tool_call>"#
            ));
        }
        let provider = Arc::new(ScriptedProvider::new(
            outputs.iter().map(|s| s.as_str()).collect(),
        ));
        let executor =
            Arc::new(ScriptedExecutor { body: "ok".into(), executed: Mutex::new(0) });
        let config = Arc::new(EngineConfig { max_tool_iterations: 3, ..offline_config() });
        let facade = Arc::new(MemoryFacade::new(
            Arc::new(MemoryStore::open_in_memory().unwrap()),
            config.clone(),
        ));
        let orch = McpFlowOrchestrator::new(facade, executor, provider.clone(), config);

        let result = orch.run_turn(turn(vec![test_server()]), None).await.unwrap();
        assert!(result.iteration_cap_reached);
        assert!(result.memory_meta.feedback.interrupted);
        assert_eq!(provider.call_count(), 3);
        assert!(!result.answer.is_empty());
    }

    #[tokio::test]
    async fn test_force_tools_without_servers_fails() {
        let provider = Arc::new(ScriptedProvider::new(vec!["x"]));
        let executor = Arc::new(ScriptedExecutor { body: "".into(), executed: Mutex::new(0) });
        let orch = orchestrator(provider, executor);
        let mut req = turn(vec![]);
        req.force_tools = true;
        let err = orch.run_turn(req, None).await.unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn test_unknown_tool_reported_to_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            r#"<tool_call>{"name":"no_such_tool","arguments":{}}</tool_call>"#,
            "Understood, answering directly.",
        ]));
        let executor = Arc::new(ScriptedExecutor { body: "ok".into(), executed: Mutex::new(0) });
        let orch = orchestrator(provider, executor.clone());

        let result = orch.run_turn(turn(vec![test_server()]), None).await.unwrap();
        assert_eq!(result.answer, "Understood, answering directly.");
        assert_eq!(*executor.executed.lock(), 0, "unroutable tool never executes");
        assert_eq!(result.tool_calls_executed, 0);
    }

    #[test]
    fn test_render_tool_calls_round_trips_through_parser() {
        let calls = vec![ParsedToolCall {
            name: "fetch".into(),
            arguments: serde_json::json!({"url": "https://example.com"}),
        }];
        let rendered = render_tool_calls(&calls);
        let reparsed = crate::flow::interceptor::parse_tool_call_payload(&rendered);
        assert_eq!(reparsed, calls);
    }
}
