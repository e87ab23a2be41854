// ── Hooks: Inbound Surface ─────────────────────────────────────────────────
//
// Typed request/response shapes and handlers for the HTTP hook surface.
// The routing framework is the host's concern: it authenticates, fills in
// `user_id`, maps these structs to/from JSON bodies, and converts
// `EngineError` to a status via `to_http_status`.
//
//   exchange     — inject <memory_context> into a message exchange
//   context      — raw context lookup for a query
//   score        — citation feedback
//   search       — paginated memory search
//   memory-bank  — curated memory CRUD
//   stats / diagnostics / health — operational surfaces
//   ops          — admin-gated maintenance (reindex, sanitize, breaker, migrate)
//   graph / kg   — knowledge-graph views

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    MemoryItem, MemoryMetaV1, RetrievalConfidence, SearchHit, SortBy, Tier,
};
use crate::config::EngineConfig;
use crate::memory::facade::{
    LegacyBankRow, MemoryFacade, MemoryPatch, MigrationReport, PrefetchRequest, StoreRequest,
    UserStats,
};
use crate::memory::knowledge_graph;
use crate::memory::reindex::{ReindexProgress, ReindexReport};
use crate::observability::{
    run_health_checks, HealthReport, LogLevel, MetricsCollector, MetricsSnapshot, StructuredLogger,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Map the error taxonomy onto HTTP status codes at the hook boundary.
pub fn to_http_status(error: &EngineError) -> u16 {
    match error {
        EngineError::Validation(_) => 400,
        EngineError::Auth(_) => 401,
        EngineError::NotFound(_) => 404,
        EngineError::Cancelled(_) => 408,
        EngineError::Config(_) => 500,
        EngineError::ServiceDown(_) => 503,
        _ => 500,
    }
}

/// Everything the handlers need, wired once at startup.
pub struct HookContext {
    pub facade: Arc<MemoryFacade>,
    pub metrics: Arc<MetricsCollector>,
    pub logger: Arc<StructuredLogger>,
    pub config: Arc<EngineConfig>,
}

// ═══════════════════════════════════════════════════════════════════════════
// POST /hooks/exchange
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeRequest {
    pub user_id: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub messages: Vec<ExchangeMessage>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeResponse {
    pub messages: Vec<ExchangeMessage>,
    #[serde(rename = "memoryMeta")]
    pub memory_meta: MemoryMetaV1,
}

/// Prefetch context for the latest user message and inject it into (or
/// prepend to) the system message as a `<memory_context>` block.
pub async fn handle_exchange(
    ctx: &HookContext,
    req: ExchangeRequest,
) -> EngineResult<ExchangeResponse> {
    let started = Instant::now();
    let cid = StructuredLogger::correlation_id();

    let query = req
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .ok_or_else(|| EngineError::Validation("exchange requires a user message".into()))?;

    let prefetch = ctx
        .facade
        .prefetch_context(PrefetchRequest {
            user_id: req.user_id.clone(),
            conversation_id: Some(req.conversation_id.clone()),
            query: query.clone(),
            recent_messages: req
                .messages
                .iter()
                .rev()
                .skip(1)
                .take(3)
                .map(|m| m.content.clone())
                .collect(),
            limit: req.limit.unwrap_or(ctx.config.top_k),
            signal: None,
        })
        .await?;

    let mut messages = req.messages;
    if !prefetch.memory_context_injection.is_empty() {
        let block = format!(
            "<memory_context>\n{}\n</memory_context>",
            prefetch.memory_context_injection
        );
        match messages.iter_mut().find(|m| m.role == "system") {
            Some(system) => {
                system.content.push_str("\n\n");
                system.content.push_str(&block);
            }
            None => messages.insert(0, ExchangeMessage { role: "system".into(), content: block }),
        }
    }

    let latency = started.elapsed().as_millis() as u64;
    ctx.metrics.record_latency("hook_exchange", latency);
    ctx.logger.log(
        LogLevel::Info,
        "prefetch",
        &cid,
        &format!("{} citations in {}ms", prefetch.citations.len(), latency),
    );

    let memory_meta = MemoryMetaV1 {
        schema_version: MemoryMetaV1::SCHEMA_VERSION.into(),
        conversation_id: req.conversation_id,
        assistant_message_id: req.message_id,
        user_id: Some(req.user_id),
        created_at: crate::atoms::types::now_iso(),
        context_type: Some("exchange".into()),
        retrieval: crate::atoms::types::RetrievalSummary {
            query,
            limit: req.limit.unwrap_or(ctx.config.top_k),
            tiers_considered: Tier::default_search_set().iter().map(|t| t.as_str()).collect(),
            tiers_used: prefetch
                .citations
                .iter()
                .map(|c| c.tier.as_str())
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect(),
            ..Default::default()
        },
        known_context: crate::atoms::types::KnownContext {
            known_context_text: prefetch.memory_context_injection.clone(),
            known_context_items: prefetch
                .memory_context_injection
                .lines()
                .map(|l| l.to_string())
                .collect(),
        },
        citations: prefetch.citations,
        context_insights: Default::default(),
        debug: crate::atoms::types::DebugMeta {
            retrieval_confidence: prefetch.retrieval_confidence.as_str().into(),
            fallbacks_used: prefetch.retrieval_debug.fallbacks_used,
            stage_timings_ms: prefetch.retrieval_debug.stage_timings_ms,
            errors: prefetch.retrieval_debug.errors,
            vector_stage_status: prefetch.retrieval_debug.vector_stage_status,
        },
        feedback: crate::atoms::types::FeedbackMeta {
            eligible: true,
            interrupted: false,
            default_related_positions: vec![],
        },
    };

    Ok(ExchangeResponse { messages, memory_meta })
}

// ═══════════════════════════════════════════════════════════════════════════
// POST /hooks/context
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ContextRequest {
    pub user_id: String,
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub tiers: Vec<Tier>,
    #[serde(default, rename = "sortBy")]
    pub sort_by: Option<SortBy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextResponse {
    pub contexts: Vec<SearchHit>,
    pub total: usize,
    pub query: String,
    #[serde(rename = "tiersSearched")]
    pub tiers_searched: Vec<String>,
    #[serde(rename = "latencyMs")]
    pub latency_ms: u64,
    pub confidence: RetrievalConfidence,
}

pub async fn handle_context(
    ctx: &HookContext,
    req: ContextRequest,
) -> EngineResult<ContextResponse> {
    if req.query.trim().chars().count() < 2 {
        return Err(EngineError::Validation(
            "query must be at least 2 characters".into(),
        ));
    }
    let started = Instant::now();
    let tiers_searched: Vec<String> = if req.tiers.is_empty() {
        Tier::default_search_set().iter().map(|t| t.as_str()).collect()
    } else {
        req.tiers.iter().map(|t| t.as_str()).collect()
    };

    let resp = ctx
        .facade
        .search(
            &req.user_id,
            &req.query,
            req.tiers,
            req.limit.unwrap_or(ctx.config.top_k),
            req.sort_by.unwrap_or_default(),
            None,
        )
        .await?;

    let latency_ms = started.elapsed().as_millis() as u64;
    ctx.metrics.record_latency("hook_context", latency_ms);

    Ok(ContextResponse {
        total: resp.hits.len(),
        contexts: resp.hits,
        query: req.query,
        tiers_searched,
        latency_ms,
        confidence: resp.debug.confidence,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// POST /hooks/score
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreRequest {
    pub user_id: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub score: i8,
    #[serde(rename = "memoryIds")]
    pub memory_ids: Vec<String>,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreResponse {
    pub updated: usize,
    pub success: bool,
}

pub fn handle_score(ctx: &HookContext, req: ScoreRequest) -> EngineResult<ScoreResponse> {
    let mut updated = 0;
    for memory_id in &req.memory_ids {
        ctx.facade.record_feedback(
            &req.user_id,
            memory_id,
            req.score,
            Some(&req.conversation_id),
            Some(&req.message_id),
        )?;
        updated += 1;
    }
    // Response-level feedback rides alongside but never touches item stats.
    ctx.facade.record_response_feedback(
        &req.user_id,
        Some(&req.conversation_id),
        Some(&req.message_id),
        req.score,
        req.feedback.as_deref(),
    )?;
    Ok(ScoreResponse { updated, success: true })
}

// ═══════════════════════════════════════════════════════════════════════════
// POST /memory/search (offset pagination)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct MemorySearchRequest {
    pub user_id: String,
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub tiers: Vec<Tier>,
    #[serde(default, rename = "sortBy")]
    pub sort_by: Option<SortBy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySearchResponse {
    pub hits: Vec<SearchHit>,
    pub total: usize,
    pub offset: usize,
}

pub async fn handle_memory_search(
    ctx: &HookContext,
    req: MemorySearchRequest,
) -> EngineResult<MemorySearchResponse> {
    let limit = req.limit.unwrap_or(ctx.config.top_k);
    // Over-fetch to page past the offset; retrieval quality degrades deep
    // into the list anyway.
    let resp = ctx
        .facade
        .search(
            &req.user_id,
            &req.query,
            req.tiers,
            limit + req.offset,
            req.sort_by.unwrap_or_default(),
            None,
        )
        .await?;

    let total = resp.hits.len();
    let hits: Vec<SearchHit> = resp.hits.into_iter().skip(req.offset).take(limit).collect();
    Ok(MemorySearchResponse { hits, total, offset: req.offset })
}

// ═══════════════════════════════════════════════════════════════════════════
// Memory-bank CRUD
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryBankStoreRequest {
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub importance: Option<f64>,
}

pub async fn handle_memory_bank_store(
    ctx: &HookContext,
    req: MemoryBankStoreRequest,
) -> EngineResult<crate::memory::facade::StoreResult> {
    ctx.facade
        .store(StoreRequest {
            user_id: req.user_id,
            tier: Some(Tier::MemoryBank),
            text: req.text,
            tags: req.tags,
            importance: req.importance,
            ..Default::default()
        })
        .await
}

pub fn handle_memory_bank_list(
    ctx: &HookContext,
    user_id: &str,
    limit: usize,
    offset: usize,
) -> EngineResult<Vec<MemoryItem>> {
    ctx.facade.list(user_id, Some(&Tier::MemoryBank), limit.max(1), offset)
}

pub fn handle_memory_bank_get(
    ctx: &HookContext,
    user_id: &str,
    memory_id: &str,
) -> EngineResult<MemoryItem> {
    ctx.facade
        .get_by_id(user_id, memory_id)?
        .ok_or_else(|| EngineError::NotFound(format!("memory {memory_id}")))
}

pub fn handle_memory_bank_update(
    ctx: &HookContext,
    user_id: &str,
    memory_id: &str,
    patch: MemoryPatch,
) -> EngineResult<MemoryItem> {
    ctx.facade.update(user_id, memory_id, patch)
}

pub async fn handle_memory_bank_delete(
    ctx: &HookContext,
    user_id: &str,
    memory_id: &str,
) -> EngineResult<bool> {
    ctx.facade.delete_memory(user_id, memory_id).await
}

// ═══════════════════════════════════════════════════════════════════════════
// Stats / diagnostics / health
// ═══════════════════════════════════════════════════════════════════════════

pub fn handle_stats(ctx: &HookContext, user_id: &str) -> EngineResult<UserStats> {
    ctx.facade.get_stats(user_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsResponse {
    pub metrics: MetricsSnapshot,
    pub embedding: crate::memory::embedding::EmbeddingStatus,
    pub reindex: ReindexProgress,
}

pub fn handle_diagnostics(ctx: &HookContext) -> DiagnosticsResponse {
    let embedding = ctx.facade.embedding_handle();
    let mut breakers = HashMap::new();
    breakers.insert("embedding".to_string(), embedding.is_circuit_open());
    breakers.insert(
        "vector_index".to_string(),
        ctx.facade.vector_index_handle().is_circuit_open(),
    );
    DiagnosticsResponse {
        metrics: ctx.metrics.snapshot(breakers),
        embedding: embedding.status(),
        reindex: ctx.facade.reindex_progress(),
    }
}

pub async fn handle_health(ctx: &HookContext, full: bool) -> EngineResult<HealthReport> {
    if !full {
        // Shallow probe: document store only, for cheap liveness checks.
        let store = ctx.facade.store_handle();
        let ok = store.count_documents("__health__", None, None).is_ok();
        return Ok(HealthReport {
            status: if ok {
                crate::observability::HealthStatus::Healthy
            } else {
                crate::observability::HealthStatus::Unhealthy
            },
            checked_at: crate::atoms::types::now_iso(),
            components: vec![],
        });
    }
    Ok(run_health_checks(
        &ctx.facade.store_handle(),
        &ctx.facade.embedding_handle(),
        &ctx.facade.vector_index_handle(),
        &crate::memory::rerank::RerankClient::new(&ctx.config),
    )
    .await)
}

// ═══════════════════════════════════════════════════════════════════════════
// Ops (admin-gated)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpsAction {
    ReindexDeferred,
    Reset,
    Sanitize,
    CircuitBreaker,
    Migrate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpsRequest {
    pub user_id: String,
    /// The host marks requests that passed its admin gate.
    pub admin: bool,
    pub action: OpsAction,
    /// Migration payload for `migrate`.
    #[serde(default)]
    pub legacy_rows: Vec<LegacyBankRow>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OpsResponse {
    Reindex(ReindexReport),
    Migration(MigrationReport),
    Ack { done: bool },
}

pub async fn handle_ops(ctx: &HookContext, req: OpsRequest) -> EngineResult<OpsResponse> {
    if !req.admin {
        return Err(EngineError::Auth("ops endpoints are admin-gated".into()));
    }
    match req.action {
        OpsAction::ReindexDeferred => Ok(OpsResponse::Reindex(ctx.facade.run_reindex(false).await?)),
        OpsAction::Sanitize => Ok(OpsResponse::Reindex(ctx.facade.run_reindex(true).await?)),
        OpsAction::CircuitBreaker => {
            ctx.facade.embedding_handle().reset_circuit();
            Ok(OpsResponse::Ack { done: true })
        }
        OpsAction::Reset => {
            ctx.facade.embedding_handle().reset_circuit();
            ctx.facade.resume_reindex();
            Ok(OpsResponse::Ack { done: true })
        }
        OpsAction::Migrate => Ok(OpsResponse::Migration(ctx.facade.migrate_legacy_bank(
            &req.user_id,
            &req.legacy_rows,
            req.dry_run,
            true,
        )?)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Knowledge-graph views
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct GraphResponse {
    pub nodes: Vec<crate::atoms::types::KgNode>,
}

pub fn handle_graph(ctx: &HookContext, user_id: &str, limit: usize) -> EngineResult<GraphResponse> {
    let store = ctx.facade.store_handle();
    Ok(GraphResponse { nodes: knowledge_graph::top_nodes(&store, user_id, limit.max(1))? })
}

pub fn handle_kg_concept(
    ctx: &HookContext,
    user_id: &str,
    node_id: &str,
    limit: usize,
) -> EngineResult<knowledge_graph::ConceptContext> {
    let store = ctx.facade.store_handle();
    knowledge_graph::get_concept_context(&store, user_id, node_id, limit.max(1))
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::MemoryStore;

    fn context() -> HookContext {
        let config = Arc::new(EngineConfig {
            embedding_url: "http://127.0.0.1:1".into(),
            qdrant_host: "127.0.0.1".into(),
            qdrant_port: 1,
            embedding_timeout_ms: 100,
            vector_timeout_ms: 100,
            embedding_dimension: 8,
            qdrant_vector_size: 8,
            ..Default::default()
        });
        HookContext {
            facade: Arc::new(MemoryFacade::new(
                Arc::new(MemoryStore::open_in_memory().unwrap()),
                config.clone(),
            )),
            metrics: Arc::new(MetricsCollector::new()),
            logger: Arc::new(StructuredLogger::new()),
            config,
        }
    }

    async fn seed(ctx: &HookContext, text: &str) -> String {
        ctx.facade
            .store(StoreRequest {
                user_id: "u1".into(),
                tier: Some(Tier::MemoryBank),
                text: text.into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .memory_id
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(to_http_status(&EngineError::Validation("x".into())), 400);
        assert_eq!(to_http_status(&EngineError::Auth("x".into())), 401);
        assert_eq!(to_http_status(&EngineError::NotFound("x".into())), 404);
        assert_eq!(to_http_status(&EngineError::ServiceDown("x".into())), 503);
        assert_eq!(to_http_status(&EngineError::Other("x".into())), 500);
    }

    #[tokio::test]
    async fn test_context_rejects_short_query() {
        let ctx = context();
        let err = handle_context(
            &ctx,
            ContextRequest {
                user_id: "u1".into(),
                query: "x".into(),
                limit: None,
                tiers: vec![],
                sort_by: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(to_http_status(&err), 400);
    }

    #[tokio::test]
    async fn test_exchange_injects_memory_context_block() {
        let ctx = context();
        let id = seed(&ctx, "My name is Avi.").await;

        let resp = handle_exchange(
            &ctx,
            ExchangeRequest {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                message_id: "m1".into(),
                messages: vec![
                    ExchangeMessage { role: "system".into(), content: "Base prompt.".into() },
                    ExchangeMessage { role: "user".into(), content: "מה שמי? Avi name".into() },
                ],
                limit: None,
            },
        )
        .await
        .unwrap();

        let system = &resp.messages[0];
        assert_eq!(system.role, "system");
        assert!(system.content.starts_with("Base prompt."));
        assert!(system.content.contains("<memory_context>"));
        assert!(system.content.contains(&format!("[memory_bank:{id}] My name is Avi.")));
        assert!(system.content.contains("</memory_context>"));
        assert_eq!(resp.memory_meta.citations.len(), 1);
        assert_eq!(resp.memory_meta.schema_version, "v1");
    }

    #[tokio::test]
    async fn test_exchange_without_system_prepends_one() {
        let ctx = context();
        seed(&ctx, "The project deadline is Thursday.").await;

        let resp = handle_exchange(
            &ctx,
            ExchangeRequest {
                user_id: "u1".into(),
                conversation_id: "c1".into(),
                message_id: "m1".into(),
                messages: vec![ExchangeMessage {
                    role: "user".into(),
                    content: "when is the project deadline?".into(),
                }],
                limit: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(resp.messages[0].role, "system");
        assert!(resp.messages[0].content.starts_with("<memory_context>"));
        assert_eq!(resp.messages[1].role, "user");
    }

    #[tokio::test]
    async fn test_score_updates_and_separates_response_feedback() {
        let ctx = context();
        let id = seed(&ctx, "a scored memory").await;

        let resp = handle_score(
            &ctx,
            ScoreRequest {
                user_id: "u1".into(),
                message_id: "m1".into(),
                conversation_id: "c1".into(),
                score: 1,
                memory_ids: vec![id.clone()],
                feedback: Some("helpful".into()),
            },
        )
        .unwrap();
        assert_eq!(resp.updated, 1);
        assert!(resp.success);

        let item = ctx.facade.get_by_id("u1", &id).unwrap().unwrap();
        assert_eq!(item.stats.worked_count, 1);
        assert_eq!(item.stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_ops_requires_admin() {
        let ctx = context();
        let err = handle_ops(
            &ctx,
            OpsRequest {
                user_id: "u1".into(),
                admin: false,
                action: OpsAction::CircuitBreaker,
                legacy_rows: vec![],
                dry_run: false,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(to_http_status(&err), 401);
    }

    #[tokio::test]
    async fn test_ops_circuit_breaker_reset() {
        let ctx = context();
        let resp = handle_ops(
            &ctx,
            OpsRequest {
                user_id: "u1".into(),
                admin: true,
                action: OpsAction::CircuitBreaker,
                legacy_rows: vec![],
                dry_run: false,
            },
        )
        .await
        .unwrap();
        assert!(matches!(resp, OpsResponse::Ack { done: true }));
    }

    #[tokio::test]
    async fn test_memory_bank_crud_flow() {
        let ctx = context();
        let stored = handle_memory_bank_store(
            &ctx,
            MemoryBankStoreRequest {
                user_id: "u1".into(),
                text: "curated fact".into(),
                tags: vec!["t1".into()],
                importance: Some(0.9),
            },
        )
        .await
        .unwrap();

        let listed = handle_memory_bank_list(&ctx, "u1", 10, 0).unwrap();
        assert_eq!(listed.len(), 1);

        let got = handle_memory_bank_get(&ctx, "u1", &stored.memory_id).unwrap();
        assert_eq!(got.text, "curated fact");

        assert!(handle_memory_bank_delete(&ctx, "u1", &stored.memory_id).await.unwrap());
        assert!(matches!(
            handle_memory_bank_get(&ctx, "u1", &stored.memory_id),
            Ok(item) if item.status == crate::atoms::types::MemoryStatus::Deleted
        ));
    }

    #[tokio::test]
    async fn test_graph_view_after_store() {
        let ctx = context();
        seed(&ctx, "We use Qdrant and Docker for the deployment.").await;
        let graph = handle_graph(&ctx, "u1", 10).unwrap();
        assert!(graph.nodes.iter().any(|n| n.label == "qdrant"));
        assert!(graph.nodes.iter().any(|n| n.label == "docker"));
    }

    #[tokio::test]
    async fn test_search_pagination() {
        let ctx = context();
        for i in 0..5 {
            seed(&ctx, &format!("pagination target number {i}")).await;
        }
        let page = handle_memory_search(
            &ctx,
            MemorySearchRequest {
                user_id: "u1".into(),
                query: "pagination target".into(),
                limit: Some(2),
                offset: 2,
                tiers: vec![],
                sort_by: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(page.hits.len(), 2);
        assert_eq!(page.offset, 2);
        assert!(page.total >= 4);
    }

    #[test]
    fn test_diagnostics_shape() {
        let ctx = context();
        let diag = handle_diagnostics(&ctx);
        assert!(diag.metrics.circuit_breakers.contains_key("embedding"));
        assert!(!diag.reindex.running);
    }

    #[tokio::test]
    async fn test_shallow_health_is_cheap() {
        let ctx = context();
        let report = handle_health(&ctx, false).await.unwrap();
        assert_eq!(report.status, crate::observability::HealthStatus::Healthy);
        assert!(report.components.is_empty());
    }
}
