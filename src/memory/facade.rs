// ── Memory Engine: Facade ──────────────────────────────────────────────────
//
// The public surface of the memory subsystem. Hooks and the MCP flow talk
// to this and nothing below it.
//
// Write ordering per memory: document insert → (optional) embed → vector
// upsert → KG update. Later steps fail independently; a failed embed or
// upsert leaves the item `needs_reindex = true` for the deferred reindexer
// instead of rolling anything back.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    now_iso, AbortSignal, Citation, MemoryItem, MemorySource, MemoryStatus, RetrievalConfidence,
    RetrievalDebug, SearchHit, SortBy, Tier,
};
use crate::config::EngineConfig;
use crate::memory::backup::{self, BackupBundle, ImportReport};
use crate::memory::embedding::EmbeddingClient;
use crate::memory::knowledge_graph::{self, extract_entities};
use crate::memory::reindex::{DeferredReindexer, ReindexProgress, ReindexReport};
use crate::memory::rerank::RerankClient;
use crate::memory::retriever::{HybridRetriever, SearchRequest, SearchResponse};
use crate::memory::scoring::{self, DecayReport, PromotionReport};
use crate::memory::store::{MemoryStore, TierStats};
use crate::memory::vector_index::{VectorIndexAdapter, VectorPoint};
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// Request / response shapes
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct StoreRequest {
    pub user_id: String,
    pub tier: Option<Tier>,
    pub text: String,
    pub tags: Vec<String>,
    pub importance: Option<f64>,
    pub source: Option<MemorySource>,
    /// Pre-extracted entities; the heuristic extractor runs when empty.
    pub entities: Vec<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreResult {
    pub memory_id: String,
    /// True when an existing item with the same content hash was recognized
    /// instead of creating a new one (book-like tiers).
    pub deduplicated: bool,
    pub needs_reindex: bool,
}

pub struct PrefetchRequest {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub query: String,
    /// Recent turns appended to the query for lexical recall.
    pub recent_messages: Vec<String>,
    pub limit: usize,
    pub signal: Option<AbortSignal>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PrefetchResult {
    /// Newline-separated `[tier:memory_id] content` lines (content newlines
    /// folded to spaces). Empty when nothing qualified.
    pub memory_context_injection: String,
    pub retrieval_confidence: RetrievalConfidence,
    pub retrieval_debug: RetrievalDebug,
    pub citations: Vec<Citation>,
}

/// Partial update accepted by `update`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct MemoryPatch {
    pub tier: Option<Tier>,
    pub status: Option<MemoryStatus>,
    pub tags: Option<Vec<String>>,
    pub summary: Option<String>,
    pub importance: Option<f64>,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UserStats {
    pub tiers: Vec<TierStats>,
    pub total_active: u64,
    pub total_archived: u64,
    pub total_needs_reindex: u64,
}

/// One row of the legacy memory-bank migration input.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LegacyBankRow {
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
    pub dry_run: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// Facade
// ═══════════════════════════════════════════════════════════════════════════

pub struct MemoryFacade {
    store: Arc<MemoryStore>,
    embedding: Arc<EmbeddingClient>,
    vector_index: Arc<VectorIndexAdapter>,
    retriever: HybridRetriever,
    reindexer: Arc<DeferredReindexer>,
    config: Arc<EngineConfig>,
}

impl MemoryFacade {
    pub fn new(store: Arc<MemoryStore>, config: Arc<EngineConfig>) -> Self {
        let embedding = Arc::new(EmbeddingClient::new(&config));
        let vector_index = Arc::new(VectorIndexAdapter::new(&config));
        let rerank = Arc::new(RerankClient::new(&config));
        let retriever = HybridRetriever::new(
            store.clone(),
            embedding.clone(),
            vector_index.clone(),
            rerank,
            config.clone(),
        );
        let reindexer = Arc::new(DeferredReindexer::new(
            store.clone(),
            embedding.clone(),
            vector_index.clone(),
        ));
        MemoryFacade { store, embedding, vector_index, retriever, reindexer, config }
    }

    pub fn store_handle(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    pub fn embedding_handle(&self) -> Arc<EmbeddingClient> {
        self.embedding.clone()
    }

    pub fn vector_index_handle(&self) -> Arc<VectorIndexAdapter> {
        self.vector_index.clone()
    }

    // ── Store ──────────────────────────────────────────────────────────

    pub async fn store(&self, req: StoreRequest) -> EngineResult<StoreResult> {
        if !self.config.flags.memory_enabled {
            return Err(EngineError::Config("memory system disabled".into()));
        }
        let text = req.text.trim();
        if text.is_empty() {
            return Err(EngineError::Validation("cannot store empty text".into()));
        }

        let tier = req.tier.unwrap_or(Tier::Working);
        let hash = sha256_hex(text);

        // Book-like tiers: recognize already-ingested content by hash
        // (same-user scope) instead of creating a twin.
        if tier.is_book_like() {
            if let Some(existing) = self.store.get_document_by_hash(&req.user_id, &hash)? {
                info!(
                    "[memory] Recognized existing document {} by hash, skipping store",
                    existing.memory_id
                );
                return Ok(StoreResult {
                    memory_id: existing.memory_id,
                    deduplicated: true,
                    needs_reindex: existing.embedding.needs_reindex,
                });
            }
        }

        let mut item = MemoryItem::new(&req.user_id, tier.clone(), text);
        item.document_hash = hash;
        item.tags = req.tags;
        item.language = req.language;
        if let Some(importance) = req.importance {
            item.importance = importance.clamp(0.0, 1.0);
        }
        item.quality_score = self.config.initial_score;
        if let Some(source) = req.source {
            item.source = source;
        }
        item.entities = if req.entities.is_empty() {
            extract_entities(text)
        } else {
            knowledge_graph::prepare_entities(&req.entities)
        };

        // 1. Document insert
        self.store.insert_item(&item)?;

        // 2-3. Embed + vector upsert. Failures leave needs_reindex set.
        match self.embedding.embed_strict(text).await {
            Ok(vector) => {
                let point = VectorPoint {
                    memory_id: item.memory_id.clone(),
                    vector: vector.clone(),
                    user_id: item.user_id.clone(),
                    tier: item.tier.clone(),
                    status: item.status.as_str().to_string(),
                    text: item.text.clone(),
                };
                match self.vector_index.upsert_points(&[point]).await {
                    Ok(()) => {
                        item.embedding.needs_reindex = false;
                        item.embedding.dimensions = Some(vector.len());
                        item.embedding.indexed_at = Some(now_iso());
                        self.store.update_item(&item)?;
                    }
                    Err(e) => {
                        warn!("[memory] Vector upsert deferred for {}: {}", item.memory_id, e);
                    }
                }
            }
            Err(e) => {
                warn!("[memory] Embed deferred for {}: {}", item.memory_id, e);
            }
        }

        // 4. KG update (failure logged, never blocks the store).
        if !item.entities.is_empty() {
            if let Err(e) = knowledge_graph::record_entities(
                &self.store,
                &item.user_id,
                &item.memory_id,
                &item.entities,
                item.importance,
            ) {
                warn!("[memory] KG update failed for {}: {}", item.memory_id, e);
            }
        }

        Ok(StoreResult {
            memory_id: item.memory_id,
            deduplicated: false,
            needs_reindex: item.embedding.needs_reindex,
        })
    }

    // ── Search & prefetch ──────────────────────────────────────────────

    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        tiers: Vec<Tier>,
        limit: usize,
        sort_by: SortBy,
        signal: Option<AbortSignal>,
    ) -> EngineResult<SearchResponse> {
        if query.trim().chars().count() < 2 {
            return Err(EngineError::Validation(
                "query must be at least 2 characters".into(),
            ));
        }
        self.retriever
            .search(&SearchRequest {
                user_id: user_id.to_string(),
                query: query.to_string(),
                tiers,
                limit: if limit == 0 { self.config.top_k } else { limit },
                sort_by,
                signal,
            })
            .await
    }

    /// Pre-inference retrieval: ranked hits folded into an injection block.
    /// Honors its own deadline; on timeout returns an empty injection with
    /// `prefetch_timeout` recorded rather than delaying the turn.
    pub async fn prefetch_context(&self, req: PrefetchRequest) -> EngineResult<PrefetchResult> {
        let deadline = Duration::from_millis(self.config.prefetch_timeout_ms);
        let limit = if req.limit == 0 { self.config.top_k } else { req.limit };

        // Recent turns sharpen lexical recall for pronoun-heavy queries.
        let mut query = req.query.clone();
        for recent in req.recent_messages.iter().rev().take(2) {
            query.push(' ');
            query.push_str(recent);
        }

        let search = self.search(
            &req.user_id,
            &query,
            vec![],
            limit,
            SortBy::Relevance,
            req.signal.clone(),
        );

        match tokio::time::timeout(deadline, search).await {
            Ok(Ok(resp)) => Ok(build_prefetch_result(resp)),
            Ok(Err(e)) => {
                // Validation errors surface; retrieval failures degrade.
                if matches!(e, EngineError::Validation(_)) {
                    return Err(e);
                }
                warn!("[memory] Prefetch degraded: {}", e);
                let mut debug = RetrievalDebug::default();
                debug.errors.push(e.to_string());
                Ok(empty_prefetch(debug))
            }
            Err(_) => {
                if let Some(sig) = &req.signal {
                    sig.abort();
                }
                let mut debug = RetrievalDebug::default();
                debug.fallbacks_used.push("prefetch_timeout".into());
                Ok(empty_prefetch(debug))
            }
        }
    }

    // ── Feedback ───────────────────────────────────────────────────────

    pub fn record_feedback(
        &self,
        user_id: &str,
        memory_id: &str,
        score: i8,
        conversation_id: Option<&str>,
        message_id: Option<&str>,
    ) -> EngineResult<()> {
        scoring::record_feedback(
            &self.store,
            &self.config,
            user_id,
            memory_id,
            score,
            conversation_id,
            message_id,
        )
    }

    pub fn record_response_feedback(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        message_id: Option<&str>,
        score: i8,
        feedback: Option<&str>,
    ) -> EngineResult<()> {
        scoring::record_response_feedback(
            &self.store,
            user_id,
            conversation_id,
            message_id,
            score,
            feedback,
        )
    }

    /// LEARN phase bookkeeping: bump usage on cited memories and refresh
    /// their entities into the knowledge graph. Failures never surface.
    pub fn record_turn_learning(&self, user_id: &str, cited_memory_ids: &[String]) {
        if let Err(e) = scoring::record_use(&self.store, user_id, cited_memory_ids) {
            warn!("[memory] LEARN use-bump failed: {}", e);
        }
        for memory_id in cited_memory_ids {
            match self.store.get_item(user_id, memory_id) {
                Ok(Some(item)) if !item.entities.is_empty() => {
                    if let Err(e) = knowledge_graph::record_entities(
                        &self.store,
                        user_id,
                        memory_id,
                        &item.entities,
                        item.quality_score,
                    ) {
                        warn!("[memory] LEARN KG refresh failed for {}: {}", memory_id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("[memory] LEARN lookup failed for {}: {}", memory_id, e),
            }
        }
    }

    // ── CRUD ───────────────────────────────────────────────────────────

    pub fn get_by_id(&self, user_id: &str, memory_id: &str) -> EngineResult<Option<MemoryItem>> {
        self.store.get_item(user_id, memory_id)
    }

    pub fn update(
        &self,
        user_id: &str,
        memory_id: &str,
        patch: MemoryPatch,
    ) -> EngineResult<MemoryItem> {
        let mut item = self
            .store
            .get_item(user_id, memory_id)?
            .ok_or_else(|| EngineError::NotFound(format!("memory {memory_id}")))?;

        if let Some(tier) = patch.tier {
            item.tier = tier;
        }
        if let Some(status) = patch.status {
            match status {
                MemoryStatus::Archived if item.status != MemoryStatus::Archived => {
                    item.archived_at = Some(now_iso());
                }
                MemoryStatus::Active => {
                    item.archived_at = None;
                }
                _ => {}
            }
            item.status = status;
        }
        if let Some(tags) = patch.tags {
            item.tags = tags;
        }
        if let Some(summary) = patch.summary {
            item.summary = if summary.is_empty() { None } else { Some(summary) };
        }
        if let Some(importance) = patch.importance {
            item.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(expires_at) = patch.expires_at {
            item.expires_at = if expires_at.is_empty() { None } else { Some(expires_at) };
        }
        item.current_version += 1;

        self.store.update_item(&item)?;
        Ok(item)
    }

    /// Soft-delete plus best-effort vector cleanup.
    pub async fn delete_memory(&self, user_id: &str, memory_id: &str) -> EngineResult<bool> {
        let deleted = self.store.soft_delete(user_id, memory_id)?;
        if deleted {
            if let Err(e) = self.vector_index.delete_points(&[memory_id.to_string()]).await {
                warn!("[memory] Vector delete deferred for {}: {}", memory_id, e);
            }
        }
        Ok(deleted)
    }

    pub fn list(
        &self,
        user_id: &str,
        tier: Option<&Tier>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<MemoryItem>> {
        self.store
            .list_items(user_id, tier, Some(MemoryStatus::Active), limit, offset)
    }

    // ── Stats, backup, schedulers ──────────────────────────────────────

    pub fn get_stats(&self, user_id: &str) -> EngineResult<UserStats> {
        let tiers = self.store.tier_stats(user_id)?;
        let total_active = tiers.iter().map(|t| t.active).sum();
        let total_archived = tiers.iter().map(|t| t.archived).sum();
        let total_needs_reindex = tiers.iter().map(|t| t.needs_reindex).sum();
        Ok(UserStats { tiers, total_active, total_archived, total_needs_reindex })
    }

    pub fn export_backup(&self, user_id: Option<&str>) -> EngineResult<BackupBundle> {
        backup::export_backup(&self.store, user_id)
    }

    pub fn import_backup(&self, bundle: &BackupBundle) -> EngineResult<ImportReport> {
        backup::import_backup(&self.store, bundle)
    }

    /// Run the promotion pass immediately (scheduler also runs it).
    pub fn promote_now(&self) -> EngineResult<PromotionReport> {
        if !self.config.flags.promotion_enabled {
            return Ok(PromotionReport::default());
        }
        scoring::run_promotion(&self.store, &self.config)
    }

    /// Run the decay/archival pass immediately.
    pub fn decay_now(&self) -> EngineResult<DecayReport> {
        scoring::run_decay(&self.store, &self.config)
    }

    pub async fn run_reindex(&self, sanitize: bool) -> EngineResult<ReindexReport> {
        self.reindexer.run_once(sanitize).await
    }

    pub fn pause_reindex(&self) {
        self.reindexer.pause();
    }

    pub fn resume_reindex(&self) {
        self.reindexer.resume();
    }

    pub fn reindex_progress(&self) -> ReindexProgress {
        self.reindexer.progress()
    }

    /// Spawn the decay/promotion scheduler as a cooperative background task.
    /// Returns the join handle so the host can abort it on shutdown.
    pub fn spawn_scheduler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let facade = self.clone();
        let interval = Duration::from_millis(facade.config.scheduler_interval_ms.max(60_000));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = facade.decay_now() {
                    warn!("[memory] Scheduled decay failed: {}", e);
                }
                if let Err(e) = facade.promote_now() {
                    warn!("[memory] Scheduled promotion failed: {}", e);
                }
            }
        })
    }

    // ── Legacy migration ───────────────────────────────────────────────

    /// One-shot streaming migration of legacy memory-bank rows. Re-running
    /// is safe: rows are skipped by `(user, tier, normalized_text)` when
    /// `skip_existing` is set, and all migrated items defer embedding.
    pub fn migrate_legacy_bank(
        &self,
        user_id: &str,
        rows: &[LegacyBankRow],
        dry_run: bool,
        skip_existing: bool,
    ) -> EngineResult<MigrationReport> {
        let mut report = MigrationReport { dry_run, ..Default::default() };

        for row in rows {
            let text = row.text.trim();
            if text.is_empty() {
                report.skipped += 1;
                continue;
            }
            let hash = sha256_hex(&normalize_for_dedup(text));
            if skip_existing && self.store.get_document_by_hash(user_id, &hash)?.is_some() {
                report.skipped += 1;
                continue;
            }
            if dry_run {
                report.migrated += 1;
                continue;
            }

            let mut item = MemoryItem::new(user_id, Tier::MemoryBank, text);
            item.document_hash = hash;
            item.tags = row.tags.clone();
            item.source = MemorySource {
                source_type: "migration".into(),
                legacy: true,
                ..Default::default()
            };
            if let Some(created) = &row.created_at {
                item.created_at = created.clone();
            }
            item.embedding.needs_reindex = true;
            self.store.insert_item(&item)?;
            report.migrated += 1;
        }

        info!(
            "[memory] Legacy migration{}: {} migrated, {} skipped",
            if dry_run { " (dry run)" } else { "" },
            report.migrated,
            report.skipped
        );
        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

pub fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("{digest:x}")
}

/// Dedup key for migration: lowercase, whitespace-collapsed.
fn normalize_for_dedup(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fold a hit into one `[tier:memory_id] content` line (newlines → spaces).
fn injection_line(hit: &SearchHit) -> String {
    let content: String = hit
        .text
        .split(['\n', '\r'])
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    format!("[{}:{}] {}", hit.tier.as_str(), hit.memory_id, content.trim())
}

fn build_prefetch_result(resp: SearchResponse) -> PrefetchResult {
    let citations: Vec<Citation> = resp
        .hits
        .iter()
        .map(|h| Citation {
            tier: h.tier.clone(),
            memory_id: h.memory_id.clone(),
            doc_id: h.doc_id.clone(),
            chunk_id: h.chunk_id.clone(),
            wilson_score: Some(h.wilson_score),
            confidence: None,
            score: Some(h.score),
        })
        .collect();

    let injection = resp
        .hits
        .iter()
        .map(injection_line)
        .collect::<Vec<_>>()
        .join("\n");

    PrefetchResult {
        memory_context_injection: injection,
        retrieval_confidence: resp.debug.confidence,
        retrieval_debug: resp.debug,
        citations,
    }
}

fn empty_prefetch(debug: RetrievalDebug) -> PrefetchResult {
    PrefetchResult {
        memory_context_injection: String::new(),
        retrieval_confidence: RetrievalConfidence::Low,
        retrieval_debug: debug,
        citations: vec![],
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
