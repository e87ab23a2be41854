// ── Zikaron Atoms: Memory Domain Types ─────────────────────────────────────
//
// The canonical data model shared by the memory engine, the MCP flow, and
// the hook surface:
//   - MemoryItem: the primary long-term memory record (tiered, scored, versioned)
//   - Outcome: append-only feedback events feeding the scorer
//   - KgNode / KgEdge: knowledge graph over extracted entities
//   - SearchHit / RetrievalDebug: retrieval results with diagnostics
//   - MemoryMetaV1: the response envelope attached to final answers
//   - AbortSignal: cooperative cancellation threaded through retrieval
//
// Timestamps are ISO-8601 UTC strings ("%Y-%m-%dT%H:%M:%SZ") to match the
// document store's text columns.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Format a UTC timestamp the way the store persists them.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ═══════════════════════════════════════════════════════════════════════════
// Tiers & Status
// ═══════════════════════════════════════════════════════════════════════════

/// Coarse-grained memory class. Informs ranking weight and lifecycle:
/// `working` memories decay fast and can promote into `history`, which can
/// promote into `patterns`; `books` and `datagov_*` hold ingested corpora;
/// `memory_bank` and `system` are curated and rank highest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tier {
    Working,
    History,
    Patterns,
    Books,
    MemoryBank,
    System,
    /// Open-ended per-dataset tiers, serialized as `datagov_<suffix>`.
    Datagov(String),
}

impl Tier {
    pub fn as_str(&self) -> String {
        match self {
            Tier::Working => "working".into(),
            Tier::History => "history".into(),
            Tier::Patterns => "patterns".into(),
            Tier::Books => "books".into(),
            Tier::MemoryBank => "memory_bank".into(),
            Tier::System => "system".into(),
            Tier::Datagov(suffix) => format!("datagov_{suffix}"),
        }
    }

    pub fn parse(s: &str) -> Option<Tier> {
        match s {
            "working" => Some(Tier::Working),
            "history" => Some(Tier::History),
            "patterns" => Some(Tier::Patterns),
            "books" => Some(Tier::Books),
            "memory_bank" => Some(Tier::MemoryBank),
            "system" => Some(Tier::System),
            other => other.strip_prefix("datagov_").map(|sfx| Tier::Datagov(sfx.to_string())),
        }
    }

    /// Rank multiplier applied during score fusion.
    /// Curated tiers outrank ingested corpora, which outrank scratch memory.
    pub fn rank_multiplier(&self) -> f64 {
        match self {
            Tier::System | Tier::MemoryBank => 1.3,
            Tier::Patterns => 1.15,
            Tier::Books | Tier::Datagov(_) => 1.1,
            Tier::History => 1.0,
            Tier::Working => 0.85,
        }
    }

    /// Book-like tiers deduplicate by document hash on store, so the same
    /// ingested text is recognized instead of re-created.
    pub fn is_book_like(&self) -> bool {
        matches!(self, Tier::Books | Tier::Datagov(_))
    }

    /// The default tier set searched when a caller passes none.
    pub fn default_search_set() -> Vec<Tier> {
        vec![
            Tier::MemoryBank,
            Tier::System,
            Tier::Patterns,
            Tier::History,
            Tier::Books,
            Tier::Working,
        ]
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Tier {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Tier::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown tier: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Active,
    Archived,
    Deleted,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Archived => "archived",
            MemoryStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MemoryStatus::Active),
            "archived" => Some(MemoryStatus::Archived),
            "deleted" => Some(MemoryStatus::Deleted),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MemoryItem
// ═══════════════════════════════════════════════════════════════════════════

/// Provenance of a memory: where the text came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySource {
    /// Source kind: "conversation", "tool", "ingest", "migration", …
    #[serde(default)]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    /// Set on rows carried over by the legacy migration.
    #[serde(default)]
    pub legacy: bool,
}

/// Usage and outcome statistics, updated atomically by the scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub uses: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
    #[serde(default)]
    pub worked_count: u64,
    #[serde(default)]
    pub failed_count: u64,
    #[serde(default)]
    pub partial_count: u64,
    #[serde(default)]
    pub success_count: u64,
    /// worked / (worked + failed + partial), or 0.5 with no outcomes.
    pub success_rate: f64,
    /// Wilson lower confidence bound at z = 1.96. Always in [0, 1].
    pub wilson_score: f64,
}

impl Default for MemoryStats {
    fn default() -> Self {
        MemoryStats {
            uses: 0,
            last_used_at: None,
            worked_count: 0,
            failed_count: 0,
            partial_count: 0,
            success_count: 0,
            success_rate: 0.5,
            wilson_score: 0.0,
        }
    }
}

/// Embedding bookkeeping. `needs_reindex = false` implies a vector with the
/// same `memory_id` exists in the vector index at the configured dimension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,
    #[serde(default)]
    pub needs_reindex: bool,
}

/// The primary long-term memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub memory_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    pub tier: Tier,
    pub status: MemoryStatus,

    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default)]
    pub source: MemorySource,
    /// SHA-256 of `text`, used for book-tier dedup ("already ingested").
    #[serde(default)]
    pub document_hash: String,

    // Quality (all 0–1)
    pub importance: f64,
    pub confidence: f64,
    pub quality_score: f64,
    pub recency_score: f64,

    #[serde(default)]
    pub stats: MemoryStats,
    #[serde(default)]
    pub embedding: EmbeddingInfo,

    #[serde(default = "default_version")]
    pub current_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes_memory_id: Option<String>,

    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decay_at: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl MemoryItem {
    /// Construct a fresh active item with default quality and stats.
    pub fn new(user_id: &str, tier: Tier, text: &str) -> Self {
        let now = now_iso();
        MemoryItem {
            memory_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            org_id: None,
            tier,
            status: MemoryStatus::Active,
            text: text.to_string(),
            summary: None,
            tags: vec![],
            entities: vec![],
            language: None,
            source: MemorySource::default(),
            document_hash: String::new(),
            importance: 0.5,
            confidence: 0.5,
            quality_score: 0.5,
            recency_score: 1.0,
            stats: MemoryStats::default(),
            embedding: EmbeddingInfo { needs_reindex: true, ..Default::default() },
            current_version: 1,
            supersedes_memory_id: None,
            created_at: now.clone(),
            updated_at: now,
            archived_at: None,
            expires_at: None,
            last_decay_at: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// Append-only feedback event. Never deleted; the scorer folds these into
/// the memory's stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub user_id: String,
    pub memory_id: String,
    /// -1 = failed, 0 = partial, +1 = worked.
    pub score: i8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub created_at: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// Knowledge Graph
// ═══════════════════════════════════════════════════════════════════════════

/// An entity node. `node_id` is derived deterministically from the
/// normalized label so repeated mentions converge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgNode {
    pub user_id: String,
    pub node_id: String,
    pub label: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub first_seen_at: String,
    pub last_seen_at: String,
    pub mentions: u64,
    #[serde(default)]
    pub memory_ids: Vec<String>,
    pub quality_sum: f64,
    pub avg_quality: f64,
}

/// An undirected co-occurrence edge. `edge_id = min(a,b):max(a,b)` keeps
/// the pair canonical regardless of mention order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KgEdge {
    pub user_id: String,
    pub edge_id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation_type: String,
    pub weight: u64,
    #[serde(default)]
    pub memory_ids: Vec<String>,
    pub first_seen_at: String,
    pub last_seen_at: String,
}

impl KgEdge {
    /// Canonical edge id for an unordered node pair.
    pub fn edge_id_for(a: &str, b: &str) -> String {
        if a <= b { format!("{a}:{b}") } else { format!("{b}:{a}") }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Retrieval results
// ═══════════════════════════════════════════════════════════════════════════

/// Per-stage status of the dense retrieval path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorStageStatus {
    Ok,
    SkippedDegraded,
    DisabledBreakerOpen,
    DisabledSchemaMismatch,
    Disabled,
}

impl VectorStageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorStageStatus::Ok => "ok",
            VectorStageStatus::SkippedDegraded => "skipped_degraded",
            VectorStageStatus::DisabledBreakerOpen => "disabled_breaker_open",
            VectorStageStatus::DisabledSchemaMismatch => "disabled_schema_mismatch",
            VectorStageStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalConfidence {
    High,
    Medium,
    Low,
}

impl RetrievalConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalConfidence::High => "high",
            RetrievalConfidence::Medium => "medium",
            RetrievalConfidence::Low => "low",
        }
    }
}

/// A single ranked retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub memory_id: String,
    pub tier: Tier,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Final score after fusion (and rerank, when applied).
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dense_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
    pub wilson_score: f64,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    /// Which stages surfaced this hit: "dense", "lexical".
    #[serde(default)]
    pub matched_by: Vec<String>,
}

/// Diagnostics attached to every search and prefetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalDebug {
    pub confidence: RetrievalConfidence,
    #[serde(default)]
    pub fallbacks_used: Vec<String>,
    #[serde(default)]
    pub stage_timings_ms: BTreeMap<String, u64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_stage_status: Option<String>,
}

impl Default for RetrievalDebug {
    fn default() -> Self {
        RetrievalDebug {
            confidence: RetrievalConfidence::Low,
            fallbacks_used: vec![],
            stage_timings_ms: BTreeMap::new(),
            errors: vec![],
            vector_stage_status: None,
        }
    }
}

/// Sort order for search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    Relevance,
    Recency,
    Score,
}

impl Default for SortBy {
    fn default() -> Self {
        SortBy::Relevance
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MemoryMetaV1 — response envelope
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub tier: Tier,
    pub memory_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wilson_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalSummary {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_query: Option<String>,
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub tiers_considered: Vec<String>,
    #[serde(default)]
    pub tiers_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_position_map: Option<BTreeMap<String, usize>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnownContext {
    #[serde(default)]
    pub known_context_text: String,
    #[serde(default)]
    pub known_context_items: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextInsights {
    #[serde(default)]
    pub matched_concepts: Vec<String>,
    #[serde(default)]
    pub active_concepts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugMeta {
    pub retrieval_confidence: String,
    #[serde(default)]
    pub fallbacks_used: Vec<String>,
    #[serde(default)]
    pub stage_timings_ms: BTreeMap<String, u64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_stage_status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackMeta {
    pub eligible: bool,
    pub interrupted: bool,
    #[serde(default)]
    pub default_related_positions: Vec<usize>,
}

/// Envelope attached to every finalized assistant answer: what was retrieved,
/// what was cited, and whether the turn is feedback-eligible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMetaV1 {
    pub schema_version: String,
    pub conversation_id: String,
    pub assistant_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
    pub retrieval: RetrievalSummary,
    pub known_context: KnownContext,
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub context_insights: ContextInsights,
    pub debug: DebugMeta,
    pub feedback: FeedbackMeta,
}

impl MemoryMetaV1 {
    pub const SCHEMA_VERSION: &'static str = "v1";
}

// ═══════════════════════════════════════════════════════════════════════════
// AbortSignal
// ═══════════════════════════════════════════════════════════════════════════

/// Cooperative cancellation flag, cloned into every retrieval stage.
/// Aborting stops awaiting promptly; in-flight upstream I/O is not torn
/// down unless the HTTP layer supports it.
#[derive(Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
