// ── Zikaron Engine: Configuration ──────────────────────────────────────────
//
// All tuning knobs live here, loaded once at startup from the process
// environment. Components receive an `Arc<EngineConfig>` and never read env
// vars themselves, so tests can construct configs directly.
//
// Initialization order contract (enforced by the host):
//   config → document store → vector index (schema probe) → embedding client
//   → facade → background schedulers.

use crate::atoms::error::{EngineError, EngineResult};
use log::{info, warn};
use std::collections::HashMap;

// ═══════════════════════════════════════════════════════════════════════════
// Env helpers
// ═══════════════════════════════════════════════════════════════════════════

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

// ═══════════════════════════════════════════════════════════════════════════
// Feature flags
// ═══════════════════════════════════════════════════════════════════════════

/// The memory system's feature switches. All default to on except where the
/// deployment opts out.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    /// Master kill switch for the whole memory subsystem.
    pub memory_enabled: bool,
    /// Dense retrieval through the vector index.
    pub qdrant_enabled: bool,
    /// Lexical retrieval through the document store's full-text index.
    pub bm25_enabled: bool,
    /// Cross-encoder reranking of fused candidates.
    pub rerank_enabled: bool,
    /// Scheduled promotion / decay passes.
    pub promotion_enabled: bool,
    /// Allow the embedding client to fall back to pseudo-vectors.
    pub graceful_degradation: bool,
    /// Tool calls may execute without per-call confirmation.
    pub autonomous_tools: bool,
    /// Per-call tool confirmation gate.
    pub tool_confirmation: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            memory_enabled: true,
            qdrant_enabled: true,
            bm25_enabled: true,
            rerank_enabled: true,
            promotion_enabled: true,
            graceful_degradation: true,
            autonomous_tools: false,
            tool_confirmation: true,
        }
    }
}

/// Reject dangerous flag combinations. Pure function: no I/O, no env reads.
/// Returns the list of violations (empty = valid).
pub fn validate_feature_flags(flags: &FeatureFlags) -> Vec<String> {
    let mut violations = Vec::new();

    if flags.autonomous_tools && !flags.tool_confirmation {
        violations.push(
            "autonomous_tools without tool_confirmation: unattended tool execution \
             with no approval gate is not allowed"
                .to_string(),
        );
    }
    if !flags.memory_enabled && flags.promotion_enabled {
        violations.push(
            "promotion_enabled requires memory_enabled: the scheduler would mutate \
             a disabled store"
                .to_string(),
        );
    }
    if !flags.qdrant_enabled && !flags.bm25_enabled {
        violations.push(
            "qdrant_enabled and bm25_enabled both off: no retrieval path remains"
                .to_string(),
        );
    }

    violations
}

// ═══════════════════════════════════════════════════════════════════════════
// EngineConfig
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub flags: FeatureFlags,

    // ── Retrieval ──────────────────────────────────────────────────
    /// Prefetch budget before inference (ms).
    pub prefetch_timeout_ms: u64,
    /// Overall search deadline (ms).
    pub search_timeout_ms: u64,
    /// Default result count.
    pub top_k: usize,
    /// Maximum candidates passed to the reranker.
    pub rerank_cap: usize,

    // ── Scoring ────────────────────────────────────────────────────
    pub initial_score: f64,
    pub positive_boost: f64,
    pub negative_penalty: f64,
    /// Daily multiplicative decay applied to quality_score.
    pub decay_per_day: f64,
    /// quality_score never decays below this floor.
    pub decay_floor: f64,
    /// Items under this quality for longer than the grace period archive.
    pub archive_threshold: f64,
    pub archive_grace_days: i64,
    /// working → history promotion gate.
    pub promote_threshold: f64,
    pub promote_min_uses: u64,
    /// history → patterns requires successes across this many conversations.
    pub promote_distinct_conversations: usize,
    /// Interval between scheduled decay/promotion passes (ms).
    pub scheduler_interval_ms: u64,

    // ── Embedding service ──────────────────────────────────────────
    pub embedding_url: String,
    pub embedding_dimension: usize,
    pub embedding_timeout_ms: u64,

    // ── NER service (optional; heuristic extractor used when absent) ─
    pub ner_url: Option<String>,
    pub ner_min_confidence: f64,

    // ── Vector index (Qdrant) ──────────────────────────────────────
    pub qdrant_host: String,
    pub qdrant_port: u16,
    pub qdrant_https: bool,
    pub qdrant_collection: String,
    pub qdrant_vector_size: usize,
    pub vector_timeout_ms: u64,

    // ── Reranker service ───────────────────────────────────────────
    pub reranker_url: Option<String>,
    pub rerank_timeout_ms: u64,

    // ── Lexical search ─────────────────────────────────────────────
    pub lexical_timeout_ms: u64,

    // ── MCP ────────────────────────────────────────────────────────
    pub forward_hf_user_token: bool,
    pub max_tool_iterations: u32,
    pub max_parallel_tools: usize,

    /// Deployment runs in production mode: invalid flags abort startup.
    pub production: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            flags: FeatureFlags::default(),
            prefetch_timeout_ms: 800,
            search_timeout_ms: 15_000,
            top_k: 10,
            rerank_cap: 50,
            initial_score: 0.5,
            positive_boost: 0.1,
            negative_penalty: 0.15,
            decay_per_day: 0.02,
            decay_floor: 0.05,
            archive_threshold: 0.15,
            archive_grace_days: 14,
            promote_threshold: 0.7,
            promote_min_uses: 3,
            promote_distinct_conversations: 3,
            scheduler_interval_ms: 6 * 60 * 60 * 1000,
            embedding_url: "http://127.0.0.1:8300".into(),
            embedding_dimension: 1024,
            embedding_timeout_ms: 2_000,
            ner_url: None,
            ner_min_confidence: 0.5,
            qdrant_host: "127.0.0.1".into(),
            qdrant_port: 6333,
            qdrant_https: false,
            qdrant_collection: "zikaron_memories".into(),
            qdrant_vector_size: 1024,
            vector_timeout_ms: 10_000,
            reranker_url: None,
            rerank_timeout_ms: 30_000,
            lexical_timeout_ms: 5_000,
            forward_hf_user_token: false,
            max_tool_iterations: 8,
            max_parallel_tools: 4,
            production: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    /// Fails fast in production when feature flags are invalid.
    pub fn from_env() -> EngineResult<Self> {
        let flags = FeatureFlags {
            memory_enabled: env_bool("MEMORY_SYSTEM_ENABLED", true),
            qdrant_enabled: env_bool("MEMORY_QDRANT_ENABLED", true),
            bm25_enabled: env_bool("MEMORY_BM25_ENABLED", true),
            rerank_enabled: env_bool("MEMORY_RERANK_ENABLED", true),
            promotion_enabled: env_bool("MEMORY_PROMOTION_ENABLED", true),
            graceful_degradation: env_bool("MEMORY_GRACEFUL_DEGRADATION", true),
            autonomous_tools: env_bool("MCP_AUTONOMOUS_TOOLS", false),
            tool_confirmation: env_bool("MCP_TOOL_CONFIRMATION", true),
        };

        let defaults = EngineConfig::default();
        let config = EngineConfig {
            flags,
            prefetch_timeout_ms: env_u64("MEMORY_PREFETCH_TIMEOUT_MS", defaults.prefetch_timeout_ms),
            search_timeout_ms: env_u64("MEMORY_SEARCH_TIMEOUT_MS", defaults.search_timeout_ms),
            top_k: env_usize("MEMORY_TOP_K", defaults.top_k),
            rerank_cap: env_usize("MEMORY_RERANK_CAP", defaults.rerank_cap),
            initial_score: env_f64("MEMORY_INITIAL_SCORE", defaults.initial_score),
            positive_boost: env_f64("MEMORY_POSITIVE_BOOST", defaults.positive_boost),
            negative_penalty: env_f64("MEMORY_NEGATIVE_PENALTY", defaults.negative_penalty),
            decay_per_day: env_f64("MEMORY_DECAY_PER_DAY", defaults.decay_per_day),
            decay_floor: env_f64("MEMORY_DECAY_FLOOR", defaults.decay_floor),
            archive_threshold: env_f64("MEMORY_ARCHIVE_THRESHOLD", defaults.archive_threshold),
            archive_grace_days: env_u64("MEMORY_ARCHIVE_GRACE_DAYS", defaults.archive_grace_days as u64) as i64,
            promote_threshold: env_f64("MEMORY_PROMOTE_THRESHOLD", defaults.promote_threshold),
            promote_min_uses: env_u64("MEMORY_PROMOTE_MIN_USES", defaults.promote_min_uses),
            promote_distinct_conversations: env_usize(
                "MEMORY_PROMOTE_DISTINCT_CONVERSATIONS",
                defaults.promote_distinct_conversations,
            ),
            scheduler_interval_ms: env_u64("MEMORY_SCHEDULER_INTERVAL_MS", defaults.scheduler_interval_ms),
            embedding_url: env_str("EMBEDDING_SERVICE_URL", &defaults.embedding_url),
            embedding_dimension: env_usize("EMBEDDING_DIMENSION", defaults.embedding_dimension),
            embedding_timeout_ms: env_u64("EMBEDDING_TIMEOUT_MS", defaults.embedding_timeout_ms),
            ner_url: env_opt("NER_SERVICE_URL"),
            ner_min_confidence: env_f64("NER_MIN_CONFIDENCE", defaults.ner_min_confidence),
            qdrant_host: env_str("QDRANT_HOST", &defaults.qdrant_host),
            qdrant_port: env_u64("QDRANT_PORT", defaults.qdrant_port as u64) as u16,
            qdrant_https: env_bool("QDRANT_HTTPS", false),
            qdrant_collection: env_str("QDRANT_COLLECTION", &defaults.qdrant_collection),
            qdrant_vector_size: env_usize("QDRANT_VECTOR_SIZE", defaults.qdrant_vector_size),
            vector_timeout_ms: env_u64("MEMORY_VECTOR_TIMEOUT_MS", defaults.vector_timeout_ms),
            reranker_url: env_opt("RERANKER_URL"),
            rerank_timeout_ms: env_u64("MEMORY_RERANK_TIMEOUT_MS", defaults.rerank_timeout_ms),
            lexical_timeout_ms: env_u64("MEMORY_LEXICAL_TIMEOUT_MS", defaults.lexical_timeout_ms),
            forward_hf_user_token: env_bool("MCP_FORWARD_HF_USER_TOKEN", false),
            max_tool_iterations: env_u64("MCP_MAX_TOOL_ITERATIONS", defaults.max_tool_iterations as u64) as u32,
            max_parallel_tools: env_usize("MCP_MAX_PARALLEL_TOOLS", defaults.max_parallel_tools),
            production: env_bool("ZIKARON_PRODUCTION", false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate flag combinations and structural constraints.
    /// In production, violations are fatal; otherwise they are logged.
    pub fn validate(&self) -> EngineResult<()> {
        let violations = validate_feature_flags(&self.flags);
        if !violations.is_empty() {
            if self.production {
                return Err(EngineError::Config(format!(
                    "rejected feature flags: {}",
                    violations.join("; ")
                )));
            }
            for v in &violations {
                warn!("[config] Feature flag violation (non-production): {}", v);
            }
        }

        if self.embedding_dimension != self.qdrant_vector_size {
            return Err(EngineError::Config(format!(
                "EMBEDDING_DIMENSION ({}) != QDRANT_VECTOR_SIZE ({}): writes would be rejected at upsert",
                self.embedding_dimension, self.qdrant_vector_size
            )));
        }
        if self.top_k == 0 {
            return Err(EngineError::Config("MEMORY_TOP_K must be >= 1".into()));
        }

        info!(
            "[config] Loaded: memory={} qdrant={} bm25={} rerank={} dim={} top_k={}",
            self.flags.memory_enabled,
            self.flags.qdrant_enabled,
            self.flags.bm25_enabled,
            self.flags.rerank_enabled,
            self.embedding_dimension,
            self.top_k,
        );
        Ok(())
    }

    /// Qdrant base URL assembled from host/port/https.
    pub fn qdrant_base_url(&self) -> String {
        let scheme = if self.qdrant_https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.qdrant_host, self.qdrant_port)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Environment variable substitution (servers.json `${VAR}` patterns)
// ═══════════════════════════════════════════════════════════════════════════

/// Expand `${VAR}` patterns from the given environment map.
/// Unknown variables expand to the empty string (and are logged once).
pub fn expand_env_vars(input: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match env.get(name) {
                    Some(val) => out.push_str(val),
                    None => {
                        warn!("[config] Unknown env var in substitution: ${{{}}}", name);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated `${` — keep literally.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Capture the process environment as a map for substitution.
pub fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags_are_valid() {
        assert!(validate_feature_flags(&FeatureFlags::default()).is_empty());
    }

    #[test]
    fn test_autonomy_without_confirmation_rejected() {
        let flags = FeatureFlags {
            autonomous_tools: true,
            tool_confirmation: false,
            ..Default::default()
        };
        let violations = validate_feature_flags(&flags);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("autonomous_tools"));
    }

    #[test]
    fn test_no_retrieval_path_rejected() {
        let flags = FeatureFlags {
            qdrant_enabled: false,
            bm25_enabled: false,
            ..Default::default()
        };
        assert!(!validate_feature_flags(&flags).is_empty());
    }

    #[test]
    fn test_dimension_mismatch_fails_validation() {
        let config = EngineConfig {
            embedding_dimension: 768,
            qdrant_vector_size: 1024,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_production_rejects_violations() {
        let config = EngineConfig {
            production: true,
            flags: FeatureFlags {
                autonomous_tools: true,
                tool_confirmation: false,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "abc123".to_string());
        assert_eq!(expand_env_vars("Bearer ${TOKEN}", &env), "Bearer abc123");
        assert_eq!(expand_env_vars("no vars here", &env), "no vars here");
        assert_eq!(expand_env_vars("${MISSING}!", &env), "!");
        assert_eq!(expand_env_vars("${UNTERMINATED", &env), "${UNTERMINATED");
        assert_eq!(expand_env_vars("${TOKEN}${TOKEN}", &env), "abc123abc123");
    }

    #[test]
    fn test_qdrant_base_url() {
        let config = EngineConfig::default();
        assert_eq!(config.qdrant_base_url(), "http://127.0.0.1:6333");
        let https = EngineConfig { qdrant_https: true, ..Default::default() };
        assert!(https.qdrant_base_url().starts_with("https://"));
    }
}
