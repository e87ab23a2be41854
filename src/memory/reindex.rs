// ── Memory Engine: Deferred Reindexer ──────────────────────────────────────
//
// Background reconciliation of items left without vectors: scans
// `needs_reindex` in batches of 50, embeds (strict — never pseudo-vectors),
// upserts into the vector index, clears the flag.
//
// Pausable; progress survives restarts through `reindex_checkpoints`.
// Sanitize mode strips base64/binary artifacts from item text before
// embedding. When the embedding client is unhealthy the reindexer refuses
// to start and hands back a recovery checklist.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::now_iso;
use crate::memory::embedding::EmbeddingClient;
use crate::memory::store::MemoryStore;
use crate::memory::vector_index::{VectorIndexAdapter, VectorPoint};
use log::{info, warn};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::params;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

/// Items per scan batch.
const BATCH_SIZE: usize = 50;

/// Checkpoint row id (a single global cursor).
const CHECKPOINT_ID: &str = "deferred";

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReindexReport {
    pub processed: u64,
    pub failed: u64,
    pub sanitized: u64,
    pub duration_ms: u64,
    /// Set when the run stopped before draining the queue (pause, circuit).
    pub stopped_early: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReindexProgress {
    pub running: bool,
    pub paused: bool,
    pub processed: u64,
    pub failed: u64,
    pub sanitized: u64,
    pub remaining: u64,
}

/// Steps an operator should take before retrying a refused run.
pub fn recovery_checklist() -> Vec<&'static str> {
    vec![
        "check the embedding service is reachable at EMBEDDING_SERVICE_URL",
        "reset the embedding circuit breaker (POST /memory/ops/circuit-breaker)",
        "exit degraded mode if it was entered manually",
        "verify EMBEDDING_DIMENSION matches the deployed model",
        "re-run the deferred reindex (POST /memory/ops/reindex/deferred)",
    ]
}

pub struct DeferredReindexer {
    store: Arc<MemoryStore>,
    embedding: Arc<EmbeddingClient>,
    vector_index: Arc<VectorIndexAdapter>,
    paused: AtomicBool,
    running: AtomicBool,
    progress: Mutex<ReindexProgress>,
}

impl DeferredReindexer {
    pub fn new(
        store: Arc<MemoryStore>,
        embedding: Arc<EmbeddingClient>,
        vector_index: Arc<VectorIndexAdapter>,
    ) -> Self {
        DeferredReindexer {
            store,
            embedding,
            vector_index,
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            progress: Mutex::new(ReindexProgress::default()),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("[memory] Reindexer paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("[memory] Reindexer resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> ReindexProgress {
        let mut p = self.progress.lock().clone();
        p.running = self.running.load(Ordering::SeqCst);
        p.paused = self.is_paused();
        p.remaining = self
            .store
            .find_needs_reindex(None, BATCH_SIZE)
            .map(|items| items.len() as u64)
            .unwrap_or(0);
        p
    }

    /// Drain the needs-reindex queue. Running twice on a steady state
    /// yields `processed = 0` on the second run.
    pub async fn run_once(&self, sanitize: bool) -> EngineResult<ReindexReport> {
        // Health gate: an open circuit or degraded mode means every embed
        // would fail or lie. Refuse and tell the operator what to fix.
        if self.embedding.is_circuit_open() || self.embedding.is_degraded() {
            return Err(EngineError::ServiceDown(format!(
                "reindexer refused to start (embedding unhealthy). Recovery: {}",
                recovery_checklist().join("; ")
            )));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Validation("reindexer already running".into()));
        }

        let started = Instant::now();
        let mut report = ReindexReport::default();
        *self.progress.lock() = ReindexProgress::default();

        'outer: loop {
            if self.is_paused() {
                report.stopped_early = true;
                break;
            }
            let batch = self.store.find_needs_reindex(None, BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }

            // Items that keep failing stay flagged; avoid spinning on them
            // within one run by tracking whether this batch made progress.
            let mut batch_progress = false;

            for mut item in batch {
                if self.is_paused() {
                    report.stopped_early = true;
                    break 'outer;
                }
                if self.embedding.is_circuit_open() {
                    warn!("[memory] Reindex aborted mid-run: embedding circuit opened");
                    report.stopped_early = true;
                    break 'outer;
                }

                if sanitize {
                    let cleaned = sanitize_text(&item.text);
                    if cleaned != item.text {
                        item.text = cleaned;
                        item.embedding.needs_reindex = true;
                        if let Err(e) = self.store.update_item(&item) {
                            warn!("[memory] Sanitize update failed for {}: {}", item.memory_id, e);
                        } else {
                            report.sanitized += 1;
                        }
                    }
                }

                match self.embedding.embed_strict(&item.text).await {
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
                                self.clear_flag(&item.user_id, &item.memory_id, vector.len())?;
                                report.processed += 1;
                                batch_progress = true;
                            }
                            Err(e) => {
                                warn!(
                                    "[memory] Vector upsert failed for {}: {}",
                                    item.memory_id, e
                                );
                                report.failed += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("[memory] Embed failed for {}: {}", item.memory_id, e);
                        report.failed += 1;
                    }
                }

                let mut p = self.progress.lock();
                p.processed = report.processed;
                p.failed = report.failed;
                p.sanitized = report.sanitized;
            }

            self.write_checkpoint(&report)?;
            if !batch_progress {
                // Nothing in this batch succeeded; the queue will return
                // the same rows forever. Stop and let the operator look.
                report.stopped_early = true;
                break;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.write_checkpoint(&report)?;
        self.running.store(false, Ordering::SeqCst);
        info!(
            "[memory] Reindex run: processed={} failed={} sanitized={} in {}ms",
            report.processed, report.failed, report.sanitized, report.duration_ms
        );
        Ok(report)
    }

    fn clear_flag(&self, user_id: &str, memory_id: &str, dims: usize) -> EngineResult<()> {
        let conn = self.store.conn.lock();
        conn.execute(
            "UPDATE memory_items SET needs_reindex = 0, indexed_at = ?3,
                    embedding_dimensions = ?4, updated_at = ?3
             WHERE user_id = ?1 AND memory_id = ?2",
            params![user_id, memory_id, now_iso(), dims as i64],
        )?;
        Ok(())
    }

    fn write_checkpoint(&self, report: &ReindexReport) -> EngineResult<()> {
        let conn = self.store.conn.lock();
        conn.execute(
            "INSERT INTO reindex_checkpoints (id, processed, failed, sanitized, paused, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                processed = excluded.processed,
                failed = excluded.failed,
                sanitized = excluded.sanitized,
                paused = excluded.paused,
                updated_at = excluded.updated_at",
            params![
                CHECKPOINT_ID,
                report.processed as i64,
                report.failed as i64,
                report.sanitized as i64,
                self.is_paused() as i64,
                now_iso()
            ],
        )?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sanitization
// ═══════════════════════════════════════════════════════════════════════════

/// Base64 data URIs embedded in text (images pasted into chat, etc.).
static DATA_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:[A-Za-z0-9.+/-]+;base64,[A-Za-z0-9+/=]+").expect("data-uri regex")
});

/// Long bare base64 runs — nothing a human wrote looks like this.
static BASE64_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/]{120,}={0,2}").expect("base64 regex"));

/// Strip binary/base64 artifacts so they never pollute embeddings.
/// Control characters (except newline/tab) are dropped too.
pub fn sanitize_text(text: &str) -> String {
    let without_uris = DATA_URI.replace_all(text, "[binary removed]");
    let without_runs = BASE64_RUN.replace_all(&without_uris, "[binary removed]");
    let cleaned: String = without_runs
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    // Collapse the whitespace the removals leave behind.
    cleaned
        .split(' ')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{MemoryItem, Tier};
    use crate::config::EngineConfig;

    fn offline_parts() -> (Arc<MemoryStore>, Arc<EmbeddingClient>, Arc<VectorIndexAdapter>) {
        let config = EngineConfig {
            embedding_url: "http://127.0.0.1:1".into(),
            qdrant_host: "127.0.0.1".into(),
            qdrant_port: 1,
            embedding_timeout_ms: 100,
            vector_timeout_ms: 100,
            embedding_dimension: 16,
            qdrant_vector_size: 16,
            ..Default::default()
        };
        (
            Arc::new(MemoryStore::open_in_memory().unwrap()),
            Arc::new(EmbeddingClient::new(&config)),
            Arc::new(VectorIndexAdapter::new(&config)),
        )
    }

    #[test]
    fn test_sanitize_strips_data_uri() {
        let text = "see the chart data:image/png;base64,iVBORw0KGgoAAAANSUhEUg and more text";
        let cleaned = sanitize_text(text);
        assert!(!cleaned.contains("base64,"));
        assert!(cleaned.contains("see the chart"));
        assert!(cleaned.contains("and more text"));
    }

    #[test]
    fn test_sanitize_strips_long_base64_runs() {
        let blob: String = "QUJDREVGR0hJ".repeat(20); // > 120 chars
        let text = format!("prefix {blob} suffix");
        let cleaned = sanitize_text(&text);
        assert!(cleaned.contains("prefix"));
        assert!(cleaned.contains("suffix"));
        assert!(cleaned.contains("[binary removed]"));
        assert!(cleaned.len() < text.len());
    }

    #[test]
    fn test_sanitize_keeps_normal_text() {
        let text = "ordinary sentence with a URL http://example.com and עברית";
        assert_eq!(sanitize_text(text), text);
    }

    #[test]
    fn test_sanitize_drops_control_chars() {
        let cleaned = sanitize_text("a\u{0000}b\u{0007}c\nd");
        assert_eq!(cleaned, "abc\nd");
    }

    #[tokio::test]
    async fn test_refuses_when_degraded() {
        let (store, embedding, vector_index) = offline_parts();
        embedding.enter_degraded();
        let reindexer = DeferredReindexer::new(store, embedding, vector_index);
        let err = reindexer.run_once(false).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("refused"));
        assert!(msg.contains("EMBEDDING_SERVICE_URL"), "must carry the recovery checklist");
    }

    #[tokio::test]
    async fn test_empty_queue_reports_zero() {
        let (store, embedding, vector_index) = offline_parts();
        let reindexer = DeferredReindexer::new(store, embedding, vector_index);
        let report = reindexer.run_once(false).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 0);
        assert!(!report.stopped_early);
    }

    #[tokio::test]
    async fn test_dead_service_leaves_items_flagged() {
        let (store, embedding, vector_index) = offline_parts();
        let item = MemoryItem::new("u1", Tier::Working, "needs a vector");
        store.insert_item(&item).unwrap();

        let reindexer = DeferredReindexer::new(store.clone(), embedding, vector_index);
        let report = reindexer.run_once(false).await.unwrap();
        assert_eq!(report.processed, 0);
        assert!(report.failed >= 1);
        assert!(report.stopped_early, "no-progress batch must stop the run");

        let got = store.get_item("u1", &item.memory_id).unwrap().unwrap();
        assert!(got.embedding.needs_reindex, "failed embed must not clear the flag");
    }

    #[tokio::test]
    async fn test_pause_prevents_processing() {
        let (store, embedding, vector_index) = offline_parts();
        store.insert_item(&MemoryItem::new("u1", Tier::Working, "pending")).unwrap();
        let reindexer = DeferredReindexer::new(store, embedding, vector_index);
        reindexer.pause();
        let report = reindexer.run_once(false).await.unwrap();
        assert_eq!(report.processed + report.failed, 0);
        assert!(report.stopped_early);
        reindexer.resume();
        assert!(!reindexer.is_paused());
    }

    #[tokio::test]
    async fn test_sanitize_mode_rewrites_dirty_items() {
        let (store, embedding, vector_index) = offline_parts();
        let blob: String = "QUJDREVGR0hJ".repeat(20);
        let item = MemoryItem::new("u1", Tier::Working, &format!("note {blob}"));
        store.insert_item(&item).unwrap();

        let reindexer = DeferredReindexer::new(store.clone(), embedding, vector_index);
        let report = reindexer.run_once(true).await.unwrap();
        assert_eq!(report.sanitized, 1);

        let got = store.get_item("u1", &item.memory_id).unwrap().unwrap();
        assert!(!got.text.contains(&blob));
        assert!(got.embedding.needs_reindex, "sanitized item stays flagged until embedded");
    }

    #[test]
    fn test_recovery_checklist_is_actionable() {
        let steps = recovery_checklist();
        assert!(steps.len() >= 3);
        assert!(steps.iter().any(|s| s.contains("circuit")));
    }
}
