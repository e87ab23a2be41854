// ── Memory Engine: Document Store ──────────────────────────────────────────
//
// Canonical persistence for memory items, outcomes, and the knowledge graph,
// plus the engine's lexical search (FTS5 BM25) over item text.
//
// Thread-safe via an internal Mutex'd SQLite connection. All scoring updates
// go through single-row UPDATE statements so counts never regress; no
// cross-table transactions are required outside the KG writer.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    now_iso, EmbeddingInfo, MemoryItem, MemorySource, MemoryStats, MemoryStatus, Outcome, Tier,
};
use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;

/// Thread-safe document store wrapper.
pub struct MemoryStore {
    /// The SQLite connection, protected by a Mutex.
    /// `pub(crate)` so sibling modules (knowledge graph, scorer) can run
    /// their own statements against the same connection.
    pub(crate) conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(path: &Path) -> EngineResult<Self> {
        info!("[memory] Opening document store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        super::schema::run_migrations(&conn)?;
        let store = MemoryStore { conn: Mutex::new(conn) };
        store.backfill_legacy_stats()?;
        Ok(store)
    }

    /// In-memory store for tests and ephemeral sessions.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::run_migrations(&conn)?;
        Ok(MemoryStore { conn: Mutex::new(conn) })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Item CRUD
    // ═══════════════════════════════════════════════════════════════════

    /// Insert a memory item. Fails on duplicate memory_id.
    pub fn insert_item(&self, item: &MemoryItem) -> EngineResult<()> {
        self.validate_item(item)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_items (
                memory_id, user_id, org_id, tier, status,
                text, summary, tags, entities, language,
                source_json, document_hash,
                importance, confidence, quality_score, recency_score,
                uses, last_used_at,
                worked_count, failed_count, partial_count, success_count,
                success_rate, wilson_score,
                embedding_model, embedding_dimensions, indexed_at, needs_reindex,
                current_version, supersedes_memory_id,
                created_at, updated_at, archived_at, expires_at, last_decay_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9, ?10,
                ?11, ?12,
                ?13, ?14, ?15, ?16,
                ?17, ?18,
                ?19, ?20, ?21, ?22,
                ?23, ?24,
                ?25, ?26, ?27, ?28,
                ?29, ?30,
                ?31, ?32, ?33, ?34, ?35
            )",
            params![
                item.memory_id,
                item.user_id,
                item.org_id,
                item.tier.as_str(),
                item.status.as_str(),
                item.text,
                item.summary,
                serde_json::to_string(&item.tags)?,
                serde_json::to_string(&item.entities)?,
                item.language,
                serde_json::to_string(&item.source)?,
                item.document_hash,
                item.importance,
                item.confidence,
                item.quality_score,
                item.recency_score,
                item.stats.uses as i64,
                item.stats.last_used_at,
                item.stats.worked_count as i64,
                item.stats.failed_count as i64,
                item.stats.partial_count as i64,
                item.stats.success_count as i64,
                item.stats.success_rate,
                item.stats.wilson_score,
                item.embedding.model,
                item.embedding.dimensions.map(|d| d as i64),
                item.embedding.indexed_at,
                item.embedding.needs_reindex as i64,
                item.current_version as i64,
                item.supersedes_memory_id,
                item.created_at,
                item.updated_at,
                item.archived_at,
                item.expires_at,
                item.last_decay_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch an item by id, scoped to its owner. Soft-deleted rows are
    /// returned too (callers filter on status where it matters).
    pub fn get_item(&self, user_id: &str, memory_id: &str) -> EngineResult<Option<MemoryItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM memory_items WHERE user_id = ?1 AND memory_id = ?2"
        ))?;
        let mut rows = stmt.query_map(params![user_id, memory_id], item_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Replace the full row for an item, stamping `updated_at` and snapshotting
    /// the previous version into `memory_versions`.
    pub fn update_item(&self, item: &MemoryItem) -> EngineResult<()> {
        self.validate_item(item)?;
        let previous = self
            .get_item(&item.user_id, &item.memory_id)?
            .ok_or_else(|| EngineError::NotFound(format!("memory {}", item.memory_id)))?;
        self.snapshot_version(&previous)?;

        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE memory_items SET
                org_id = ?3, tier = ?4, status = ?5,
                text = ?6, summary = ?7, tags = ?8, entities = ?9, language = ?10,
                source_json = ?11, document_hash = ?12,
                importance = ?13, confidence = ?14, quality_score = ?15, recency_score = ?16,
                embedding_model = ?17, embedding_dimensions = ?18, indexed_at = ?19,
                needs_reindex = ?20,
                current_version = ?21, supersedes_memory_id = ?22,
                updated_at = ?23, archived_at = ?24, expires_at = ?25, last_decay_at = ?26
             WHERE user_id = ?1 AND memory_id = ?2",
            params![
                item.user_id,
                item.memory_id,
                item.org_id,
                item.tier.as_str(),
                item.status.as_str(),
                item.text,
                item.summary,
                serde_json::to_string(&item.tags)?,
                serde_json::to_string(&item.entities)?,
                item.language,
                serde_json::to_string(&item.source)?,
                item.document_hash,
                item.importance,
                item.confidence,
                item.quality_score,
                item.recency_score,
                item.embedding.model,
                item.embedding.dimensions.map(|d| d as i64),
                item.embedding.indexed_at,
                item.embedding.needs_reindex as i64,
                item.current_version as i64,
                item.supersedes_memory_id,
                now_iso(),
                item.archived_at,
                item.expires_at,
                item.last_decay_at,
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::NotFound(format!("memory {}", item.memory_id)));
        }
        Ok(())
    }

    /// Soft-delete: flips status without removing the row or its outcomes.
    pub fn soft_delete(&self, user_id: &str, memory_id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE memory_items SET status = 'deleted', updated_at = ?3
             WHERE user_id = ?1 AND memory_id = ?2 AND status != 'deleted'",
            params![user_id, memory_id, now_iso()],
        )?;
        Ok(changed > 0)
    }

    /// Snapshot an item's current state before a destructive update.
    fn snapshot_version(&self, item: &MemoryItem) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO memory_versions (memory_id, version, snapshot_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                item.memory_id,
                item.current_version as i64,
                serde_json::to_string(item)?,
                now_iso()
            ],
        )?;
        Ok(())
    }

    /// Invariant checks applied on every write.
    fn validate_item(&self, item: &MemoryItem) -> EngineResult<()> {
        if item.status == MemoryStatus::Archived && item.archived_at.is_none() {
            return Err(EngineError::Validation(
                "archived item must carry archived_at".into(),
            ));
        }
        if !(0.0..=1.0).contains(&item.stats.wilson_score) {
            return Err(EngineError::Validation(format!(
                "wilson_score out of range: {}",
                item.stats.wilson_score
            )));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Lexical search (FTS5 / BM25)
    // ═══════════════════════════════════════════════════════════════════

    /// BM25 keyword search over active items, scoped by user and tiers.
    /// Returns (item, lexical_score) pairs, best first. Scores are the
    /// negated FTS5 rank so larger is better.
    pub fn text_search(
        &self,
        user_id: &str,
        tiers: &[Tier],
        query: &str,
        limit: usize,
    ) -> EngineResult<Vec<(MemoryItem, f64)>> {
        let match_expr = fts_match_expr(query);
        if match_expr.is_empty() {
            return Ok(vec![]);
        }

        let tier_filter = tier_in_clause(tiers);
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {ITEM_COLUMNS}, -memory_items_fts.rank AS lex_score
             FROM memory_items_fts
             JOIN memory_items ON memory_items.rowid = memory_items_fts.rowid
             WHERE memory_items_fts MATCH ?1
               AND memory_items.user_id = ?2
               AND memory_items.status = 'active'
               {tier_filter}
             ORDER BY memory_items_fts.rank
             LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![match_expr, user_id, limit as i64], |row| {
            let item = item_from_row(row)?;
            let score: f64 = row.get("lex_score")?;
            Ok((item, score))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    /// Count documents for a user, optionally scoped to a tier and status.
    pub fn count_documents(
        &self,
        user_id: &str,
        tier: Option<&Tier>,
        status: Option<MemoryStatus>,
    ) -> EngineResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = match (tier, status) {
            (Some(t), Some(s)) => conn.query_row(
                "SELECT COUNT(*) FROM memory_items WHERE user_id=?1 AND tier=?2 AND status=?3",
                params![user_id, t.as_str(), s.as_str()],
                |r| r.get(0),
            )?,
            (Some(t), None) => conn.query_row(
                "SELECT COUNT(*) FROM memory_items WHERE user_id=?1 AND tier=?2",
                params![user_id, t.as_str()],
                |r| r.get(0),
            )?,
            (None, Some(s)) => conn.query_row(
                "SELECT COUNT(*) FROM memory_items WHERE user_id=?1 AND status=?2",
                params![user_id, s.as_str()],
                |r| r.get(0),
            )?,
            (None, None) => conn.query_row(
                "SELECT COUNT(*) FROM memory_items WHERE user_id=?1",
                params![user_id],
                |r| r.get(0),
            )?,
        };
        Ok(count as u64)
    }

    /// Items still awaiting a vector, oldest first. `user_id = None` scans
    /// every user (the background reindexer path).
    pub fn find_needs_reindex(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<MemoryItem>> {
        let conn = self.conn.lock();
        let sql_user = format!(
            "SELECT {ITEM_COLUMNS} FROM memory_items
             WHERE needs_reindex = 1 AND status = 'active' AND user_id = ?1
             ORDER BY updated_at ASC LIMIT ?2"
        );
        let sql_all = format!(
            "SELECT {ITEM_COLUMNS} FROM memory_items
             WHERE needs_reindex = 1 AND status = 'active'
             ORDER BY updated_at ASC LIMIT ?1"
        );
        let items = match user_id {
            Some(uid) => {
                let mut stmt = conn.prepare(&sql_user)?;
                let rows = stmt.query_map(params![uid, limit as i64], item_from_row)?;
                rows.filter_map(|r| r.ok()).collect()
            }
            None => {
                let mut stmt = conn.prepare(&sql_all)?;
                let rows = stmt.query_map(params![limit as i64], item_from_row)?;
                rows.filter_map(|r| r.ok()).collect()
            }
        };
        Ok(items)
    }

    /// Look up a non-deleted item by its content hash, same-user scope only.
    pub fn get_document_by_hash(
        &self,
        user_id: &str,
        sha256: &str,
    ) -> EngineResult<Option<MemoryItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM memory_items
             WHERE user_id = ?1 AND document_hash = ?2 AND status != 'deleted'
             LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![user_id, sha256], item_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Page through a user's items (hook search pagination, memory-bank views).
    pub fn list_items(
        &self,
        user_id: &str,
        tier: Option<&Tier>,
        status: Option<MemoryStatus>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<MemoryItem>> {
        let conn = self.conn.lock();
        let mut filters = vec!["user_id = ?1".to_string()];
        if tier.is_some() {
            filters.push("tier = ?2".to_string());
        }
        if status.is_some() {
            filters.push(format!("status = ?{}", if tier.is_some() { 3 } else { 2 }));
        }
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM memory_items WHERE {}
             ORDER BY updated_at DESC LIMIT {} OFFSET {}",
            filters.join(" AND "),
            limit,
            offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = match (tier, status) {
            (Some(t), Some(s)) => {
                let rows = stmt.query_map(params![user_id, t.as_str(), s.as_str()], item_from_row)?;
                rows.filter_map(|r| r.ok()).collect()
            }
            (Some(t), None) => {
                let rows = stmt.query_map(params![user_id, t.as_str()], item_from_row)?;
                rows.filter_map(|r| r.ok()).collect()
            }
            (None, Some(s)) => {
                let rows = stmt.query_map(params![user_id, s.as_str()], item_from_row)?;
                rows.filter_map(|r| r.ok()).collect()
            }
            (None, None) => {
                let rows = stmt.query_map(params![user_id], item_from_row)?;
                rows.filter_map(|r| r.ok()).collect()
            }
        };
        Ok(items)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Outcomes & response feedback
    // ═══════════════════════════════════════════════════════════════════

    /// Append an outcome event. Outcomes are never deleted.
    pub fn insert_outcome(&self, outcome: &Outcome) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_outcomes (user_id, memory_id, score, conversation_id, message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                outcome.user_id,
                outcome.memory_id,
                outcome.score as i64,
                outcome.conversation_id,
                outcome.message_id,
                outcome.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn outcomes_for(&self, user_id: &str, memory_id: &str) -> EngineResult<Vec<Outcome>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, memory_id, score, conversation_id, message_id, created_at
             FROM memory_outcomes WHERE user_id = ?1 AND memory_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id, memory_id], |row| {
            Ok(Outcome {
                user_id: row.get(0)?,
                memory_id: row.get(1)?,
                score: row.get::<_, i64>(2)? as i8,
                conversation_id: row.get(3)?,
                message_id: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Number of distinct conversations with a positive outcome for an item.
    /// Drives the history → patterns promotion gate.
    pub fn distinct_positive_conversations(
        &self,
        user_id: &str,
        memory_id: &str,
    ) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT conversation_id) FROM memory_outcomes
             WHERE user_id = ?1 AND memory_id = ?2 AND score = 1 AND conversation_id IS NOT NULL",
            params![user_id, memory_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Record aggregate response-level feedback (kept separate from item stats).
    pub fn insert_response_feedback(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        message_id: Option<&str>,
        score: i8,
        feedback: Option<&str>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO response_feedback (user_id, conversation_id, message_id, score, feedback, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_id, conversation_id, message_id, score as i64, feedback, now_iso()],
        )?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Stats & maintenance
    // ═══════════════════════════════════════════════════════════════════

    /// Per-tier counts and success rates for the stats surface.
    pub fn tier_stats(&self, user_id: &str) -> EngineResult<Vec<TierStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tier,
                    SUM(CASE WHEN status='active' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status='archived' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN needs_reindex=1 AND status='active' THEN 1 ELSE 0 END),
                    AVG(success_rate),
                    AVG(wilson_score)
             FROM memory_items WHERE user_id = ?1 GROUP BY tier ORDER BY tier",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(TierStats {
                tier: row.get::<_, String>(0)?,
                active: row.get::<_, i64>(1)? as u64,
                archived: row.get::<_, i64>(2)? as u64,
                needs_reindex: row.get::<_, i64>(3)? as u64,
                avg_success_rate: row.get::<_, Option<f64>>(4)?.unwrap_or(0.5),
                avg_wilson_score: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Backfill stats/embedding columns for rows written by older builds.
    /// Idempotent: only touches rows where the defaults are missing.
    pub fn backfill_legacy_stats(&self) -> EngineResult<()> {
        let conn = self.conn.lock();
        let fixed = conn.execute(
            "UPDATE memory_items SET success_rate = 0.5 WHERE success_rate IS NULL",
            [],
        )? + conn.execute(
            "UPDATE memory_items SET wilson_score = 0.0 WHERE wilson_score IS NULL",
            [],
        )? + conn.execute(
            "UPDATE memory_items SET needs_reindex = 1
             WHERE needs_reindex IS NULL OR (indexed_at IS NULL AND needs_reindex = 0)",
            [],
        )?;
        if fixed > 0 {
            warn!("[memory] Backfilled {} legacy stat fields", fixed);
        }
        Ok(())
    }
}

/// Per-tier summary row for the stats surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TierStats {
    pub tier: String,
    pub active: u64,
    pub archived: u64,
    pub needs_reindex: u64,
    pub avg_success_rate: f64,
    pub avg_wilson_score: f64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

/// Column list shared by every SELECT that maps to MemoryItem.
/// Keep in sync with `item_from_row` positions.
const ITEM_COLUMNS: &str = "memory_items.memory_id, memory_items.user_id, memory_items.org_id, \
    memory_items.tier, memory_items.status, memory_items.text, memory_items.summary, \
    memory_items.tags, memory_items.entities, memory_items.language, memory_items.source_json, \
    memory_items.document_hash, memory_items.importance, memory_items.confidence, \
    memory_items.quality_score, memory_items.recency_score, memory_items.uses, \
    memory_items.last_used_at, memory_items.worked_count, memory_items.failed_count, \
    memory_items.partial_count, memory_items.success_count, memory_items.success_rate, \
    memory_items.wilson_score, memory_items.embedding_model, memory_items.embedding_dimensions, \
    memory_items.indexed_at, memory_items.needs_reindex, memory_items.current_version, \
    memory_items.supersedes_memory_id, memory_items.created_at, memory_items.updated_at, \
    memory_items.archived_at, memory_items.expires_at, memory_items.last_decay_at";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryItem> {
    let tier_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let tags_json: String = row.get(7)?;
    let entities_json: String = row.get(8)?;
    let source_json: String = row.get(10)?;

    Ok(MemoryItem {
        memory_id: row.get(0)?,
        user_id: row.get(1)?,
        org_id: row.get(2)?,
        tier: Tier::parse(&tier_str).unwrap_or(Tier::Working),
        status: MemoryStatus::parse(&status_str).unwrap_or(MemoryStatus::Active),
        text: row.get(5)?,
        summary: row.get(6)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        entities: serde_json::from_str(&entities_json).unwrap_or_default(),
        language: row.get(9)?,
        source: serde_json::from_str::<MemorySource>(&source_json).unwrap_or_default(),
        document_hash: row.get(11)?,
        importance: row.get(12)?,
        confidence: row.get(13)?,
        quality_score: row.get(14)?,
        recency_score: row.get(15)?,
        stats: MemoryStats {
            uses: row.get::<_, i64>(16)? as u64,
            last_used_at: row.get(17)?,
            worked_count: row.get::<_, i64>(18)? as u64,
            failed_count: row.get::<_, i64>(19)? as u64,
            partial_count: row.get::<_, i64>(20)? as u64,
            success_count: row.get::<_, i64>(21)? as u64,
            success_rate: row.get(22)?,
            wilson_score: row.get(23)?,
        },
        embedding: EmbeddingInfo {
            model: row.get(24)?,
            dimensions: row.get::<_, Option<i64>>(25)?.map(|d| d as usize),
            indexed_at: row.get(26)?,
            needs_reindex: row.get::<_, i64>(27)? != 0,
        },
        current_version: row.get::<_, i64>(28)? as u32,
        supersedes_memory_id: row.get(29)?,
        created_at: row.get(30)?,
        updated_at: row.get(31)?,
        archived_at: row.get(32)?,
        expires_at: row.get(33)?,
        last_decay_at: row.get(34)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// FTS helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Build a safe FTS5 MATCH expression: each token quoted, OR-joined so
/// partial matches still rank (BM25 rewards multi-token hits).
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .filter(|t| !t.is_empty())
        .take(32)
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .filter(|t| t.len() > 2) // drop tokens that were only quotes
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// SQL fragment restricting results to the given tiers (empty = all tiers).
/// Tier names are quoted-escaped: `datagov_*` suffixes arrive from requests.
fn tier_in_clause(tiers: &[Tier]) -> String {
    if tiers.is_empty() {
        return String::new();
    }
    let quoted: Vec<String> = tiers
        .iter()
        .map(|t| format!("'{}'", t.as_str().replace('\'', "''")))
        .collect();
    format!("AND memory_items.tier IN ({})", quoted.join(","))
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    fn item(user: &str, tier: Tier, text: &str) -> MemoryItem {
        MemoryItem::new(user, tier, text)
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let s = store();
        let mut m = item("u1", Tier::MemoryBank, "My name is Avi.");
        m.tags = vec!["identity".into()];
        m.document_hash = "abc".into();
        s.insert_item(&m).unwrap();

        let got = s.get_item("u1", &m.memory_id).unwrap().unwrap();
        assert_eq!(got.text, "My name is Avi.");
        assert_eq!(got.tier, Tier::MemoryBank);
        assert_eq!(got.tags, vec!["identity".to_string()]);
        assert!(got.embedding.needs_reindex);

        // Wrong user sees nothing
        assert!(s.get_item("u2", &m.memory_id).unwrap().is_none());
    }

    #[test]
    fn test_text_search_ranks_exact_match_first() {
        let s = store();
        s.insert_item(&item("u1", Tier::Working, "the deployment pipeline uses docker")).unwrap();
        s.insert_item(&item("u1", Tier::Working, "docker compose configuration for tests")).unwrap();
        s.insert_item(&item("u1", Tier::Working, "unrelated note about lunch")).unwrap();

        let hits = s.text_search("u1", &[], "deployment pipeline docker", 10).unwrap();
        assert!(hits.len() >= 2);
        assert!(hits[0].0.text.contains("deployment pipeline"));
        assert!(hits[0].1 >= hits[1].1);
    }

    #[test]
    fn test_text_search_scopes_user_and_tier() {
        let s = store();
        s.insert_item(&item("u1", Tier::Working, "shared phrase alpha")).unwrap();
        s.insert_item(&item("u2", Tier::Working, "shared phrase alpha")).unwrap();
        s.insert_item(&item("u1", Tier::Books, "shared phrase alpha")).unwrap();

        let all = s.text_search("u1", &[], "alpha", 10).unwrap();
        assert_eq!(all.len(), 2);

        let books_only = s.text_search("u1", &[Tier::Books], "alpha", 10).unwrap();
        assert_eq!(books_only.len(), 1);
        assert_eq!(books_only[0].0.tier, Tier::Books);
    }

    #[test]
    fn test_text_search_excludes_non_active() {
        let s = store();
        let mut m = item("u1", Tier::Working, "findable content here");
        s.insert_item(&m).unwrap();
        assert_eq!(s.text_search("u1", &[], "findable", 10).unwrap().len(), 1);

        m.status = MemoryStatus::Archived;
        m.archived_at = Some(now_iso());
        s.update_item(&m).unwrap();
        assert!(s.text_search("u1", &[], "findable", 10).unwrap().is_empty());
    }

    #[test]
    fn test_archived_requires_archived_at() {
        let s = store();
        let mut m = item("u1", Tier::Working, "x y z");
        m.status = MemoryStatus::Archived;
        let err = s.insert_item(&m).unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_soft_delete_keeps_row() {
        let s = store();
        let m = item("u1", Tier::Working, "delete me softly");
        s.insert_item(&m).unwrap();
        assert!(s.soft_delete("u1", &m.memory_id).unwrap());
        // Second delete is a no-op
        assert!(!s.soft_delete("u1", &m.memory_id).unwrap());
        let got = s.get_item("u1", &m.memory_id).unwrap().unwrap();
        assert_eq!(got.status, MemoryStatus::Deleted);
    }

    #[test]
    fn test_document_hash_lookup_same_user_only() {
        let s = store();
        let mut m = item("u1", Tier::Books, "chapter one");
        m.document_hash = "hash-1".into();
        s.insert_item(&m).unwrap();

        assert!(s.get_document_by_hash("u1", "hash-1").unwrap().is_some());
        assert!(s.get_document_by_hash("u2", "hash-1").unwrap().is_none());
    }

    #[test]
    fn test_find_needs_reindex() {
        let s = store();
        let mut a = item("u1", Tier::Working, "needs vector");
        a.embedding.needs_reindex = true;
        s.insert_item(&a).unwrap();

        let mut b = item("u1", Tier::Working, "already indexed");
        b.embedding.needs_reindex = false;
        b.embedding.indexed_at = Some(now_iso());
        b.embedding.dimensions = Some(1024);
        s.insert_item(&b).unwrap();

        let pending = s.find_needs_reindex(Some("u1"), 50).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].memory_id, a.memory_id);
    }

    #[test]
    fn test_outcome_append_and_query() {
        let s = store();
        let m = item("u1", Tier::History, "useful fact");
        s.insert_item(&m).unwrap();

        for (score, conv) in [(1i8, "c1"), (1, "c2"), (-1, "c1")] {
            s.insert_outcome(&Outcome {
                user_id: "u1".into(),
                memory_id: m.memory_id.clone(),
                score,
                conversation_id: Some(conv.into()),
                message_id: None,
                created_at: now_iso(),
            })
            .unwrap();
        }

        assert_eq!(s.outcomes_for("u1", &m.memory_id).unwrap().len(), 3);
        assert_eq!(s.distinct_positive_conversations("u1", &m.memory_id).unwrap(), 2);
    }

    #[test]
    fn test_update_snapshots_version() {
        let s = store();
        let mut m = item("u1", Tier::Working, "v1 text");
        s.insert_item(&m).unwrap();

        m.text = "v2 text".into();
        m.current_version = 2;
        s.update_item(&m).unwrap();

        let conn = s.conn.lock();
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_versions WHERE memory_id = ?1", params![m.memory_id], |r| r.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_tier_stats() {
        let s = store();
        s.insert_item(&item("u1", Tier::Working, "a")).unwrap();
        s.insert_item(&item("u1", Tier::Working, "b")).unwrap();
        s.insert_item(&item("u1", Tier::Books, "c")).unwrap();

        let stats = s.tier_stats("u1").unwrap();
        let working = stats.iter().find(|t| t.tier == "working").unwrap();
        assert_eq!(working.active, 2);
        assert_eq!(working.needs_reindex, 2);
    }

    #[test]
    fn test_fts_match_expr_sanitizes() {
        assert_eq!(fts_match_expr("hello world"), "\"hello\" OR \"world\"");
        assert!(fts_match_expr("a\"b").contains("ab"));
        assert_eq!(fts_match_expr("   "), "");
    }

    #[test]
    fn test_tier_clause_escapes_quotes() {
        let clause = tier_in_clause(&[Tier::Datagov("x' OR '1'='1".into())]);
        assert!(
            clause.contains("'datagov_x'' OR ''1''=''1'"),
            "quotes must be doubled: {clause}"
        );
    }

    #[test]
    fn test_hebrew_text_round_trip() {
        let s = store();
        s.insert_item(&item("u1", Tier::MemoryBank, "קוראים לי אבי")).unwrap();
        let hits = s.text_search("u1", &[], "אבי", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_list_items_pagination() {
        let s = store();
        for i in 0..5 {
            s.insert_item(&item("u1", Tier::MemoryBank, &format!("note {i}"))).unwrap();
        }
        let page1 = s.list_items("u1", Some(&Tier::MemoryBank), None, 2, 0).unwrap();
        let page2 = s.list_items("u1", Some(&Tier::MemoryBank), None, 2, 2).unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert_ne!(page1[0].memory_id, page2[0].memory_id);
    }
}
