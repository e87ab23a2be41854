// ── Memory Engine: Document Store Schema ───────────────────────────────────
//
// Tables for the unified long-term memory subsystem:
//   - memory_items: canonical memory records (tiered, scored, versioned)
//   - memory_items_fts: FTS5 index over text/summary/tags (BM25 lexical search)
//   - memory_outcomes: append-only feedback events
//   - response_feedback: aggregate response-level feedback (separate from items)
//   - kg_nodes / kg_edges: knowledge graph over extracted entities
//   - memory_versions: snapshots taken before destructive updates
//   - reindex_checkpoints: deferred reindexer progress, survives restarts
//
// All statements are idempotent (CREATE IF NOT EXISTS / ADD COLUMN with
// silent error). Adding a migration: append at the end of run_migrations(),
// never edit existing SQL.

use crate::atoms::error::EngineResult;
use log::info;
use rusqlite::Connection;

/// Run all memory-store migrations. Called once from MemoryStore::open().
pub fn run_migrations(conn: &Connection) -> EngineResult<()> {
    info!("[memory] Running document store migrations");

    conn.execute_batch(MEMORY_SCHEMA)?;

    // ── Idempotent column additions for future migrations ────────────
    // Pattern: try ADD COLUMN, swallow error if already exists.

    // Language tag for mixed Hebrew/English corpora.
    let _ = conn.execute("ALTER TABLE memory_items ADD COLUMN language TEXT", []);

    // Decay idempotence stamp.
    let _ = conn.execute("ALTER TABLE memory_items ADD COLUMN last_decay_at TEXT", []);

    info!("[memory] Document store migrations complete");
    Ok(())
}

const MEMORY_SCHEMA: &str = "
    -- ═══════════════════════════════════════════════════════════════
    -- Memory Items (canonical records)
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS memory_items (
        memory_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        org_id TEXT,

        tier TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',

        -- Content
        text TEXT NOT NULL,
        summary TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        entities TEXT NOT NULL DEFAULT '[]',

        -- Provenance (JSON: source_type, tool_name, conversation_id, …)
        source_json TEXT NOT NULL DEFAULT '{}',
        document_hash TEXT NOT NULL DEFAULT '',

        -- Quality (0-1)
        importance REAL NOT NULL DEFAULT 0.5,
        confidence REAL NOT NULL DEFAULT 0.5,
        quality_score REAL NOT NULL DEFAULT 0.5,
        recency_score REAL NOT NULL DEFAULT 1.0,

        -- Statistics (maintained by the scorer; counts never regress)
        uses INTEGER NOT NULL DEFAULT 0,
        last_used_at TEXT,
        worked_count INTEGER NOT NULL DEFAULT 0,
        failed_count INTEGER NOT NULL DEFAULT 0,
        partial_count INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        success_rate REAL NOT NULL DEFAULT 0.5,
        wilson_score REAL NOT NULL DEFAULT 0.0,

        -- Embedding bookkeeping
        embedding_model TEXT,
        embedding_dimensions INTEGER,
        indexed_at TEXT,
        needs_reindex INTEGER NOT NULL DEFAULT 1,

        -- Versioning
        current_version INTEGER NOT NULL DEFAULT 1,
        supersedes_memory_id TEXT,

        -- Temporal
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
        archived_at TEXT,
        expires_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_items_user_tier_status
        ON memory_items(user_id, tier, status);
    CREATE INDEX IF NOT EXISTS idx_items_user_hash
        ON memory_items(user_id, document_hash);
    CREATE INDEX IF NOT EXISTS idx_items_needs_reindex
        ON memory_items(needs_reindex, user_id);
    CREATE INDEX IF NOT EXISTS idx_items_updated
        ON memory_items(updated_at);
    CREATE INDEX IF NOT EXISTS idx_items_wilson
        ON memory_items(wilson_score DESC);

    -- FTS5 index for keyword search (BM25 ranking)
    CREATE VIRTUAL TABLE IF NOT EXISTS memory_items_fts USING fts5(
        memory_id UNINDEXED,
        text,
        summary,
        tags,
        content=memory_items,
        content_rowid=rowid,
        tokenize='porter unicode61'
    );

    -- Triggers keep FTS in sync with the main table
    CREATE TRIGGER IF NOT EXISTS memory_items_fts_insert AFTER INSERT ON memory_items
    BEGIN
        INSERT INTO memory_items_fts(rowid, memory_id, text, summary, tags)
        VALUES (NEW.rowid, NEW.memory_id, NEW.text, NEW.summary, NEW.tags);
    END;

    CREATE TRIGGER IF NOT EXISTS memory_items_fts_delete AFTER DELETE ON memory_items
    BEGIN
        INSERT INTO memory_items_fts(memory_items_fts, rowid, memory_id, text, summary, tags)
        VALUES ('delete', OLD.rowid, OLD.memory_id, OLD.text, OLD.summary, OLD.tags);
    END;

    CREATE TRIGGER IF NOT EXISTS memory_items_fts_update AFTER UPDATE ON memory_items
    BEGIN
        INSERT INTO memory_items_fts(memory_items_fts, rowid, memory_id, text, summary, tags)
        VALUES ('delete', OLD.rowid, OLD.memory_id, OLD.text, OLD.summary, OLD.tags);
        INSERT INTO memory_items_fts(rowid, memory_id, text, summary, tags)
        VALUES (NEW.rowid, NEW.memory_id, NEW.text, NEW.summary, NEW.tags);
    END;

    -- ═══════════════════════════════════════════════════════════════
    -- Outcomes (append-only; never deleted)
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS memory_outcomes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        memory_id TEXT NOT NULL,
        score INTEGER NOT NULL,
        conversation_id TEXT,
        message_id TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
    );

    CREATE INDEX IF NOT EXISTS idx_outcomes_memory
        ON memory_outcomes(user_id, memory_id);
    CREATE INDEX IF NOT EXISTS idx_outcomes_conversation
        ON memory_outcomes(user_id, conversation_id);

    -- Aggregate response-level feedback, independent of citations
    CREATE TABLE IF NOT EXISTS response_feedback (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        conversation_id TEXT,
        message_id TEXT,
        score INTEGER NOT NULL,
        feedback TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
    );

    -- ═══════════════════════════════════════════════════════════════
    -- Knowledge Graph (entity nodes + undirected co-occurrence edges)
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS kg_nodes (
        user_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        label TEXT NOT NULL,
        aliases TEXT NOT NULL DEFAULT '[]',
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        mentions INTEGER NOT NULL DEFAULT 1,
        memory_ids TEXT NOT NULL DEFAULT '[]',
        quality_sum REAL NOT NULL DEFAULT 0.0,
        avg_quality REAL NOT NULL DEFAULT 0.0,
        PRIMARY KEY (user_id, node_id)
    );

    CREATE INDEX IF NOT EXISTS idx_kg_nodes_label ON kg_nodes(user_id, label);

    CREATE TABLE IF NOT EXISTS kg_edges (
        user_id TEXT NOT NULL,
        edge_id TEXT NOT NULL,
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        relation_type TEXT NOT NULL DEFAULT 'co_occurs',
        weight INTEGER NOT NULL DEFAULT 1,
        memory_ids TEXT NOT NULL DEFAULT '[]',
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        PRIMARY KEY (user_id, edge_id)
    );

    CREATE INDEX IF NOT EXISTS idx_kg_edges_source ON kg_edges(user_id, source_id);
    CREATE INDEX IF NOT EXISTS idx_kg_edges_target ON kg_edges(user_id, target_id);

    -- ═══════════════════════════════════════════════════════════════
    -- Versions (snapshot before destructive update)
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS memory_versions (
        memory_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        snapshot_json TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
        PRIMARY KEY (memory_id, version)
    );

    -- ═══════════════════════════════════════════════════════════════
    -- Reindex checkpoints (deferred embedding progress)
    -- ═══════════════════════════════════════════════════════════════
    CREATE TABLE IF NOT EXISTS reindex_checkpoints (
        id TEXT PRIMARY KEY,
        last_memory_id TEXT,
        processed INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0,
        sanitized INTEGER NOT NULL DEFAULT 0,
        paused INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
    );
";

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap(); // second run must not error

        // All expected tables present
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN (
                    'memory_items','memory_outcomes','response_feedback',
                    'kg_nodes','kg_edges','memory_versions','reindex_checkpoints')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 7);
    }

    #[test]
    fn test_fts_triggers_sync() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO memory_items (memory_id, user_id, tier, text) VALUES ('m1','u1','working','the quick brown fox')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_items_fts WHERE memory_items_fts MATCH 'quick'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM memory_items WHERE memory_id='m1'", []).unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memory_items_fts WHERE memory_items_fts MATCH 'quick'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }
}
