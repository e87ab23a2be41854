// ── Memory Engine: Backup & Restore ────────────────────────────────────────
//
// Single-JSON-document backup bundle: `exported_at` plus per-collection
// arrays. Import into an empty store reproduces items, outcomes, and the
// knowledge graph with timestamps preserved verbatim.

use crate::atoms::error::EngineResult;
use crate::atoms::types::{now_iso, KgEdge, KgNode, MemoryItem, Outcome};
use crate::memory::store::MemoryStore;
use log::{info, warn};
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupBundle {
    #[serde(rename = "exportedAt")]
    pub exported_at: String,
    pub memory_items: Vec<MemoryItem>,
    pub memory_outcomes: Vec<Outcome>,
    pub kg_nodes: Vec<KgNode>,
    pub kg_edges: Vec<KgEdge>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub items: usize,
    pub outcomes: usize,
    pub nodes: usize,
    pub edges: usize,
    pub skipped: usize,
}

/// Export everything a user owns (or the whole store with `user_id = None`).
pub fn export_backup(store: &MemoryStore, user_id: Option<&str>) -> EngineResult<BackupBundle> {
    let items = dump_items(store, user_id)?;
    let outcomes = dump_outcomes(store, user_id)?;
    let nodes = dump_nodes(store, user_id)?;
    let edges = dump_edges(store, user_id)?;

    info!(
        "[memory] Exported backup: {} items, {} outcomes, {} nodes, {} edges",
        items.len(),
        outcomes.len(),
        nodes.len(),
        edges.len()
    );
    Ok(BackupBundle {
        exported_at: now_iso(),
        memory_items: items,
        memory_outcomes: outcomes,
        kg_nodes: nodes,
        kg_edges: edges,
    })
}

/// Import a bundle. Existing memory ids are skipped (import is additive and
/// re-runnable); timestamps come through verbatim via the item writer.
pub fn import_backup(store: &MemoryStore, bundle: &BackupBundle) -> EngineResult<ImportReport> {
    let mut report = ImportReport::default();

    for item in &bundle.memory_items {
        if store.get_item(&item.user_id, &item.memory_id)?.is_some() {
            report.skipped += 1;
            continue;
        }
        match store.insert_item(item) {
            Ok(()) => report.items += 1,
            Err(e) => {
                warn!("[memory] Import skipped item {}: {}", item.memory_id, e);
                report.skipped += 1;
            }
        }
    }

    for outcome in &bundle.memory_outcomes {
        // Outcomes are append-only; dedup by full identity so re-running an
        // import cannot inflate the feedback history.
        let exists: bool = {
            let conn = store.conn.lock();
            conn.query_row(
                "SELECT COUNT(*) > 0 FROM memory_outcomes
                 WHERE user_id=?1 AND memory_id=?2 AND score=?3 AND created_at=?4
                   AND COALESCE(conversation_id,'') = COALESCE(?5,'')
                   AND COALESCE(message_id,'') = COALESCE(?6,'')",
                params![
                    outcome.user_id,
                    outcome.memory_id,
                    outcome.score as i64,
                    outcome.created_at,
                    outcome.conversation_id,
                    outcome.message_id,
                ],
                |r| r.get(0),
            )?
        };
        if exists {
            report.skipped += 1;
            continue;
        }
        store.insert_outcome(outcome)?;
        report.outcomes += 1;
    }

    {
        let conn = store.conn.lock();
        for node in &bundle.kg_nodes {
            conn.execute(
                "INSERT OR REPLACE INTO kg_nodes
                    (user_id, node_id, label, aliases, first_seen_at, last_seen_at,
                     mentions, memory_ids, quality_sum, avg_quality)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                params![
                    node.user_id,
                    node.node_id,
                    node.label,
                    serde_json::to_string(&node.aliases)?,
                    node.first_seen_at,
                    node.last_seen_at,
                    node.mentions as i64,
                    serde_json::to_string(&node.memory_ids)?,
                    node.quality_sum,
                    node.avg_quality,
                ],
            )?;
            report.nodes += 1;
        }
        for edge in &bundle.kg_edges {
            conn.execute(
                "INSERT OR REPLACE INTO kg_edges
                    (user_id, edge_id, source_id, target_id, relation_type,
                     weight, memory_ids, first_seen_at, last_seen_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    edge.user_id,
                    edge.edge_id,
                    edge.source_id,
                    edge.target_id,
                    edge.relation_type,
                    edge.weight as i64,
                    serde_json::to_string(&edge.memory_ids)?,
                    edge.first_seen_at,
                    edge.last_seen_at,
                ],
            )?;
            report.edges += 1;
        }
    }

    info!(
        "[memory] Imported backup: {} items, {} outcomes, {} nodes, {} edges ({} skipped)",
        report.items, report.outcomes, report.nodes, report.edges, report.skipped
    );
    Ok(report)
}

// ── Dumps ──────────────────────────────────────────────────────────────────

fn dump_items(store: &MemoryStore, user_id: Option<&str>) -> EngineResult<Vec<MemoryItem>> {
    // Reuse the pagination path with a page large enough for a full dump.
    match user_id {
        Some(uid) => store.list_items(uid, None, None, usize::MAX / 2, 0),
        None => {
            let users = distinct_users(store)?;
            let mut all = Vec::new();
            for uid in users {
                all.extend(store.list_items(&uid, None, None, usize::MAX / 2, 0)?);
            }
            Ok(all)
        }
    }
}

fn distinct_users(store: &MemoryStore) -> EngineResult<Vec<String>> {
    let conn = store.conn.lock();
    let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM memory_items")?;
    let users = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(users)
}

fn dump_outcomes(store: &MemoryStore, user_id: Option<&str>) -> EngineResult<Vec<Outcome>> {
    let conn = store.conn.lock();
    let sql = match user_id {
        Some(_) => {
            "SELECT user_id, memory_id, score, conversation_id, message_id, created_at
             FROM memory_outcomes WHERE user_id = ?1 ORDER BY id"
        }
        None => {
            "SELECT user_id, memory_id, score, conversation_id, message_id, created_at
             FROM memory_outcomes ORDER BY id"
        }
    };
    let mut stmt = conn.prepare(sql)?;
    let map = |row: &rusqlite::Row<'_>| {
        Ok(Outcome {
            user_id: row.get(0)?,
            memory_id: row.get(1)?,
            score: row.get::<_, i64>(2)? as i8,
            conversation_id: row.get(3)?,
            message_id: row.get(4)?,
            created_at: row.get(5)?,
        })
    };
    let outcomes = match user_id {
        Some(uid) => stmt.query_map(params![uid], map)?.filter_map(|r| r.ok()).collect(),
        None => stmt.query_map([], map)?.filter_map(|r| r.ok()).collect(),
    };
    Ok(outcomes)
}

fn dump_nodes(store: &MemoryStore, user_id: Option<&str>) -> EngineResult<Vec<KgNode>> {
    let conn = store.conn.lock();
    let sql = match user_id {
        Some(_) => {
            "SELECT user_id, node_id, label, aliases, first_seen_at, last_seen_at,
                    mentions, memory_ids, quality_sum, avg_quality
             FROM kg_nodes WHERE user_id = ?1"
        }
        None => {
            "SELECT user_id, node_id, label, aliases, first_seen_at, last_seen_at,
                    mentions, memory_ids, quality_sum, avg_quality
             FROM kg_nodes"
        }
    };
    let mut stmt = conn.prepare(sql)?;
    let map = |row: &rusqlite::Row<'_>| {
        let aliases: String = row.get(3)?;
        let memory_ids: String = row.get(7)?;
        Ok(KgNode {
            user_id: row.get(0)?,
            node_id: row.get(1)?,
            label: row.get(2)?,
            aliases: serde_json::from_str(&aliases).unwrap_or_default(),
            first_seen_at: row.get(4)?,
            last_seen_at: row.get(5)?,
            mentions: row.get::<_, i64>(6)? as u64,
            memory_ids: serde_json::from_str(&memory_ids).unwrap_or_default(),
            quality_sum: row.get(8)?,
            avg_quality: row.get(9)?,
        })
    };
    let nodes = match user_id {
        Some(uid) => stmt.query_map(params![uid], map)?.filter_map(|r| r.ok()).collect(),
        None => stmt.query_map([], map)?.filter_map(|r| r.ok()).collect(),
    };
    Ok(nodes)
}

fn dump_edges(store: &MemoryStore, user_id: Option<&str>) -> EngineResult<Vec<KgEdge>> {
    let conn = store.conn.lock();
    let sql = match user_id {
        Some(_) => {
            "SELECT user_id, edge_id, source_id, target_id, relation_type,
                    weight, memory_ids, first_seen_at, last_seen_at
             FROM kg_edges WHERE user_id = ?1"
        }
        None => {
            "SELECT user_id, edge_id, source_id, target_id, relation_type,
                    weight, memory_ids, first_seen_at, last_seen_at
             FROM kg_edges"
        }
    };
    let mut stmt = conn.prepare(sql)?;
    let map = |row: &rusqlite::Row<'_>| {
        let memory_ids: String = row.get(6)?;
        Ok(KgEdge {
            user_id: row.get(0)?,
            edge_id: row.get(1)?,
            source_id: row.get(2)?,
            target_id: row.get(3)?,
            relation_type: row.get(4)?,
            weight: row.get::<_, i64>(5)? as u64,
            memory_ids: serde_json::from_str(&memory_ids).unwrap_or_default(),
            first_seen_at: row.get(7)?,
            last_seen_at: row.get(8)?,
        })
    };
    let edges = match user_id {
        Some(uid) => stmt.query_map(params![uid], map)?.filter_map(|r| r.ok()).collect(),
        None => stmt.query_map([], map)?.filter_map(|r| r.ok()).collect(),
    };
    Ok(edges)
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{MemoryItem, Tier};
    use crate::memory::knowledge_graph::record_entities;
    use crate::memory::scoring::record_feedback;

    fn populated_store() -> (MemoryStore, MemoryItem) {
        let s = MemoryStore::open_in_memory().unwrap();
        let item = MemoryItem::new("u1", Tier::MemoryBank, "backup me");
        s.insert_item(&item).unwrap();
        record_feedback(&s, &crate::config::EngineConfig::default(), "u1", &item.memory_id, 1, Some("c1"), None).unwrap();
        record_entities(&s, "u1", &item.memory_id, &["alpha".into(), "beta".into()], 0.7).unwrap();
        (s, item)
    }

    #[test]
    fn test_export_import_round_trip() {
        let (source, item) = populated_store();
        let bundle = export_backup(&source, Some("u1")).unwrap();
        assert_eq!(bundle.memory_items.len(), 1);
        assert_eq!(bundle.memory_outcomes.len(), 1);
        assert_eq!(bundle.kg_nodes.len(), 2);
        assert_eq!(bundle.kg_edges.len(), 1);

        let target = MemoryStore::open_in_memory().unwrap();
        let report = import_backup(&target, &bundle).unwrap();
        assert_eq!(report.items, 1);
        assert_eq!(report.outcomes, 1);
        assert_eq!(report.nodes, 2);
        assert_eq!(report.edges, 1);

        // Timestamps preserved verbatim.
        let restored = target.get_item("u1", &item.memory_id).unwrap().unwrap();
        assert_eq!(restored.created_at, item.created_at);
        assert_eq!(restored.text, "backup me");
    }

    #[test]
    fn test_import_is_rerunnable() {
        let (source, _) = populated_store();
        let bundle = export_backup(&source, Some("u1")).unwrap();

        let target = MemoryStore::open_in_memory().unwrap();
        import_backup(&target, &bundle).unwrap();
        let second = import_backup(&target, &bundle).unwrap();
        assert_eq!(second.items, 0);
        assert_eq!(second.outcomes, 0, "outcome history must not inflate on re-import");
        assert!(second.skipped >= 2, "existing items and outcomes are skipped");
        assert_eq!(target.count_documents("u1", None, None).unwrap(), 1);
    }

    #[test]
    fn test_bundle_serializes_with_exported_at() {
        let (source, _) = populated_store();
        let bundle = export_backup(&source, None).unwrap();
        let json = serde_json::to_value(&bundle).unwrap();
        assert!(json["exportedAt"].is_string());
        assert!(json["memory_items"].is_array());
    }
}
