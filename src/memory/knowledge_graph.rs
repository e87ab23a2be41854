// ── Memory Engine: Knowledge Graph ─────────────────────────────────────────
//
// Entity/edge store built from memory entities. After a memory write whose
// entity set is non-empty, nodes and pairwise co-occurrence edges are
// updated in one transaction:
//   - node upsert: union memory_ids, mentions = |memory_ids|,
//     avg_quality = quality_sum / mentions, first_seen only on insert
//   - edge upsert: undirected, edge_id = min(a,b):max(a,b), weight = |memory_ids|
//
// Entities pass through a normalizer (lowercase, trim, Hebrew niqqud strip,
// stopword/generic-label blocklist) and are deduplicated per memory.
//
// A lightweight heuristic extractor supplies entities when the caller has
// none and no external NER service is configured.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{now_iso, KgEdge, KgNode};
use crate::memory::store::MemoryStore;
use log::info;
use rusqlite::params;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

// ═══════════════════════════════════════════════════════════════════════════
// Normalization
// ═══════════════════════════════════════════════════════════════════════════

/// Labels too generic to be graph nodes, in both corpus languages.
const LABEL_BLOCKLIST: &[&str] = &[
    "the", "a", "an", "it", "this", "that", "these", "those", "thing", "things",
    "something", "someone", "anything", "everything", "user", "assistant", "system",
    "today", "tomorrow", "yesterday", "now", "here", "there",
    "דבר", "משהו", "מישהו", "זה", "זאת", "אלה", "היום", "מחר", "אתמול", "כאן", "שם",
];

/// Normalize an entity label: trim, lowercase, strip Hebrew diacritics
/// (niqqud and cantillation, U+0591–U+05C7), collapse inner whitespace.
pub fn normalize_label(label: &str) -> String {
    let stripped: String = label
        .trim()
        .chars()
        .filter(|c| !('\u{0591}'..='\u{05C7}').contains(c))
        .collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a normalized label is worth a graph node.
pub fn is_valid_label(normalized: &str) -> bool {
    if normalized.len() < 2 || normalized.len() > 120 {
        return false;
    }
    if LABEL_BLOCKLIST.contains(&normalized) {
        return false;
    }
    // Pure punctuation/digits carry no entity meaning.
    normalized.chars().any(|c| c.is_alphabetic())
}

/// Deterministic node id from the normalized label (first 16 hex chars of
/// its SHA-256), so repeated mentions converge on one node.
pub fn node_id_for(normalized_label: &str) -> String {
    let digest = Sha256::digest(normalized_label.as_bytes());
    format!("{digest:x}")[..16].to_string()
}

/// Normalize, filter, and dedup an entity list (order-stable).
pub fn prepare_entities(entities: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for raw in entities {
        let normalized = normalize_label(raw);
        if is_valid_label(&normalized) && seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// Graph writes
// ═══════════════════════════════════════════════════════════════════════════

/// Update nodes and pairwise edges for one memory's entity set, atomically.
/// Idempotent per (memory_id, entity): re-recording the same memory does
/// not inflate mention counts.
pub fn record_entities(
    store: &MemoryStore,
    user_id: &str,
    memory_id: &str,
    entities: &[String],
    quality: f64,
) -> EngineResult<usize> {
    let labels = prepare_entities(entities);
    if labels.is_empty() {
        return Ok(0);
    }

    let now = now_iso();
    let conn = store.conn.lock();
    let tx = conn.unchecked_transaction()?;

    for label in &labels {
        let node_id = node_id_for(label);
        upsert_node(&tx, user_id, &node_id, label, memory_id, quality, &now)?;
    }

    // Pairwise edges over the (sorted, deduped) label set. node_id ordering
    // keeps edge ids deterministic regardless of mention order.
    let node_ids: Vec<String> = labels.iter().map(|l| node_id_for(l)).collect();
    for i in 0..node_ids.len() {
        for j in (i + 1)..node_ids.len() {
            upsert_edge(&tx, user_id, &node_ids[i], &node_ids[j], memory_id, &now)?;
        }
    }

    tx.commit()?;
    info!(
        "[memory:kg] Recorded {} entities for memory {} ({} pairs)",
        labels.len(),
        &memory_id[..memory_id.len().min(8)],
        node_ids.len() * node_ids.len().saturating_sub(1) / 2,
    );
    Ok(labels.len())
}

fn upsert_node(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    node_id: &str,
    label: &str,
    memory_id: &str,
    quality: f64,
    now: &str,
) -> EngineResult<()> {
    let existing: Option<(String, f64)> = tx
        .query_row(
            "SELECT memory_ids, quality_sum FROM kg_nodes WHERE user_id=?1 AND node_id=?2",
            params![user_id, node_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        Some((memory_ids_json, quality_sum)) => {
            let mut ids: Vec<String> = serde_json::from_str(&memory_ids_json).unwrap_or_default();
            let fresh = !ids.iter().any(|id| id == memory_id);
            if fresh {
                ids.push(memory_id.to_string());
            }
            let mentions = ids.len() as i64;
            let new_quality_sum = if fresh { quality_sum + quality } else { quality_sum };
            let avg = new_quality_sum / mentions as f64;
            tx.execute(
                "UPDATE kg_nodes SET memory_ids=?3, mentions=?4, quality_sum=?5, avg_quality=?6, last_seen_at=?7
                 WHERE user_id=?1 AND node_id=?2",
                params![user_id, node_id, serde_json::to_string(&ids)?, mentions, new_quality_sum, avg, now],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO kg_nodes (user_id, node_id, label, aliases, first_seen_at, last_seen_at,
                                       mentions, memory_ids, quality_sum, avg_quality)
                 VALUES (?1, ?2, ?3, '[]', ?4, ?4, 1, ?5, ?6, ?6)",
                params![user_id, node_id, label, now, serde_json::to_string(&[memory_id])?, quality],
            )?;
        }
    }
    Ok(())
}

fn upsert_edge(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    a: &str,
    b: &str,
    memory_id: &str,
    now: &str,
) -> EngineResult<()> {
    let edge_id = KgEdge::edge_id_for(a, b);
    let (source_id, target_id) = if a <= b { (a, b) } else { (b, a) };

    let existing: Option<String> = tx
        .query_row(
            "SELECT memory_ids FROM kg_edges WHERE user_id=?1 AND edge_id=?2",
            params![user_id, edge_id],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match existing {
        Some(memory_ids_json) => {
            let mut ids: Vec<String> = serde_json::from_str(&memory_ids_json).unwrap_or_default();
            if !ids.iter().any(|id| id == memory_id) {
                ids.push(memory_id.to_string());
            }
            let weight = ids.len() as i64;
            tx.execute(
                "UPDATE kg_edges SET memory_ids=?3, weight=?4, last_seen_at=?5
                 WHERE user_id=?1 AND edge_id=?2",
                params![user_id, edge_id, serde_json::to_string(&ids)?, weight, now],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO kg_edges (user_id, edge_id, source_id, target_id, relation_type,
                                       weight, memory_ids, first_seen_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, 'co_occurs', 1, ?5, ?6, ?6)",
                params![user_id, edge_id, source_id, target_id, serde_json::to_string(&[memory_id])?, now],
            )?;
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Graph reads
// ═══════════════════════════════════════════════════════════════════════════

/// A node with its strongest edges and a sample of referencing memory ids.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConceptContext {
    pub node: KgNode,
    pub edges: Vec<KgEdge>,
    pub sample_memory_ids: Vec<String>,
}

pub fn get_node(store: &MemoryStore, user_id: &str, node_id: &str) -> EngineResult<Option<KgNode>> {
    let conn = store.conn.lock();
    let result = conn.query_row(
        "SELECT user_id, node_id, label, aliases, first_seen_at, last_seen_at,
                mentions, memory_ids, quality_sum, avg_quality
         FROM kg_nodes WHERE user_id=?1 AND node_id=?2",
        params![user_id, node_id],
        node_from_row,
    );
    match result {
        Ok(node) => Ok(Some(node)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Node + top edges by weight + sampled memories referencing the node.
pub fn get_concept_context(
    store: &MemoryStore,
    user_id: &str,
    node_id: &str,
    limit: usize,
) -> EngineResult<ConceptContext> {
    let node = get_node(store, user_id, node_id)?
        .ok_or_else(|| EngineError::NotFound(format!("kg node {node_id}")))?;

    let conn = store.conn.lock();
    let mut stmt = conn.prepare(
        "SELECT user_id, edge_id, source_id, target_id, relation_type, weight,
                memory_ids, first_seen_at, last_seen_at
         FROM kg_edges
         WHERE user_id=?1 AND (source_id=?2 OR target_id=?2)
         ORDER BY weight DESC LIMIT ?3",
    )?;
    let edges: Vec<KgEdge> = stmt
        .query_map(params![user_id, node_id, limit as i64], edge_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    drop(stmt);
    drop(conn);

    let sample_memory_ids: Vec<String> = node.memory_ids.iter().take(limit).cloned().collect();
    Ok(ConceptContext { node, edges, sample_memory_ids })
}

/// Top nodes by mention count, for the graph overview surface.
pub fn top_nodes(store: &MemoryStore, user_id: &str, limit: usize) -> EngineResult<Vec<KgNode>> {
    let conn = store.conn.lock();
    let mut stmt = conn.prepare(
        "SELECT user_id, node_id, label, aliases, first_seen_at, last_seen_at,
                mentions, memory_ids, quality_sum, avg_quality
         FROM kg_nodes WHERE user_id=?1 ORDER BY mentions DESC, label LIMIT ?2",
    )?;
    let nodes = stmt
        .query_map(params![user_id, limit as i64], node_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(nodes)
}

/// Find a node by its (raw) label.
pub fn find_node_by_label(
    store: &MemoryStore,
    user_id: &str,
    label: &str,
) -> EngineResult<Option<KgNode>> {
    let normalized = normalize_label(label);
    if !is_valid_label(&normalized) {
        return Ok(None);
    }
    get_node(store, user_id, &node_id_for(&normalized))
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KgNode> {
    let aliases_json: String = row.get(3)?;
    let memory_ids_json: String = row.get(7)?;
    Ok(KgNode {
        user_id: row.get(0)?,
        node_id: row.get(1)?,
        label: row.get(2)?,
        aliases: serde_json::from_str(&aliases_json).unwrap_or_default(),
        first_seen_at: row.get(4)?,
        last_seen_at: row.get(5)?,
        mentions: row.get::<_, i64>(6)? as u64,
        memory_ids: serde_json::from_str(&memory_ids_json).unwrap_or_default(),
        quality_sum: row.get(8)?,
        avg_quality: row.get(9)?,
    })
}

fn edge_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KgEdge> {
    let memory_ids_json: String = row.get(6)?;
    Ok(KgEdge {
        user_id: row.get(0)?,
        edge_id: row.get(1)?,
        source_id: row.get(2)?,
        target_id: row.get(3)?,
        relation_type: row.get(4)?,
        weight: row.get::<_, i64>(5)? as u64,
        memory_ids: serde_json::from_str(&memory_ids_json).unwrap_or_default(),
        first_seen_at: row.get(7)?,
        last_seen_at: row.get(8)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Heuristic entity extraction
// ═══════════════════════════════════════════════════════════════════════════

/// Lightweight extraction for when the caller supplies no entities and no
/// NER service is configured: capitalized runs (people, orgs, projects)
/// plus a small technology glossary. Hebrew text contributes words of 3+
/// letters that survive the blocklist.
pub fn extract_entities(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();

    // Pass 1: glossary terms (word-boundary, case-insensitive)
    let lower = text.to_lowercase();
    for term in TECH_GLOSSARY {
        if has_word(&lower, term) {
            found.push((*term).to_string());
        }
    }

    // Pass 2: capitalized runs of 1-4 words, skipping sentence starts
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut i = 0;
    while i < words.len() {
        let clean = trim_punct(words[i]);
        let sentence_start =
            i == 0 || words[i - 1].ends_with(['.', '!', '?', ':']);
        if !sentence_start && is_title_case(clean) {
            let mut run = vec![clean.to_string()];
            let mut j = i + 1;
            while j < words.len() && run.len() < 4 {
                // A run never crosses a sentence boundary.
                if words[j - 1].ends_with(['.', '!', '?', ':']) {
                    break;
                }
                let next = trim_punct(words[j]);
                if is_title_case(next) {
                    run.push(next.to_string());
                    j += 1;
                } else {
                    break;
                }
            }
            found.push(run.join(" "));
            i = j;
            continue;
        }
        i += 1;
    }

    // Pass 3: Hebrew tokens (no capitalization signal; length gate instead)
    for word in text.split_whitespace() {
        let clean = trim_punct(word);
        if clean.chars().count() >= 3 && clean.chars().all(is_hebrew_letter) {
            found.push(clean.to_string());
        }
    }

    prepare_entities(&found)
}

const TECH_GLOSSARY: &[&str] = &[
    "rust", "python", "typescript", "javascript", "docker", "kubernetes",
    "postgres", "sqlite", "redis", "qdrant", "mongodb", "elasticsearch",
    "react", "svelte", "tauri", "linux", "macos", "windows",
    "openai", "anthropic", "ollama", "mistral", "llama",
    "git", "github", "gitlab", "graphql", "grpc", "http", "websocket",
];

fn has_word(haystack: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let before_ok = abs == 0 || !haystack.as_bytes()[abs - 1].is_ascii_alphanumeric();
        let end = abs + needle.len();
        let after_ok = end >= haystack.len() || !haystack.as_bytes()[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = abs + 1;
    }
    false
}

fn trim_punct(word: &str) -> &str {
    word.trim_matches(|c: char| !c.is_alphanumeric())
}

fn is_title_case(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.is_uppercase() && chars.all(|c| c.is_lowercase() || c.is_numeric()),
        None => false,
    }
}

fn is_hebrew_letter(c: char) -> bool {
    ('\u{05D0}'..='\u{05EA}').contains(&c)
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

    #[test]
    fn test_normalize_strips_niqqud() {
        // "שָׁלוֹם" with niqqud normalizes to bare "שלום"
        assert_eq!(normalize_label("שָׁלוֹם"), "שלום");
        assert_eq!(normalize_label("  Hello   World  "), "hello world");
    }

    #[test]
    fn test_blocklist_and_validity() {
        assert!(!is_valid_label("the"));
        assert!(!is_valid_label("זה"));
        assert!(!is_valid_label("x"));
        assert!(!is_valid_label("12345"));
        assert!(is_valid_label("qdrant"));
        assert!(is_valid_label("tel aviv"));
    }

    #[test]
    fn test_node_id_deterministic() {
        assert_eq!(node_id_for("qdrant"), node_id_for("qdrant"));
        assert_ne!(node_id_for("qdrant"), node_id_for("redis"));
        assert_eq!(node_id_for("qdrant").len(), 16);
    }

    #[test]
    fn test_prepare_entities_dedups() {
        let prepared = prepare_entities(&[
            "Docker".into(),
            "docker".into(),
            " DOCKER ".into(),
            "the".into(),
            "Redis".into(),
        ]);
        assert_eq!(prepared, vec!["docker".to_string(), "redis".to_string()]);
    }

    #[test]
    fn test_co_occurrence_counts() {
        // Two memories: [A,B] and [B,C]. Expect B(mentions=2), A/C(=1),
        // edges A-B and B-C with weight 1, and no A-C edge.
        let s = store();
        record_entities(&s, "u1", "m1", &["alpha".into(), "beta".into()], 0.8).unwrap();
        record_entities(&s, "u1", "m2", &["beta".into(), "gamma".into()], 0.6).unwrap();

        let a = find_node_by_label(&s, "u1", "alpha").unwrap().unwrap();
        let b = find_node_by_label(&s, "u1", "beta").unwrap().unwrap();
        let c = find_node_by_label(&s, "u1", "gamma").unwrap().unwrap();
        assert_eq!(a.mentions, 1);
        assert_eq!(b.mentions, 2);
        assert_eq!(c.mentions, 1);

        let ctx = get_concept_context(&s, "u1", &b.node_id, 10).unwrap();
        assert_eq!(ctx.edges.len(), 2);
        assert!(ctx.edges.iter().all(|e| e.weight == 1));

        // No alpha-gamma edge
        let ctx_a = get_concept_context(&s, "u1", &a.node_id, 10).unwrap();
        assert_eq!(ctx_a.edges.len(), 1);
    }

    #[test]
    fn test_record_is_idempotent_per_memory() {
        let s = store();
        record_entities(&s, "u1", "m1", &["alpha".into(), "beta".into()], 0.8).unwrap();
        record_entities(&s, "u1", "m1", &["alpha".into(), "beta".into()], 0.8).unwrap();

        let a = find_node_by_label(&s, "u1", "alpha").unwrap().unwrap();
        assert_eq!(a.mentions, 1, "same memory must not inflate mentions");
        let ctx = get_concept_context(&s, "u1", &a.node_id, 10).unwrap();
        assert_eq!(ctx.edges[0].weight, 1);
    }

    #[test]
    fn test_avg_quality_tracks_mentions() {
        let s = store();
        record_entities(&s, "u1", "m1", &["alpha".into()], 1.0).unwrap();
        record_entities(&s, "u1", "m2", &["alpha".into()], 0.5).unwrap();
        let node = find_node_by_label(&s, "u1", "alpha").unwrap().unwrap();
        assert_eq!(node.mentions, 2);
        assert!((node.avg_quality - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_user_scoping() {
        let s = store();
        record_entities(&s, "u1", "m1", &["alpha".into()], 0.5).unwrap();
        assert!(find_node_by_label(&s, "u2", "alpha").unwrap().is_none());
    }

    #[test]
    fn test_extract_entities_glossary_and_names() {
        let entities = extract_entities("We deployed Qdrant with Docker. Ask Dana Cohen about it.");
        assert!(entities.contains(&"qdrant".to_string()));
        assert!(entities.contains(&"docker".to_string()));
        assert!(entities.contains(&"dana cohen".to_string()));
    }

    #[test]
    fn test_extract_entities_hebrew() {
        let entities = extract_entities("דיברתי עם אבי על הפרויקט");
        assert!(entities.contains(&"אבי".to_string()));
        assert!(entities.contains(&"הפרויקט".to_string()));
        // Blocklisted Hebrew filler absent
        assert!(!entities.contains(&"זה".to_string()));
    }

    #[test]
    fn test_edge_ids_order_independent() {
        let s = store();
        record_entities(&s, "u1", "m1", &["beta".into(), "alpha".into()], 0.5).unwrap();
        record_entities(&s, "u1", "m2", &["alpha".into(), "beta".into()], 0.5).unwrap();
        let a = find_node_by_label(&s, "u1", "alpha").unwrap().unwrap();
        let ctx = get_concept_context(&s, "u1", &a.node_id, 10).unwrap();
        assert_eq!(ctx.edges.len(), 1, "same pair regardless of order");
        assert_eq!(ctx.edges[0].weight, 2);
    }
}
