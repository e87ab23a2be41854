// ── Memory Engine: Outcome Scorer ──────────────────────────────────────────
//
// Folds feedback events into memory statistics and runs the lifecycle
// passes that depend on them:
//   - recordFeedback: append outcome, bump counts, recompute success_rate
//     and the Wilson lower bound (z = 1.96)
//   - time decay: quality_score *= (1 - decay_per_day)^days_idle, clamped
//   - archival: persistently low-quality items move to archived (never deleted)
//   - promotion: working → history on proven wilson score; history → patterns
//     on success across distinct conversations
//
// All stat updates are single-row UPDATEs computed from freshly-read counts
// inside one transaction, so counts never regress under concurrency.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{now_iso, MemoryStatus, Outcome, Tier};
use crate::config::EngineConfig;
use crate::memory::store::MemoryStore;
use log::{info, warn};
use rusqlite::params;

/// z for the 95% Wilson lower confidence bound.
const WILSON_Z: f64 = 1.96;

// ═══════════════════════════════════════════════════════════════════════════
// Wilson score
// ═══════════════════════════════════════════════════════════════════════════

/// Wilson lower confidence bound on the success proportion.
/// `positive` of `total` trials; returns 0 for an empty sample.
pub fn wilson_lower_bound(positive: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let n = total as f64;
    let p = positive as f64 / n;
    let z = WILSON_Z;
    let z2 = z * z;

    let denominator = 1.0 + z2 / n;
    let center = p + z2 / (2.0 * n);
    let margin = z * ((p * (1.0 - p) / n) + z2 / (4.0 * n * n)).sqrt();

    ((center - margin) / denominator).clamp(0.0, 1.0)
}

/// success_rate = worked / (worked + failed + partial); 0.5 with no outcomes.
pub fn success_rate(worked: u64, failed: u64, partial: u64) -> f64 {
    let denom = worked + failed + partial;
    if denom == 0 {
        0.5
    } else {
        worked as f64 / denom as f64
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Feedback recording
// ═══════════════════════════════════════════════════════════════════════════

/// Append an outcome and fold it into the memory's stats: counts, rate,
/// Wilson bound, and a quality nudge (`positive_boost` / `negative_penalty`
/// from config). `score`: +1 worked, 0 partial, -1 failed. Unknown memories
/// are not an error at the scorer — the outcome is still recorded for audit.
pub fn record_feedback(
    store: &MemoryStore,
    config: &EngineConfig,
    user_id: &str,
    memory_id: &str,
    score: i8,
    conversation_id: Option<&str>,
    message_id: Option<&str>,
) -> EngineResult<()> {
    if !(-1..=1).contains(&score) {
        return Err(EngineError::Validation(format!(
            "feedback score must be -1, 0, or +1 (got {score})"
        )));
    }

    store.insert_outcome(&Outcome {
        user_id: user_id.to_string(),
        memory_id: memory_id.to_string(),
        score,
        conversation_id: conversation_id.map(|s| s.to_string()),
        message_id: message_id.map(|s| s.to_string()),
        created_at: now_iso(),
    })?;

    let conn = store.conn.lock();
    let tx = conn.unchecked_transaction()?;

    let row: Option<(i64, i64, i64, i64, f64)> = tx
        .query_row(
            "SELECT worked_count, failed_count, partial_count, success_count, quality_score
             FROM memory_items WHERE user_id=?1 AND memory_id=?2",
            params![user_id, memory_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    let Some((mut worked, mut failed, mut partial, mut success, quality)) = row else {
        tx.commit()?;
        warn!("[memory] Outcome for unknown memory {} recorded, stats skipped", memory_id);
        return Ok(());
    };

    let quality_delta = match score {
        1 => {
            worked += 1;
            success += 1;
            config.positive_boost
        }
        -1 => {
            failed += 1;
            -config.negative_penalty
        }
        _ => {
            partial += 1;
            0.0
        }
    };
    let new_quality = (quality + quality_delta).clamp(config.decay_floor, 1.0);

    let rate = success_rate(worked as u64, failed as u64, partial as u64);
    // Wilson sample includes a +1 prior so a single lucky outcome cannot
    // dominate ranking.
    let wilson = wilson_lower_bound(worked as u64, (worked + failed + partial + 1) as u64);

    tx.execute(
        "UPDATE memory_items SET
            worked_count=?3, failed_count=?4, partial_count=?5, success_count=?6,
            success_rate=?7, wilson_score=?8, quality_score=?9, updated_at=?10
         WHERE user_id=?1 AND memory_id=?2",
        params![
            user_id, memory_id, worked, failed, partial, success, rate, wilson, new_quality,
            now_iso()
        ],
    )?;
    tx.commit()?;
    Ok(())
}

/// Aggregate response-level feedback, kept separate from item stats.
pub fn record_response_feedback(
    store: &MemoryStore,
    user_id: &str,
    conversation_id: Option<&str>,
    message_id: Option<&str>,
    score: i8,
    feedback: Option<&str>,
) -> EngineResult<()> {
    if !(-1..=1).contains(&score) {
        return Err(EngineError::Validation(format!(
            "response feedback score must be -1, 0, or +1 (got {score})"
        )));
    }
    store.insert_response_feedback(user_id, conversation_id, message_id, score, feedback)
}

/// Bump usage stats for cited memories (the LEARN phase path).
pub fn record_use(store: &MemoryStore, user_id: &str, memory_ids: &[String]) -> EngineResult<()> {
    if memory_ids.is_empty() {
        return Ok(());
    }
    let now = now_iso();
    let conn = store.conn.lock();
    for id in memory_ids {
        conn.execute(
            "UPDATE memory_items SET uses = uses + 1, last_used_at = ?3
             WHERE user_id = ?1 AND memory_id = ?2",
            params![user_id, id, now],
        )?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Time decay & archival
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DecayReport {
    pub scanned: usize,
    pub decayed: usize,
    pub archived: usize,
}

/// Apply time decay across active items and archive the persistently cold.
/// Idempotent within a day: items decayed in the last 24h are skipped via
/// `last_decay_at`.
pub fn run_decay(store: &MemoryStore, config: &EngineConfig) -> EngineResult<DecayReport> {
    let now = chrono::Utc::now();
    let now_str = now_iso();
    let mut report = DecayReport::default();

    // Collect, then update — keeps the lock window per-statement small.
    let rows: Vec<(String, String, f64, Option<String>, Option<String>, String)> = {
        let conn = store.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, memory_id, quality_score, last_used_at, last_decay_at, created_at
             FROM memory_items WHERE status = 'active'",
        )?;
        let collected = stmt
            .query_map([], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        collected
    };

    report.scanned = rows.len();

    for (user_id, memory_id, quality, last_used, last_decay, created_at) in rows {
        // Skip items decayed within the last day.
        if let Some(stamp) = &last_decay {
            if days_since(stamp, &now) < 1.0 {
                continue;
            }
        }

        let reference = last_used.as_deref().unwrap_or(&created_at);
        let idle_days = days_since(reference, &now);
        if idle_days < 1.0 {
            continue;
        }

        let factor = (1.0 - config.decay_per_day).powf(idle_days);
        let new_quality = (quality * factor).clamp(config.decay_floor, 1.0);

        let should_archive =
            new_quality < config.archive_threshold && idle_days > config.archive_grace_days as f64;

        let conn = store.conn.lock();
        if should_archive {
            conn.execute(
                "UPDATE memory_items SET status='archived', archived_at=?3, quality_score=?4,
                        last_decay_at=?5, updated_at=?5
                 WHERE user_id=?1 AND memory_id=?2 AND status='active'",
                params![user_id, memory_id, now_str, new_quality, now_str],
            )?;
            report.archived += 1;
        } else {
            conn.execute(
                "UPDATE memory_items SET quality_score=?3, last_decay_at=?4
                 WHERE user_id=?1 AND memory_id=?2",
                params![user_id, memory_id, new_quality, now_str],
            )?;
            report.decayed += 1;
        }
    }

    if report.decayed + report.archived > 0 {
        info!(
            "[memory] Decay pass: {} decayed, {} archived ({} scanned)",
            report.decayed, report.archived, report.scanned
        );
    }
    Ok(report)
}

/// Reverse an archival. Idempotent: un-archiving an active item is a no-op.
pub fn unarchive(store: &MemoryStore, user_id: &str, memory_id: &str) -> EngineResult<bool> {
    let conn = store.conn.lock();
    let changed = conn.execute(
        "UPDATE memory_items SET status='active', archived_at=NULL, updated_at=?3
         WHERE user_id=?1 AND memory_id=?2 AND status='archived'",
        params![user_id, memory_id, now_iso()],
    )?;
    Ok(changed > 0)
}

// ═══════════════════════════════════════════════════════════════════════════
// Promotion
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PromotionReport {
    pub to_history: usize,
    pub to_patterns: usize,
}

/// Promote proven memories up the tier ladder:
///   working → history  when wilson ≥ threshold and uses ≥ min_uses
///   history → patterns when positives span enough distinct conversations
pub fn run_promotion(store: &MemoryStore, config: &EngineConfig) -> EngineResult<PromotionReport> {
    let mut report = PromotionReport::default();
    let now = now_iso();

    // working → history
    let candidates: Vec<(String, String)> = {
        let conn = store.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, memory_id FROM memory_items
             WHERE status='active' AND tier='working' AND wilson_score >= ?1 AND uses >= ?2",
        )?;
        let collected = stmt
            .query_map(params![config.promote_threshold, config.promote_min_uses as i64], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        collected
    };
    {
        let conn = store.conn.lock();
        for (user_id, memory_id) in &candidates {
            conn.execute(
                "UPDATE memory_items SET tier='history', updated_at=?3
                 WHERE user_id=?1 AND memory_id=?2",
                params![user_id, memory_id, now],
            )?;
            report.to_history += 1;
        }
    }

    // history → patterns (repeated success across distinct conversations)
    let history_items: Vec<(String, String)> = {
        let conn = store.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id, memory_id FROM memory_items
             WHERE status='active' AND tier='history' AND wilson_score >= ?1",
        )?;
        let collected = stmt
            .query_map(params![config.promote_threshold], |r| Ok((r.get(0)?, r.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        collected
    };
    for (user_id, memory_id) in &history_items {
        let distinct = store.distinct_positive_conversations(user_id, memory_id)?;
        if distinct >= config.promote_distinct_conversations {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE memory_items SET tier='patterns', updated_at=?3
                 WHERE user_id=?1 AND memory_id=?2",
                params![user_id, memory_id, now],
            )?;
            report.to_patterns += 1;
        }
    }

    if report.to_history + report.to_patterns > 0 {
        info!(
            "[memory] Promotion pass: {} → history, {} → patterns",
            report.to_history, report.to_patterns
        );
    }
    Ok(report)
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

fn days_since(timestamp: &str, now: &chrono::DateTime<chrono::Utc>) -> f64 {
    match chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%SZ") {
        Ok(parsed) => {
            let duration = *now - parsed.and_utc();
            (duration.num_seconds() as f64 / 86_400.0).max(0.0)
        }
        Err(_) => 0.0,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
