// ── Memory Engine: Rerank Client ───────────────────────────────────────────
//
// Cross-encoder rescoring of candidate passages through the external
// reranker service. Fails closed: any error leaves the caller on its
// pre-rerank (fused) ordering.
//
// Wire format:
//   POST {base}/rerank {"query": ..., "passages": [...], "top_k": n}
//     → {"results": [{"index": i, "score": f}]}

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::SearchHit;
use crate::config::EngineConfig;
use log::warn;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// A single rerank result, mapping back to the input passage by index.
#[derive(Debug, Clone, Deserialize)]
pub struct RerankEntry {
    #[serde(alias = "originalIndex")]
    pub index: usize,
    pub score: f64,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankEntry>,
}

pub struct RerankClient {
    client: Client,
    base_url: Option<String>,
    timeout: Duration,
}

impl RerankClient {
    pub fn new(config: &EngineConfig) -> Self {
        RerankClient {
            client: Client::new(),
            base_url: config
                .reranker_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            timeout: Duration::from_millis(config.rerank_timeout_ms),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    /// Score passages against the query. One attempt, no retries — the
    /// retriever treats failure as "keep fused order".
    pub async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        top_k: Option<usize>,
    ) -> EngineResult<Vec<RerankEntry>> {
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| EngineError::Config("RERANKER_URL not configured".into()))?;
        if passages.is_empty() {
            return Ok(vec![]);
        }

        let mut body = json!({ "query": query, "passages": passages });
        if let Some(k) = top_k {
            body["top_k"] = json!(k);
        }

        let resp = self
            .client
            .post(format!("{base}/rerank"))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Transport(format!("rerank timed out: {e}"))
                } else if e.is_connect() {
                    EngineError::ServiceDown(format!("reranker unreachable: {e}"))
                } else {
                    EngineError::Transport(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            let brief: String = body.chars().take(200).collect();
            return Err(if status >= 500 {
                EngineError::ServiceDown(format!("reranker {status}: {brief}"))
            } else {
                EngineError::BadResponse(format!("reranker {status}: {brief}"))
            });
        }

        let parsed: RerankResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(format!("rerank response not JSON: {e}")))?;

        // Out-of-range indexes would corrupt the mapping back to hits.
        for entry in &parsed.results {
            if entry.index >= passages.len() {
                return Err(EngineError::BadResponse(format!(
                    "rerank index {} out of range ({} passages)",
                    entry.index,
                    passages.len()
                )));
            }
        }
        Ok(parsed.results)
    }

    /// Rerank hits in place, preserving metadata by original index. On any
    /// failure the input ordering is returned untouched and the error is
    /// handed back so the caller can record the fallback.
    pub async fn rerank_hits(
        &self,
        query: &str,
        mut hits: Vec<SearchHit>,
        top_k: Option<usize>,
    ) -> (Vec<SearchHit>, Option<EngineError>) {
        let passages: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
        match self.rerank(query, &passages, top_k).await {
            Ok(entries) => {
                for entry in &entries {
                    if let Some(hit) = hits.get_mut(entry.index) {
                        hit.rerank_score = Some(entry.score);
                        hit.score = entry.score;
                    }
                }
                hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                (hits, None)
            }
            Err(e) => {
                warn!("[memory] Rerank failed, keeping fused order: {}", e);
                (hits, Some(e))
            }
        }
    }
}

/// Drop entries under a minimum cross-encoder score.
pub fn filter_by_score(entries: &[RerankEntry], min_score: f64) -> Vec<RerankEntry> {
    entries.iter().filter(|e| e.score >= min_score).cloned().collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────
