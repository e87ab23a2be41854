// ── Memory Engine: Vector Index Adapter ────────────────────────────────────
//
// CRUD/search against the external vector service (Qdrant) over its REST
// API. The service is a black box: this adapter owns the collection schema
// probe, the payload contract, and failure isolation.
//
// Payload contract — every point carries at least:
//   { user_id, tier, status, text, memory_id }
// Search filters always pin user_id and status=active.
//
// A vector dimension mismatch against the collection is a configuration
// error: writes are refused and the diagnostic is kept until restart.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::Tier;
use crate::config::EngineConfig;
use crate::http_util::CircuitBreaker;
use log::{error, info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Same breaker shape as the embedding client.
const FAILURE_THRESHOLD: u32 = 3;
const OPEN_DURATION_MS: u64 = 30_000;
const SUCCESS_THRESHOLD: u32 = 1;

/// A point to upsert into the index.
#[derive(Debug, Clone, Serialize)]
pub struct VectorPoint {
    pub memory_id: String,
    pub vector: Vec<f32>,
    pub user_id: String,
    pub tier: Tier,
    pub status: String,
    pub text: String,
}

/// A dense search match.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub memory_id: String,
    pub score: f64,
    pub tier: Option<Tier>,
    pub text: Option<String>,
}

/// Health snapshot of the collection.
#[derive(Debug, Clone, Serialize)]
pub struct VectorIndexHealth {
    pub healthy: bool,
    pub collection_exists: bool,
    pub point_count: u64,
    pub vector_dims: Option<usize>,
}

/// Parameters for a filtered dense search.
pub struct VectorSearchRequest<'a> {
    pub user_id: &'a str,
    pub tier: Option<&'a Tier>,
    pub vector: &'a [f32],
    pub limit: usize,
}

pub struct VectorIndexAdapter {
    client: Client,
    base_url: String,
    collection: String,
    vector_size: usize,
    timeout: Duration,
    breaker: CircuitBreaker,
    /// Set when the collection's schema disagrees with our configured size.
    /// All writes are refused until the operator fixes the deployment.
    schema_mismatch: Mutex<Option<String>>,
}

impl VectorIndexAdapter {
    pub fn new(config: &EngineConfig) -> Self {
        VectorIndexAdapter {
            client: Client::new(),
            base_url: config.qdrant_base_url(),
            collection: config.qdrant_collection.clone(),
            vector_size: config.qdrant_vector_size,
            timeout: Duration::from_millis(config.vector_timeout_ms),
            breaker: CircuitBreaker::new(FAILURE_THRESHOLD, OPEN_DURATION_MS, SUCCESS_THRESHOLD),
            schema_mismatch: Mutex::new(None),
        }
    }

    /// Probe the collection; create it when absent; verify the vector size.
    /// Called once at startup (after config, before the facade).
    pub async fn initialize(&self) -> EngineResult<()> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let resp = self.get(&url).await?;

        match resp.status().as_u16() {
            200 => {
                let v: Value = resp
                    .json()
                    .await
                    .map_err(|e| EngineError::BadResponse(format!("collection info not JSON: {e}")))?;
                let dims = collection_vector_size(&v);
                if let Some(d) = dims {
                    if d != self.vector_size {
                        let msg = format!(
                            "collection '{}' has vector size {}, configured {}",
                            self.collection, d, self.vector_size
                        );
                        error!("[memory] Vector schema mismatch: {}", msg);
                        *self.schema_mismatch.lock() = Some(msg.clone());
                        return Err(EngineError::Config(msg));
                    }
                }
                info!(
                    "[memory] Vector collection '{}' ready (dims={})",
                    self.collection, self.vector_size
                );
                Ok(())
            }
            404 => self.create_collection().await,
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(classify_status(status, &body))
            }
        }
    }

    async fn create_collection(&self) -> EngineResult<()> {
        info!(
            "[memory] Creating vector collection '{}' (dims={})",
            self.collection, self.vector_size
        );
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let body = json!({
            "vectors": { "size": self.vector_size, "distance": "Cosine" }
        });
        let resp = self
            .client
            .put(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_reqwest)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        Ok(())
    }

    /// Upsert points. Refused outright on schema mismatch or wrong-size
    /// vectors (items stay `needs_reindex = true`).
    pub async fn upsert_points(&self, points: &[VectorPoint]) -> EngineResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        self.ensure_writable()?;
        for p in points {
            if p.vector.len() != self.vector_size {
                return Err(EngineError::Config(format!(
                    "vector dimension mismatch at upsert: point {} has {}, collection {}",
                    p.memory_id,
                    p.vector.len(),
                    self.vector_size
                )));
            }
        }
        self.breaker.check().map_err(EngineError::ServiceDown)?;

        let url = format!(
            "{}/collections/{}/points?wait=true",
            self.base_url, self.collection
        );
        let qdrant_points: Vec<Value> = points
            .iter()
            .map(|p| {
                json!({
                    "id": p.memory_id,
                    "vector": p.vector,
                    "payload": {
                        "user_id": p.user_id,
                        "tier": p.tier.as_str(),
                        "status": p.status,
                        "text": p.text,
                        "memory_id": p.memory_id,
                    }
                })
            })
            .collect();

        let resp = self
            .client
            .put(&url)
            .json(&json!({ "points": qdrant_points }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure();
                classify_reqwest(e)
            })?;

        if !resp.status().is_success() {
            self.breaker.record_failure();
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        self.breaker.record_success();
        Ok(())
    }

    /// Filtered dense search. The filter always pins `user_id` and
    /// `status = active`; `tier` narrows further when given.
    pub async fn search(&self, req: VectorSearchRequest<'_>) -> EngineResult<Vec<VectorMatch>> {
        self.breaker.check().map_err(EngineError::ServiceDown)?;
        if req.vector.len() != self.vector_size {
            return Err(EngineError::Config(format!(
                "query vector has {} dims, collection {}",
                req.vector.len(),
                self.vector_size
            )));
        }

        let mut must = vec![
            json!({ "key": "user_id", "match": { "value": req.user_id } }),
            json!({ "key": "status", "match": { "value": "active" } }),
        ];
        if let Some(tier) = req.tier {
            must.push(json!({ "key": "tier", "match": { "value": tier.as_str() } }));
        }

        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );
        let body = json!({
            "vector": req.vector,
            "limit": req.limit,
            "filter": { "must": must },
            "with_payload": true,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure();
                classify_reqwest(e)
            })?;

        if !resp.status().is_success() {
            self.breaker.record_failure();
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        self.breaker.record_success();

        let v: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(format!("search response not JSON: {e}")))?;
        let hits = v["result"]
            .as_array()
            .ok_or_else(|| EngineError::BadResponse("no 'result' array in search".into()))?;

        Ok(hits
            .iter()
            .filter_map(|h| {
                let payload = &h["payload"];
                let memory_id = payload["memory_id"]
                    .as_str()
                    .or_else(|| h["id"].as_str())?
                    .to_string();
                Some(VectorMatch {
                    memory_id,
                    score: h["score"].as_f64().unwrap_or(0.0),
                    tier: payload["tier"].as_str().and_then(Tier::parse),
                    text: payload["text"].as_str().map(|s| s.to_string()),
                })
            })
            .collect())
    }

    /// Exact point count for a user (optionally per tier).
    pub async fn count(&self, user_id: &str, tier: Option<&Tier>) -> EngineResult<u64> {
        self.breaker.check().map_err(EngineError::ServiceDown)?;
        let mut must = vec![json!({ "key": "user_id", "match": { "value": user_id } })];
        if let Some(t) = tier {
            must.push(json!({ "key": "tier", "match": { "value": t.as_str() } }));
        }

        let url = format!(
            "{}/collections/{}/points/count",
            self.base_url, self.collection
        );
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "filter": { "must": must }, "exact": true }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure();
                classify_reqwest(e)
            })?;

        if !resp.status().is_success() {
            self.breaker.record_failure();
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        self.breaker.record_success();

        let v: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(format!("count response not JSON: {e}")))?;
        Ok(v["result"]["count"].as_u64().unwrap_or(0))
    }

    /// Delete points by memory id.
    pub async fn delete_points(&self, memory_ids: &[String]) -> EngineResult<()> {
        if memory_ids.is_empty() {
            return Ok(());
        }
        self.breaker.check().map_err(EngineError::ServiceDown)?;
        let url = format!(
            "{}/collections/{}/points/delete?wait=true",
            self.base_url, self.collection
        );
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "points": memory_ids }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure();
                classify_reqwest(e)
            })?;
        if !resp.status().is_success() {
            self.breaker.record_failure();
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        self.breaker.record_success();
        Ok(())
    }

    /// Probe collection health (does not trip the breaker — probes are
    /// how the operator finds out what is wrong).
    pub async fn health(&self) -> VectorIndexHealth {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        match self.get(&url).await {
            Ok(resp) if resp.status().is_success() => {
                let v: Value = match resp.json().await {
                    Ok(v) => v,
                    Err(_) => {
                        return VectorIndexHealth {
                            healthy: false,
                            collection_exists: true,
                            point_count: 0,
                            vector_dims: None,
                        }
                    }
                };
                let dims = collection_vector_size(&v);
                VectorIndexHealth {
                    healthy: dims == Some(self.vector_size),
                    collection_exists: true,
                    point_count: v["result"]["points_count"].as_u64().unwrap_or(0),
                    vector_dims: dims,
                }
            }
            Ok(resp) if resp.status().as_u16() == 404 => VectorIndexHealth {
                healthy: false,
                collection_exists: false,
                point_count: 0,
                vector_dims: None,
            },
            _ => VectorIndexHealth {
                healthy: false,
                collection_exists: false,
                point_count: 0,
                vector_dims: None,
            },
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub fn has_schema_mismatch(&self) -> bool {
        self.schema_mismatch.lock().is_some()
    }

    pub fn breaker_status(&self) -> crate::http_util::BreakerStatus {
        self.breaker.status()
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn ensure_writable(&self) -> EngineResult<()> {
        if let Some(msg) = self.schema_mismatch.lock().as_ref() {
            return Err(EngineError::Config(format!("writes refused: {msg}")));
        }
        Ok(())
    }

    async fn get(&self, url: &str) -> EngineResult<reqwest::Response> {
        self.client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_reqwest)
    }
}

/// Extract the configured vector size from a collection-info response.
/// Handles both unnamed ({size}) and named vector configs.
fn collection_vector_size(info: &Value) -> Option<usize> {
    let vectors = &info["result"]["config"]["params"]["vectors"];
    if let Some(size) = vectors["size"].as_u64() {
        return Some(size as usize);
    }
    // Named vectors: take the first entry's size.
    vectors
        .as_object()
        .and_then(|map| map.values().next())
        .and_then(|v| v["size"].as_u64())
        .map(|s| s as usize)
}

fn classify_reqwest(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Transport(format!("vector index timed out: {e}"))
    } else if e.is_connect() {
        EngineError::ServiceDown(format!("vector index unreachable: {e}"))
    } else {
        EngineError::Transport(e.to_string())
    }
}

fn classify_status(status: u16, body: &str) -> EngineError {
    let brief: String = body.chars().take(200).collect();
    if status >= 500 {
        EngineError::ServiceDown(format!("vector index {status}: {brief}"))
    } else {
        EngineError::BadResponse(format!("vector index {status}: {brief}"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn adapter() -> VectorIndexAdapter {
        let config = EngineConfig {
            qdrant_host: "127.0.0.1".into(),
            qdrant_port: 1, // nothing listens here
            embedding_dimension: 8,
            qdrant_vector_size: 8,
            vector_timeout_ms: 200,
            ..Default::default()
        };
        VectorIndexAdapter::new(&config)
    }

    #[test]
    fn test_collection_vector_size_unnamed() {
        let info = json!({
            "result": { "config": { "params": { "vectors": { "size": 1024, "distance": "Cosine" } } } }
        });
        assert_eq!(collection_vector_size(&info), Some(1024));
    }

    #[test]
    fn test_collection_vector_size_named() {
        let info = json!({
            "result": { "config": { "params": { "vectors": { "default": { "size": 768 } } } } }
        });
        assert_eq!(collection_vector_size(&info), Some(768));
    }

    #[test]
    fn test_collection_vector_size_missing() {
        assert_eq!(collection_vector_size(&json!({})), None);
    }

    #[tokio::test]
    async fn test_upsert_rejects_wrong_dimension() {
        let a = adapter();
        let point = VectorPoint {
            memory_id: "m1".into(),
            vector: vec![0.0; 4], // collection expects 8
            user_id: "u1".into(),
            tier: Tier::Working,
            status: "active".into(),
            text: "x".into(),
        };
        let err = a.upsert_points(&[point]).await.unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn test_search_rejects_wrong_query_dimension() {
        let a = adapter();
        let err = a
            .search(VectorSearchRequest {
                user_id: "u1",
                tier: None,
                vector: &[0.0; 3],
                limit: 5,
            })
            .await
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[tokio::test]
    async fn test_unreachable_service_classified_service_down() {
        let a = adapter();
        let err = a
            .search(VectorSearchRequest {
                user_id: "u1",
                tier: None,
                vector: &[0.0; 8],
                limit: 5,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ServiceDown(_) | EngineError::Transport(_)));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_short_circuits() {
        let a = adapter();
        for _ in 0..FAILURE_THRESHOLD {
            let _ = a
                .search(VectorSearchRequest {
                    user_id: "u1",
                    tier: None,
                    vector: &[0.0; 8],
                    limit: 5,
                })
                .await;
        }
        assert!(a.is_circuit_open());
        // Next call is rejected without a network attempt.
        let err = a.count("u1", None).await.unwrap_err();
        assert_eq!(err.category(), "service_down");
    }

    #[tokio::test]
    async fn test_empty_upsert_and_delete_are_noops() {
        let a = adapter();
        a.upsert_points(&[]).await.unwrap();
        a.delete_points(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_on_unreachable_service() {
        let a = adapter();
        let h = a.health().await;
        assert!(!h.healthy);
        assert!(!h.collection_exists);
    }
}
