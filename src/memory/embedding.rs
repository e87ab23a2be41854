// ── Memory Engine: Embedding Client ────────────────────────────────────────
//
// Dense vectorization over the external embedding service, with failure
// isolation so a dead service never blocks a chat turn:
//   - circuit breaker (3 consecutive failures → open 30s → half-open probe)
//   - degraded mode: deterministic SHA-256 pseudo-vectors instead of networking
//   - in-process LRU cache of the last 5,000 vectors
//
// Wire formats, tried in order:
//   POST {base}/embed          {"texts": [...]}  → {"embeddings": [[f32]]}
//   POST {base}/v1/embeddings  {"input": [...]}  → {"data": [{"embedding": [f32]}]}

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::AbortSignal;
use crate::config::EngineConfig;
use crate::http_util::CircuitBreaker;
use log::{info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Cache capacity: last N embedded texts.
const CACHE_CAPACITY: usize = 5_000;

/// Circuit defaults: trip after 3 failures, stay open 30s, one good probe closes.
const FAILURE_THRESHOLD: u32 = 3;
const OPEN_DURATION_MS: u64 = 30_000;
const SUCCESS_THRESHOLD: u32 = 1;

/// Status snapshot for diagnostics and the health surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EmbeddingStatus {
    pub circuit_open: bool,
    pub failures: u32,
    pub degraded_mode: bool,
    pub last_error_category: Option<String>,
    pub cache_entries: usize,
}

/// Embedding client — calls the configured embedding service with a circuit
/// breaker and an LRU cache in front of it.
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    dimension: usize,
    timeout: Duration,
    breaker: CircuitBreaker,
    /// Explicit degraded mode (operator-set or auto on open circuit).
    degraded: AtomicBool,
    /// Auto-degrade on open circuit when graceful degradation is enabled.
    graceful_degradation: bool,
    last_error_category: Mutex<Option<String>>,
    cache: Mutex<LruVecCache>,
}

impl EmbeddingClient {
    pub fn new(config: &EngineConfig) -> Self {
        EmbeddingClient {
            client: Client::new(),
            base_url: config.embedding_url.trim_end_matches('/').to_string(),
            dimension: config.embedding_dimension,
            timeout: Duration::from_millis(config.embedding_timeout_ms),
            breaker: CircuitBreaker::new(FAILURE_THRESHOLD, OPEN_DURATION_MS, SUCCESS_THRESHOLD),
            degraded: AtomicBool::new(false),
            graceful_degradation: config.flags.graceful_degradation,
            last_error_category: Mutex::new(None),
            cache: Mutex::new(LruVecCache::new(CACHE_CAPACITY)),
        }
    }

    /// Embed a single text. Returns `None` when no vector can be produced
    /// and degradation is disabled (callers mark the item `needs_reindex`).
    pub async fn embed(&self, text: &str, signal: Option<&AbortSignal>) -> EngineResult<Option<Vec<f32>>> {
        if let Some(sig) = signal {
            if sig.is_aborted() {
                return Err(EngineError::Cancelled("embed aborted before start".into()));
            }
        }

        let cache_key = content_hash(text);
        if let Some(hit) = self.cache.lock().get(&cache_key) {
            return Ok(Some(hit));
        }

        // Degraded (explicit, or circuit open with graceful degradation):
        // deterministic pseudo-vector, no network call.
        if self.is_degraded() {
            return Ok(Some(self.pseudo_vector(text)));
        }
        if self.breaker.is_open() {
            if self.graceful_degradation {
                return Ok(Some(self.pseudo_vector(text)));
            }
            return Ok(None);
        }

        match self.embed_remote(std::slice::from_ref(&text.to_string())).await {
            Ok(mut vectors) => {
                self.breaker.record_success();
                let vec = vectors.pop().ok_or_else(|| {
                    EngineError::BadResponse("embedding service returned no vectors".into())
                })?;
                self.check_dimension(&vec)?;
                self.cache.lock().put(cache_key, vec.clone());
                Ok(Some(vec))
            }
            Err(e) => {
                self.note_failure(&e);
                if self.graceful_degradation && self.breaker.is_open() {
                    warn!("[memory] Embedding circuit opened — serving pseudo-vectors");
                    return Ok(Some(self.pseudo_vector(text)));
                }
                Err(e)
            }
        }
    }

    /// Embed a batch. Per-text results: cache hits and degraded fallbacks are
    /// filled in, remote failures leave `None` at that position.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        signal: Option<&AbortSignal>,
    ) -> EngineResult<Vec<Option<Vec<f32>>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if let Some(sig) = signal {
            if sig.is_aborted() {
                return Err(EngineError::Cancelled("embed_batch aborted".into()));
            }
        }

        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<(usize, String)> = Vec::new();
        {
            let mut cache = self.cache.lock();
            for (i, text) in texts.iter().enumerate() {
                match cache.get(&content_hash(text)) {
                    Some(hit) => out[i] = Some(hit),
                    None => misses.push((i, text.clone())),
                }
            }
        }
        if misses.is_empty() {
            return Ok(out);
        }

        if self.is_degraded() || self.breaker.is_open() {
            if self.is_degraded() || self.graceful_degradation {
                for (i, text) in &misses {
                    out[*i] = Some(self.pseudo_vector(text));
                }
            }
            return Ok(out);
        }

        let miss_texts: Vec<String> = misses.iter().map(|(_, t)| t.clone()).collect();
        match self.embed_remote(&miss_texts).await {
            Ok(vectors) => {
                self.breaker.record_success();
                if vectors.len() != misses.len() {
                    return Err(EngineError::BadResponse(format!(
                        "embedding count mismatch: sent {}, got {}",
                        misses.len(),
                        vectors.len()
                    )));
                }
                let mut cache = self.cache.lock();
                for ((i, text), vec) in misses.iter().zip(vectors) {
                    self.check_dimension(&vec)?;
                    cache.put(content_hash(text), vec.clone());
                    out[*i] = Some(vec);
                }
                Ok(out)
            }
            Err(e) => {
                self.note_failure(&e);
                if self.graceful_degradation && self.breaker.is_open() {
                    for (i, text) in &misses {
                        out[*i] = Some(self.pseudo_vector(text));
                    }
                    return Ok(out);
                }
                // Partial result: cache hits stay, misses remain None.
                Ok(out)
            }
        }
    }

    /// Embed without degradation: a real vector or an error, never a
    /// pseudo-vector. The reindexer uses this so `needs_reindex` is only
    /// cleared by genuine embeddings.
    pub async fn embed_strict(&self, text: &str) -> EngineResult<Vec<f32>> {
        let cache_key = content_hash(text);
        if let Some(hit) = self.cache.lock().get(&cache_key) {
            return Ok(hit);
        }
        self.breaker
            .check()
            .map_err(EngineError::ServiceDown)?;

        match self.embed_remote(std::slice::from_ref(&text.to_string())).await {
            Ok(mut vectors) => {
                self.breaker.record_success();
                let vec = vectors.pop().ok_or_else(|| {
                    EngineError::BadResponse("embedding service returned no vectors".into())
                })?;
                self.check_dimension(&vec)?;
                self.cache.lock().put(cache_key, vec.clone());
                Ok(vec)
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    /// Probe the service with a tiny request.
    pub async fn health_check(&self) -> bool {
        self.embed_remote(&["ping".to_string()]).await.is_ok()
    }

    pub fn status(&self) -> EmbeddingStatus {
        let breaker = self.breaker.status();
        EmbeddingStatus {
            circuit_open: breaker.circuit_open,
            failures: breaker.failures,
            degraded_mode: self.is_degraded(),
            last_error_category: self.last_error_category.lock().clone(),
            cache_entries: self.cache.lock().len(),
        }
    }

    /// Operator action: force-close the circuit.
    pub fn reset_circuit(&self) {
        self.breaker.reset();
        *self.last_error_category.lock() = None;
        info!("[memory] Embedding circuit reset");
    }

    pub fn enter_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
        warn!("[memory] Embedding client entering degraded mode (pseudo-vectors)");
    }

    pub fn exit_degraded(&self) {
        self.degraded.store(false, Ordering::SeqCst);
        info!("[memory] Embedding client exiting degraded mode");
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn is_circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn check_dimension(&self, vec: &[f32]) -> EngineResult<()> {
        if vec.len() != self.dimension {
            return Err(EngineError::Config(format!(
                "embedding dimension mismatch: service returned {}, configured {}",
                vec.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    fn note_failure(&self, e: &EngineError) {
        self.breaker.record_failure();
        *self.last_error_category.lock() = Some(e.category().to_string());
    }

    /// Call the service: native format first, OpenAI-compatible fallback.
    async fn embed_remote(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let native = self.embed_native(texts).await;
        match native {
            Ok(vecs) => Ok(vecs),
            Err(native_err) => {
                // Config errors (dimension) and bad shapes don't warrant the fallback.
                if !native_err.is_retryable() && !matches!(native_err, EngineError::BadResponse(_)) {
                    return Err(native_err);
                }
                match self.embed_openai(texts).await {
                    Ok(vecs) => Ok(vecs),
                    Err(openai_err) => Err(EngineError::ServiceDown(format!(
                        "embedding failed. native: {} | openai: {}",
                        native_err, openai_err
                    ))),
                }
            }
        }
    }

    /// Native format: POST /embed {"texts": [...]} → {"embeddings": [[f32]]}
    async fn embed_native(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "texts": texts }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_reqwest)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(format!("embed response not JSON: {e}")))?;
        let arrays = v["embeddings"]
            .as_array()
            .ok_or_else(|| EngineError::BadResponse("no 'embeddings' array".into()))?;
        parse_vector_arrays(arrays)
    }

    /// OpenAI-compatible: POST /v1/embeddings {"input": [...]}
    async fn embed_openai(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "input": texts }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify_reqwest)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(format!("embeddings response not JSON: {e}")))?;
        let data = v["data"]
            .as_array()
            .ok_or_else(|| EngineError::BadResponse("no 'data' array".into()))?;
        let arrays: Vec<Value> = data.iter().map(|d| d["embedding"].clone()).collect();
        parse_vector_arrays(&arrays)
    }

    /// Deterministic pseudo-vector: SHA-256 of the text repeated to the
    /// configured dimension, scaled to [-0.5, 0.5], L2-normalized. Keeps
    /// identical texts clustering together while the real service is down.
    pub fn pseudo_vector(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.trim().to_lowercase().as_bytes());
        let mut vec: Vec<f32> = (0..self.dimension)
            .map(|i| (digest[i % digest.len()] as f32 / 255.0) - 0.5)
            .collect();
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 1e-8 {
            for x in vec.iter_mut() {
                *x /= norm;
            }
        }
        vec
    }
}

/// Cache key: SHA-256 of lowercase-trimmed content.
fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.trim().to_lowercase().as_bytes());
    format!("{digest:x}")
}

fn parse_vector_arrays(arrays: &[Value]) -> EngineResult<Vec<Vec<f32>>> {
    arrays
        .iter()
        .map(|arr| {
            let floats = arr
                .as_array()
                .ok_or_else(|| EngineError::BadResponse("embedding entry not an array".into()))?;
            let vec: Vec<f32> = floats
                .iter()
                .filter_map(|f| f.as_f64().map(|x| x as f32))
                .collect();
            if vec.is_empty() {
                return Err(EngineError::BadResponse("empty embedding vector".into()));
            }
            Ok(vec)
        })
        .collect()
}

fn classify_reqwest(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Transport(format!("embedding request timed out: {e}"))
    } else if e.is_connect() {
        EngineError::ServiceDown(format!("embedding service unreachable: {e}"))
    } else {
        EngineError::Transport(e.to_string())
    }
}

fn classify_status(status: u16, body: &str) -> EngineError {
    let brief: String = body.chars().take(200).collect();
    if status >= 500 {
        EngineError::ServiceDown(format!("embedding service {status}: {brief}"))
    } else if status == 401 || status == 403 {
        EngineError::Auth(format!("embedding service {status}"))
    } else {
        EngineError::BadResponse(format!("embedding service {status}: {brief}"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LRU cache (HashMap + access-ordered queue)
// ═══════════════════════════════════════════════════════════════════════════

struct LruVecCache {
    capacity: usize,
    map: HashMap<String, Vec<f32>>,
    order: VecDeque<String>,
}

impl LruVecCache {
    fn new(capacity: usize) -> Self {
        LruVecCache { capacity, map: HashMap::new(), order: VecDeque::new() }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        if let Some(v) = self.map.get(key) {
            let v = v.clone();
            // Refresh recency
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
            self.order.push_back(key.to_string());
            Some(v)
        } else {
            None
        }
    }

    fn put(&mut self, key: String, value: Vec<f32>) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            while self.map.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                } else {
                    break;
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
