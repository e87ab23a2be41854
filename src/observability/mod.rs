// ── Observability ──────────────────────────────────────────────────────────
//
// Three small pieces the rest of the engine reports through:
//   - StructuredLogger: correlation-id logging with per-operation sampling
//     (warn/error are never sampled away)
//   - MetricsCollector: rolling latency windows (last 1,000 samples per
//     stage) and 5-minute event-rate windows, snapshot with percentiles
//   - health probes: per-component checks with a 3s budget each, folded
//     into healthy / degraded / unhealthy

use crate::atoms::types::now_iso;
use crate::memory::embedding::EmbeddingClient;
use crate::memory::rerank::RerankClient;
use crate::memory::store::MemoryStore;
use crate::memory::vector_index::VectorIndexAdapter;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// Telemetry init
// ═══════════════════════════════════════════════════════════════════════════

static TELEMETRY_INIT: Once = Once::new();

/// Install the tracing subscriber (RUST_LOG-style env filter). Idempotent;
/// hosts embedding their own subscriber simply skip this.
pub fn init_telemetry() {
    TELEMETRY_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
        tracing::info!("telemetry initialized");
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// Structured logging
// ═══════════════════════════════════════════════════════════════════════════

/// Per-operation sampling rates: log 1 out of N info-level events.
fn sample_rate_for(operation: &str) -> u64 {
    match operation {
        "search" => 10,
        "prefetch" => 10,
        "embed" => 5,
        _ => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Correlation-id logger. One instance per process; cheap to share.
#[derive(Default)]
pub struct StructuredLogger {
    counters: Mutex<HashMap<String, u64>>,
}

impl StructuredLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a correlation id for a turn or hook call.
    pub fn correlation_id() -> String {
        uuid::Uuid::new_v4().to_string()[..8].to_string()
    }

    /// Log an operation event. Info-level events are sampled per operation;
    /// warnings and errors always land.
    pub fn log(&self, level: LogLevel, operation: &str, correlation_id: &str, message: &str) {
        if level == LogLevel::Info && !self.should_sample(operation) {
            return;
        }
        match level {
            LogLevel::Info => info!("[{operation}] cid={correlation_id} {message}"),
            LogLevel::Warn => warn!("[{operation}] cid={correlation_id} {message}"),
            LogLevel::Error => error!("[{operation}] cid={correlation_id} {message}"),
        }
    }

    fn should_sample(&self, operation: &str) -> bool {
        let rate = sample_rate_for(operation);
        if rate <= 1 {
            return true;
        }
        let mut counters = self.counters.lock();
        let count = counters.entry(operation.to_string()).or_insert(0);
        *count += 1;
        *count % rate == 1
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Rolling latency samples per stage.
const LATENCY_WINDOW: usize = 1_000;
/// Event-rate window.
const RATE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub count: u64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
    /// Events in the last 5 minutes.
    pub recent_events: usize,
    /// Events per second over the 5-minute window.
    pub rate_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: String,
    pub stages: HashMap<String, StageSnapshot>,
    pub queue_depths: HashMap<String, u64>,
    pub circuit_breakers: HashMap<String, bool>,
}

struct StageWindow {
    latencies_ms: Vec<u64>,
    next_slot: usize,
    total: u64,
    event_times: Vec<Instant>,
}

impl StageWindow {
    fn new() -> Self {
        StageWindow {
            latencies_ms: Vec::with_capacity(LATENCY_WINDOW),
            next_slot: 0,
            total: 0,
            event_times: Vec::new(),
        }
    }

    fn record(&mut self, latency_ms: u64, now: Instant) {
        if self.latencies_ms.len() < LATENCY_WINDOW {
            self.latencies_ms.push(latency_ms);
        } else {
            self.latencies_ms[self.next_slot] = latency_ms;
            self.next_slot = (self.next_slot + 1) % LATENCY_WINDOW;
        }
        self.total += 1;
        self.event_times.push(now);
        self.event_times.retain(|t| now.duration_since(*t) <= RATE_WINDOW);
    }

    fn snapshot(&self, now: Instant) -> StageSnapshot {
        let mut sorted = self.latencies_ms.clone();
        sorted.sort_unstable();
        let recent = self
            .event_times
            .iter()
            .filter(|t| now.duration_since(**t) <= RATE_WINDOW)
            .count();
        StageSnapshot {
            count: self.total,
            p50_ms: percentile(&sorted, 50),
            p90_ms: percentile(&sorted, 90),
            p99_ms: percentile(&sorted, 99),
            recent_events: recent,
            rate_per_sec: recent as f64 / RATE_WINDOW.as_secs_f64(),
        }
    }
}

/// Nearest-rank percentile on a sorted slice (0 for an empty window).
fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank - 1]
}

#[derive(Default)]
pub struct MetricsCollector {
    stages: Mutex<HashMap<String, StageWindow>>,
    queue_depths: Mutex<HashMap<String, AtomicU64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one timed operation for a named stage.
    pub fn record_latency(&self, stage: &str, latency_ms: u64) {
        let mut stages = self.stages.lock();
        stages
            .entry(stage.to_string())
            .or_insert_with(StageWindow::new)
            .record(latency_ms, Instant::now());
    }

    /// Set a gauge (reindex queue, pool occupancy, …).
    pub fn set_queue_depth(&self, name: &str, depth: u64) {
        let mut depths = self.queue_depths.lock();
        depths
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self, circuit_breakers: HashMap<String, bool>) -> MetricsSnapshot {
        let now = Instant::now();
        let stages = self
            .stages
            .lock()
            .iter()
            .map(|(name, window)| (name.clone(), window.snapshot(now)))
            .collect();
        let queue_depths = self
            .queue_depths
            .lock()
            .iter()
            .map(|(name, depth)| (name.clone(), depth.load(Ordering::Relaxed)))
            .collect();
        MetricsSnapshot {
            generated_at: now_iso(),
            stages,
            queue_depths,
            circuit_breakers,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Health probes
// ═══════════════════════════════════════════════════════════════════════════

/// Per-probe budget.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub healthy: bool,
    pub detail: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: String,
    pub components: Vec<ComponentHealth>,
}

/// Probe every dependency with a 3-second budget each and aggregate:
/// all healthy → healthy; document store down → unhealthy (nothing works
/// without it); anything else down → degraded.
pub async fn run_health_checks(
    store: &MemoryStore,
    embedding: &EmbeddingClient,
    vector_index: &VectorIndexAdapter,
    rerank: &RerankClient,
) -> HealthReport {
    let mut components = Vec::new();

    // Document store: a trivial count proves the connection works.
    let started = Instant::now();
    let store_ok = store.count_documents("__health__", None, None).is_ok();
    components.push(ComponentHealth {
        component: "document_store".into(),
        healthy: store_ok,
        detail: if store_ok { "ok".into() } else { "count query failed".into() },
        latency_ms: started.elapsed().as_millis() as u64,
    });

    // Vector index.
    let started = Instant::now();
    let vector_health = tokio::time::timeout(PROBE_TIMEOUT, vector_index.health()).await;
    let (vector_ok, vector_detail) = match vector_health {
        Ok(h) if h.healthy => (true, format!("{} points", h.point_count)),
        Ok(h) if !h.collection_exists => (false, "collection missing".into()),
        Ok(h) => (false, format!("dims {:?} vs configured", h.vector_dims)),
        Err(_) => (false, "probe timed out".into()),
    };
    components.push(ComponentHealth {
        component: "vector_index".into(),
        healthy: vector_ok,
        detail: vector_detail,
        latency_ms: started.elapsed().as_millis() as u64,
    });

    // Embedding service. An open circuit is reported without re-probing
    // (the breaker exists so we stop hammering a dead service).
    let started = Instant::now();
    let (embed_ok, embed_detail) = if embedding.is_circuit_open() {
        (false, "circuit open".to_string())
    } else if embedding.is_degraded() {
        (false, "degraded mode".to_string())
    } else {
        match tokio::time::timeout(PROBE_TIMEOUT, embedding.health_check()).await {
            Ok(true) => (true, "ok".to_string()),
            Ok(false) => (false, "probe failed".to_string()),
            Err(_) => (false, "probe timed out".to_string()),
        }
    };
    components.push(ComponentHealth {
        component: "embedding".into(),
        healthy: embed_ok,
        detail: embed_detail,
        latency_ms: started.elapsed().as_millis() as u64,
    });

    // Reranker: optional; unconfigured counts as healthy-by-absence.
    let started = Instant::now();
    let (rerank_ok, rerank_detail) = if !rerank.is_configured() {
        (true, "not configured".to_string())
    } else {
        match tokio::time::timeout(PROBE_TIMEOUT, rerank.rerank("ping", &["ping".into()], Some(1)))
            .await
        {
            Ok(Ok(_)) => (true, "ok".to_string()),
            Ok(Err(e)) => (false, e.category().to_string()),
            Err(_) => (false, "probe timed out".to_string()),
        }
    };
    components.push(ComponentHealth {
        component: "rerank".into(),
        healthy: rerank_ok,
        detail: rerank_detail,
        latency_ms: started.elapsed().as_millis() as u64,
    });

    let status = if !store_ok {
        HealthStatus::Unhealthy
    } else if components.iter().all(|c| c.healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    HealthReport { status, checked_at: now_iso(), components }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
